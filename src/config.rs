use crate::download::DownloadTuning;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_folder_id() -> String {
    "default".to_string()
}
fn default_api_enabled() -> bool {
    true
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    7843
}
fn default_max_in_flight() -> usize {
    16
}
fn default_max_block_size() -> u32 {
    32 * 1024
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_maintain_period_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub folder: FolderConfig,
    pub download: DownloadConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_in_flight: usize,
    pub max_block_size: u32,
    pub request_timeout_secs: u64,
    pub maintain_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            folder: FolderConfig::default(),
            download: DownloadConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            folder_id: default_folder_id(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_block_size: default_max_block_size(),
            request_timeout_secs: default_request_timeout_secs(),
            maintain_period_secs: default_maintain_period_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl DownloadConfig {
    pub fn tuning(&self) -> DownloadTuning {
        DownloadTuning {
            max_in_flight: self.max_in_flight.max(1),
            max_block_size: self.max_block_size.max(1),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            maintain_period: Duration::from_secs(self.maintain_period_secs.max(1)),
        }
    }
}

impl Config {
    /// Loads `config.toml` from the working directory, creating it with
    /// defaults on first run. Environment overrides are applied afterwards.
    pub fn load_or_create() -> anyhow::Result<Self> {
        let path = std::path::Path::new("config.toml");
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RUST_VAULT_LOG") {
            self.general.log_level = level;
        }
        if let Ok(dir) = std::env::var("RUST_VAULT_DATA_DIR") {
            self.general.data_dir = dir;
        }
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let path = "config.toml";
        let tmp_path = format!("{path}.tmp");
        let toml = toml::to_string_pretty(self)?;

        tokio::fs::write(&tmp_path, toml).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

pub fn init_tracing(config: &Config) {
    // RUST_LOG wins over the config's log_level; both fall back to info.
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| config.general.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduler_tuning() {
        let config = Config::default();
        let tuning = config.download.tuning();
        assert_eq!(tuning.max_in_flight, 16);
        assert_eq!(tuning.max_block_size, 32 * 1024);
        assert_eq!(tuning.request_timeout, Duration::from_secs(10));
        assert_eq!(tuning.maintain_period, Duration::from_secs(1));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [download]
            max_in_flight = 4
            "#,
        )
        .expect("parse");
        assert_eq!(config.download.max_in_flight, 4);
        assert_eq!(config.download.max_block_size, 32 * 1024);
        assert_eq!(config.general.log_level, "info");
        assert!(config.api.enabled);
    }

    #[test]
    fn zeroed_tuning_is_clamped_to_sane_minimums() {
        let config: Config = toml::from_str(
            r#"
            [download]
            max_in_flight = 0
            max_block_size = 0
            request_timeout_secs = 0
            maintain_period_secs = 0
            "#,
        )
        .expect("parse");
        let tuning = config.download.tuning();
        assert_eq!(tuning.max_in_flight, 1);
        assert_eq!(tuning.max_block_size, 1);
        assert_eq!(tuning.request_timeout, Duration::from_secs(1));
        assert_eq!(tuning.maintain_period, Duration::from_secs(1));
    }
}
