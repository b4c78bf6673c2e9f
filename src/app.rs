use crate::config::Config;
use crate::download::{DownloaderDeps, start_downloader};
use crate::folder::{DirectoryChunkStore, MemoryMetaStore};
use crate::single_instance::InstanceLock;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        log = %config.general.log_level,
        data_dir = %config.general.data_dir,
        folder = %config.folder.folder_id,
        "starting rust-vault"
    );

    let data_dir = Path::new(&config.general.data_dir);
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data dir '{}'", data_dir.display()))?;
    let _lock = InstanceLock::acquire(data_dir).context("single-instance check failed")?;

    let chunk_store = DirectoryChunkStore::open(data_dir.join("store"))
        .context("failed to open chunk store")?;
    // The persistent meta index is populated by the indexer; until that is
    // wired in, the daemon starts with an empty in-memory index.
    let meta_store = Arc::new(MemoryMetaStore::new());

    let deps = DownloaderDeps {
        folder_id: config.folder.folder_id.clone(),
        scratch_dir: data_dir.join("scratch").join(&config.folder.folder_id),
        meta_store,
        chunk_store: Arc::new(chunk_store),
    };
    let (download_handle, _status_rx, download_join) =
        start_downloader(config.download.tuning(), deps)
            .await
            .context("failed to start downloader")?;

    let api_join = if config.api.enabled {
        let api_cfg = config.api.clone();
        let folder_id = config.folder.folder_id.clone();
        let handle = download_handle.clone();
        Some(tokio::spawn(async move {
            if let Err(error) = crate::api::serve(&api_cfg, folder_id, handle).await {
                tracing::error!(error = %error, "api server exited");
            }
        }))
    } else {
        None
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::warn!("received Ctrl+C");
        }
    }

    download_handle
        .shutdown()
        .await
        .context("downloader shutdown failed")?;
    download_join
        .await
        .context("downloader task panicked")?
        .context("downloader exited with error")?;
    if let Some(join) = api_join {
        join.abort();
    }

    tracing::info!("shutting down gracefully");
    Ok(())
}
