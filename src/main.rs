use rust_vault::{app, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::load_or_create()?;
    config::init_tracing(&config);
    tracing::info!("rust-vault booted");

    app::run(config).await
}
