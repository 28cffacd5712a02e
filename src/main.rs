use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use message_store::application::bootstrap;
use message_store::config::Config;
use message_store::infrastructure::repositories::postgres::PostgresMessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::try_parse().context("failed to load configuration")?;

    let store = PostgresMessageStore::connect(&config)
        .await
        .context("failed to open message store")?;

    bootstrap::run(&store, config.seed_sample_messages)
        .await
        .context("message store initialization failed")?;

    info!("message store bootstrap complete");
    Ok(())
}
