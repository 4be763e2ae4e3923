//! Speechway Gateway — realtime speech-streaming coordination service.

use speechway_gateway::config::Config;
use speechway_gateway::gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env()?;
    gateway::run(config).await?;
    Ok(())
}
