use clap::Parser;
use putiod::daemon::{DaemonArgs, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonArgs::parse().into_config()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
