use tracing_subscriber::EnvFilter;
use vulnwatch::{Config, Controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let controller = Controller::new(config);
    let cancellation = controller.cancellation();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            cancellation.cancel();
        }
    });

    controller.run().await?;
    Ok(())
}
