use livebridge::{server, Config, Metrics};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env();
    let metrics = Metrics::new();
    info!(bind = %cfg.server.bind_addr, model = %cfg.upstream.model, "starting livebridge");

    tokio::select! {
        result = server::run(cfg, metrics) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
