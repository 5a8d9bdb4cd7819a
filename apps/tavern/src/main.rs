use clap::Parser;
use tavern::config::ServerConfig;
use tavern::{server, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServerConfig::parse();
    telemetry::init_tracing(&cfg.log_filter);

    server::run(cfg, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await
}
