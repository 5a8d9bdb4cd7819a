use anyhow::Context;
use clap::Parser;
use tavern_socks5::cli::{Cli, Command};
use tavern_socks5::proxy::Proxy;
use tavern_socks5::{telemetry, trace, upstream};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);
    let token = upstream::load_api_token(&std::env::current_dir()?);

    match cli.command {
        Some(Command::Trace {
            portal,
            size,
            upstream_addr,
            count,
        }) => {
            anyhow::ensure!(portal > 0, "--portal is required");
            let mut client = upstream::connect(&upstream_addr, token.as_deref())
                .await
                .with_context(|| format!("failed to connect to {upstream_addr}"))?;
            trace::run_trace(&mut client, portal, size, count).await
        }
        None => {
            let portal = cli
                .portal
                .filter(|id| *id > 0)
                .context("--portal is required")?;
            let client = upstream::connect(&cli.upstream, token.as_deref())
                .await
                .with_context(|| format!("failed to connect to {}", cli.upstream))?;
            let proxy = Proxy::bind(cli.listen, portal)
                .await
                .with_context(|| format!("failed to listen on {}", cli.listen))?;
            info!(
                portal,
                listen = %proxy.local_addr()?,
                upstream = %cli.upstream,
                authenticated = token.is_some(),
                "starting socks5 bridge"
            );
            proxy.run(client).await
        }
    }
}
