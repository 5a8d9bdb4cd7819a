use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, info};

use crate::backplane::build_driver;
use crate::config::ServerConfig;
use crate::metrics;
use crate::mux::Mux;
use crate::portal::{ApiTokenCheck, PortalService};
use crate::store::{InMemoryPortalStore, PortalStore};

/// Serve the Portal service on an already bound listener until `shutdown`
/// resolves.
pub async fn serve(
    listener: TcpListener,
    service: PortalService,
    auth: ApiTokenCheck,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(service.into_server(auth))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

/// Wire the configured backplane, store and Mux together and run the server.
pub async fn run(cfg: ServerConfig, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let driver = build_driver(&cfg)?;
    let mux = Mux::new(driver, cfg.mux_config());
    let store: Arc<dyn PortalStore> = if cfg.accept_unknown_tasks {
        InMemoryPortalStore::accepting_unknown_tasks()
    } else {
        InMemoryPortalStore::new()
    };
    let service = PortalService::new(mux.clone(), store)
        .with_agent_keepalive(cfg.agent_keepalive());
    let tokens = cfg.api_tokens();
    let auth = ApiTokenCheck::new(tokens.clone());

    let listener = TcpListener::bind(cfg.listen_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        server_id = mux.server_id(),
        backend = ?cfg.pubsub_backend,
        api_tokens = tokens.len(),
        "tavern listening"
    );

    let result = serve(listener, service, auth, shutdown).await;
    mux.close().await;
    result?;
    debug!(
        metrics = %String::from_utf8_lossy(&metrics::gather()),
        "final metrics snapshot"
    );
    info!("tavern stopped");
    Ok(())
}
