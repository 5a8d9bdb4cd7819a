use std::sync::Arc;

use portal_pubsub::{Driver, GcpConfig, GcpDriver, InMemoryDriver};
use tracing::{info, warn};

use crate::config::{PubSubBackend, ServerConfig};

/// Build the pub/sub driver selected by the configuration.
pub fn build_driver(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn Driver>> {
    let driver: Arc<dyn Driver> = match (cfg.pubsub_backend, cfg.gcp_project_id.as_deref()) {
        (PubSubBackend::Gcp, Some(project)) => {
            let config = GcpConfig::from_env(project);
            info!(project, endpoint = %config.endpoint, "using gcp pubsub backplane");
            Arc::new(GcpDriver::new(config)?)
        }
        (PubSubBackend::Gcp, None) => {
            warn!("gcp backend selected without TAVERN_GCP_PROJECT_ID; falling back to in-memory backplane");
            InMemoryDriver::new()
        }
        (PubSubBackend::Memory, _) => {
            info!("using in-memory backplane");
            InMemoryDriver::new()
        }
    };
    Ok(driver)
}
