use std::path::Path;

use portal_proto::rpc::portal_client::PortalClient;
use tonic::codegen::InterceptedService;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::debug;

pub const API_TOKEN_ENV: &str = "TAVERN_API_TOKEN";
pub const AUTH_CACHE_FILE: &str = ".tavern-auth";
pub const AUTH_METADATA_KEY: &str = "x-tavern-auth";

pub type UpstreamClient = PortalClient<InterceptedService<Channel, AttachToken>>;

/// Resolve the operator credential: `TAVERN_API_TOKEN` wins, otherwise the
/// first non-empty line of `.tavern-auth` in `dir`.
pub fn load_api_token(dir: &Path) -> Option<String> {
    if let Ok(token) = std::env::var(API_TOKEN_ENV) {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    read_auth_cache(&dir.join(AUTH_CACHE_FILE))
}

fn read_auth_cache(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Adds the `x-tavern-auth` header to every call when a token is known.
#[derive(Clone, Default)]
pub struct AttachToken {
    token: Option<MetadataValue<Ascii>>,
}

impl AttachToken {
    pub fn new(token: Option<&str>) -> anyhow::Result<Self> {
        let token: Option<MetadataValue<Ascii>> = token.map(str::parse).transpose()?;
        Ok(Self { token })
    }
}

impl Interceptor for AttachToken {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(token) = &self.token {
            request
                .metadata_mut()
                .insert(AUTH_METADATA_KEY, token.clone());
        }
        Ok(request)
    }
}

/// Dial the tavern gRPC endpoint. `addr` may omit the scheme.
pub async fn connect(addr: &str, token: Option<&str>) -> anyhow::Result<UpstreamClient> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    debug!(%uri, authenticated = token.is_some(), "connecting upstream");
    let channel = Endpoint::from_shared(uri)?.connect().await?;
    Ok(PortalClient::with_interceptor(
        channel,
        AttachToken::new(token)?,
    ))
}
