use std::collections::HashSet;
use std::sync::Arc;

use tonic::service::Interceptor;
use tonic::{Request, Status};

pub const AUTH_METADATA_KEY: &str = "x-tavern-auth";

/// Rejects calls whose `x-tavern-auth` value is not a configured API token.
/// With no tokens configured every call is let through.
#[derive(Clone, Default)]
pub struct ApiTokenCheck {
    tokens: Arc<HashSet<String>>,
}

impl ApiTokenCheck {
    pub fn new(tokens: HashSet<String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }
}

impl Interceptor for ApiTokenCheck {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if self.tokens.is_empty() {
            return Ok(request);
        }
        let presented = request
            .metadata()
            .get(AUTH_METADATA_KEY)
            .and_then(|value| value.to_str().ok());
        match presented {
            Some(token) if self.tokens.contains(token) => Ok(request),
            Some(_) => Err(Status::unauthenticated("invalid api token")),
            None => Err(Status::unauthenticated("missing api token")),
        }
    }
}
