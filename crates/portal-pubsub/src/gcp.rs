use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Driver, Message, PubSubError, PubSubResult, ReceivedMessage, Subscription};

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const PULL_BATCH: u32 = 100;
const EMPTY_PULL_BACKOFF: Duration = Duration::from_millis(100);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// No `Authorization` header (emulator).
    None,
    Static(String),
    /// GCE/GKE metadata server.
    Metadata,
}

#[derive(Debug, Clone)]
pub struct GcpConfig {
    pub project_id: String,
    pub endpoint: String,
    pub token: TokenSource,
}

impl GcpConfig {
    /// Resolve endpoint and credentials from the environment.
    ///
    /// `PUBSUB_EMULATOR_HOST` points the driver at an emulator without auth;
    /// otherwise `GOOGLE_OAUTH_ACCESS_TOKEN` is used as a static bearer token,
    /// falling back to the metadata server.
    pub fn from_env(project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        if let Ok(host) = std::env::var("PUBSUB_EMULATOR_HOST") {
            return Self {
                project_id,
                endpoint: format!("http://{host}/v1"),
                token: TokenSource::None,
            };
        }
        let token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .map(TokenSource::Static)
            .unwrap_or(TokenSource::Metadata);
        Self {
            project_id,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token,
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct Inner {
    http: reqwest::Client,
    config: GcpConfig,
    token: Mutex<Option<CachedToken>>,
}

/// Google Cloud Pub/Sub over its REST API.
#[derive(Clone)]
pub struct GcpDriver {
    inner: Arc<Inner>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    data: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PulledMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Received {
    ack_id: String,
    message: PulledMessage,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<Received>,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl GcpDriver {
    pub fn new(config: GcpConfig) -> PubSubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        info!(
            project_id = %config.project_id,
            endpoint = %config.endpoint,
            "gcp pubsub driver configured"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                token: Mutex::new(None),
            }),
        })
    }
}

impl Inner {
    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.config.project_id, topic)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.config.project_id, subscription
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn bearer(&self) -> PubSubResult<Option<String>> {
        match &self.config.token {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata => {
                let mut cached = self.token.lock().await;
                if let Some(token) = cached.as_ref() {
                    if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                        return Ok(Some(token.value.clone()));
                    }
                }
                let response = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|err| PubSubError::Auth(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(PubSubError::Auth(format!(
                        "metadata server returned {}",
                        response.status()
                    )));
                }
                let token: MetadataToken = response
                    .json()
                    .await
                    .map_err(|err| PubSubError::Auth(err.to_string()))?;
                debug!(expires_in = token.expires_in, "refreshed pubsub access token");
                let value = token.access_token.clone();
                *cached = Some(CachedToken {
                    value: token.access_token,
                    expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                });
                Ok(Some(value))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> PubSubResult<Response> {
        let request = match self.bearer().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        Ok(request.send().await?)
    }

    async fn exists(&self, path: &str) -> PubSubResult<bool> {
        let response = self.send(self.http.get(self.url(path))).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(api_error(response).await),
        }
    }

    async fn create(&self, path: &str, body: serde_json::Value) -> PubSubResult<()> {
        let response = self
            .send(self.http.put(self.url(path)).json(&body))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Another replica won the race.
            StatusCode::CONFLICT => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> PubSubResult<Response> {
        let response = self
            .send(self.http.post(self.url(path)).json(&body))
            .await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(api_error(response).await)
        }
    }
}

async fn api_error(response: Response) -> PubSubError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PubSubError::Api { status, body }
}

fn ttl_string(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

#[async_trait]
impl Driver for GcpDriver {
    async fn ensure_topic(&self, topic: &str) -> PubSubResult<()> {
        let path = self.inner.topic_path(topic);
        if self.inner.exists(&path).await? {
            return Ok(());
        }
        debug!(topic, "creating pubsub topic");
        self.inner.create(&path, json!({})).await
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        ttl: Duration,
    ) -> PubSubResult<Box<dyn Subscription>> {
        let path = self.inner.subscription_path(subscription);
        if !self.inner.exists(&path).await? {
            self.ensure_topic(topic).await?;
            debug!(topic, subscription, ttl_secs = ttl.as_secs(), "creating pubsub subscription");
            self.inner
                .create(
                    &path,
                    json!({
                        "topic": self.inner.topic_path(topic),
                        "expirationPolicy": { "ttl": ttl_string(ttl) },
                    }),
                )
                .await?;
        }
        Ok(Box::new(GcpSubscription {
            inner: Arc::clone(&self.inner),
            name: subscription.to_string(),
            path,
            pending: VecDeque::new(),
            unacked: HashSet::new(),
        }))
    }

    async fn publish(&self, topic: &str, message: Message) -> PubSubResult<()> {
        let wire = WireMessage {
            data: BASE64.encode(&message.data),
            attributes: message.attributes,
        };
        let path = format!("{}:publish", self.inner.topic_path(topic));
        let response = self
            .inner
            .post(&path, json!({ "messages": [wire] }))
            .await
            .map_err(|err| match err {
                PubSubError::Api { status: 404, .. } => PubSubError::TopicNotFound(topic.to_string()),
                other => other,
            })?;
        // Drain the body so the connection can be reused.
        let _ = response.bytes().await;
        Ok(())
    }
}

/// Pulled batches are acknowledged as a whole as soon as they arrive;
/// `ack` only retries ids whose batch acknowledgement failed.
struct GcpSubscription {
    inner: Arc<Inner>,
    name: String,
    path: String,
    pending: VecDeque<ReceivedMessage>,
    unacked: HashSet<String>,
}

impl GcpSubscription {
    async fn acknowledge(&self, ack_ids: &[String]) -> PubSubResult<()> {
        let response = self
            .inner
            .post(
                &format!("{}:acknowledge", self.path),
                json!({ "ackIds": ack_ids }),
            )
            .await?;
        let _ = response.bytes().await;
        Ok(())
    }

    async fn pull(&mut self) -> PubSubResult<()> {
        let response = self
            .inner
            .post(
                &format!("{}:pull", self.path),
                json!({ "maxMessages": PULL_BATCH }),
            )
            .await
            .map_err(|err| match err {
                PubSubError::Api { status: 404, .. } => {
                    PubSubError::SubscriptionNotFound(self.name.clone())
                }
                other => other,
            })?;
        let pulled: PullResponse = response
            .json()
            .await
            .map_err(|err| PubSubError::Decode(err.to_string()))?;
        if pulled.received_messages.is_empty() {
            return Ok(());
        }

        let ack_ids: Vec<String> = pulled
            .received_messages
            .iter()
            .map(|received| received.ack_id.clone())
            .collect();
        if let Err(err) = self.acknowledge(&ack_ids).await {
            warn!(
                subscription = %self.name,
                count = ack_ids.len(),
                error = %err,
                "batch acknowledge failed"
            );
            self.unacked.extend(ack_ids);
        }

        for received in pulled.received_messages {
            let data = match BASE64.decode(received.message.data.as_bytes()) {
                Ok(data) => data,
                Err(err) => {
                    warn!(subscription = %self.name, error = %err, "dropping undecodable message");
                    continue;
                }
            };
            self.pending.push_back(ReceivedMessage {
                ack_id: received.ack_id,
                message: Message {
                    data: Bytes::from(data),
                    attributes: received.message.attributes,
                },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for GcpSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&mut self) -> PubSubResult<ReceivedMessage> {
        loop {
            if let Some(next) = self.pending.pop_front() {
                return Ok(next);
            }
            self.pull().await?;
            if self.pending.is_empty() {
                tokio::time::sleep(EMPTY_PULL_BACKOFF).await;
            }
        }
    }

    async fn ack(&mut self, ack_id: &str) -> PubSubResult<()> {
        if !self.unacked.remove(ack_id) {
            return Ok(());
        }
        self.acknowledge(&[ack_id.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_paths_use_project() {
        let inner = Inner {
            http: reqwest::Client::new(),
            config: GcpConfig {
                project_id: "realm-prod".into(),
                endpoint: "http://localhost:8085/v1/".into(),
                token: TokenSource::None,
            },
            token: Mutex::new(None),
        };
        assert_eq!(
            inner.url(&inner.topic_path("PORTAL_IN_9")),
            "http://localhost:8085/v1/projects/realm-prod/topics/PORTAL_IN_9"
        );
        assert_eq!(
            inner.subscription_path("PORTAL_IN_9_SUB_x"),
            "projects/realm-prod/subscriptions/PORTAL_IN_9_SUB_x"
        );
    }

    #[test]
    fn ttl_is_rendered_in_seconds() {
        assert_eq!(ttl_string(crate::DEFAULT_SUBSCRIPTION_TTL), "86400s");
        assert_eq!(ttl_string(Duration::from_millis(10)), "1s");
    }

    #[test]
    fn empty_pull_response_parses() {
        let pulled: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(pulled.received_messages.is_empty());
    }
}
