//! Consul user-event log over the agent HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::{EventBatch, EventLog, LogError, LogEvent};
use crate::config::BusConfig;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// User event as serialized by the Consul agent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulUserEvent {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(default)]
    payload: Option<String>,
    #[serde(rename = "LTime", default)]
    ltime: u64,
}

impl TryFrom<ConsulUserEvent> for LogEvent {
    type Error = LogError;

    fn try_from(event: ConsulUserEvent) -> Result<Self, Self::Error> {
        let payload = match event.payload {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| LogError::Decode(format!("payload of event {}: {e}", event.id)))?,
            None => Vec::new(),
        };

        Ok(LogEvent {
            id: event.id,
            name: event.name,
            payload,
            ltime: event.ltime,
        })
    }
}

/// Event log backed by a Consul agent.
pub struct ConsulEventLog {
    client: Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulEventLog {
    /// Create a client for the agent named in `config`.
    ///
    /// No request is made; an unusable endpoint or TLS backend is reported
    /// here as [`LogError::Connection`].
    pub fn new(config: &BusConfig) -> Result<Self, LogError> {
        let url = reqwest::Url::parse(&config.consul_uri)
            .map_err(|e| LogError::Connection(format!("invalid endpoint {}: {e}", config.consul_uri)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LogError::Connection(format!(
                "unsupported scheme in endpoint {}",
                config.consul_uri
            )));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| LogError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.consul_uri.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
        })
    }

    /// Agent endpoint this log talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn decorate(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, LogError> {
        let response = self.decorate(request).send().await.map_err(|e| {
            if e.is_connect() {
                LogError::Connection(format!("cannot connect to {}", self.base_url))
            } else {
                LogError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn read_batch(response: Response) -> Result<EventBatch, LogError> {
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let body = response.bytes().await?;
        let events = parse_events(&body)?;
        Ok(EventBatch { index, events })
    }
}

/// Decode a `/v1/event/list` body.
fn parse_events(body: &[u8]) -> Result<Vec<LogEvent>, LogError> {
    // The agent answers `null` rather than `[]` when nothing is retained.
    let raw: Option<Vec<ConsulUserEvent>> =
        serde_json::from_slice(body).map_err(|e| LogError::Decode(e.to_string()))?;

    raw.unwrap_or_default()
        .into_iter()
        .map(LogEvent::try_from)
        .collect()
}

#[async_trait]
impl EventLog for ConsulEventLog {
    async fn list(&self, name: &str) -> Result<EventBatch, LogError> {
        let request = self
            .client
            .get(format!("{}/v1/event/list", self.base_url))
            .query(&[("name", name)]);

        Self::read_batch(self.send(request).await?).await
    }

    async fn list_blocking(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<EventBatch, LogError> {
        // The agent adds up to wait/16 of jitter before answering.
        let deadline = wait + wait / 16 + Duration::from_secs(5);
        let request = self
            .client
            .get(format!("{}/v1/event/list", self.base_url))
            .query(&[("name", name)])
            .query(&[
                ("index", index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ])
            .timeout(deadline);

        debug!(event = name, index, wait_ms = wait.as_millis() as u64, "Blocking event query");
        Self::read_batch(self.send(request).await?).await
    }

    async fn fire(&self, name: &str, payload: Vec<u8>) -> Result<String, LogError> {
        let request = self
            .client
            .put(format!("{}/v1/event/fire/{}", self.base_url, name))
            .body(payload);

        let body = self.send(request).await?.bytes().await?;
        let event: ConsulUserEvent =
            serde_json::from_slice(&body).map_err(|e| LogError::Decode(e.to_string()))?;

        debug!(event = name, id = %event.id, "Event fired");
        Ok(event.id)
    }
}
