//! # Stub Consul Agent
//!
//! Serves the two user-event endpoints the bus relies on:
//!
//! - `GET /v1/event/list?name=&index=&wait=` with blocking-query support and
//!   the `X-Consul-Index` header. Like the real agent it answers `null` when
//!   nothing is retained.
//! - `PUT /v1/event/fire/:name` storing the raw body.
//!
//! The server runs on an ephemeral port and stops when the handle is dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "x-consul-token";
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Event as retained by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub ltime: u64,
}

impl StoredEvent {
    fn to_json(&self) -> Value {
        let payload = if self.payload.is_empty() {
            Value::Null
        } else {
            Value::String(STANDARD.encode(&self.payload))
        };
        json!({
            "ID": self.id,
            "Name": self.name,
            "Payload": payload,
            "NodeFilter": "",
            "ServiceFilter": "",
            "TagFilter": "",
            "Version": 1,
            "LTime": self.ltime,
        })
    }
}

struct Store {
    events: Vec<StoredEvent>,
    index: u64,
    ltime: u64,
    fail_status: Option<StatusCode>,
    last_token: Option<String>,
    last_datacenter: Option<String>,
    blocking_queries: usize,
}

struct Shared {
    store: Mutex<Store>,
    changed: Notify,
}

impl Shared {
    /// Record request metadata; returns the injected failure, if any.
    fn observe(&self, headers: &HeaderMap, dc: Option<String>) -> Option<StatusCode> {
        let mut store = self.store.lock();
        store.last_token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        store.last_datacenter = dc;
        store.fail_status
    }

    fn push(&self, event: StoredEvent) {
        {
            let mut store = self.store.lock();
            store.index += 1;
            store.ltime = store.ltime.max(event.ltime);
            store.events.push(event);
        }
        self.changed.notify_waiters();
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    name: Option<String>,
    index: Option<u64>,
    wait: Option<String>,
    dc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FireQuery {
    dc: Option<String>,
}

/// Handle to a running stub agent.
pub struct StubConsul {
    addr: SocketAddr,
    shared: Arc<Shared>,
    server: JoinHandle<()>,
}

impl StubConsul {
    /// Bind an ephemeral local port and start serving.
    pub async fn spawn() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            store: Mutex::new(Store {
                events: Vec::new(),
                // The real agent never reports index 0.
                index: 1,
                ltime: 0,
                fail_status: None,
                last_token: None,
                last_datacenter: None,
                blocking_queries: 0,
            }),
            changed: Notify::new(),
        });

        let app = Router::new()
            .route("/v1/event/list", get(list))
            .route("/v1/event/fire/:name", put(fire))
            .with_state(Arc::clone(&shared));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            shared,
            server,
        })
    }

    /// Base URI of the agent, e.g. `http://127.0.0.1:49152`.
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Retain an event exactly as given, bypassing the fire endpoint.
    pub fn insert(&self, id: &str, name: &str, payload: &[u8], ltime: u64) {
        self.shared.push(StoredEvent {
            id: id.to_string(),
            name: name.to_string(),
            payload: payload.to_vec(),
            ltime,
        });
    }

    /// Answer every request with `status` until cleared with `None`.
    pub fn fail_with(&self, status: Option<StatusCode>) {
        self.shared.store.lock().fail_status = status;
        self.shared.changed.notify_waiters();
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.shared.store.lock().events.clone()
    }

    pub fn last_token(&self) -> Option<String> {
        self.shared.store.lock().last_token.clone()
    }

    pub fn last_datacenter(&self) -> Option<String> {
        self.shared.store.lock().last_datacenter.clone()
    }

    /// Number of list requests that carried an `index` parameter.
    pub fn blocking_queries(&self) -> usize {
        self.shared.store.lock().blocking_queries
    }
}

impl Drop for StubConsul {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn list(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = shared.observe(&headers, query.dc.clone()) {
        return (status, "stub failure").into_response();
    }

    if let Some(index) = query.index {
        shared.store.lock().blocking_queries += 1;
        let wait = query.wait.as_deref().and_then(parse_wait).unwrap_or(DEFAULT_WAIT);
        let deadline = Instant::now() + wait;

        loop {
            let notified = shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let store = shared.store.lock();
                if store.index != index || store.fail_status.is_some() {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
    }

    let store = shared.store.lock();
    if let Some(status) = store.fail_status {
        return (status, "stub failure").into_response();
    }

    let events: Vec<Value> = store
        .events
        .iter()
        .filter(|e| query.name.as_deref().map_or(true, |name| e.name == name))
        .map(StoredEvent::to_json)
        .collect();
    let body = if events.is_empty() {
        Value::Null
    } else {
        Value::Array(events)
    };

    ([(INDEX_HEADER, store.index.to_string())], Json(body)).into_response()
}

async fn fire(
    State(shared): State<Arc<Shared>>,
    Path(name): Path<String>,
    Query(query): Query<FireQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(status) = shared.observe(&headers, query.dc) {
        return (status, "stub failure").into_response();
    }

    let ltime = shared.store.lock().ltime + 1;
    let event = StoredEvent {
        id: Uuid::new_v4().to_string(),
        name,
        payload: body.to_vec(),
        ltime,
    };
    shared.push(event.clone());

    Json(event.to_json()).into_response()
}

/// Parse Consul's `wait` parameter (`"250ms"`, `"5s"`).
fn parse_wait(raw: &str) -> Option<Duration> {
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    raw.strip_suffix('s')?.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wait() {
        assert_eq!(parse_wait("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_wait("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_wait("soon"), None);
    }

    #[test]
    fn test_event_json_shape() {
        let event = StoredEvent {
            id: "1".into(),
            name: "pong".into(),
            payload: b"hi".to_vec(),
            ltime: 3,
        };
        let value = event.to_json();
        assert_eq!(value["Payload"], "aGk=");
        assert_eq!(value["LTime"], 3);
    }
}
