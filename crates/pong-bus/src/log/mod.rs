//! # Event Log Port
//!
//! The external, append-only log the bus reads from and fires into.
//!
//! - [`ConsulEventLog`] - Consul agent HTTP API (`/v1/event/*`)
//! - [`InMemoryEventLog`] - single-process log for tests and local runs

mod consul;
mod memory;

pub use consul::ConsulEventLog;
pub use memory::InMemoryEventLog;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by an event log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log could not be reached or the handle could not be created.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The log answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The event could not be encoded for firing.
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// The log has been shut down and will not answer again.
    #[error("event log closed")]
    Closed,
}

impl LogError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, LogError::Closed | LogError::Encode(_))
    }
}

/// A user event as stored by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Log-assigned event id.
    pub id: String,
    /// Event name (always `"pong"` for bus traffic).
    pub name: String,
    /// Raw event body.
    pub payload: Vec<u8>,
    /// Logical timestamp; strictly increasing across the log.
    pub ltime: u64,
}

/// Result of a (possibly blocking) listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    /// Query index to pass to the next blocking listing.
    pub index: u64,
    /// Events in log order, oldest first.
    pub events: Vec<LogEvent>,
}

/// Port to the external event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// List the retained events named `name`.
    async fn list(&self, name: &str) -> Result<EventBatch, LogError>;

    /// List events named `name`, waiting up to `wait` for the log index to
    /// move past `index`.
    ///
    /// Returns the current listing on timeout, so callers must compare
    /// indexes themselves.
    async fn list_blocking(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<EventBatch, LogError>;

    /// Append an event and return the id the log assigned to it.
    async fn fire(&self, name: &str, payload: Vec<u8>) -> Result<String, LogError>;
}
