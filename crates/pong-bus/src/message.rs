//! # Message Envelope
//!
//! The wire-level unit carried through the event log: an id, a topic address
//! and an opaque JSON payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding a [`Message`].
#[derive(Debug, Error)]
pub enum MessageError {
    /// The bytes are not a valid JSON message object.
    #[error("invalid message encoding: {0}")]
    Json(#[from] serde_json::Error),

    /// The message decoded but carries no address to route on.
    #[error("message has no address")]
    MissingAddress,
}

/// A message routed by address.
///
/// `id` is only meaningful once the message has passed through the log;
/// outbound messages usually leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Log-assigned event id.
    #[serde(default)]
    pub id: String,

    /// Topic the message is routed to.
    pub address: String,

    /// Message body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Create an outbound message with no id.
    pub fn new(address: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: String::new(),
            address: address.into(),
            payload: payload.into(),
        }
    }

    /// Encode to the canonical JSON bytes fired into the log.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the raw bytes of a log event payload.
    ///
    /// Unknown fields are ignored. An empty address is rejected so every
    /// decoded message can be routed.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_slice(bytes)?;
        if message.address.is_empty() {
            return Err(MessageError::MissingAddress);
        }
        Ok(message)
    }

    /// Return the message tagged with the id the log assigned to it.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
