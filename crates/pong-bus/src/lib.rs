//! # Pong Bus - Topic-Routed Messaging over Consul User Events
//!
//! Processes fire messages addressed by a string topic; other processes
//! subscribe to a topic and get a callback for every new message observed on
//! it. Storage, ordering and replication are delegated to Consul's user-event
//! log; this crate only bridges its watch mechanism to in-process listeners.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  blocking query   ┌──────────────┐
//! │  Consul log  │ ────────────────→ │  WatchPlan   │
//! └──────────────┘   (full batch)    └──────┬───────┘
//!        ↑                                  │ ltime > seen ?
//!        │ fire("pong")                     ▼
//! ┌──────┴───────┐               ┌──────────────────────┐
//! │  publish()   │               │ Dispatcher           │
//! └──────────────┘               │   "rawmessage"       │
//!                                │     → decode         │
//!                                │   "message"          │
//!                                │   "<address>"        │
//!                                │   "error"            │
//!                                └──────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At least once, deduplicated:** every event is dispatched at most once
//!   per bus instance, keyed by the log's logical timestamp (`LTime`).
//! - **Per-bus dispatcher:** two buses in one process never cross-talk.
//! - **One-shot shutdown:** the watch task reports its exit exactly once.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod log;
pub mod message;
pub mod watch;

// Re-export main types
pub use bus::{BusError, BusState, Consumer, EventBus, ShutdownCode, ShutdownSignal};
pub use config::BusConfig;
pub use dispatcher::{BusEvent, Dispatcher, ListenerId};
pub use log::{ConsulEventLog, EventBatch, EventLog, InMemoryEventLog, LogError, LogEvent};
pub use message::{Message, MessageError};
pub use watch::{WatchError, WatchOptions, WatchParams, WatchPlan};

/// Name of the Consul user event every pong message is fired as.
pub const EVENT_NAME: &str = "pong";

/// Consul agent address used when none is configured.
pub const DEFAULT_CONSUL_URI: &str = "http://localhost:8500";

/// Dispatcher topic carrying raw log events before decoding.
pub const RAW_TOPIC: &str = "rawmessage";

/// Dispatcher topic receiving every successfully decoded message.
pub const MESSAGE_TOPIC: &str = "message";

/// Dispatcher topic carrying non-fatal diagnostics.
pub const ERROR_TOPIC: &str = "error";
