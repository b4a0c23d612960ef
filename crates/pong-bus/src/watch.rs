//! # Watch Plans
//!
//! A watch turns repeated blocking queries against an [`EventLog`] into a
//! stream of handler invocations, one per change of the log index.
//!
//! ## Lifecycle
//!
//! ```text
//! loop {
//!   ├─► list_blocking(name, index, wait)      (cancellable)
//!   │       ├─ Ok, index unchanged  ─► continue
//!   │       ├─ Ok, index changed    ─► handler(batch), remember index
//!   │       │                           (index went backwards ─► reset to 0)
//!   │       └─ Err
//!   │            ├─ not transient                 ─► exit Err(Terminated)
//!   │            ├─ failures > max_retries        ─► exit Err(RetriesExhausted)
//!   │            └─ sleep(backoff) (cancellable)  ─► continue
//!   └─ cancelled ─► exit Ok(())
//! }
//! ```
//!
//! The handler always receives the full listing, including events it has
//! already seen; deduplication is the caller's job.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::log::{EventBatch, EventLog, LogError};

/// Loosely typed watch specification, e.g. `{"type": "event", "name": "pong"}`.
pub type WatchParams = HashMap<String, serde_json::Value>;

/// Errors from parsing or running a watch.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The specification is malformed or asks for something unsupported.
    #[error("invalid watch specification: {0}")]
    InvalidSpec(String),

    /// The log failed in a way retrying cannot fix.
    #[error("watch terminated: {0}")]
    Terminated(#[source] LogError),

    /// Too many consecutive query failures.
    #[error("watch gave up after {attempts} consecutive failures: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: LogError,
    },
}

/// Blocking-query and retry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Longest time a single blocking query may wait for a change.
    pub wait: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
    /// Delay after the first failure; doubles on every further one.
    pub retry_base: Duration,
    /// Upper bound for the retry delay.
    pub retry_max: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(300),
            max_retries: 5,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(180),
        }
    }
}

impl WatchOptions {
    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(1 << exponent)
            .min(self.retry_max)
    }
}

/// A parsed event watch, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPlan {
    name: String,
    options: WatchOptions,
}

impl WatchPlan {
    /// Build a plan from a specification.
    ///
    /// Accepted keys are `type` (must be `"event"`) and `name` (event name to
    /// watch). Anything else is rejected.
    pub fn parse(params: &WatchParams) -> Result<Self, WatchError> {
        let watch_type = params
            .get("type")
            .ok_or_else(|| WatchError::InvalidSpec("watch type must be specified".into()))?
            .as_str()
            .ok_or_else(|| WatchError::InvalidSpec("watch type must be a string".into()))?;
        if watch_type != "event" {
            return Err(WatchError::InvalidSpec(format!(
                "unsupported watch type: {watch_type}"
            )));
        }

        let name = params
            .get("name")
            .ok_or_else(|| WatchError::InvalidSpec("event name must be specified".into()))?
            .as_str()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| WatchError::InvalidSpec("event name must be a non-empty string".into()))?;

        let mut unknown: Vec<&str> = params
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "type" | "name"))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(WatchError::InvalidSpec(format!(
                "unsupported parameters: {}",
                unknown.join(", ")
            )));
        }

        Ok(Self {
            name: name.to_string(),
            options: WatchOptions::default(),
        })
    }

    /// Replace the query and retry tuning.
    #[must_use]
    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Event name this plan watches.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until cancelled or until the log fails for good.
    ///
    /// `cancel` stops the loop once it holds `true` or its sender is dropped.
    /// Returns `Ok(())` only for cancellation.
    pub async fn run<F>(
        &self,
        log: &dyn EventLog,
        mut handler: F,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&EventBatch) + Send,
    {
        let mut last_index: Option<u64> = None;
        let mut failures: u32 = 0;

        loop {
            if *cancel.borrow() {
                return Ok(());
            }

            let index = last_index.unwrap_or(0);
            let result = tokio::select! {
                biased;
                () = cancelled(&mut cancel) => return Ok(()),
                result = log.list_blocking(&self.name, index, self.options.wait) => result,
            };

            let batch = match result {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(err) if !err.is_transient() => return Err(WatchError::Terminated(err)),
                Err(err) => {
                    failures += 1;
                    if failures > self.options.max_retries {
                        return Err(WatchError::RetriesExhausted {
                            attempts: failures,
                            source: err,
                        });
                    }

                    let delay = self.options.backoff(failures);
                    warn!(
                        event = %self.name,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Event watch query failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancelled(&mut cancel) => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if last_index == Some(batch.index) {
                continue;
            }

            // An index moving backwards means the log was reset; start over.
            last_index = Some(if batch.index < index { 0 } else { batch.index });

            debug!(
                event = %self.name,
                index = batch.index,
                events = batch.events.len(),
                "Event watch fired"
            );
            handler(&batch);
        }
    }
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
