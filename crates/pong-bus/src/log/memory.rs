//! In-memory event log for tests and single-process scenarios.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{EventBatch, EventLog, LogError, LogEvent};

#[derive(Default)]
struct State {
    events: Vec<LogEvent>,
    last_ltime: u64,
    pending_failures: u32,
    closed: bool,
}

impl State {
    fn check(&mut self) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed);
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(LogError::Connection("injected failure".to_string()));
        }
        Ok(())
    }

    fn batch(&self, name: &str) -> EventBatch {
        EventBatch {
            index: self.last_ltime,
            events: self
                .events
                .iter()
                .filter(|e| e.name == name)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

/// Append-only log held in memory.
///
/// Cloning yields another handle to the same log. Logical timestamps start
/// at 1 and the blocking-query index is the last timestamp assigned.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event with a fresh id and the next logical timestamp.
    pub fn append(&self, name: &str, payload: impl Into<Vec<u8>>) -> LogEvent {
        let event = {
            let mut state = self.inner.state.lock();
            state.last_ltime += 1;
            let event = LogEvent {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                payload: payload.into(),
                ltime: state.last_ltime,
            };
            state.events.push(event.clone());
            event
        };
        self.inner.changed.notify_waiters();
        event
    }

    /// Append an event exactly as given, id and timestamp included.
    ///
    /// Later appends continue from the highest timestamp seen.
    pub fn insert(&self, event: LogEvent) {
        {
            let mut state = self.inner.state.lock();
            state.last_ltime = state.last_ltime.max(event.ltime);
            state.events.push(event);
        }
        self.inner.changed.notify_waiters();
    }

    /// Make the next `count` queries fail with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.inner.state.lock().pending_failures = count;
    }

    /// Fail every further call with [`LogError::Closed`] and wake waiters.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_waiters();
    }

    /// Snapshot of every retained event.
    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.inner.state.lock().events.clone()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Whether the log holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn list(&self, name: &str) -> Result<EventBatch, LogError> {
        let mut state = self.inner.state.lock();
        state.check()?;
        Ok(state.batch(name))
    }

    async fn list_blocking(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<EventBatch, LogError> {
        let deadline = Instant::now() + wait;
        self.inner.state.lock().check()?;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no append is missed.
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if state.closed {
                    return Err(LogError::Closed);
                }
                if state.last_ltime != index {
                    return Ok(state.batch(name));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.inner.state.lock().batch(name));
            }
        }
    }

    async fn fire(&self, name: &str, payload: Vec<u8>) -> Result<String, LogError> {
        if self.inner.state.lock().closed {
            return Err(LogError::Closed);
        }
        Ok(self.append(name, payload).id)
    }
}
