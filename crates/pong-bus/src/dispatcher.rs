//! # Dispatcher
//!
//! In-process, topic-keyed listener registry. Each [`EventBus`](crate::EventBus)
//! owns its own dispatcher; there is no process-wide emitter.
//!
//! Listeners run synchronously on the emitting task, in registration order.
//! The table lock is released before any listener runs, so listeners may
//! register or remove listeners (on any topic) while a dispatch is in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::log::LogEvent;
use crate::message::Message;

/// Values carried on a bus dispatcher.
///
/// All topics share one namespace; the variant tells listeners what kind of
/// value was emitted.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A raw log event, before decoding (`"rawmessage"`).
    Raw(LogEvent),
    /// A decoded message (`"message"` and `"<address>"`).
    Message(Message),
    /// A non-fatal diagnostic (`"error"`).
    Error(String),
}

/// Handle identifying one registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Topic-keyed publish/subscribe primitive.
pub struct Dispatcher<E = BusEvent> {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener<E>)>>>,
    next_id: AtomicU64,
}

impl<E> Dispatcher<E> {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `listener` on `topic`.
    ///
    /// Registering the same closure twice adds two independent listeners.
    pub fn on<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        trace!(topic = %topic, listener = id.0, "Listener registered");

        self.listeners
            .write()
            .entry(topic)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a registration. Returns `false` if it was not present.
    pub fn off(&self, topic: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(topic) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            listeners.remove(topic);
        }
        removed
    }

    /// Invoke every listener on `topic` with `value`.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, topic: &str, value: &E) -> usize {
        // Snapshot so listeners can touch the table without deadlocking.
        let snapshot: Vec<Listener<E>> = match self.listeners.read().get(topic) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };

        for listener in &snapshot {
            listener(value);
        }
        snapshot.len()
    }

    /// Number of listeners currently registered on `topic`.
    #[must_use]
    pub fn listener_count(&self, topic: &str) -> usize {
        self.listeners.read().get(topic).map_or(0, Vec::len)
    }
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let mut topics: Vec<(&String, usize)> =
            listeners.iter().map(|(t, l)| (t, l.len())).collect();
        topics.sort();
        f.debug_struct("Dispatcher").field("topics", &topics).finish()
    }
}
