//! # Event Bus
//!
//! Bridges a Consul event watch to per-topic listeners.
//!
//! ## State Machine
//!
//! ```text
//!          start() ok                stop()               watch task exits
//! Idle ─────────────────► Running ──────────► Stopping ───────────────────► Stopped
//!   │                        │                                                 ▲
//!   │ start() fails          └──────────── watch task exits on its own ────────┤
//!   └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Stopped` is terminal; a bus is never restarted.
//!
//! ## Deduplication
//!
//! The watch hands over the whole retained listing on every change. Only
//! events whose logical timestamp is above the watermark are dispatched, and
//! each dispatched event raises the watermark to its timestamp.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::BusConfig;
use crate::dispatcher::{BusEvent, Dispatcher, ListenerId};
use crate::log::{ConsulEventLog, EventLog, LogError, LogEvent};
use crate::message::Message;
use crate::watch::{WatchError, WatchParams, WatchPlan};
use crate::{ERROR_TOPIC, EVENT_NAME, MESSAGE_TOPIC, RAW_TOPIC};

/// Errors returned by [`EventBus`] operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The event log handle could not be created.
    #[error("failed to connect to event log: {0}")]
    Connection(#[source] LogError),

    /// The initial listing failed.
    #[error("failed to list existing events: {0}")]
    Query(#[source] LogError),

    /// The watch specification was rejected.
    #[error("failed to set up event watch: {0}")]
    WatchSetup(#[source] WatchError),

    /// Firing the event failed.
    #[error("failed to publish message: {0}")]
    Publish(#[source] LogError),

    /// `start` was called on a bus that is not idle.
    #[error("event bus already started (state: {0})")]
    AlreadyStarted(BusState),

    /// `stop` was called on a bus that is not running.
    #[error("event bus is not running (state: {0})")]
    NotRunning(BusState),

    /// No event log handle exists yet.
    #[error("event bus has no event log connection; call start() first")]
    NotStarted,
}

/// Lifecycle state of an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusState::Idle => "idle",
            BusState::Starting => "starting",
            BusState::Running => "running",
            BusState::Stopping => "stopping",
            BusState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Final result reported by the watch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCode {
    /// The watch was cancelled.
    Clean,
    /// The watch ended because of an error.
    Fatal,
}

impl ShutdownCode {
    /// Numeric form: `0` for clean, `1` for fatal.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ShutdownCode::Clean => 0,
            ShutdownCode::Fatal => 1,
        }
    }
}

/// One-shot future resolving when the watch task exits.
///
/// Resolves to [`ShutdownCode::Fatal`] if the bus is dropped or fails to
/// start without ever running its watch.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: oneshot::Receiver<ShutdownCode>,
}

impl ShutdownSignal {
    /// Non-blocking check; `None` while the watch is still running.
    pub fn try_code(&mut self) -> Option<ShutdownCode> {
        match self.rx.try_recv() {
            Ok(code) => Some(code),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(ShutdownCode::Fatal),
        }
    }
}

impl Future for ShutdownSignal {
    type Output = ShutdownCode;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(ShutdownCode::Fatal))
    }
}

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Record of a [`EventBus::consume`] registration.
#[derive(Clone)]
pub struct Consumer {
    address: String,
    handler: Handler,
    id: ListenerId,
    dispatcher: Weak<Dispatcher>,
}

impl Consumer {
    /// Address the handler is registered on.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The registered handler.
    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Dispatcher registration id.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the registration. Returns `false` if already removed or the
    /// bus is gone.
    pub fn cancel(&self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|d| d.off(&self.address, self.id))
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("address", &self.address)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Topic-routed event bus over an external event log.
pub struct EventBus {
    config: BusConfig,
    dispatcher: Arc<Dispatcher>,
    log: Mutex<Option<Arc<dyn EventLog>>>,
    seen: Arc<AtomicU64>,
    state: Arc<Mutex<BusState>>,
    cancel: watch::Sender<bool>,
    shutdown_tx: Mutex<Option<oneshot::Sender<ShutdownCode>>>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<ShutdownCode>>>,
}

impl EventBus {
    /// Create a bus that connects to the Consul agent in `config` on start.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a bus over an already connected log.
    ///
    /// Watch tuning comes from `config`; its endpoint settings are unused.
    #[must_use]
    pub fn with_log(log: Arc<dyn EventLog>, config: BusConfig) -> Self {
        Self::build(config, Some(log))
    }

    fn build(config: BusConfig, log: Option<Arc<dyn EventLog>>) -> Self {
        let (cancel, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            log: Mutex::new(log),
            seen: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(BusState::Idle)),
            cancel,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    /// Synchronise the watermark with the log and launch the watch task.
    ///
    /// Returns once the task is spawned; await [`shutdown_signal`] to learn
    /// when it exits. Must be called from within a tokio runtime.
    ///
    /// A failed start leaves the bus `Stopped`; build a new one to retry.
    ///
    /// [`shutdown_signal`]: EventBus::shutdown_signal
    pub async fn start(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock();
            if *state != BusState::Idle {
                return Err(BusError::AlreadyStarted(*state));
            }
            *state = BusState::Starting;
        }

        let result = self.launch().await;
        if let Err(err) = &result {
            warn!(error = %err, "Event bus failed to start");
            *self.state.lock() = BusState::Stopped;
            self.shutdown_tx.lock().take();
        }
        result
    }

    async fn launch(&self) -> Result<(), BusError> {
        let log = self.connect()?;

        let initial = log.list(EVENT_NAME).await.map_err(BusError::Query)?;
        let watermark = initial.events.last().map_or(0, |e| e.ltime);
        self.seen.store(watermark, Ordering::Release);

        let plan = WatchPlan::parse(&watch_params())
            .map_err(BusError::WatchSetup)?
            .with_options(self.config.watch.clone());

        let Some(shutdown_tx) = self.shutdown_tx.lock().take() else {
            return Err(BusError::AlreadyStarted(BusState::Starting));
        };

        let raw_handler = Arc::downgrade(&self.dispatcher);
        self.dispatcher.on(RAW_TOPIC, move |event| {
            if let (BusEvent::Raw(raw), Some(dispatcher)) = (event, raw_handler.upgrade()) {
                handle(&dispatcher, raw);
            }
        });

        *self.state.lock() = BusState::Running;
        info!(
            event = EVENT_NAME,
            watermark,
            retained = initial.events.len(),
            "Event bus started"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let seen = Arc::clone(&self.seen);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.subscribe();

        tokio::spawn(async move {
            let outcome = plan
                .run(
                    log.as_ref(),
                    |batch| {
                        dispatch_batch(&dispatcher, &seen, &batch.events);
                    },
                    cancel,
                )
                .await;

            let code = match outcome {
                Ok(()) => {
                    info!("Event watch stopped");
                    ShutdownCode::Clean
                }
                Err(err) => {
                    error!(error = %err, "Event watch failed");
                    dispatcher.emit(
                        ERROR_TOPIC,
                        &BusEvent::Error(format!("error accessing event log: {err}")),
                    );
                    ShutdownCode::Fatal
                }
            };

            *state.lock() = BusState::Stopped;
            // The receiver may already be gone; nothing else to notify.
            let _ = shutdown_tx.send(code);
        });

        Ok(())
    }

    fn connect(&self) -> Result<Arc<dyn EventLog>, BusError> {
        let mut slot = self.log.lock();
        if let Some(log) = slot.as_ref() {
            return Ok(Arc::clone(log));
        }

        let log: Arc<dyn EventLog> =
            Arc::new(ConsulEventLog::new(&self.config).map_err(BusError::Connection)?);
        debug!(endpoint = %self.config.consul_uri, "Connected to Consul agent");
        *slot = Some(Arc::clone(&log));
        Ok(log)
    }

    /// Request the watch task to stop. Does not wait for it.
    pub fn stop(&self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if *state != BusState::Running {
            return Err(BusError::NotRunning(*state));
        }
        *state = BusState::Stopping;
        self.cancel.send_replace(true);
        debug!("Event bus stop requested");
        Ok(())
    }

    /// Register `handler` for messages routed to `address`.
    ///
    /// Handlers run synchronously on the watch task.
    pub fn consume<F>(&self, address: impl Into<String>, handler: F) -> Consumer
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let address = address.into();
        let handler: Handler = Arc::new(handler);

        let listener = Arc::clone(&handler);
        let id = self.dispatcher.on(address.clone(), move |event| {
            if let BusEvent::Message(message) = event {
                listener(message);
            }
        });
        debug!(address = %address, "Consumer registered");

        Consumer {
            address,
            handler,
            id,
            dispatcher: Arc::downgrade(&self.dispatcher),
        }
    }

    /// Register `handler` for every decoded message regardless of address.
    pub fn on_message<F>(&self, handler: F) -> Consumer
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.consume(MESSAGE_TOPIC, handler)
    }

    /// Register `handler` for non-fatal diagnostics.
    pub fn on_error<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.on(ERROR_TOPIC, move |event| {
            if let BusEvent::Error(text) = event {
                handler(text);
            }
        })
    }

    /// Remove a consumer registered on this bus.
    ///
    /// Returns `false` if it belongs to another bus or was already removed.
    pub fn unsubscribe(&self, consumer: &Consumer) -> bool {
        let own = Arc::downgrade(&self.dispatcher);
        if !Weak::ptr_eq(&own, &consumer.dispatcher) {
            return false;
        }
        self.dispatcher.off(&consumer.address, consumer.id)
    }

    /// Fire `message` into the log and return the id the log assigned.
    ///
    /// The message is not delivered locally; it comes back through the watch
    /// like any other.
    pub async fn publish(&self, message: &Message) -> Result<String, BusError> {
        let log = self.log.lock().clone().ok_or(BusError::NotStarted)?;
        let payload = message
            .to_json()
            .map_err(|e| BusError::Publish(LogError::Encode(e.to_string())))?;

        let id = log
            .fire(EVENT_NAME, payload)
            .await
            .map_err(BusError::Publish)?;
        debug!(address = %message.address, id = %id, "Message published");
        Ok(id)
    }

    /// Take the shutdown signal. Only the first call returns it.
    pub fn shutdown_signal(&self) -> Option<ShutdownSignal> {
        self.shutdown_rx
            .lock()
            .take()
            .map(|rx| ShutdownSignal { rx })
    }

    /// Highest logical timestamp dispatched (or found at start).
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.seen.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    /// The bus's own dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &self.state())
            .field("watermark", &self.watermark())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn watch_params() -> WatchParams {
    WatchParams::from([
        ("type".to_string(), serde_json::Value::from("event")),
        ("name".to_string(), serde_json::Value::from(EVENT_NAME)),
    ])
}

/// Dispatch the events of one watch batch that lie above the watermark.
///
/// Returns how many were dispatched.
fn dispatch_batch(dispatcher: &Dispatcher, seen: &AtomicU64, events: &[LogEvent]) -> usize {
    let mut dispatched = 0;
    for event in events {
        if event.ltime <= seen.load(Ordering::Acquire) {
            trace!(id = %event.id, ltime = event.ltime, "Skipping seen event");
            continue;
        }
        dispatcher.emit(RAW_TOPIC, &BusEvent::Raw(event.clone()));
        seen.store(event.ltime, Ordering::Release);
        dispatched += 1;
    }
    dispatched
}

/// Decode a raw event and route it to `"message"` then its address.
fn handle(dispatcher: &Dispatcher, raw: &LogEvent) {
    let message = match Message::from_json(&raw.payload) {
        Ok(message) => message.with_id(raw.id.clone()),
        Err(err) => {
            warn!(id = %raw.id, error = %err, "Dropping undecodable event");
            dispatcher.emit(
                ERROR_TOPIC,
                &BusEvent::Error(format!("error parsing data for message: {}", raw.id)),
            );
            return;
        }
    };

    let address = message.address.clone();
    let event = BusEvent::Message(message);
    dispatcher.emit(MESSAGE_TOPIC, &event);
    let delivered = dispatcher.emit(&address, &event);
    debug!(id = %raw.id, address = %address, delivered, "Message dispatched");
}
