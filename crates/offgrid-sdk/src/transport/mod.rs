//! Resilient duplex transport.
//!
//! [`WebSocketClient`] keeps one logical connection alive over any
//! [`SocketConnector`]. It walks the state machine
//! `disconnected -> connecting -> connected -> reconnecting -> (connecting | disconnected)`,
//! reconnects with capped exponential backoff after unexpected closes, queues
//! frames while offline and flushes them in FIFO order once the link opens.
//!
//! Frames are JSON objects of the form `{"type": ..., "payload": ...}`.
//! Inbound frames that fail to decode are dropped. A panicking handler is
//! contained and never stops dispatch to the other handlers.

pub mod socket;
pub mod tungstenite;

pub use self::socket::{MemoryConnector, MemoryPeer, SocketConnector, SocketEvent, SocketLink};
pub use self::tungstenite::TungsteniteConnector;

use crate::error::{Result, SdkError};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Well-known frame types.
pub mod frame_types {
    pub const PING: &str = "ping";
    pub const CRDT_UPDATE: &str = "crdt:update";
    pub const MESSAGE_NEW: &str = "message:new";
    pub const MESSAGE_STATUS: &str = "message:status";
    pub const MESSAGE_DELETED: &str = "message:deleted";
}

/// A wire frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Connection state of the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Foreground/background state of the host application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Foreground,
    Background,
}

/// Configuration for the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// First reconnect delay (in milliseconds).
    pub initial_reconnect_delay_ms: u64,
    /// Reconnect delay ceiling (in milliseconds).
    pub max_reconnect_delay_ms: u64,
    /// Reconnects attempted before settling in `disconnected`.
    pub max_reconnect_attempts: u32,
    /// Keep-alive ping period (in milliseconds).
    pub ping_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30000,
            max_reconnect_attempts: 10,
            ping_interval_ms: 30000,
        }
    }
}

/// Builder for transport configuration.
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
        }
    }

    pub fn initial_reconnect_delay(mut self, ms: u64) -> Self {
        self.config.initial_reconnect_delay_ms = ms;
        self
    }

    pub fn max_reconnect_delay(mut self, ms: u64) -> Self {
        self.config.max_reconnect_delay_ms = ms;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn ping_interval(mut self, ms: u64) -> Self {
        self.config.ping_interval_ms = ms;
        self
    }

    pub fn build(self) -> TransportConfig {
        self.config
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`WebSocketClient::on`] and
/// [`WebSocketClient::on_state_change`].
///
/// Dropping the handle leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type FrameHandler = Arc<dyn Fn(&Value) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Credentials {
    url: String,
    token: String,
}

struct Shared {
    state: ConnectionState,
    credentials: Option<Credentials>,
    intentional_close: bool,
    attempts: u32,
    backoff_ms: u64,
    outbound: VecDeque<String>,
    link: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    /// Bumped on every open and on disconnect; events of older links are ignored.
    generation: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    lifecycle_task: Option<JoinHandle<()>>,
}

impl Shared {
    /// Returns the new state if it changed.
    fn set_state(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }

    fn stop_link(&mut self) {
        self.link = None;
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

struct Inner<C> {
    connector: Arc<C>,
    config: TransportConfig,
    shared: Mutex<Shared>,
    handlers: RwLock<HashMap<String, Vec<(u64, FrameHandler)>>>,
    state_handlers: RwLock<Vec<(u64, StateHandler)>>,
    next_handler_id: AtomicU64,
}

/// Reconnecting client over a [`SocketConnector`].
pub struct WebSocketClient<C: SocketConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: SocketConnector> Clone for WebSocketClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: SocketConnector> WebSocketClient<C> {
    pub fn new(connector: Arc<C>, config: TransportConfig) -> Self {
        let backoff_ms = config.initial_reconnect_delay_ms;
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    credentials: None,
                    intentional_close: false,
                    attempts: 0,
                    backoff_ms,
                    outbound: VecDeque::new(),
                    link: None,
                    generation: 0,
                    reconnect_timer: None,
                    ping_task: None,
                    reader_task: None,
                    lifecycle_task: None,
                }),
                handlers: RwLock::new(HashMap::new()),
                state_handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.inner.connector
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Frames waiting for an open link.
    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().outbound.len()
    }

    /// Open the connection.
    ///
    /// A no-op while already connected or connecting. Otherwise the reconnect
    /// budget is reset and a pending reconnect timer is replaced by an
    /// immediate attempt. A failed attempt is returned and also schedules a
    /// reconnect.
    pub async fn connect(&self, url: &str, token: &str) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            if matches!(
                shared.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            shared.credentials = Some(Credentials {
                url: url.to_string(),
                token: token.to_string(),
            });
            shared.intentional_close = false;
            shared.attempts = 0;
            shared.backoff_ms = self.inner.config.initial_reconnect_delay_ms;
            if let Some(timer) = shared.reconnect_timer.take() {
                timer.abort();
            }
        }
        Inner::open(self.inner.clone()).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Frames queued while offline are kept for the next connect.
    pub fn disconnect(&self) {
        let changed = {
            let mut shared = self.inner.shared.lock();
            shared.intentional_close = true;
            shared.generation += 1;
            if let Some(timer) = shared.reconnect_timer.take() {
                timer.abort();
            }
            shared.stop_link();
            shared.set_state(ConnectionState::Disconnected)
        };
        info!("transport disconnected");
        self.inner.notify_state(changed);
    }

    /// Send a frame, or queue it until the link opens.
    pub fn send(&self, kind: &str, payload: Value) -> Result<()> {
        let text = serde_json::to_string(&Frame::new(kind, payload))?;
        self.inner.shared.lock().outbound.push_back(text);
        self.inner.flush();
        Ok(())
    }

    /// Register a handler for one frame type.
    ///
    /// Handlers of the same type run in registration order.
    pub fn on<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        let kind = kind.to_string();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut handlers = inner.handlers.write();
                if let Some(list) = handlers.get_mut(&kind) {
                    list.retain(|(hid, _)| *hid != id);
                    if list.is_empty() {
                        handlers.remove(&kind);
                    }
                }
            }
        })
    }

    /// Register a connection-state observer.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state_handlers
            .write()
            .push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state_handlers.write().retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// React to the host app moving between foreground and background.
    ///
    /// Coming to the foreground while not connected, and not intentionally
    /// closed, reconnects immediately with a fresh attempt budget.
    pub fn app_state_changed(&self, app_state: AppState) {
        if app_state == AppState::Background {
            debug!("app moved to background");
            return;
        }

        {
            let mut shared = self.inner.shared.lock();
            if shared.intentional_close
                || shared.credentials.is_none()
                || matches!(
                    shared.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            {
                return;
            }
            shared.attempts = 0;
            shared.backoff_ms = self.inner.config.initial_reconnect_delay_ms;
            if let Some(timer) = shared.reconnect_timer.take() {
                timer.abort();
            }
        }

        info!("app foregrounded, reconnecting");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = Inner::open(inner).await;
        });
    }

    /// Follow app lifecycle changes published on a watch channel.
    pub fn attach_lifecycle(&self, mut lifecycle: watch::Receiver<AppState>) {
        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while lifecycle.changed().await.is_ok() {
                let app_state = *lifecycle.borrow_and_update();
                match weak.upgrade() {
                    Some(inner) => WebSocketClient { inner }.app_state_changed(app_state),
                    None => break,
                }
            }
        });

        if let Some(previous) = self.inner.shared.lock().lifecycle_task.replace(task) {
            previous.abort();
        }
    }
}

impl<C: SocketConnector> Inner<C> {
    fn open(inner: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let (generation, url, token, changed) = {
                let mut shared = inner.shared.lock();
                if shared.intentional_close
                    || matches!(
                        shared.state,
                        ConnectionState::Connected | ConnectionState::Connecting
                    )
                {
                    return Ok(());
                }
                let Some(credentials) = shared.credentials.as_ref() else {
                    return Err(SdkError::ConnectionFailed("no url configured".to_string()));
                };
                let (url, token) = (credentials.url.clone(), credentials.token.clone());
                shared.generation += 1;
                let changed = shared.set_state(ConnectionState::Connecting);
                (shared.generation, url, token, changed)
            };
            inner.notify_state(changed);
            debug!(%url, generation, "opening connection");

            match inner.connector.connect(&url, &token).await {
                Ok(link) => {
                    inner.on_open(link, generation);
                    Ok(())
                }
                Err(err) => {
                    warn!(error = %err, "connection attempt failed");
                    inner.handle_close(generation, Some(err.to_string()));
                    Err(err)
                }
            }
        })
    }

    fn on_open(self: &Arc<Self>, link: SocketLink, generation: u64) {
        let SocketLink {
            outgoing,
            mut incoming,
        } = link;

        let changed = {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.intentional_close {
                // Superseded while the connect was in flight.
                return;
            }
            shared.attempts = 0;
            shared.backoff_ms = self.config.initial_reconnect_delay_ms;
            shared.link = Some(outgoing);

            let reader = {
                let inner = self.clone();
                tokio::spawn(async move {
                    let reason = loop {
                        match incoming.recv().await {
                            Some(SocketEvent::Message(text)) => inner.dispatch(&text),
                            Some(SocketEvent::Closed { reason }) => break reason,
                            None => break None,
                        }
                    };
                    inner.handle_close(generation, reason);
                })
            };
            shared.reader_task = Some(reader);

            let ping_every = Duration::from_millis(self.config.ping_interval_ms.max(1));
            let ping = {
                let inner = self.clone();
                tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        inner.ping();
                    }
                })
            };
            shared.ping_task = Some(ping);

            shared.set_state(ConnectionState::Connected)
        };

        info!("transport connected");
        self.notify_state(changed);
        self.flush();
    }

    fn ping(&self) {
        let shared = self.shared.lock();
        if let Some(link) = shared.link.as_ref() {
            if let Ok(text) = serde_json::to_string(&Frame::new(frame_types::PING, Value::Null)) {
                let _ = link.send(text);
            }
        }
    }

    /// Drain queued frames in FIFO order while the link is open.
    fn flush(&self) {
        loop {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connected {
                return;
            }
            let Some(link) = shared.link.clone() else {
                return;
            };
            let Some(text) = shared.outbound.pop_front() else {
                return;
            };
            if let Err(unsent) = link.send(text) {
                shared.outbound.push_front(unsent.0);
                debug!(queued = shared.outbound.len(), "link closed during flush");
                return;
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "dropping malformed frame");
                return;
            }
        };

        let handlers: Vec<FrameHandler> = match self.handlers.read().get(&frame.kind) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&frame.payload))).is_err() {
                warn!(kind = %frame.kind, "frame handler panicked");
            }
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            shared.link = None;
            if let Some(task) = shared.ping_task.take() {
                task.abort();
            }
            // May be the running reader itself; detach rather than abort.
            shared.reader_task = None;
            if shared.intentional_close {
                return;
            }
        }
        debug!(?reason, "connection closed unexpectedly");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let changed = {
            let mut shared = self.shared.lock();
            if shared.intentional_close {
                return;
            }

            if shared.attempts >= self.config.max_reconnect_attempts {
                warn!(
                    attempts = shared.attempts,
                    "reconnect attempts exhausted, giving up"
                );
                shared.set_state(ConnectionState::Disconnected)
            } else {
                let delay = shared.backoff_ms;
                shared.attempts += 1;
                shared.backoff_ms = (shared.backoff_ms * 2).min(self.config.max_reconnect_delay_ms);
                info!(attempt = shared.attempts, delay_ms = delay, "scheduling reconnect");

                let inner = self.clone();
                let timer = tokio::spawn(async move {
                    sleep(Duration::from_millis(delay)).await;
                    inner.shared.lock().reconnect_timer = None;
                    let _ = Inner::open(inner).await;
                });
                if let Some(previous) = shared.reconnect_timer.replace(timer) {
                    previous.abort();
                }
                shared.set_state(ConnectionState::Reconnecting)
            }
        };
        self.notify_state(changed);
    }

    fn notify_state(&self, changed: Option<ConnectionState>) {
        let Some(state) = changed else {
            return;
        };
        let handlers: Vec<StateHandler> = self
            .state_handlers
            .read()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(state))).is_err() {
                warn!(%state, "state handler panicked");
            }
        }
    }
}
