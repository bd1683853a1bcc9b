//! Composition root of the offline-first client.

use crate::api::{MemoryApi, RemoteApi, RemoteMessage};
use crate::error::{Result, SdkError};
use crate::queue::{MessageQueue, QueueConfig};
use crate::session::DocumentSession;
use crate::sync::{SyncConfig, SyncEngine, SyncStatus};
use crate::transport::{
    frame_types, AppState, ConnectionState, MemoryConnector, SocketConnector, Subscription,
    TransportConfig, WebSocketClient,
};
use offgrid_core::clock::{SystemClock, WallClock};
use offgrid_db::{LocalStore, MemoryStore, MessageStatus, NewMessage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the client.
///
/// Every section is optional in JSON; missing values take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity of this replica in CRDT events.
    pub node_id: String,
    /// WebSocket endpoint.
    pub server_url: String,
    /// Bearer token presented on connect.
    pub auth_token: String,
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", ulid::Ulid::new()),
            server_url: "ws://localhost:8080/ws".to_string(),
            auth_token: String::new(),
            transport: TransportConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SdkError::Config(e.to_string()))
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(alias = "id")]
    message_id: String,
    status: MessageStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedPayload {
    #[serde(alias = "id")]
    message_id: String,
}

/// Server pushes applied to the store in arrival order.
#[derive(Debug)]
enum Inbound {
    New(RemoteMessage),
    Status(StatusPayload),
    Deleted(DeletedPayload),
}

/// The offline-first client.
///
/// Owns the store, remote API, transport, message queue and sync engine.
/// Nothing is global, so several clients (one per account) can coexist.
///
/// # Example
///
/// ```rust
/// use offgrid_sdk::{ClientConfigBuilder, OfflineClient};
/// use offgrid_sdk::db::BlockField;
///
/// let config = ClientConfigBuilder::new().node_id("alice").build();
/// let client = OfflineClient::new_in_memory(config);
///
/// let doc = client.open_document("notes");
/// doc.edit("b1", BlockField::Content, "offline edit").unwrap();
/// assert_eq!(client.transport().queued_len(), 1);
/// ```
pub struct OfflineClient<S: LocalStore, A: RemoteApi, C: SocketConnector> {
    config: ClientConfig,
    store: Arc<S>,
    api: Arc<A>,
    transport: WebSocketClient<C>,
    queue: MessageQueue<S>,
    sync: SyncEngine<S, A>,
    subscriptions: Mutex<Vec<Subscription>>,
    inbound_worker: Mutex<Option<JoinHandle<()>>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
    sessions: RwLock<HashMap<String, Arc<DocumentSession<C>>>>,
}

impl OfflineClient<MemoryStore, MemoryApi, MemoryConnector> {
    /// Client over in-memory collaborators (for testing).
    pub fn new_in_memory(config: ClientConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryApi::new()),
            Arc::new(MemoryConnector::new()),
        )
    }
}

impl<S: LocalStore, A: RemoteApi, C: SocketConnector> OfflineClient<S, A, C> {
    pub fn new(config: ClientConfig, store: Arc<S>, api: Arc<A>, connector: Arc<C>) -> Self {
        Self::with_clock(config, store, api, connector, Arc::new(SystemClock))
    }

    /// Create a client whose sync staleness is measured against `clock`.
    pub fn with_clock(
        config: ClientConfig,
        store: Arc<S>,
        api: Arc<A>,
        connector: Arc<C>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let transport = WebSocketClient::new(connector, config.transport.clone());
        let queue = MessageQueue::new(store.clone(), config.queue.clone());
        let sync = SyncEngine::with_clock(store.clone(), api.clone(), config.sync.clone(), clock);

        let sender = api.clone();
        queue.set_send_function(move |message| {
            let api = sender.clone();
            async move { Ok(api.send_message(&message).await?.data.id) }
        });

        Self {
            config,
            store,
            api,
            transport,
            queue,
            sync,
            subscriptions: Mutex::new(Vec::new()),
            inbound_worker: Mutex::new(None),
            auto_sync: Mutex::new(None),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn transport(&self) -> &WebSocketClient<C> {
        &self.transport
    }

    pub fn queue(&self) -> &MessageQueue<S> {
        &self.queue
    }

    pub fn sync(&self) -> &SyncEngine<S, A> {
        &self.sync
    }

    /// Recover state left by the previous run and go online.
    ///
    /// Resets interrupted ledger operations, re-queues unsent messages, wires
    /// server pushes into the store, connects and starts the periodic sync
    /// check. A failed connect is not an error here; the transport keeps
    /// retrying in the background.
    pub async fn start(&self) -> Result<()> {
        self.sync.recover().await?;
        self.wire_transport();
        self.queue.flush_pending().await?;

        if let Err(err) = self
            .transport
            .connect(&self.config.server_url, &self.config.auth_token)
            .await
        {
            warn!(error = %err, "starting offline");
        }

        let mut auto_sync = self.auto_sync.lock();
        if auto_sync.is_none() {
            let interval = Duration::from_millis(self.config.sync.auto_sync_interval_ms.max(1));
            *auto_sync = Some(self.sync.spawn_auto_sync(interval));
        }
        drop(auto_sync);
        info!(node_id = %self.config.node_id, "client started");
        Ok(())
    }

    /// Disconnect and detach from server pushes.
    pub fn stop(&self) {
        self.transport.disconnect();
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(worker) = self.inbound_worker.lock().take() {
            worker.abort();
        }
        if let Some(task) = self.auto_sync.lock().take() {
            task.abort();
        }
        info!("client stopped");
    }

    /// Queue a message for delivery. Returns its local id.
    pub async fn send_message(&self, draft: NewMessage) -> Result<String> {
        self.queue.enqueue(draft).await
    }

    pub async fn retry_message(&self, local_id: &str) -> Result<()> {
        self.queue.retry(local_id).await
    }

    pub async fn full_sync(&self) -> SyncStatus {
        self.sync.full_sync().await
    }

    /// Open, or return the already open, session for a document.
    pub fn open_document(&self, document_id: impl Into<String>) -> Arc<DocumentSession<C>> {
        let document_id = document_id.into();
        let mut sessions = self.sessions.write();

        if let Some(session) = sessions.get(&document_id) {
            session.clone()
        } else {
            let session = Arc::new(DocumentSession::open(
                document_id.clone(),
                self.config.node_id.clone(),
                self.transport.clone(),
            ));
            sessions.insert(document_id, session.clone());
            session
        }
    }

    pub fn close_document(&self, document_id: &str) {
        if let Some(session) = self.sessions.write().remove(document_id) {
            session.close();
        }
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// The app came to the foreground: reconnect if needed and sync if stale.
    pub async fn on_foreground(&self) -> Option<SyncStatus> {
        self.transport.app_state_changed(AppState::Foreground);
        self.sync.on_foreground().await
    }

    pub fn on_background(&self) {
        self.transport.app_state_changed(AppState::Background);
    }

    fn wire_transport(&self) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound_worker.lock() = Some(tokio::spawn(apply_inbound(self.store.clone(), rx)));

        subscriptions.push(self.route(frame_types::MESSAGE_NEW, tx.clone(), |payload| {
            Ok(Inbound::New(serde_json::from_value(payload)?))
        }));
        subscriptions.push(self.route(frame_types::MESSAGE_STATUS, tx.clone(), |payload| {
            Ok(Inbound::Status(serde_json::from_value(payload)?))
        }));
        subscriptions.push(self.route(frame_types::MESSAGE_DELETED, tx, |payload| {
            Ok(Inbound::Deleted(serde_json::from_value(payload)?))
        }));

        let queue = self.queue.clone();
        let sync = self.sync.clone();
        subscriptions.push(self.transport.on_state_change(move |state| {
            if state != ConnectionState::Connected {
                return;
            }
            let queue = queue.clone();
            let sync = sync.clone();
            tokio::spawn(async move {
                if let Err(err) = queue.flush_pending().await {
                    warn!(error = %err, "flushing pending messages failed");
                }
                if let Err(err) = sync.push_pending_operations().await {
                    warn!(error = %err, "replaying operations failed");
                }
            });
        }));
    }

    fn route(
        &self,
        kind: &'static str,
        tx: mpsc::UnboundedSender<Inbound>,
        decode: fn(Value) -> Result<Inbound>,
    ) -> Subscription {
        self.transport.on(kind, move |payload| match decode(payload.clone()) {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => debug!(kind, error = %err, "dropping undecodable push"),
        })
    }
}

async fn apply_inbound<S: LocalStore>(store: Arc<S>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = rx.recv().await {
        let result = match event {
            Inbound::New(message) => store.upsert_message(message.into_row()).await.map(|_| ()),
            Inbound::Status(update) => {
                store
                    .update_message_status(&update.message_id, update.status)
                    .await
            }
            Inbound::Deleted(deleted) => store.soft_delete_message(&deleted.message_id).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "applying server push failed");
        }
    }
}
