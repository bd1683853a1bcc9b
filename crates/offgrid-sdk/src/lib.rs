//! Offgrid SDK - offline-first client for chat and collaborative documents
//!
//! Local state is authoritative for the UI and converges with the remote side
//! whenever connectivity allows:
//!
//! - outgoing messages are persisted before they are sent and retried with
//!   backoff, strictly in submission order
//! - the WebSocket link reconnects on its own and queues frames while offline
//! - chats, contacts, documents and message history are pulled with
//!   idempotent upserts
//! - document edits merge per block and per field with Last-Writer-Wins
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use offgrid_sdk::{ClientConfigBuilder, OfflineClient, TungsteniteConnector};
//! use offgrid_sdk::api::MemoryApi;
//! use offgrid_sdk::db::{MemoryStore, NewMessage};
//! use std::sync::Arc;
//!
//! # async fn run() -> offgrid_sdk::Result<()> {
//! let config = ClientConfigBuilder::new()
//!     .node_id("alice")
//!     .server_url("ws://localhost:8080/ws")
//!     .auth_token("token")
//!     .build();
//!
//! let client = OfflineClient::new(
//!     config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryApi::new()),
//!     Arc::new(TungsteniteConnector::new()),
//! );
//! client.start().await?;
//!
//! let local_id = client
//!     .send_message(NewMessage::text("chat-1", "alice", "hello"))
//!     .await?;
//! # let _ = local_id;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`transport`] - reconnecting WebSocket client and socket connectors
//! - [`queue`] - serial, persistent outbound message queue
//! - [`sync`] - reconciliation engine and pending-operation replay
//! - [`api`] - remote API collaborator trait and envelopes
//! - [`session`] - document editing sessions over the transport
//! - [`backup`] - cloud backup capability
//! - [`client`] - composition root
//! - [`error`] - error types

pub mod api;
pub mod backup;
pub mod client;
pub mod error;
pub mod queue;
pub mod session;
pub mod sync;
pub mod transport;

pub use offgrid_db as db;

// Re-exports for convenience
pub use api::{ApiResponse, MemoryApi, PageMeta, RemoteApi};
pub use backup::{BackupKind, BackupService, CloudBackupProvider, MemoryBackupProvider, Platform};
pub use client::{ClientConfig, ClientConfigBuilder, OfflineClient};
pub use error::{Result, SdkError};
pub use queue::{MessageQueue, OutgoingMessage, QueueConfig, StatusChange};
pub use session::{DocumentSession, SessionEvent};
pub use sync::{ReplayReport, SyncConfig, SyncConfigBuilder, SyncEngine, SyncStatus};
pub use transport::{
    AppState, ConnectionState, Frame, MemoryConnector, SocketConnector, Subscription,
    TransportConfig, TransportConfigBuilder, TungsteniteConnector, WebSocketClient,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{ClientConfig, OfflineClient};
    pub use crate::error::SdkError;
    pub use crate::queue::MessageQueue;
    pub use crate::session::DocumentSession;
    pub use crate::sync::{SyncConfig, SyncEngine};
    pub use crate::transport::{ConnectionState, SocketConnector, WebSocketClient};
    pub use offgrid_db::{BlockField, LocalStore, NewMessage};
}
