//! Local store repositories.
//!
//! The local store is the single shared mutable resource of the client. All
//! writers treat rows as upsert-only, keyed by local id or server id, so
//! concurrent writers need no locking protocol beyond each call being atomic.
//! The remote system is the source of truth; the cache is advisory.
//!
//! Operations keyed by local id fail with [`DbError::NotFound`] when the row
//! is missing. Operations keyed by server id are no-ops for unknown ids, since
//! remote events may reference records this client never cached.
//!
//! [`DbError::NotFound`]: crate::error::DbError::NotFound

pub mod memory;
pub mod models;

use crate::error::Result;
use async_trait::async_trait;
use models::{
    ChatRow, ContactRow, DocumentRow, MessageRow, MessageStatus, NewMessage, NewOperation,
    PendingOperation,
};

/// Key under which the full-sync watermark is stored.
pub const FULL_SYNC_KEY: &str = "full_sync";

/// Persistence for chat messages and their pending-send state.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert an optimistic local message, returning its local id.
    async fn insert_message(&self, draft: &NewMessage) -> Result<String>;

    /// Insert or update by server id. Rows without a server id always insert.
    async fn upsert_message(&self, row: MessageRow) -> Result<String>;

    async fn get_message(&self, local_id: &str) -> Result<Option<MessageRow>>;

    async fn get_message_by_server_id(&self, server_id: &str) -> Result<Option<MessageRow>>;

    /// Non-deleted messages of a chat, oldest first.
    async fn list_messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>>;

    /// Confirm a send: status `sent`, pending cleared, server id recorded.
    async fn mark_message_sent(&self, local_id: &str, server_id: &str) -> Result<()>;

    /// Give up on a send. The row stays pending so it can be retried.
    async fn mark_message_failed(&self, local_id: &str) -> Result<()>;

    /// Put a message back to `sending` for a retry.
    async fn mark_message_sending(&self, local_id: &str) -> Result<()>;

    async fn update_message_status(&self, server_id: &str, status: MessageStatus) -> Result<()>;

    async fn soft_delete_message(&self, server_id: &str) -> Result<()>;

    /// All pending messages, oldest first.
    async fn get_pending_messages(&self) -> Result<Vec<MessageRow>>;

    async fn get_pending_messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>>;

    /// Server id of the newest synced message of a chat (the sync cursor).
    async fn get_latest_message_server_id(&self, chat_id: &str) -> Result<Option<String>>;

    async fn count_messages(&self, chat_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn upsert_chat(&self, row: ChatRow) -> Result<String>;
    async fn get_chat(&self, server_id: &str) -> Result<Option<ChatRow>>;
    async fn list_chats(&self) -> Result<Vec<ChatRow>>;
    async fn delete_chat(&self, server_id: &str) -> Result<bool>;
    async fn count_chats(&self) -> Result<usize>;
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn upsert_contact(&self, row: ContactRow) -> Result<String>;
    async fn get_contact(&self, server_id: &str) -> Result<Option<ContactRow>>;
    async fn list_contacts(&self) -> Result<Vec<ContactRow>>;
    async fn delete_contact(&self, server_id: &str) -> Result<bool>;
    async fn count_contacts(&self) -> Result<usize>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn upsert_document(&self, row: DocumentRow) -> Result<String>;
    async fn get_document(&self, server_id: &str) -> Result<Option<DocumentRow>>;
    async fn list_documents(&self) -> Result<Vec<DocumentRow>>;
    async fn delete_document(&self, server_id: &str) -> Result<bool>;
    async fn count_documents(&self) -> Result<usize>;
}

/// Sync watermarks, in epoch milliseconds.
#[async_trait]
pub trait SyncRepository: Send + Sync {
    /// Zero when the key was never synced.
    async fn get_last_sync_time(&self, key: &str) -> Result<i64>;
    async fn set_last_sync_time(&self, key: &str, timestamp: i64) -> Result<()>;
}

/// Durable ledger of mutations awaiting remote confirmation.
#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn add_pending_operation(&self, op: NewOperation) -> Result<String>;

    /// Operations in `pending`, in creation order.
    async fn get_pending_operations(&self) -> Result<Vec<PendingOperation>>;

    async fn get_operation(&self, id: &str) -> Result<Option<PendingOperation>>;

    async fn mark_operation_processing(&self, id: &str) -> Result<()>;

    /// Count a failed attempt and return the operation to `pending`.
    async fn mark_operation_failed(&self, id: &str) -> Result<()>;

    async fn mark_operation_permanently_failed(&self, id: &str) -> Result<()>;

    async fn remove_operation(&self, id: &str) -> Result<()>;

    /// Crash recovery: move every `processing` row back to `pending`.
    /// Must run on startup. Returns how many rows were reset.
    async fn reset_processing_operations(&self) -> Result<usize>;
}

/// Everything the sync layers need from local persistence.
pub trait LocalStore:
    MessageRepository
    + ChatRepository
    + ContactRepository
    + DocumentRepository
    + SyncRepository
    + OperationRepository
    + 'static
{
}

impl<T> LocalStore for T where
    T: MessageRepository
        + ChatRepository
        + ContactRepository
        + DocumentRepository
        + SyncRepository
        + OperationRepository
        + 'static
{
}
