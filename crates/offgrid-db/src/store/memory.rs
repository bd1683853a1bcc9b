//! In-memory local store.
//!
//! Backs tests, simulations and clients that keep no durable cache. Each call
//! takes the table lock once, so every repository operation is atomic.

use super::models::{
    now_millis, ChatRow, ContactRow, DocumentRow, MessageRow, MessageStatus, NewMessage,
    NewOperation, OperationStatus, PendingOperation,
};
use super::{
    ChatRepository, ContactRepository, DocumentRepository, MessageRepository,
    OperationRepository, SyncRepository,
};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use ulid::{Generator, Ulid};

/// Rows addressable by both local and server id.
trait Keyed {
    fn local_id(&self) -> &str;
    fn set_local_id(&mut self, id: String);
    fn server_id(&self) -> Option<&str>;
}

macro_rules! impl_keyed {
    ($($row:ty),*) => {
        $(impl Keyed for $row {
            fn local_id(&self) -> &str {
                &self.local_id
            }

            fn set_local_id(&mut self, id: String) {
                self.local_id = id;
            }

            fn server_id(&self) -> Option<&str> {
                self.server_id.as_deref()
            }
        })*
    };
}

impl_keyed!(ChatRow, ContactRow, DocumentRow, MessageRow);

#[derive(Debug, Default)]
struct Tables {
    chats: HashMap<String, ChatRow>,
    contacts: HashMap<String, ContactRow>,
    documents: HashMap<String, DocumentRow>,
    messages: HashMap<String, MessageRow>,
    sync_meta: HashMap<String, i64>,
    operations: HashMap<String, PendingOperation>,
}

/// Thread-safe in-memory implementation of every repository.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    ids: Mutex<Generator>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("chats", &tables.chats.len())
            .field("contacts", &tables.contacts.len())
            .field("documents", &tables.documents.len())
            .field("messages", &tables.messages.len())
            .field("operations", &tables.operations.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            ids: Mutex::new(Generator::new()),
        }
    }

    /// Monotonic ULID, so id order is creation order.
    fn next_id(&self) -> String {
        self.ids
            .lock()
            .generate()
            .unwrap_or_else(|_| Ulid::new())
            .to_string()
    }

    fn upsert_keyed<R: Keyed>(&self, table: &mut HashMap<String, R>, mut row: R) -> String {
        let existing = row.server_id().and_then(|sid| {
            table
                .values()
                .find(|r| r.server_id() == Some(sid))
                .map(|r| r.local_id().to_string())
        });

        let local_id = match existing {
            Some(id) => id,
            None if row.local_id().is_empty() => self.next_id(),
            None => row.local_id().to_string(),
        };

        row.set_local_id(local_id.clone());
        table.insert(local_id.clone(), row);
        local_id
    }

    fn find_by_server_id<'a, R: Keyed>(
        table: &'a HashMap<String, R>,
        server_id: &str,
    ) -> Option<&'a R> {
        table.values().find(|r| r.server_id() == Some(server_id))
    }

    fn remove_by_server_id<R: Keyed>(table: &mut HashMap<String, R>, server_id: &str) -> bool {
        let key = Self::find_by_server_id(table, server_id).map(|r| r.local_id().to_string());
        match key {
            Some(key) => table.remove(&key).is_some(),
            None => false,
        }
    }

    fn message_mut<'a>(tables: &'a mut Tables, local_id: &str) -> Result<&'a mut MessageRow> {
        tables
            .messages
            .get_mut(local_id)
            .ok_or_else(|| DbError::NotFound(format!("message {}", local_id)))
    }

    fn operation_mut<'a>(tables: &'a mut Tables, id: &str) -> Result<&'a mut PendingOperation> {
        tables
            .operations
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("operation {}", id)))
    }

    fn sorted_messages<'a>(rows: impl Iterator<Item = &'a MessageRow>) -> Vec<MessageRow> {
        let mut rows: Vec<MessageRow> = rows.cloned().collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        rows
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert_message(&self, draft: &NewMessage) -> Result<String> {
        let mut row = MessageRow::outgoing(draft);
        let local_id = self.next_id();
        row.local_id = local_id.clone();
        self.tables.write().messages.insert(local_id.clone(), row);
        Ok(local_id)
    }

    async fn upsert_message(&self, row: MessageRow) -> Result<String> {
        let mut tables = self.tables.write();
        Ok(self.upsert_keyed(&mut tables.messages, row))
    }

    async fn get_message(&self, local_id: &str) -> Result<Option<MessageRow>> {
        Ok(self.tables.read().messages.get(local_id).cloned())
    }

    async fn get_message_by_server_id(&self, server_id: &str) -> Result<Option<MessageRow>> {
        Ok(Self::find_by_server_id(&self.tables.read().messages, server_id).cloned())
    }

    async fn list_messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>> {
        let tables = self.tables.read();
        Ok(Self::sorted_messages(
            tables
                .messages
                .values()
                .filter(|m| m.chat_id == chat_id && !m.is_deleted),
        ))
    }

    async fn mark_message_sent(&self, local_id: &str, server_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.messages.contains_key(local_id) {
            return Err(DbError::NotFound(format!("message {}", local_id)));
        }

        // An inbound echo of this message may have been cached before the ack.
        let echo = tables
            .messages
            .values()
            .find(|m| m.local_id != local_id && m.server_id.as_deref() == Some(server_id))
            .map(|m| m.local_id.clone());
        if let Some(echo) = echo {
            debug!(local_id, server_id, "dropping echoed copy of sent message");
            tables.messages.remove(&echo);
        }

        let row = Self::message_mut(&mut tables, local_id)?;
        row.server_id = Some(server_id.to_string());
        row.status = MessageStatus::Sent;
        row.is_pending = false;
        row.updated_at = now_millis();
        Ok(())
    }

    async fn mark_message_failed(&self, local_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let row = Self::message_mut(&mut tables, local_id)?;
        row.status = MessageStatus::Failed;
        row.updated_at = now_millis();
        Ok(())
    }

    async fn mark_message_sending(&self, local_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let row = Self::message_mut(&mut tables, local_id)?;
        row.status = MessageStatus::Sending;
        row.is_pending = true;
        row.retry_count = 0;
        row.updated_at = now_millis();
        Ok(())
    }

    async fn update_message_status(&self, server_id: &str, status: MessageStatus) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(row) = tables
            .messages
            .values_mut()
            .find(|m| m.server_id.as_deref() == Some(server_id))
        {
            row.status = status;
            row.updated_at = now_millis();
        }
        Ok(())
    }

    async fn soft_delete_message(&self, server_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(row) = tables
            .messages
            .values_mut()
            .find(|m| m.server_id.as_deref() == Some(server_id))
        {
            row.is_deleted = true;
            row.updated_at = now_millis();
        }
        Ok(())
    }

    async fn get_pending_messages(&self) -> Result<Vec<MessageRow>> {
        let tables = self.tables.read();
        Ok(Self::sorted_messages(
            tables.messages.values().filter(|m| m.is_pending),
        ))
    }

    async fn get_pending_messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>> {
        let tables = self.tables.read();
        Ok(Self::sorted_messages(
            tables
                .messages
                .values()
                .filter(|m| m.is_pending && m.chat_id == chat_id),
        ))
    }

    async fn get_latest_message_server_id(&self, chat_id: &str) -> Result<Option<String>> {
        let tables = self.tables.read();
        Ok(tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .filter_map(|m| m.server_id.as_ref().map(|sid| (m.created_at, sid)))
            .max()
            .map(|(_, sid)| sid.clone()))
    }

    async fn count_messages(&self, chat_id: &str) -> Result<usize> {
        let tables = self.tables.read();
        Ok(tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && !m.is_deleted)
            .count())
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn upsert_chat(&self, row: ChatRow) -> Result<String> {
        let mut tables = self.tables.write();
        Ok(self.upsert_keyed(&mut tables.chats, row))
    }

    async fn get_chat(&self, server_id: &str) -> Result<Option<ChatRow>> {
        Ok(Self::find_by_server_id(&self.tables.read().chats, server_id).cloned())
    }

    /// Most recently updated first.
    async fn list_chats(&self) -> Result<Vec<ChatRow>> {
        let mut rows: Vec<ChatRow> = self.tables.read().chats.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        Ok(rows)
    }

    async fn delete_chat(&self, server_id: &str) -> Result<bool> {
        Ok(Self::remove_by_server_id(
            &mut self.tables.write().chats,
            server_id,
        ))
    }

    async fn count_chats(&self) -> Result<usize> {
        Ok(self.tables.read().chats.len())
    }
}

#[async_trait]
impl ContactRepository for MemoryStore {
    async fn upsert_contact(&self, row: ContactRow) -> Result<String> {
        let mut tables = self.tables.write();
        Ok(self.upsert_keyed(&mut tables.contacts, row))
    }

    async fn get_contact(&self, server_id: &str) -> Result<Option<ContactRow>> {
        Ok(Self::find_by_server_id(&self.tables.read().contacts, server_id).cloned())
    }

    /// Alphabetical by display name.
    async fn list_contacts(&self) -> Result<Vec<ContactRow>> {
        let mut rows: Vec<ContactRow> = self.tables.read().contacts.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        Ok(rows)
    }

    async fn delete_contact(&self, server_id: &str) -> Result<bool> {
        Ok(Self::remove_by_server_id(
            &mut self.tables.write().contacts,
            server_id,
        ))
    }

    async fn count_contacts(&self) -> Result<usize> {
        Ok(self.tables.read().contacts.len())
    }
}

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn upsert_document(&self, row: DocumentRow) -> Result<String> {
        let mut tables = self.tables.write();
        Ok(self.upsert_keyed(&mut tables.documents, row))
    }

    async fn get_document(&self, server_id: &str) -> Result<Option<DocumentRow>> {
        Ok(Self::find_by_server_id(&self.tables.read().documents, server_id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRow>> {
        let mut rows: Vec<DocumentRow> = self.tables.read().documents.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        Ok(rows)
    }

    async fn delete_document(&self, server_id: &str) -> Result<bool> {
        Ok(Self::remove_by_server_id(
            &mut self.tables.write().documents,
            server_id,
        ))
    }

    async fn count_documents(&self) -> Result<usize> {
        Ok(self.tables.read().documents.len())
    }
}

#[async_trait]
impl SyncRepository for MemoryStore {
    async fn get_last_sync_time(&self, key: &str) -> Result<i64> {
        Ok(self
            .tables
            .read()
            .sync_meta
            .get(key)
            .copied()
            .unwrap_or(0))
    }

    async fn set_last_sync_time(&self, key: &str, timestamp: i64) -> Result<()> {
        self.tables
            .write()
            .sync_meta
            .insert(key.to_string(), timestamp);
        Ok(())
    }
}

#[async_trait]
impl OperationRepository for MemoryStore {
    async fn add_pending_operation(&self, op: NewOperation) -> Result<String> {
        let id = self.next_id();
        let now = now_millis();
        let row = PendingOperation {
            id: id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            kind: op.kind,
            payload: op.payload,
            retry_count: 0,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.tables.write().operations.insert(id.clone(), row);
        Ok(id)
    }

    async fn get_pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let mut rows: Vec<PendingOperation> = self
            .tables
            .read()
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn get_operation(&self, id: &str) -> Result<Option<PendingOperation>> {
        Ok(self.tables.read().operations.get(id).cloned())
    }

    async fn mark_operation_processing(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let op = Self::operation_mut(&mut tables, id)?;
        op.status = OperationStatus::Processing;
        op.updated_at = now_millis();
        Ok(())
    }

    async fn mark_operation_failed(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let op = Self::operation_mut(&mut tables, id)?;
        op.retry_count += 1;
        op.status = OperationStatus::Pending;
        op.updated_at = now_millis();
        Ok(())
    }

    async fn mark_operation_permanently_failed(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let op = Self::operation_mut(&mut tables, id)?;
        op.status = OperationStatus::Failed;
        op.updated_at = now_millis();
        Ok(())
    }

    async fn remove_operation(&self, id: &str) -> Result<()> {
        self.tables.write().operations.remove(id);
        Ok(())
    }

    async fn reset_processing_operations(&self) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut reset = 0;
        for op in tables
            .operations
            .values_mut()
            .filter(|op| op.status == OperationStatus::Processing)
        {
            op.status = OperationStatus::Pending;
            reset += 1;
        }
        if reset > 0 {
            debug!(reset, "reset in-flight operations to pending");
        }
        Ok(reset)
    }
}
