//! Remote API collaborator.
//!
//! The HTTP layer itself is external; the SDK only needs the operations in
//! [`RemoteApi`]. Responses are wrapped in an envelope carrying `data` and,
//! for paginated message lists, `meta.hasMore` / `meta.cursor`.

use crate::error::{Result, SdkError};
use crate::queue::OutgoingMessage;
use async_trait::async_trait;
use offgrid_db::{ChatRow, ContactRow, DocumentRow, MessageRow, MessageStatus, PendingOperation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pagination metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub has_more: bool,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(default)]
    pub meta: Option<PageMeta>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data, meta: None }
    }

    pub fn paged(data: T, has_more: bool, cursor: Option<String>) -> Self {
        Self {
            data,
            meta: Some(PageMeta { has_more, cursor }),
        }
    }

    /// Cursor of the next page, if there is one.
    pub fn next_cursor(&self) -> Option<&str> {
        match &self.meta {
            Some(meta) if meta.has_more => meta.cursor.as_deref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChat {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: i64,
}

impl RemoteChat {
    pub fn into_row(self) -> ChatRow {
        ChatRow {
            local_id: String::new(),
            server_id: Some(self.id),
            title: self.title,
            is_group: self.is_group,
            last_message_preview: self.last_message,
            unread_count: self.unread_count,
            updated_at: self.updated_at,
        }
    }
}

fn default_kind() -> String {
    "text".to_string()
}

fn default_status() -> MessageStatus {
    MessageStatus::Sent
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl RemoteMessage {
    pub fn into_row(self) -> MessageRow {
        let updated_at = self.updated_at.max(self.created_at);
        MessageRow {
            local_id: String::new(),
            server_id: Some(self.id),
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            kind: self.kind,
            reply_to: self.reply_to,
            status: self.status,
            is_pending: false,
            is_deleted: self.is_deleted,
            retry_count: 0,
            created_at: self.created_at,
            updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteContact {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl RemoteContact {
    pub fn into_row(self) -> ContactRow {
        ContactRow {
            local_id: String::new(),
            server_id: Some(self.id),
            display_name: self.display_name,
            username: self.username,
            avatar_url: self.avatar_url,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub blocks: serde_json::Value,
    #[serde(default)]
    pub updated_at: i64,
}

impl RemoteDocument {
    pub fn into_row(self) -> DocumentRow {
        DocumentRow {
            local_id: String::new(),
            server_id: Some(self.id),
            title: self.title,
            blocks: self.blocks,
            updated_at: self.updated_at,
        }
    }
}

/// Operations the SDK consumes from the remote API.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    async fn list_chats(&self) -> Result<ApiResponse<Vec<RemoteChat>>>;

    /// Messages of a chat strictly after `cursor`, oldest first.
    async fn list_messages(
        &self,
        chat_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApiResponse<Vec<RemoteMessage>>>;

    async fn list_contacts(&self) -> Result<ApiResponse<Vec<RemoteContact>>>;

    async fn list_documents(&self) -> Result<ApiResponse<Vec<RemoteDocument>>>;

    async fn send_message(&self, message: &OutgoingMessage) -> Result<ApiResponse<RemoteMessage>>;

    /// Replay one ledger operation.
    async fn apply_operation(&self, operation: &PendingOperation) -> Result<()>;
}

/// Endpoints of [`MemoryApi`] that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Chats,
    Messages,
    Contacts,
    Documents,
    Send,
    Operations,
}

#[derive(Default)]
struct MemoryApiState {
    chats: Vec<RemoteChat>,
    messages: HashMap<String, Vec<RemoteMessage>>,
    contacts: Vec<RemoteContact>,
    documents: Vec<RemoteDocument>,
    sent: Vec<OutgoingMessage>,
    operations: Vec<PendingOperation>,
    failing: HashMap<Endpoint, Option<u32>>,
    calls: HashMap<Endpoint, usize>,
    next_server_id: u64,
}

/// In-memory remote API for tests and simulation.
#[derive(Default)]
pub struct MemoryApi {
    state: RwLock<MemoryApiState>,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chat(&self, chat: RemoteChat) {
        let mut state = self.state.write();
        state.chats.retain(|c| c.id != chat.id);
        state.chats.push(chat);
    }

    /// Append a message to its chat's history.
    pub fn add_message(&self, message: RemoteMessage) {
        self.state
            .write()
            .messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
    }

    pub fn add_contact(&self, contact: RemoteContact) {
        let mut state = self.state.write();
        state.contacts.retain(|c| c.id != contact.id);
        state.contacts.push(contact);
    }

    pub fn add_document(&self, document: RemoteDocument) {
        let mut state = self.state.write();
        state.documents.retain(|d| d.id != document.id);
        state.documents.push(document);
    }

    /// Fail every call to `endpoint` until cleared.
    pub fn set_failing(&self, endpoint: Endpoint, failing: bool) {
        let mut state = self.state.write();
        if failing {
            state.failing.insert(endpoint, None);
        } else {
            state.failing.remove(&endpoint);
        }
    }

    /// Fail the next `times` calls to `endpoint`.
    pub fn fail_next(&self, endpoint: Endpoint, times: u32) {
        self.state.write().failing.insert(endpoint, Some(times));
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.state.read().calls.get(&endpoint).copied().unwrap_or(0)
    }

    /// Messages accepted by `send_message`, in order.
    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.state.read().sent.clone()
    }

    /// Operations accepted by `apply_operation`, in order.
    pub fn applied_operations(&self) -> Vec<PendingOperation> {
        self.state.read().operations.clone()
    }

    fn begin(&self, endpoint: Endpoint) -> Result<()> {
        let mut state = self.state.write();
        *state.calls.entry(endpoint).or_default() += 1;

        let fail = match state.failing.get_mut(&endpoint) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        };
        if fail {
            Err(SdkError::Api(format!("{:?} unavailable", endpoint)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryApi {
    async fn list_chats(&self) -> Result<ApiResponse<Vec<RemoteChat>>> {
        self.begin(Endpoint::Chats)?;
        Ok(ApiResponse::new(self.state.read().chats.clone()))
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApiResponse<Vec<RemoteMessage>>> {
        self.begin(Endpoint::Messages)?;
        let state = self.state.read();
        let history = state.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[]);

        // An unknown cursor restarts from the beginning; upserts absorb the overlap.
        let start = cursor
            .and_then(|c| history.iter().position(|m| m.id == c))
            .map(|i| i + 1)
            .unwrap_or(0);
        let page: Vec<RemoteMessage> = history.iter().skip(start).take(limit).cloned().collect();
        let has_more = start + page.len() < history.len();
        let next = page.last().map(|m| m.id.clone());

        Ok(ApiResponse::paged(page, has_more, next))
    }

    async fn list_contacts(&self) -> Result<ApiResponse<Vec<RemoteContact>>> {
        self.begin(Endpoint::Contacts)?;
        Ok(ApiResponse::new(self.state.read().contacts.clone()))
    }

    async fn list_documents(&self) -> Result<ApiResponse<Vec<RemoteDocument>>> {
        self.begin(Endpoint::Documents)?;
        Ok(ApiResponse::new(self.state.read().documents.clone()))
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<ApiResponse<RemoteMessage>> {
        self.begin(Endpoint::Send)?;
        let mut state = self.state.write();
        state.next_server_id += 1;
        let now = offgrid_db::store::models::now_millis();

        let remote = RemoteMessage {
            id: format!("srv-{}", state.next_server_id),
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            kind: message.kind.clone(),
            reply_to: message.reply_to.clone(),
            status: MessageStatus::Sent,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        state.sent.push(message.clone());
        state
            .messages
            .entry(remote.chat_id.clone())
            .or_default()
            .push(remote.clone());

        Ok(ApiResponse::new(remote))
    }

    async fn apply_operation(&self, operation: &PendingOperation) -> Result<()> {
        self.begin(Endpoint::Operations)?;
        self.state.write().operations.push(operation.clone());
        Ok(())
    }
}
