//! Rows cached in the local store.
//!
//! Every row carries a generator-assigned `local_id` and a nullable
//! `server_id`. Rows without a server id are local, unsynced records. An empty
//! `local_id` on a row handed to an insert or upsert asks the store to assign
//! one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// Current wall time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delivery state of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(DbError::SerializationError(format!(
                "unknown message status: {}",
                other
            ))),
        }
    }
}

/// A chat message, local or synced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub local_id: String,
    pub server_id: Option<String>,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: String,
    pub reply_to: Option<String>,
    pub status: MessageStatus,
    /// Set while the message awaits remote confirmation.
    pub is_pending: bool,
    pub is_deleted: bool,
    pub retry_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MessageRow {
    /// An optimistic, locally originated message awaiting send.
    pub fn outgoing(draft: &NewMessage) -> Self {
        let now = now_millis();
        Self {
            local_id: String::new(),
            server_id: None,
            chat_id: draft.chat_id.clone(),
            sender_id: draft.sender_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind.clone(),
            reply_to: draft.reply_to.clone(),
            status: MessageStatus::Sending,
            is_pending: true,
            is_deleted: false,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// User input for a new outgoing message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

fn default_kind() -> String {
    "text".to_string()
}

impl NewMessage {
    pub fn text(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            kind: default_kind(),
            reply_to: None,
        }
    }
}

/// A cached chat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRow {
    pub local_id: String,
    pub server_id: Option<String>,
    pub title: String,
    pub is_group: bool,
    pub last_message_preview: Option<String>,
    pub unread_count: u32,
    pub updated_at: i64,
}

/// A cached contact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactRow {
    pub local_id: String,
    pub server_id: Option<String>,
    pub display_name: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub updated_at: i64,
}

/// A cached document with its authoritative block list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub local_id: String,
    pub server_id: Option<String>,
    pub title: String,
    pub blocks: serde_json::Value,
    pub updated_at: i64,
}

/// Ledger state of a queued mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Failed,
}

/// Mutation kind recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Entity an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Chat,
    Message,
    Contact,
    Document,
}

/// A locally queued mutation awaiting remote confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub status: OperationStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for a new ledger entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
}
