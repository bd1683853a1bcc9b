//! Block-level Last-Writer-Wins CRDT for one document editing session.
//!
//! Every block carries one [`LwwValue`] per editable field, so concurrent
//! edits to different fields or different blocks never clobber each other;
//! only same-field races are decided by (timestamp, node id).
//!
//! Block lifecycle: `nonexistent -> live -> deleted`. Deletion is terminal for
//! updates. A delete can only be re-stamped by a delete carrying a strictly
//! greater timestamp.
//!
//! State is not persisted: it is rebuilt from the server's block list when a
//! document is reopened.

use crate::error::DbError;
use offgrid_core::clock::{LamportClock, LogicalTimestamp};
use offgrid_core::lww::{merge_lww, LwwValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Editable fields of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockField {
    Content,
    Checked,
}

impl BlockField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockField::Content => "content",
            BlockField::Checked => "checked",
        }
    }
}

impl fmt::Display for BlockField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockField {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(BlockField::Content),
            "checked" => Ok(BlockField::Checked),
            other => Err(DbError::UnknownField(other.to_string())),
        }
    }
}

/// What an event does to its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrdtAction {
    Update,
    Delete,
}

/// Wire payload for one block change.
///
/// `field` stays a string on the wire so events from newer peers with fields
/// this build does not know can still be decoded and rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtUpdateEvent {
    pub document_id: String,
    pub block_id: String,
    pub field: String,
    pub value: String,
    pub timestamp: LogicalTimestamp,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<CrdtAction>,
}

impl CrdtUpdateEvent {
    /// Missing action means update.
    pub fn is_delete(&self) -> bool {
        matches!(self.action, Some(CrdtAction::Delete))
    }

    /// The field value this event carries, stamped.
    pub fn to_lww(&self) -> LwwValue {
        LwwValue::new(self.value.clone(), self.timestamp, self.node_id.clone())
    }
}

/// Per-block replicated state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCrdtState {
    pub block_id: String,
    pub content: LwwValue,
    pub checked: LwwValue,
    pub deleted: bool,
    pub deleted_at: LogicalTimestamp,
}

impl BlockCrdtState {
    pub fn new(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            ..Default::default()
        }
    }

    pub fn field(&self, field: BlockField) -> &LwwValue {
        match field {
            BlockField::Content => &self.content,
            BlockField::Checked => &self.checked,
        }
    }

    fn field_mut(&mut self, field: BlockField) -> &mut LwwValue {
        match field {
            BlockField::Content => &mut self.content,
            BlockField::Checked => &mut self.checked,
        }
    }

    /// `checked` is stored as a string on the wire.
    pub fn is_checked(&self) -> bool {
        self.checked.value == "true"
    }
}

/// CRDT state for one open document.
#[derive(Clone, Debug)]
pub struct DocumentCrdt {
    document_id: String,
    clock: LamportClock,
    blocks: HashMap<String, BlockCrdtState>,
}

impl DocumentCrdt {
    /// Open a session stamped by `node_id` using the system time.
    pub fn new(document_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::with_clock(document_id, LamportClock::new(node_id))
    }

    /// Open a session driven by an existing clock.
    pub fn with_clock(document_id: impl Into<String>, clock: LamportClock) -> Self {
        Self {
            document_id: document_id.into(),
            clock,
            blocks: HashMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Apply any remote event, dispatching on its action.
    pub fn apply_remote(&mut self, event: &CrdtUpdateEvent) -> bool {
        if event.is_delete() {
            self.apply_remote_delete(event)
        } else {
            self.apply_remote_update(event)
        }
    }

    /// Merge a remote field update. Returns whether it was applied.
    ///
    /// Rejected when the block is deleted, the field is unknown, or the
    /// update loses the LWW race.
    pub fn apply_remote_update(&mut self, event: &CrdtUpdateEvent) -> bool {
        self.clock.receive_tick(event.timestamp);
        let block = self.materialize(&event.block_id);

        if block.deleted {
            debug!(
                block_id = %event.block_id,
                timestamp = event.timestamp,
                "rejecting update to deleted block"
            );
            return false;
        }

        let field = match event.field.parse::<BlockField>() {
            Ok(field) => field,
            Err(_) => {
                warn!(
                    document_id = %event.document_id,
                    block_id = %event.block_id,
                    field = %event.field,
                    "ignoring update for unknown block field"
                );
                return false;
            }
        };

        merge_lww(block.field_mut(field), &event.to_lww())
    }

    /// Apply a remote delete. Returns whether it was applied.
    ///
    /// A block that is already deleted only accepts a delete with a strictly
    /// newer timestamp, which re-stamps `deleted_at`.
    pub fn apply_remote_delete(&mut self, event: &CrdtUpdateEvent) -> bool {
        self.clock.receive_tick(event.timestamp);
        let block = self.materialize(&event.block_id);

        if block.deleted && event.timestamp <= block.deleted_at {
            return false;
        }

        block.deleted = true;
        block.deleted_at = event.timestamp;
        true
    }

    /// Record a local field edit and return the event to transmit.
    pub fn create_update_event(
        &mut self,
        block_id: impl Into<String>,
        field: BlockField,
        value: impl Into<String>,
    ) -> CrdtUpdateEvent {
        let block_id = block_id.into();
        let value = value.into();
        let timestamp = self.clock.tick();
        let node_id = self.clock.node_id().to_string();

        let block = self.materialize(&block_id);
        *block.field_mut(field) = LwwValue::new(value.clone(), timestamp, node_id.clone());

        CrdtUpdateEvent {
            document_id: self.document_id.clone(),
            block_id,
            field: field.as_str().to_string(),
            value,
            timestamp,
            node_id,
            action: Some(CrdtAction::Update),
        }
    }

    /// Record a local delete and return the event to transmit.
    pub fn create_delete_event(&mut self, block_id: impl Into<String>) -> CrdtUpdateEvent {
        let block_id = block_id.into();
        let timestamp = self.clock.tick();
        let node_id = self.clock.node_id().to_string();

        let block = self.materialize(&block_id);
        block.deleted = true;
        block.deleted_at = timestamp;

        CrdtUpdateEvent {
            document_id: self.document_id.clone(),
            block_id,
            field: BlockField::Content.as_str().to_string(),
            value: String::new(),
            timestamp,
            node_id,
            action: Some(CrdtAction::Delete),
        }
    }

    /// State for a block, if it has ever been referenced.
    pub fn get_block_state(&self, block_id: &str) -> Option<&BlockCrdtState> {
        self.blocks.get(block_id)
    }

    /// All referenced blocks, including deleted ones.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockCrdtState> {
        self.blocks.values()
    }

    /// Blocks that have not been deleted.
    pub fn visible_blocks(&self) -> impl Iterator<Item = &BlockCrdtState> {
        self.blocks.values().filter(|b| !b.deleted)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop all block state when the editing session ends.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn materialize(&mut self, block_id: &str) -> &mut BlockCrdtState {
        self.blocks
            .entry(block_id.to_string())
            .or_insert_with(|| BlockCrdtState::new(block_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offgrid_core::clock::ManualClock;
    use std::sync::Arc;

    fn doc(node: &str, now: u64) -> DocumentCrdt {
        let clock = LamportClock::with_wall_clock(node, Arc::new(ManualClock::new(now)));
        DocumentCrdt::with_clock("doc-1", clock)
    }

    fn update(block: &str, field: &str, value: &str, ts: u64, node: &str) -> CrdtUpdateEvent {
        CrdtUpdateEvent {
            document_id: "doc-1".to_string(),
            block_id: block.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            timestamp: ts,
            node_id: node.to_string(),
            action: None,
        }
    }

    fn delete(block: &str, ts: u64, node: &str) -> CrdtUpdateEvent {
        CrdtUpdateEvent {
            action: Some(CrdtAction::Delete),
            ..update(block, "content", "", ts, node)
        }
    }

    #[test]
    fn test_remote_update_materializes_block() {
        let mut crdt = doc("local", 0);
        assert!(crdt.get_block_state("b1").is_none());

        assert!(crdt.apply_remote_update(&update("b1", "content", "hello", 10, "n2")));

        let state = crdt.get_block_state("b1").unwrap();
        assert_eq!(state.content.value, "hello");
        assert_eq!(state.content.timestamp, 10);
        assert!(!state.deleted);
    }

    #[test]
    fn test_stale_update_loses() {
        let mut crdt = doc("local", 0);
        assert!(crdt.apply_remote_update(&update("b1", "content", "new", 20, "n2")));
        assert!(!crdt.apply_remote_update(&update("b1", "content", "old", 10, "n3")));

        assert_eq!(crdt.get_block_state("b1").unwrap().content.value, "new");
    }

    #[test]
    fn test_fields_merge_independently() {
        let mut crdt = doc("local", 0);
        assert!(crdt.apply_remote_update(&update("b1", "content", "text", 50, "n2")));
        // Older stamp on a different field still applies
        assert!(crdt.apply_remote_update(&update("b1", "checked", "true", 5, "n3")));

        let state = crdt.get_block_state("b1").unwrap();
        assert_eq!(state.content.value, "text");
        assert!(state.is_checked());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut crdt = doc("local", 0);
        assert!(!crdt.apply_remote_update(&update("b1", "color", "red", 10, "n2")));

        let state = crdt.get_block_state("b1").unwrap();
        assert_eq!(state.content, LwwValue::default());
    }

    #[test]
    fn test_delete_then_newer_update_rejected() {
        let mut crdt = doc("local", 0);
        assert!(crdt.apply_remote_delete(&delete("b1", 200, "n2")));
        assert!(!crdt.apply_remote_update(&update("b1", "content", "zombie", 500, "n3")));

        let state = crdt.get_block_state("b1").unwrap();
        assert!(state.deleted);
        assert_eq!(state.deleted_at, 200);
        assert_eq!(state.content.value, "");
    }

    #[test]
    fn test_redelete_requires_strictly_newer_stamp() {
        let mut crdt = doc("local", 0);
        assert!(crdt.apply_remote_delete(&delete("b1", 200, "n2")));
        assert!(!crdt.apply_remote_delete(&delete("b1", 200, "n3")));
        assert!(!crdt.apply_remote_delete(&delete("b1", 150, "n3")));
        assert!(crdt.apply_remote_delete(&delete("b1", 300, "n3")));

        assert_eq!(crdt.get_block_state("b1").unwrap().deleted_at, 300);
    }

    #[test]
    fn test_apply_remote_dispatches_on_action() {
        let mut crdt = doc("local", 0);
        assert!(crdt.apply_remote(&update("b1", "content", "x", 1, "n2")));
        assert!(crdt.apply_remote(&delete("b1", 2, "n2")));
        assert!(crdt.get_block_state("b1").unwrap().deleted);
    }

    #[test]
    fn test_local_update_event_advances_clock() {
        let mut crdt = doc("local", 1_000);

        let first = crdt.create_update_event("b1", BlockField::Content, "a");
        let second = crdt.create_update_event("b1", BlockField::Content, "b");

        assert_eq!(first.timestamp, 1_000);
        assert_eq!(second.timestamp, 1_001);
        assert_eq!(second.node_id, "local");
        assert_eq!(second.field, "content");
        assert_eq!(second.action, Some(CrdtAction::Update));
        assert_eq!(crdt.get_block_state("b1").unwrap().content.value, "b");
    }

    #[test]
    fn test_local_edit_is_after_observed_remote() {
        let mut crdt = doc("local", 100);
        crdt.apply_remote_update(&update("b1", "content", "remote", 9_000, "n2"));

        let event = crdt.create_update_event("b1", BlockField::Content, "mine");
        assert!(event.timestamp > 9_000);
        assert_eq!(crdt.get_block_state("b1").unwrap().content.value, "mine");
    }

    #[test]
    fn test_local_delete_event() {
        let mut crdt = doc("local", 500);
        let event = crdt.create_delete_event("b7");

        assert!(event.is_delete());
        assert_eq!(event.timestamp, 500);
        let state = crdt.get_block_state("b7").unwrap();
        assert!(state.deleted);
        assert_eq!(state.deleted_at, 500);
        assert_eq!(crdt.visible_blocks().count(), 0);
    }

    #[test]
    fn test_clear_drops_state() {
        let mut crdt = doc("local", 1);
        crdt.create_update_event("b1", BlockField::Content, "a");
        crdt.create_update_event("b2", BlockField::Checked, "true");
        assert_eq!(crdt.len(), 2);

        crdt.clear();
        assert!(crdt.is_empty());
        assert!(crdt.get_block_state("b1").is_none());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = r#"{"documentId":"d","blockId":"b","field":"checked","value":"true","timestamp":7,"nodeId":"n"}"#;
        let event: CrdtUpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, None);
        assert!(!event.is_delete());

        let with_action = serde_json::to_value(&delete("b", 3, "n")).unwrap();
        assert_eq!(with_action["action"], "delete");
        assert_eq!(with_action["blockId"], "b");
    }

    #[test]
    fn test_block_field_parse() {
        assert_eq!("content".parse::<BlockField>(), Ok(BlockField::Content));
        assert_eq!(
            "title".parse::<BlockField>(),
            Err(DbError::UnknownField("title".to_string()))
        );
    }
}
