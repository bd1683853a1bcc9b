//! # offgrid-db
//!
//! Local state for the offline-first client.
//!
//! This crate provides:
//! - [`crdt`] - per-block, per-field Last-Writer-Wins document CRDT
//! - [`store`] - repository traits for the local cache (chats, messages,
//!   contacts, documents, sync watermarks, pending-operation ledger)
//! - [`store::memory::MemoryStore`] - in-memory implementation of every
//!   repository
//!
//! ## Example
//!
//! ```rust
//! use offgrid_db::{BlockField, DocumentCrdt};
//!
//! let mut alice = DocumentCrdt::new("doc-1", "alice");
//! let mut bob = DocumentCrdt::new("doc-1", "bob");
//!
//! let edit = alice.create_update_event("block-1", BlockField::Content, "Hello");
//! assert!(bob.apply_remote_update(&edit));
//! assert_eq!(bob.get_block_state("block-1").unwrap().content.value, "Hello");
//! ```

pub mod crdt;
pub mod error;
pub mod store;

pub use crdt::{BlockCrdtState, BlockField, CrdtAction, CrdtUpdateEvent, DocumentCrdt};
pub use error::{DbError, Result};
pub use store::memory::MemoryStore;
pub use store::models::{
    ChatRow, ContactRow, DocumentRow, EntityType, MessageRow, MessageStatus, NewMessage,
    NewOperation, OperationKind, OperationStatus, PendingOperation,
};
pub use store::{
    ChatRepository, ContactRepository, DocumentRepository, LocalStore, MessageRepository,
    OperationRepository, SyncRepository, FULL_SYNC_KEY,
};
