//! Collaborative editing sessions.

use crate::error::{Result, SdkError};
use crate::transport::{frame_types, SocketConnector, Subscription, WebSocketClient};
use offgrid_db::{BlockCrdtState, BlockField, CrdtUpdateEvent, DocumentCrdt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Events emitted by a document session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote edit changed local state.
    RemoteApplied(CrdtUpdateEvent),
    /// A remote edit lost its race or targeted a deleted block.
    RemoteRejected(CrdtUpdateEvent),
    /// The session was closed.
    Closed,
}

/// Binds one [`DocumentCrdt`] to the transport.
///
/// Local edits go out as `crdt:update` frames. Inbound `crdt:update` frames
/// for the same document are merged and re-published as [`SessionEvent`]s.
pub struct DocumentSession<C: SocketConnector> {
    document_id: String,
    crdt: Arc<RwLock<DocumentCrdt>>,
    transport: WebSocketClient<C>,
    subscription: Mutex<Option<Subscription>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<C: SocketConnector> DocumentSession<C> {
    /// Open a session for `document_id` editing as `node_id`.
    pub fn open(
        document_id: impl Into<String>,
        node_id: impl Into<String>,
        transport: WebSocketClient<C>,
    ) -> Self {
        Self::with_crdt(DocumentCrdt::new(document_id, node_id), transport)
    }

    /// Open a session around an existing CRDT.
    pub fn with_crdt(crdt: DocumentCrdt, transport: WebSocketClient<C>) -> Self {
        let document_id = crdt.document_id().to_string();
        let crdt = Arc::new(RwLock::new(crdt));
        let (event_tx, _) = broadcast::channel(256);

        let subscription = {
            let crdt = crdt.clone();
            let event_tx = event_tx.clone();
            let document_id = document_id.clone();
            transport.on(frame_types::CRDT_UPDATE, move |payload| {
                let event: CrdtUpdateEvent = match serde_json::from_value(payload.clone()) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "dropping undecodable crdt event");
                        return;
                    }
                };
                if event.document_id != document_id {
                    return;
                }

                let accepted = crdt.write().apply_remote(&event);
                let _ = event_tx.send(if accepted {
                    SessionEvent::RemoteApplied(event)
                } else {
                    SessionEvent::RemoteRejected(event)
                });
            })
        };

        Self {
            document_id,
            crdt,
            transport,
            subscription: Mutex::new(Some(subscription)),
            event_tx,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Shared handle to the underlying CRDT.
    pub fn crdt(&self) -> Arc<RwLock<DocumentCrdt>> {
        self.crdt.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Set one field of a block locally and broadcast the edit.
    ///
    /// Fails with [`SdkError::SessionClosed`] once the session is closed.
    pub fn edit(
        &self,
        block_id: impl Into<String>,
        field: BlockField,
        value: impl Into<String>,
    ) -> Result<CrdtUpdateEvent> {
        let subscription = self.subscription.lock();
        if subscription.is_none() {
            return Err(SdkError::SessionClosed(self.document_id.clone()));
        }
        let event = self.crdt.write().create_update_event(block_id, field, value);
        self.publish(&event)?;
        Ok(event)
    }

    /// Delete a block locally and broadcast the tombstone.
    pub fn delete_block(&self, block_id: impl Into<String>) -> Result<CrdtUpdateEvent> {
        let subscription = self.subscription.lock();
        if subscription.is_none() {
            return Err(SdkError::SessionClosed(self.document_id.clone()));
        }
        let event = self.crdt.write().create_delete_event(block_id);
        self.publish(&event)?;
        Ok(event)
    }

    pub fn block(&self, block_id: &str) -> Option<BlockCrdtState> {
        self.crdt.read().get_block_state(block_id).cloned()
    }

    /// Non-deleted blocks, in no particular order.
    pub fn visible_blocks(&self) -> Vec<BlockCrdtState> {
        self.crdt.read().visible_blocks().cloned().collect()
    }

    /// Stop receiving remote edits and drop all block state.
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            self.crdt.write().clear();
            let _ = self.event_tx.send(SessionEvent::Closed);
        }
    }

    fn publish(&self, event: &CrdtUpdateEvent) -> Result<()> {
        self.transport
            .send(frame_types::CRDT_UPDATE, serde_json::to_value(event)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, TransportConfig};

    fn transport() -> WebSocketClient<MemoryConnector> {
        WebSocketClient::new(Arc::new(MemoryConnector::new()), TransportConfig::default())
    }

    #[test]
    fn test_local_edit_is_queued_while_offline() {
        let transport = transport();
        let session = DocumentSession::open("doc-1", "alice", transport.clone());

        let event = session.edit("b1", BlockField::Content, "hello").unwrap();
        assert_eq!(event.document_id, "doc-1");
        assert_eq!(session.block("b1").unwrap().content.value, "hello");
        assert_eq!(transport.queued_len(), 1);
    }

    #[test]
    fn test_close_clears_state() {
        let session = DocumentSession::open("doc-1", "alice", transport());
        let mut events = session.subscribe();

        session.edit("b1", BlockField::Content, "hello").unwrap();
        session.close();

        assert!(!session.is_open());
        assert!(session.visible_blocks().is_empty());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed);

        session.close();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_closed_session_refuses_local_edits() {
        let transport = transport();
        let session = DocumentSession::open("doc-1", "alice", transport.clone());
        session.edit("b1", BlockField::Content, "hello").unwrap();
        session.close();

        let err = session.edit("b1", BlockField::Content, "late").unwrap_err();
        assert_eq!(err, SdkError::SessionClosed("doc-1".to_string()));
        assert!(matches!(
            session.delete_block("b1"),
            Err(SdkError::SessionClosed(_))
        ));

        assert!(session.block("b1").is_none());
        assert_eq!(transport.queued_len(), 1);
    }
}
