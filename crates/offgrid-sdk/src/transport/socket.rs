//! Socket connector abstraction.
//!
//! A connector opens one duplex text channel and hands back a [`SocketLink`]:
//! an outbound sender and an inbound event receiver. The reconnect state
//! machine in [`WebSocketClient`](super::WebSocketClient) only ever talks to
//! links, so the same client runs over a real WebSocket or an in-memory pipe.

use crate::error::{Result, SdkError};
use crate::transport::Frame;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Events delivered by an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived.
    Message(String),
    /// The remote end closed or the connection failed.
    Closed { reason: Option<String> },
}

/// One open duplex channel.
///
/// Dropping `outgoing` closes the connection from the client side.
#[derive(Debug)]
pub struct SocketLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens socket links.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str, token: &str) -> Result<SocketLink>;
}

/// Server side of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    token: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<SocketEvent>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Next raw frame sent by the client.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Next decoded frame sent by the client.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Deliver a raw text frame to the client.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(SocketEvent::Message(text.into()))
            .is_ok()
    }

    /// Deliver a `{type, payload}` frame to the client.
    pub fn push_frame(&self, kind: &str, payload: serde_json::Value) -> bool {
        match serde_json::to_string(&Frame::new(kind, payload)) {
            Ok(text) => self.push(text),
            Err(_) => false,
        }
    }

    /// Close the link from the server side.
    pub fn close(&self) {
        let _ = self.to_client.send(SocketEvent::Closed {
            reason: Some("closed by peer".to_string()),
        });
    }
}

/// In-memory connector for tests and simulation.
///
/// Every successful connect yields a [`MemoryPeer`] on the channel returned by
/// [`MemoryConnector::take_peers`]. While offline, connects fail.
#[derive(Debug)]
pub struct MemoryConnector {
    online: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Mutex<Option<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            online: AtomicBool::new(true),
            attempts: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: Mutex::new(Some(peers_rx)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// When each connect was attempted, in order.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Receiver of server-side peers. Can only be taken once.
    pub fn take_peers(&self) -> Option<mpsc::UnboundedReceiver<MemoryPeer>> {
        self.peers_rx.lock().take()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<SocketLink> {
        self.attempts.lock().push(Instant::now());

        if !self.online.load(Ordering::SeqCst) {
            return Err(SdkError::ConnectionFailed(format!("{} unreachable", url)));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            token: token.to_string(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| SdkError::ConnectionFailed("memory server gone".to_string()))?;

        Ok(SocketLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
