//! Outbound message pipeline.
//!
//! Every message is written to the local store before it is sent, so the send
//! state survives restarts. Sends are strictly serial: the head of the queue is
//! retried with exponential backoff until it succeeds or runs out of attempts,
//! and only then does the queue advance. Messages therefore reach the remote
//! side in submission order.

use crate::error::{Result, SdkError};
use futures::future::BoxFuture;
use offgrid_db::{DbError, MessageRepository, MessageRow, MessageStatus, NewMessage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for send retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per message before it is marked failed.
    pub max_attempts: u32,
    /// Delay after the first failure (in milliseconds).
    pub base_delay_ms: u64,
    /// Delay ceiling (in milliseconds).
    pub max_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl QueueConfig {
    /// Delay before the next attempt, given how many attempts already failed
    /// before the latest one.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// A message handed to the send function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub local_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: String,
    pub reply_to: Option<String>,
    /// Failed attempts so far.
    pub retry_count: u32,
}

impl OutgoingMessage {
    pub fn from_row(row: &MessageRow) -> Self {
        Self {
            local_id: row.local_id.clone(),
            chat_id: row.chat_id.clone(),
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            kind: row.kind.clone(),
            reply_to: row.reply_to.clone(),
            retry_count: row.retry_count,
        }
    }
}

/// A message changed delivery state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub local_id: String,
    pub status: MessageStatus,
    pub server_id: Option<String>,
}

/// Sends one message and resolves to its server id.
pub type SendFn = Arc<dyn Fn(OutgoingMessage) -> BoxFuture<'static, Result<String>> + Send + Sync>;
type StatusHandler = Arc<dyn Fn(StatusChange) + Send + Sync>;

struct QueueInner<S> {
    store: Arc<S>,
    config: QueueConfig,
    queue: Mutex<VecDeque<OutgoingMessage>>,
    /// Held while a row's stored send state and its queue membership change
    /// together, so readers of the store never see one without the other.
    settle: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    send_fn: RwLock<Option<SendFn>>,
    status_handler: RwLock<Option<StatusHandler>>,
}

/// Serial, persistent outbound queue.
pub struct MessageQueue<S: MessageRepository + 'static> {
    inner: Arc<QueueInner<S>>,
}

impl<S: MessageRepository + 'static> Clone for MessageQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: MessageRepository + 'static> MessageQueue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                config,
                queue: Mutex::new(VecDeque::new()),
                settle: tokio::sync::Mutex::new(()),
                processing: AtomicBool::new(false),
                send_fn: RwLock::new(None),
                status_handler: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Install the function that delivers a message to the remote side.
    ///
    /// Messages queued before a send function exists wait for it.
    pub fn set_send_function<F, Fut>(&self, send: F)
    where
        F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let send: SendFn = Arc::new(move |message| Box::pin(send(message)));
        *self.inner.send_fn.write() = Some(send);
        self.kick();
    }

    /// Observe `sent` and `failed` transitions, and `sending` on retry.
    pub fn set_status_change_handler<F>(&self, handler: F)
    where
        F: Fn(StatusChange) + Send + Sync + 'static,
    {
        *self.inner.status_handler.write() = Some(Arc::new(handler));
    }

    /// Messages waiting in memory, including the one in flight.
    pub fn get_queue_length(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Store an optimistic `sending` row and queue it.
    ///
    /// Returns the local id once the row is written; the send happens in the
    /// background.
    pub async fn enqueue(&self, draft: NewMessage) -> Result<String> {
        let guard = self.inner.settle.lock().await;
        let local_id = self.inner.store.insert_message(&draft).await?;
        let mut row = MessageRow::outgoing(&draft);
        row.local_id = local_id.clone();

        self.inner
            .queue
            .lock()
            .push_back(OutgoingMessage::from_row(&row));
        drop(guard);
        debug!(%local_id, chat_id = %draft.chat_id, "message enqueued");

        self.kick();
        Ok(local_id)
    }

    /// Re-queue a pending message with a fresh retry budget.
    ///
    /// A message that is still queued keeps its place and budget.
    pub async fn retry(&self, local_id: &str) -> Result<()> {
        let guard = self.inner.settle.lock().await;
        let row = self
            .inner
            .store
            .get_message(local_id)
            .await?
            .ok_or_else(|| SdkError::Store(DbError::NotFound(format!("message {}", local_id))))?;

        if !row.is_pending {
            return Err(SdkError::MessageNotPending(local_id.to_string()));
        }

        if self.inner.is_queued(local_id) {
            debug!(%local_id, "retry ignored, message still queued");
            return Ok(());
        }

        self.inner.store.mark_message_sending(local_id).await?;
        let mut message = OutgoingMessage::from_row(&row);
        message.retry_count = 0;
        self.inner.queue.lock().push_back(message);
        drop(guard);

        info!(%local_id, "message re-queued for retry");
        self.inner.notify(StatusChange {
            local_id: local_id.to_string(),
            status: MessageStatus::Sending,
            server_id: None,
        });
        self.kick();
        Ok(())
    }

    /// Queue stored `sending` messages that are not already queued.
    ///
    /// Run on startup and after reconnecting. Messages that already failed
    /// stay failed until [`retry`](Self::retry). Returns how many were added.
    pub async fn flush_pending(&self) -> Result<usize> {
        let guard = self.inner.settle.lock().await;
        let pending = self.inner.store.get_pending_messages().await?;

        let added = {
            let mut queue = self.inner.queue.lock();
            let mut added = 0;
            for row in pending
                .iter()
                .filter(|row| row.status == MessageStatus::Sending)
            {
                if queue.iter().any(|m| m.local_id == row.local_id) {
                    continue;
                }
                queue.push_back(OutgoingMessage::from_row(row));
                added += 1;
            }
            added
        };
        drop(guard);

        if added > 0 {
            debug!(added, "pending messages restored to queue");
        }
        self.kick();
        Ok(added)
    }

    /// Run the send loop on the current task until the queue is empty.
    ///
    /// Returns immediately when another loop is already running.
    pub async fn process(&self) {
        QueueInner::run(self.inner.clone()).await;
    }

    fn kick(&self) {
        // Outside a runtime the next enqueue or `process` call picks the work up.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(QueueInner::run(self.inner.clone()));
        }
    }
}

impl<S: MessageRepository + 'static> QueueInner<S> {
    async fn run(self: Arc<Self>) {
        loop {
            if self.processing.swap(true, Ordering::SeqCst) {
                return;
            }
            self.drain().await;
            self.processing.store(false, Ordering::SeqCst);

            // Catch anything queued between the last pop and releasing the flag.
            if self.queue.lock().is_empty() || self.send_fn.read().is_none() {
                return;
            }
        }
    }

    async fn drain(&self) {
        loop {
            let Some(send) = self.send_fn.read().clone() else {
                return;
            };
            let Some(head) = self.queue.lock().front().cloned() else {
                return;
            };

            match send(head.clone()).await {
                Ok(server_id) => {
                    {
                        let _settle = self.settle.lock().await;
                        if let Err(err) = self.store.mark_message_sent(&head.local_id, &server_id).await {
                            warn!(local_id = %head.local_id, error = %err, "failed to persist sent state");
                        }
                        self.pop(&head.local_id);
                    }
                    debug!(local_id = %head.local_id, %server_id, "message sent");
                    self.notify(StatusChange {
                        local_id: head.local_id,
                        status: MessageStatus::Sent,
                        server_id: Some(server_id),
                    });
                }
                Err(err) => {
                    let attempts = head.retry_count + 1;
                    if attempts >= self.config.max_attempts {
                        warn!(local_id = %head.local_id, attempts, error = %err, "message failed permanently");
                        {
                            let _settle = self.settle.lock().await;
                            if let Err(err) = self.store.mark_message_failed(&head.local_id).await {
                                warn!(local_id = %head.local_id, error = %err, "failed to persist failed state");
                            }
                            self.pop(&head.local_id);
                        }
                        self.notify(StatusChange {
                            local_id: head.local_id,
                            status: MessageStatus::Failed,
                            server_id: None,
                        });
                    } else {
                        let delay = self.config.backoff_delay(head.retry_count);
                        debug!(
                            local_id = %head.local_id,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "send failed, backing off"
                        );
                        if let Some(front) = self.queue.lock().front_mut() {
                            if front.local_id == head.local_id {
                                front.retry_count = attempts;
                            }
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn is_queued(&self, local_id: &str) -> bool {
        self.queue.lock().iter().any(|m| m.local_id == local_id)
    }

    fn pop(&self, local_id: &str) {
        let mut queue = self.queue.lock();
        if queue.front().is_some_and(|m| m.local_id == local_id) {
            queue.pop_front();
        } else {
            queue.retain(|m| m.local_id != local_id);
        }
    }

    fn notify(&self, change: StatusChange) {
        let handler = self.status_handler.read().clone();
        if let Some(handler) = handler {
            handler(change);
        }
    }
}
