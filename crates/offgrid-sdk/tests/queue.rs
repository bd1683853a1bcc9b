//! Outbound queue: retry ceiling, ordering and duplicate suppression.

use async_trait::async_trait;
use offgrid_db::{DbError, MemoryStore, MessageRepository, MessageRow, MessageStatus, NewMessage};
use offgrid_sdk::api::{Endpoint, MemoryApi, RemoteApi};
use offgrid_sdk::queue::{MessageQueue, QueueConfig, StatusChange};
use offgrid_sdk::SdkError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Memory store that counts `mark_message_failed` calls and can make reads
/// take time.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    failed_marks: AtomicUsize,
    read_delay: Duration,
}

impl CountingStore {
    fn slow_reads(delay: Duration) -> Self {
        Self {
            read_delay: delay,
            ..Self::default()
        }
    }

    async fn pause(&self) {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }
}

type DbResult<T> = offgrid_db::Result<T>;

#[async_trait]
impl MessageRepository for CountingStore {
    async fn insert_message(&self, draft: &NewMessage) -> DbResult<String> {
        self.inner.insert_message(draft).await
    }

    async fn upsert_message(&self, row: MessageRow) -> DbResult<String> {
        self.inner.upsert_message(row).await
    }

    async fn get_message(&self, local_id: &str) -> DbResult<Option<MessageRow>> {
        self.pause().await;
        self.inner.get_message(local_id).await
    }

    async fn get_message_by_server_id(&self, server_id: &str) -> DbResult<Option<MessageRow>> {
        self.inner.get_message_by_server_id(server_id).await
    }

    async fn list_messages_for_chat(&self, chat_id: &str) -> DbResult<Vec<MessageRow>> {
        self.inner.list_messages_for_chat(chat_id).await
    }

    async fn mark_message_sent(&self, local_id: &str, server_id: &str) -> DbResult<()> {
        self.inner.mark_message_sent(local_id, server_id).await
    }

    async fn mark_message_failed(&self, local_id: &str) -> DbResult<()> {
        self.failed_marks.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_message_failed(local_id).await
    }

    async fn mark_message_sending(&self, local_id: &str) -> DbResult<()> {
        self.inner.mark_message_sending(local_id).await
    }

    async fn update_message_status(&self, server_id: &str, status: MessageStatus) -> DbResult<()> {
        self.inner.update_message_status(server_id, status).await
    }

    async fn soft_delete_message(&self, server_id: &str) -> DbResult<()> {
        self.inner.soft_delete_message(server_id).await
    }

    async fn get_pending_messages(&self) -> DbResult<Vec<MessageRow>> {
        self.pause().await;
        self.inner.get_pending_messages().await
    }

    async fn get_pending_messages_for_chat(&self, chat_id: &str) -> DbResult<Vec<MessageRow>> {
        self.inner.get_pending_messages_for_chat(chat_id).await
    }

    async fn get_latest_message_server_id(&self, chat_id: &str) -> DbResult<Option<String>> {
        self.inner.get_latest_message_server_id(chat_id).await
    }

    async fn count_messages(&self, chat_id: &str) -> DbResult<usize> {
        self.inner.count_messages(chat_id).await
    }
}

fn status_channel<S: MessageRepository + 'static>(
    queue: &MessageQueue<S>,
) -> mpsc::UnboundedReceiver<StatusChange> {
    let (tx, rx) = mpsc::unbounded_channel();
    queue.set_status_change_handler(move |change| {
        let _ = tx.send(change);
    });
    rx
}

fn via_api<S: MessageRepository + 'static>(queue: &MessageQueue<S>, api: Arc<MemoryApi>) {
    queue.set_send_function(move |message| {
        let api = api.clone();
        async move { Ok(api.send_message(&message).await?.data.id) }
    });
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_send_fails_after_exactly_five_attempts() {
    let store = Arc::new(CountingStore::default());
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue.set_send_function(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<String, _>(SdkError::SendFailed("offline".to_string())) }
    });

    let started = Instant::now();
    let local_id = queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();

    let change = statuses.recv().await.unwrap();
    assert_eq!(change.local_id, local_id);
    assert_eq!(change.status, MessageStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Waits between attempts: 1s, 2s, 4s, 8s.
    assert_eq!(started.elapsed(), Duration::from_millis(15000));

    let row = store.get_message(&local_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert!(row.is_pending);
    assert_eq!(store.failed_marks.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_queue_length(), 0);

    // Nothing else is attempted afterwards.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_success_on_third_attempt_never_marks_failed() {
    let store = Arc::new(CountingStore::default());
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue.set_send_function(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n < 3 {
                Err(SdkError::SendFailed(format!("attempt {}", n)))
            } else {
                Ok("srv-42".to_string())
            }
        }
    });

    let local_id = queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();

    let change = statuses.recv().await.unwrap();
    assert_eq!(change.status, MessageStatus::Sent);
    assert_eq!(change.server_id.as_deref(), Some("srv-42"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.failed_marks.load(Ordering::SeqCst), 0);

    let row = store.get_message(&local_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Sent);
    assert_eq!(row.server_id.as_deref(), Some("srv-42"));
    assert!(!row.is_pending);
}

#[tokio::test(start_paused = true)]
async fn test_flush_pending_twice_while_in_flight_sends_once() {
    let store = Arc::new(MemoryStore::new());
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let gate = gate.clone();
        let calls = calls.clone();
        queue.set_send_function(move |_| {
            let gate = gate.clone();
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                gate.notified().await;
                Ok("srv-1".to_string())
            }
        });
    }

    queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(queue.flush_pending().await.unwrap(), 0);
    assert_eq!(queue.flush_pending().await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(), 1);

    gate.notify_one();
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_restores_sending_rows_once() {
    let store = Arc::new(MemoryStore::new());
    let orphan = store
        .insert_message(&NewMessage::text("c1", "me", "from last run"))
        .await
        .unwrap();

    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    assert_eq!(queue.flush_pending().await.unwrap(), 1);
    assert_eq!(queue.flush_pending().await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(), 1);

    let api = Arc::new(MemoryApi::new());
    let mut statuses = status_channel(&queue);
    via_api(&queue, api.clone());

    let change = statuses.recv().await.unwrap();
    assert_eq!(change.local_id, orphan);
    assert_eq!(change.status, MessageStatus::Sent);
    assert_eq!(api.sent_messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_never_reorder_messages() {
    let store = Arc::new(MemoryStore::new());
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let api = Arc::new(MemoryApi::new());
    api.fail_next(Endpoint::Send, 3);
    via_api(&queue, api.clone());

    for text in ["one", "two", "three"] {
        queue.enqueue(NewMessage::text("c1", "me", text)).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);
    }

    let order: Vec<String> = api.sent_messages().into_iter().map(|m| m.content).collect();
    assert_eq!(order, vec!["one", "two", "three"]);
    assert_eq!(api.calls(Endpoint::Send), 6);
}

#[tokio::test(start_paused = true)]
async fn test_retry_requeues_a_failed_message_with_fresh_budget() {
    let store = Arc::new(MemoryStore::new());
    let config = QueueConfig {
        max_attempts: 2,
        ..QueueConfig::default()
    };
    let queue = MessageQueue::new(store.clone(), config);
    let mut statuses = status_channel(&queue);

    let api = Arc::new(MemoryApi::new());
    api.set_failing(Endpoint::Send, true);
    via_api(&queue, api.clone());

    let local_id = queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Failed);

    // Failed rows are not picked up by a flush.
    assert_eq!(queue.flush_pending().await.unwrap(), 0);

    api.set_failing(Endpoint::Send, false);
    queue.retry(&local_id).await.unwrap();
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sending);
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);

    let row = store.get_message(&local_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Sent);

    let err = queue.retry(&local_id).await.unwrap_err();
    assert!(matches!(err, SdkError::MessageNotPending(_)));
    let err = queue.retry("missing").await.unwrap_err();
    assert!(matches!(err, SdkError::Store(DbError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_messages_wait_for_a_send_function() {
    let store = Arc::new(MemoryStore::new());
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    queue.enqueue(NewMessage::text("c1", "me", "early")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(queue.get_queue_length(), 1);

    via_api(&queue, Arc::new(MemoryApi::new()));
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);
    assert_eq!(queue.get_queue_length(), 0);
}

/// Send function that blocks until `gate` is notified.
fn gated_send<S: MessageRepository + 'static>(
    queue: &MessageQueue<S>,
    gate: Arc<Notify>,
    calls: Arc<AtomicUsize>,
) {
    queue.set_send_function(move |_| {
        let gate = gate.clone();
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            gate.notified().await;
            Ok(format!("srv-{}", n))
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_flush_racing_an_ack_does_not_resend() {
    let store = Arc::new(CountingStore::slow_reads(Duration::from_millis(100)));
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    gated_send(&queue, gate.clone(), calls.clone());

    let local_id = queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The flush reads the row while the send is still unacknowledged.
    let flusher = queue.clone();
    let flush = tokio::spawn(async move { flusher.flush_pending().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    gate.notify_one();

    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);
    assert_eq!(flush.await.unwrap().unwrap(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_queue_length(), 0);
    let row = store.get_message(&local_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Sent);
    assert!(!row.is_pending);
}

#[tokio::test(start_paused = true)]
async fn test_retry_of_an_in_flight_message_does_not_resend() {
    let store = Arc::new(CountingStore::slow_reads(Duration::from_millis(100)));
    let queue = MessageQueue::new(store.clone(), QueueConfig::default());
    let mut statuses = status_channel(&queue);

    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    gated_send(&queue, gate.clone(), calls.clone());

    let local_id = queue.enqueue(NewMessage::text("c1", "me", "hi")).await.unwrap();
    tokio::task::yield_now().await;

    let retrier = queue.clone();
    let id = local_id.clone();
    let retry = tokio::spawn(async move { retrier.retry(&id).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    gate.notify_one();

    assert!(retry.await.unwrap().is_ok());
    assert_eq!(statuses.recv().await.unwrap().status, MessageStatus::Sent);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(statuses.try_recv().is_err());
    let row = store.get_message(&local_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Sent);
    assert!(!row.is_pending);
}
