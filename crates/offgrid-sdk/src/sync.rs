//! Reconciliation between the remote API and the local store.
//!
//! Every per-entity sync is an idempotent pull: remote records are upserted by
//! server id, so running a sync twice gives the same end state. Entity syncs
//! swallow their own failures; [`SyncEngine::full_sync`] always completes and
//! reports the last error through its status.

use crate::api::RemoteApi;
use crate::error::{Result, SdkError};
use offgrid_core::clock::{SystemClock, WallClock};
use offgrid_db::{LocalStore, NewOperation, FULL_SYNC_KEY};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHATS_KEY: &str = "chats";
const CONTACTS_KEY: &str = "contacts";
const DOCUMENTS_KEY: &str = "documents";

/// Configuration for sync behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Age of the full-sync watermark after which a full sync is due (in milliseconds).
    pub stale_after_ms: i64,
    /// Messages requested per page.
    pub message_page_size: usize,
    /// Upper bound on pages fetched by one message sync.
    pub max_pages: usize,
    /// Replays of a ledger operation before it is marked failed.
    pub max_operation_attempts: u32,
    /// How often the auto-sync task checks staleness (in milliseconds).
    pub auto_sync_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 5 * 60 * 1000,
            message_page_size: 50,
            max_pages: 20,
            max_operation_attempts: 5,
            auto_sync_interval_ms: 60 * 1000,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn stale_after(mut self, ms: i64) -> Self {
        self.config.stale_after_ms = ms;
        self
    }

    pub fn message_page_size(mut self, size: usize) -> Self {
        self.config.message_page_size = size;
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.config.max_pages = pages;
        self
    }

    pub fn max_operation_attempts(mut self, attempts: u32) -> Self {
        self.config.max_operation_attempts = attempts;
        self
    }

    pub fn auto_sync_interval(mut self, ms: u64) -> Self {
        self.config.auto_sync_interval_ms = ms;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable sync state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_synced_at: Option<i64>,
    pub error: Option<String>,
}

/// Outcome of one ledger replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Confirmed remotely and removed from the ledger.
    pub applied: usize,
    /// Failed and left pending for the next pass.
    pub retried: usize,
    /// Failed for the last time and marked failed.
    pub abandoned: usize,
}

struct SyncInner<S, A> {
    store: Arc<S>,
    api: Arc<A>,
    config: SyncConfig,
    clock: Arc<dyn WallClock>,
    is_syncing: AtomicBool,
    status: RwLock<SyncStatus>,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<SyncStatus>,
}

/// Orchestrates pulls from the remote API into the local store.
pub struct SyncEngine<S: LocalStore, A: RemoteApi> {
    inner: Arc<SyncInner<S, A>>,
}

impl<S: LocalStore, A: RemoteApi> Clone for SyncEngine<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: LocalStore, A: RemoteApi> SyncEngine<S, A> {
    pub fn new(store: Arc<S>, api: Arc<A>, config: SyncConfig) -> Self {
        Self::with_clock(store, api, config, Arc::new(SystemClock))
    }

    /// Create an engine that reads time from `clock`.
    pub fn with_clock(
        store: Arc<S>,
        api: Arc<A>,
        config: SyncConfig,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SyncInner {
                store,
                api,
                config,
                clock,
                is_syncing: AtomicBool::new(false),
                status: RwLock::new(SyncStatus::default()),
                last_error: RwLock::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.read().clone()
    }

    /// Most recent entity sync failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Receive status transitions. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.events.subscribe()
    }

    /// Sync chats, contacts and documents concurrently.
    ///
    /// A no-op returning the current status while another full sync runs.
    pub async fn full_sync(&self) -> SyncStatus {
        if self.inner.is_syncing.swap(true, Ordering::SeqCst) {
            debug!("full sync already running");
            return self.status();
        }
        let _running = SyncingGuard { engine: self };

        *self.inner.last_error.write() = None;
        let previous = self.status().last_synced_at;
        self.publish(SyncStatus {
            is_syncing: true,
            last_synced_at: previous,
            error: None,
        });
        info!("full sync started");

        let (chats, contacts, documents) =
            tokio::join!(self.sync_chats(), self.sync_contacts(), self.sync_documents());

        let now = self.now();
        if let Err(err) = self.inner.store.set_last_sync_time(FULL_SYNC_KEY, now).await {
            self.record_error("watermark", err.into());
        }

        let status = SyncStatus {
            is_syncing: false,
            last_synced_at: Some(now),
            error: self.last_error(),
        };
        self.publish(status.clone());

        info!(?chats, ?contacts, ?documents, error = ?status.error, "full sync finished");
        status
    }

    /// Pull all chats. Returns how many were stored, or `None` on failure.
    pub async fn sync_chats(&self) -> Option<usize> {
        let result = async {
            let response = self.inner.api.list_chats().await?;
            let mut count = 0;
            for chat in response.data {
                self.inner.store.upsert_chat(chat.into_row()).await?;
                count += 1;
            }
            self.inner.store.set_last_sync_time(CHATS_KEY, self.now()).await?;
            Ok::<_, SdkError>(count)
        }
        .await;
        self.settle(CHATS_KEY, result)
    }

    /// Pull all contacts. Returns how many were stored, or `None` on failure.
    pub async fn sync_contacts(&self) -> Option<usize> {
        let result = async {
            let response = self.inner.api.list_contacts().await?;
            let mut count = 0;
            for contact in response.data {
                self.inner.store.upsert_contact(contact.into_row()).await?;
                count += 1;
            }
            self.inner.store.set_last_sync_time(CONTACTS_KEY, self.now()).await?;
            Ok::<_, SdkError>(count)
        }
        .await;
        self.settle(CONTACTS_KEY, result)
    }

    /// Pull all documents. Returns how many were stored, or `None` on failure.
    pub async fn sync_documents(&self) -> Option<usize> {
        let result = async {
            let response = self.inner.api.list_documents().await?;
            let mut count = 0;
            for document in response.data {
                self.inner.store.upsert_document(document.into_row()).await?;
                count += 1;
            }
            self.inner.store.set_last_sync_time(DOCUMENTS_KEY, self.now()).await?;
            Ok::<_, SdkError>(count)
        }
        .await;
        self.settle(DOCUMENTS_KEY, result)
    }

    /// Pull messages of one chat newer than the newest stored one.
    ///
    /// Follows `meta.cursor` while the API reports more pages, up to
    /// `max_pages`. Returns how many messages were stored, or `None` on failure.
    pub async fn sync_messages(&self, chat_id: &str) -> Option<usize> {
        let result = async {
            let mut cursor = self
                .inner
                .store
                .get_latest_message_server_id(chat_id)
                .await?;
            let mut count = 0;

            for _ in 0..self.inner.config.max_pages.max(1) {
                let response = self
                    .inner
                    .api
                    .list_messages(chat_id, cursor.as_deref(), self.inner.config.message_page_size)
                    .await?;
                let next = response.next_cursor().map(str::to_string);

                for message in response.data {
                    self.inner.store.upsert_message(message.into_row()).await?;
                    count += 1;
                }

                match next {
                    Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                    _ => break,
                }
            }
            Ok::<_, SdkError>(count)
        }
        .await;
        self.settle(&format!("messages:{}", chat_id), result)
    }

    /// Whether the last full sync is older than the staleness threshold.
    pub async fn needs_full_sync(&self) -> bool {
        match self.inner.store.get_last_sync_time(FULL_SYNC_KEY).await {
            Ok(last) => self.now() - last > self.inner.config.stale_after_ms,
            Err(err) => {
                warn!(error = %err, "cannot read sync watermark");
                true
            }
        }
    }

    /// Run a full sync if one is due. Call when the app comes to the foreground.
    pub async fn on_foreground(&self) -> Option<SyncStatus> {
        if self.needs_full_sync().await {
            Some(self.full_sync().await)
        } else {
            None
        }
    }

    /// Periodically run a full sync whenever one is due.
    pub fn spawn_auto_sync(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.on_foreground().await;
            }
        })
    }

    /// Return operations left `processing` by a crash to `pending`.
    ///
    /// Must run once on startup before the ledger is replayed.
    pub async fn recover(&self) -> Result<usize> {
        let reset = self.inner.store.reset_processing_operations().await?;
        if reset > 0 {
            info!(reset, "recovered interrupted operations");
        }
        Ok(reset)
    }

    /// Add a mutation to the ledger.
    pub async fn record_operation(&self, operation: NewOperation) -> Result<String> {
        Ok(self.inner.store.add_pending_operation(operation).await?)
    }

    /// Replay pending ledger operations in creation order.
    ///
    /// A transient failure stops the pass so later operations never overtake
    /// an earlier one. An operation that runs out of attempts is marked failed
    /// and skipped.
    pub async fn push_pending_operations(&self) -> Result<ReplayReport> {
        let store = &self.inner.store;
        let mut report = ReplayReport::default();

        for operation in store.get_pending_operations().await? {
            store.mark_operation_processing(&operation.id).await?;

            match self.inner.api.apply_operation(&operation).await {
                Ok(()) => {
                    store.remove_operation(&operation.id).await?;
                    report.applied += 1;
                }
                Err(err) if operation.retry_count + 1 >= self.inner.config.max_operation_attempts => {
                    warn!(id = %operation.id, error = %err, "operation abandoned");
                    store.mark_operation_permanently_failed(&operation.id).await?;
                    report.abandoned += 1;
                }
                Err(err) => {
                    debug!(id = %operation.id, error = %err, "operation replay failed");
                    store.mark_operation_failed(&operation.id).await?;
                    report.retried += 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    fn now(&self) -> i64 {
        i64::try_from(self.inner.clock.now_millis()).unwrap_or(i64::MAX)
    }

    fn settle(&self, entity: &str, result: Result<usize>) -> Option<usize> {
        match result {
            Ok(count) => {
                debug!(entity, count, "entity sync complete");
                Some(count)
            }
            Err(err) => {
                self.record_error(entity, err);
                None
            }
        }
    }

    fn record_error(&self, entity: &str, err: SdkError) {
        warn!(entity, error = %err, "sync failed");
        *self.inner.last_error.write() = Some(err.to_string());
    }

    fn publish(&self, status: SyncStatus) {
        *self.inner.status.write() = status.clone();
        let _ = self.inner.events.send(status);
    }
}

/// Releases the full-sync flag however the sync ends, including when its
/// future is dropped part way.
struct SyncingGuard<'a, S: LocalStore, A: RemoteApi> {
    engine: &'a SyncEngine<S, A>,
}

impl<S: LocalStore, A: RemoteApi> Drop for SyncingGuard<'_, S, A> {
    fn drop(&mut self) {
        let status = self.engine.status();
        if status.is_syncing {
            warn!("full sync cancelled");
            self.engine.publish(SyncStatus {
                is_syncing: false,
                ..status
            });
        }
        self.engine.inner.is_syncing.store(false, Ordering::SeqCst);
    }
}
