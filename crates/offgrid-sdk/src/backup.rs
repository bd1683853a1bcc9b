//! Cloud backup of the local cache.
//!
//! The storage backend is a capability chosen once at startup:
//! Google Drive on Android and other targets, iCloud on Apple platforms.
//! The actual Drive/iCloud transfer lives behind [`CloudBackupProvider`].

use crate::error::{Result, SdkError};
use async_trait::async_trait;
use offgrid_db::store::models::now_millis;
use offgrid_db::{ChatRow, ContactRow, DocumentRow, LocalStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Snapshot format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Host platform, detected at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// Backup backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupKind {
    GoogleDrive,
    ICloud,
}

impl BackupKind {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Ios | Platform::MacOs => BackupKind::ICloud,
            Platform::Android | Platform::Other => BackupKind::GoogleDrive,
        }
    }
}

/// A place backups can be written to and read from.
#[async_trait]
pub trait CloudBackupProvider: Send + Sync + 'static {
    fn kind(&self) -> BackupKind;

    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<()>;

    async fn download(&self, name: &str) -> Result<Vec<u8>>;

    /// Names of stored backups, oldest first.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Serialized contents of one backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub version: u32,
    pub created_at: i64,
    pub chats: Vec<ChatRow>,
    pub contacts: Vec<ContactRow>,
    pub documents: Vec<DocumentRow>,
}

/// Writes and restores snapshots of the local store.
pub struct BackupService<S: LocalStore, P: CloudBackupProvider> {
    store: Arc<S>,
    provider: Arc<P>,
}

impl<S: LocalStore, P: CloudBackupProvider> BackupService<S, P> {
    pub fn new(store: Arc<S>, provider: Arc<P>) -> Self {
        Self { store, provider }
    }

    pub fn kind(&self) -> BackupKind {
        self.provider.kind()
    }

    /// Capture chats, contacts and documents.
    pub async fn snapshot(&self) -> Result<BackupSnapshot> {
        Ok(BackupSnapshot {
            version: SNAPSHOT_VERSION,
            created_at: now_millis(),
            chats: self.store.list_chats().await?,
            contacts: self.store.list_contacts().await?,
            documents: self.store.list_documents().await?,
        })
    }

    /// Upload a fresh snapshot and return its name.
    pub async fn backup(&self) -> Result<String> {
        let snapshot = self.snapshot().await?;
        let name = format!("offgrid-backup-{}.json", snapshot.created_at);
        let data = serde_json::to_vec(&snapshot)?;
        let size = data.len();

        self.provider.upload(&name, data).await?;
        info!(%name, size, kind = ?self.kind(), "backup uploaded");
        Ok(name)
    }

    /// Upsert every row of a stored snapshot. Returns how many rows were written.
    pub async fn restore(&self, name: &str) -> Result<usize> {
        let data = self.provider.download(name).await?;
        let snapshot: BackupSnapshot = serde_json::from_slice(&data)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SdkError::Backup(format!(
                "snapshot version {} is newer than supported {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let mut written = 0;
        for chat in snapshot.chats {
            self.store.upsert_chat(chat).await?;
            written += 1;
        }
        for contact in snapshot.contacts {
            self.store.upsert_contact(contact).await?;
            written += 1;
        }
        for document in snapshot.documents {
            self.store.upsert_document(document).await?;
            written += 1;
        }

        info!(%name, written, "backup restored");
        Ok(written)
    }

    /// Restore the newest stored backup, if any.
    pub async fn restore_latest(&self) -> Result<Option<usize>> {
        match self.provider.list().await?.last() {
            Some(name) => Ok(Some(self.restore(name).await?)),
            None => Ok(None),
        }
    }
}

/// In-memory provider for tests.
pub struct MemoryBackupProvider {
    kind: BackupKind,
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackupProvider {
    pub fn new(kind: BackupKind) -> Self {
        Self {
            kind,
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Provider of the kind the current platform would use.
    pub fn for_current_platform() -> Self {
        Self::new(BackupKind::for_platform(Platform::current()))
    }
}

#[async_trait]
impl CloudBackupProvider for MemoryBackupProvider {
    fn kind(&self) -> BackupKind {
        self.kind
    }

    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.files.write().insert(name.to_string(), data);
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SdkError::Backup(format!("no backup named {}", name)))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }
}
