//! Persisted snapshot of the registry and the checkpointer that writes it.
//!
//! The snapshot holds last-known status only. It is provisional on restore
//! until the reconciler has confirmed it against the server.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::key::MailboxSessionKey;
use crate::registry::SessionRegistry;
use crate::state::MailboxSessionState;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub sessions: Vec<PersistedSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub email: String,
    pub user_id: String,
    pub state: MailboxSessionState,
}

impl PersistedSnapshot {
    pub fn into_registry(self) -> SessionRegistry {
        let entries: BTreeMap<_, _> = self
            .sessions
            .into_iter()
            .map(|session| {
                (
                    MailboxSessionKey::new(session.email, session.user_id),
                    session.state,
                )
            })
            .collect();
        SessionRegistry::from_entries(entries)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: PersistedSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }
}

/// The persisted view of `registry`: status fields only, ordered by key.
pub fn derive_snapshot(registry: &SessionRegistry) -> PersistedSnapshot {
    PersistedSnapshot {
        version: SNAPSHOT_VERSION,
        sessions: registry
            .snapshot()
            .into_iter()
            .map(|(key, state)| PersistedSession {
                email: key.email,
                user_id: key.user_id,
                state,
            })
            .collect(),
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, SnapshotError>;
    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), SnapshotError>;
}

/// Restores the registry from `store`, starting empty when nothing usable is
/// stored.
pub async fn restore_registry(store: &dyn SnapshotStore) -> SessionRegistry {
    match store.load().await {
        Ok(Some(snapshot)) => {
            info!(
                target = "mailguard.persist",
                sessions = snapshot.sessions.len(),
                "restored session snapshot"
            );
            snapshot.into_registry()
        }
        Ok(None) => SessionRegistry::new(),
        Err(err) => {
            warn!(
                target = "mailguard.persist",
                error = %err,
                "ignoring unreadable session snapshot"
            );
            SessionRegistry::new()
        }
    }
}

/// JSON file on local disk, replaced atomically on save. Saves through one
/// store are serialized so they never share the temporary file.
pub struct FileSnapshotStore {
    path: PathBuf,
    write: AsyncMutex<()>,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: AsyncMutex::new(()),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => PersistedSnapshot::from_bytes(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), SnapshotError> {
        let bytes = snapshot.to_bytes()?;
        let _write = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory adapter for tests; keeps the encoded bytes of the last save.
#[derive(Default)]
pub struct MemorySnapshotStore {
    bytes: Mutex<Option<Vec<u8>>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes.lock().clone()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, SnapshotError> {
        match self.bytes.lock().as_deref() {
            Some(bytes) => PersistedSnapshot::from_bytes(bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), SnapshotError> {
        let bytes = snapshot.to_bytes()?;
        *self.bytes.lock() = Some(bytes);
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Quiet period after a change before the snapshot is written.
    pub debounce: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Writes registry snapshots on a debounce after changes, or on demand.
#[derive(Clone)]
pub struct Checkpointer {
    registry: SessionRegistry,
    store: Arc<dyn SnapshotStore>,
    config: CheckpointConfig,
}

impl Checkpointer {
    pub fn new(
        registry: SessionRegistry,
        store: Arc<dyn SnapshotStore>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Explicit checkpoint.
    pub async fn flush(&self) -> Result<(), SnapshotError> {
        let snapshot = derive_snapshot(&self.registry);
        self.store.save(&snapshot).await?;
        debug!(
            target = "mailguard.persist",
            sessions = snapshot.sessions.len(),
            revision = self.registry.revision(),
            "session snapshot written"
        );
        Ok(())
    }

    /// Starts the debounced writer. Stop it with [`CheckpointTask::stop`]
    /// before the final [`Checkpointer::flush`].
    pub fn spawn(&self) -> CheckpointTask {
        let checkpointer = self.clone();
        let mut changes = self.registry.subscribe();
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = tokio::time::sleep(checkpointer.config.debounce) => {}
                }
                let _ = changes.borrow_and_update();
                if let Err(err) = checkpointer.flush().await {
                    warn!(
                        target = "mailguard.persist",
                        error = %err,
                        "failed to write session snapshot"
                    );
                }
            }
        });
        CheckpointTask { stop, task }
    }
}

/// Handle on a running debounced writer. Dropping it also stops the writer.
pub struct CheckpointTask {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CheckpointTask {
    /// Stops the writer and waits for any save already in progress.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            warn!(
                target = "mailguard.persist",
                error = %err,
                "checkpoint task ended abnormally"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionUpdate;
    use time::OffsetDateTime;

    fn populated() -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry.set(
            &MailboxSessionKey::new("a@x.com", "u1"),
            &SessionUpdate {
                is_scanning: Some(true),
                last_scan: Some(OffsetDateTime::now_utc()),
                emails_scanned: Some(42),
                threats_found: Some(3),
            },
        );
        registry.set(
            &MailboxSessionKey::new("a@x.com", "u2"),
            &SessionUpdate::scanning(false),
        );
        registry
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_store() {
        let registry = populated();
        let store = MemorySnapshotStore::new();
        Checkpointer::new(registry.clone(), store.clone(), CheckpointConfig::default())
            .flush()
            .await
            .expect("flush");

        let restored = restore_registry(store.as_ref()).await;
        assert_eq!(restored.snapshot(), registry.snapshot());
    }

    #[test]
    fn snapshot_contains_only_status_fields() {
        let bytes = derive_snapshot(&populated()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let state = value["sessions"][0]["state"].as_object().unwrap();
        let mut fields: Vec<_> = state.keys().cloned().collect();
        fields.sort();
        assert_eq!(
            fields,
            ["emailsScanned", "isScanning", "lastScan", "threatsFound"]
        );
        assert_eq!(value["sessions"][0]["userId"], "u1");
    }

    #[tokio::test]
    async fn rejects_unknown_versions() {
        let bytes = br#"{"version":99,"sessions":[]}"#;
        assert!(matches!(
            PersistedSnapshot::from_bytes(bytes),
            Err(SnapshotError::UnsupportedVersion(99))
        ));
    }

    #[tokio::test]
    async fn file_store_writes_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("state").join("sessions.json"));
        assert!(store.load().await.expect("load").is_none());

        let snapshot = derive_snapshot(&populated());
        store.save(&snapshot).await.expect("save");
        assert_eq!(store.load().await.expect("load"), Some(snapshot));
    }

    #[tokio::test]
    async fn corrupt_file_restores_empty_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let registry = restore_registry(&FileSnapshotStore::new(path)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn spawned_checkpointer_coalesces_changes() {
        let registry = SessionRegistry::new();
        let store = MemorySnapshotStore::new();
        let checkpointer = Checkpointer::new(
            registry.clone(),
            store.clone(),
            CheckpointConfig {
                debounce: Duration::from_millis(50),
            },
        );
        let task = checkpointer.spawn();

        let key = MailboxSessionKey::new("a@x.com", "u1");
        registry.set(&key, &SessionUpdate::scanning(true));
        registry.set(&key, &SessionUpdate::scanning(false));
        registry.set(&key, &SessionUpdate::scanning(true));

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.saves() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("snapshot written");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.saves(), 1);

        let restored = restore_registry(store.as_ref()).await;
        assert!(restored.get(&key).is_scanning);
        task.stop().await;
    }

    #[tokio::test]
    async fn stopped_checkpointer_writes_nothing_more() {
        let registry = SessionRegistry::new();
        let store = MemorySnapshotStore::new();
        let task = Checkpointer::new(
            registry.clone(),
            store.clone(),
            CheckpointConfig {
                debounce: Duration::from_millis(20),
            },
        )
        .spawn();

        task.stop().await;
        registry.set(
            &MailboxSessionKey::new("a@x.com", "u1"),
            &SessionUpdate::scanning(true),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_file_saves_do_not_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileSnapshotStore::new(dir.path().join("sessions.json")));
        let snapshot = derive_snapshot(&populated());

        for _ in 0..50 {
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let store = Arc::clone(&store);
                    let snapshot = snapshot.clone();
                    async move { store.save(&snapshot).await }
                }),
                tokio::spawn({
                    let store = Arc::clone(&store);
                    let snapshot = snapshot.clone();
                    async move { store.save(&snapshot).await }
                }),
            );
            a.expect("join").expect("first save");
            b.expect("join").expect("second save");
        }
        assert_eq!(store.load().await.expect("load"), Some(snapshot));
    }
}
