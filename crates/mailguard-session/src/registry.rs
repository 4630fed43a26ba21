use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::key::MailboxSessionKey;
use crate::state::{MailboxSessionState, SessionUpdate};

/// Process-wide map from mailbox session to its cached status.
///
/// Reads hand out owned copies. Writes are crate-private: only the connection
/// manager and the reconciler mutate entries. Every effective change advances a
/// revision counter observable through [`SessionRegistry::subscribe`].
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: RwLock<BTreeMap<MailboxSessionKey, MailboxSessionState>>,
    revision: watch::Sender<u64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::from_entries(BTreeMap::new())
    }

    pub(crate) fn from_entries(entries: BTreeMap<MailboxSessionKey, MailboxSessionState>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                entries: RwLock::new(entries),
                revision,
            }),
        }
    }

    /// Current state for `key`, or the idle default when the key is unknown.
    pub fn get(&self, key: &MailboxSessionKey) -> MailboxSessionState {
        self.inner
            .entries
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &MailboxSessionKey) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    pub fn snapshot(&self) -> BTreeMap<MailboxSessionKey, MailboxSessionState> {
        self.inner.entries.read().clone()
    }

    pub fn keys_for_user(&self, user_id: &str) -> Vec<MailboxSessionKey> {
        self.inner
            .entries
            .read()
            .keys()
            .filter(|key| key.belongs_to(user_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Merges `update` into the entry for `key`, creating it on first
    /// reference. Returns the resulting state.
    pub(crate) fn set(&self, key: &MailboxSessionKey, update: &SessionUpdate) -> MailboxSessionState {
        let mut entries = self.inner.entries.write();
        let existed = entries.contains_key(key);
        let current = entries.get(key).cloned().unwrap_or_default();
        let next = update.apply(&current);
        if existed && next == current {
            return next;
        }
        entries.insert(key.clone(), next.clone());
        drop(entries);
        self.bump();
        next
    }

    pub(crate) fn remove(&self, key: &MailboxSessionKey) -> Option<MailboxSessionState> {
        let removed = self.inner.entries.write().remove(key);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }
}
