use std::collections::BTreeSet;
use std::sync::Arc;

use mailguard_sdk::{ConnectionStateSource, SdkError};
use thiserror::Error;
use tracing::{info, warn};

use crate::key::MailboxSessionKey;
use crate::manager::ConnectionManager;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch connection states: {0}")]
    Fetch(#[from] SdkError),
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Mailboxes the server listed for the user.
    pub reported: usize,
    /// Keys whose `is_scanning` flag was rewritten.
    pub changed: Vec<MailboxSessionKey>,
    /// Keys the server reports as live but that have no local connection.
    /// Resuming them is up to the caller.
    pub resumable: Vec<MailboxSessionKey>,
}

/// Merges server-side session truth into the registry.
///
/// Only `is_scanning` is written; counters and timestamps stay as tracked
/// locally. No connections are opened.
pub struct Reconciler {
    source: Arc<dyn ConnectionStateSource>,
    manager: ConnectionManager,
}

impl Reconciler {
    pub fn new(source: Arc<dyn ConnectionStateSource>, manager: ConnectionManager) -> Self {
        Self { source, manager }
    }

    /// Fetches the live sessions of `user_id` and merges them.
    ///
    /// On fetch failure the registry is left untouched and the error is
    /// returned for the caller to log or ignore.
    pub async fn synchronize(&self, user_id: &str) -> Result<SyncReport, ReconcileError> {
        let states = match self.source.connection_states(user_id).await {
            Ok(states) => states,
            Err(err) => {
                warn!(
                    target = "mailguard.reconcile",
                    user_id,
                    error = %err,
                    "connection state sync failed; keeping cached status"
                );
                return Err(err.into());
            }
        };

        let mut report = SyncReport {
            reported: states.len(),
            ..SyncReport::default()
        };
        let mut live = BTreeSet::new();
        for (email, connected) in &states {
            let key = MailboxSessionKey::new(email.clone(), user_id);
            if *connected {
                live.insert(key.clone());
            }
            if self.manager.reconcile_status(&key, *connected) {
                report.changed.push(key.clone());
            }
            if *connected && !self.manager.has_handle(&key) {
                report.resumable.push(key);
            }
        }

        // Flags left over from a previous run that the server no longer backs.
        let registry = self.manager.registry();
        for key in registry.keys_for_user(user_id) {
            if live.contains(&key) || !registry.get(&key).is_scanning {
                continue;
            }
            if self.manager.reconcile_status(&key, false) {
                report.changed.push(key);
            }
        }

        info!(
            target = "mailguard.reconcile",
            user_id,
            reported = report.reported,
            changed = report.changed.len(),
            resumable = report.resumable.len(),
            "connection states synchronized"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::notice::LogNotifier;
    use crate::registry::SessionRegistry;
    use crate::state::SessionUpdate;
    use mailguard_sdk::InMemoryConnectionStates;
    use transport_bus::{LocalBus, LocalConnector};

    fn manager(registry: SessionRegistry) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(LocalConnector::new(Arc::new(LocalBus::new()))),
            registry,
            Arc::new(LogNotifier),
            ManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn overwrites_only_the_scanning_flag() {
        let registry = SessionRegistry::new();
        let key = MailboxSessionKey::new("a@x.com", "u1");
        registry.set(
            &key,
            &SessionUpdate {
                emails_scanned: Some(9),
                threats_found: Some(2),
                ..SessionUpdate::default()
            },
        );
        let source = InMemoryConnectionStates::new();
        source.set("u1", "a@x.com", true);
        let reconciler = Reconciler::new(source, manager(registry.clone()));

        let report = reconciler.synchronize("u1").await.expect("sync");
        let state = registry.get(&key);
        assert!(state.is_scanning);
        assert_eq!(state.emails_scanned, 9);
        assert_eq!(state.threats_found, 2);
        assert_eq!(report.changed, vec![key.clone()]);
        assert_eq!(report.resumable, vec![key]);
    }

    #[tokio::test]
    async fn clears_stale_flags_for_unreported_mailboxes() {
        let registry = SessionRegistry::new();
        let stale = MailboxSessionKey::new("gone@x.com", "u1");
        let other_user = MailboxSessionKey::new("gone@x.com", "u2");
        registry.set(&stale, &SessionUpdate::scanning(true));
        registry.set(&other_user, &SessionUpdate::scanning(true));
        let reconciler = Reconciler::new(InMemoryConnectionStates::new(), manager(registry.clone()));

        let report = reconciler.synchronize("u1").await.expect("sync");
        assert!(!registry.get(&stale).is_scanning);
        assert!(registry.get(&other_user).is_scanning);
        assert_eq!(report.changed, vec![stale]);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_registry_untouched() {
        let registry = SessionRegistry::new();
        let key = MailboxSessionKey::new("a@x.com", "u1");
        registry.set(&key, &SessionUpdate::scanning(true));
        let before = registry.snapshot();
        let source = InMemoryConnectionStates::new();
        source.fail_with("offline");
        let reconciler = Reconciler::new(source, manager(registry.clone()));

        assert!(reconciler.synchronize("u1").await.is_err());
        assert_eq!(registry.snapshot(), before);
    }

    #[tokio::test]
    async fn does_not_create_entries_for_idle_unknown_mailboxes() {
        let registry = SessionRegistry::new();
        let source = InMemoryConnectionStates::new();
        source.set("u1", "idle@x.com", false);
        let reconciler = Reconciler::new(source, manager(registry.clone()));

        let report = reconciler.synchronize("u1").await.expect("sync");
        assert!(registry.is_empty());
        assert!(report.changed.is_empty());
        assert_eq!(report.reported, 1);
    }
}
