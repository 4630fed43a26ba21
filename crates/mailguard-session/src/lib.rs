//! Session state core for the mailguard scanning client.
//!
//! Tracks, per `(mailbox address, user)` pair, whether a remote scan is
//! running and what it has found so far:
//!
//! - [`SessionRegistry`] holds the cached [`MailboxSessionState`] of every
//!   known session and publishes a revision on each effective change.
//! - [`ConnectionManager`] owns the live streaming connection of each session
//!   and drives the registry from acknowledgments and scan events.
//! - [`Reconciler`] merges the server's view of which sessions are live.
//! - [`project`] joins a mailbox list with cached status for display.
//! - [`Checkpointer`] writes the registry to a [`SnapshotStore`] so status
//!   survives restarts.

pub mod config;
pub mod event;
pub mod key;
pub mod manager;
pub mod notice;
pub mod params;
pub mod persist;
pub mod projection;
pub mod reconcile;
pub mod reducer;
pub mod registry;
pub mod state;

pub use config::ManagerConfig;
pub use event::{SessionEvent, ThreatLevel};
pub use key::MailboxSessionKey;
pub use manager::ConnectionManager;
pub use notice::{ChannelNotifier, LogNotifier, Notice, NoticeKind, NoticeLevel, Notifier};
pub use params::ConnectionParams;
pub use persist::{
    derive_snapshot, restore_registry, CheckpointConfig, CheckpointTask, Checkpointer,
    FileSnapshotStore, MemorySnapshotStore, PersistedSnapshot, SnapshotError, SnapshotStore,
};
pub use projection::{project, summarize, DashboardSummary, MailboxStatusView, ScanningState};
pub use reconcile::{ReconcileError, Reconciler, SyncReport};
pub use reducer::Phase;
pub use registry::SessionRegistry;
pub use state::MailboxSessionState;
