use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Cached scanning status of one mailbox session.
///
/// The default value is the idle state reported for keys the registry has
/// never seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxSessionState {
    pub is_scanning: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_scan: Option<OffsetDateTime>,
    #[serde(default)]
    pub emails_scanned: u64,
    #[serde(default)]
    pub threats_found: u64,
}

/// Partial update merged into a [`MailboxSessionState`]; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub is_scanning: Option<bool>,
    pub last_scan: Option<OffsetDateTime>,
    pub emails_scanned: Option<u64>,
    pub threats_found: Option<u64>,
}

impl SessionUpdate {
    pub fn scanning(is_scanning: bool) -> Self {
        Self {
            is_scanning: Some(is_scanning),
            ..Self::default()
        }
    }

    /// The smallest update turning `from` into `to`.
    pub fn between(from: &MailboxSessionState, to: &MailboxSessionState) -> Self {
        Self {
            is_scanning: (from.is_scanning != to.is_scanning).then_some(to.is_scanning),
            last_scan: if from.last_scan != to.last_scan {
                to.last_scan
            } else {
                None
            },
            emails_scanned: (from.emails_scanned != to.emails_scanned)
                .then_some(to.emails_scanned),
            threats_found: (from.threats_found != to.threats_found).then_some(to.threats_found),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, state: &MailboxSessionState) -> MailboxSessionState {
        MailboxSessionState {
            is_scanning: self.is_scanning.unwrap_or(state.is_scanning),
            last_scan: self.last_scan.or(state.last_scan),
            emails_scanned: self.emails_scanned.unwrap_or(state.emails_scanned),
            threats_found: self.threats_found.unwrap_or(state.threats_found),
        }
    }
}
