//! Read-only views joining the mailbox list with cached scanning status.

use mailguard_sdk::MailboxRecord;
use serde::Serialize;
use time::OffsetDateTime;

use crate::key::MailboxSessionKey;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanningState {
    Scanning,
    Idle,
}

impl ScanningState {
    pub fn label(self) -> &'static str {
        match self {
            ScanningState::Scanning => "scanning",
            ScanningState::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStatusView {
    pub id: i64,
    pub email_address: String,
    pub mail_server_type: String,
    pub state: ScanningState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_scan: Option<OffsetDateTime>,
    pub emails_scanned: u64,
    pub threats_found: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub mailboxes: usize,
    pub scanning: usize,
    pub emails_scanned: u64,
    pub threats_found: u64,
}

/// One view per mailbox, in list order. Mailboxes without a registry entry
/// show as idle.
pub fn project(
    mailboxes: &[MailboxRecord],
    user_id: &str,
    registry: &SessionRegistry,
) -> Vec<MailboxStatusView> {
    let snapshot = registry.snapshot();
    mailboxes
        .iter()
        .map(|mailbox| {
            let key = MailboxSessionKey::new(mailbox.email_address.clone(), user_id);
            let state = snapshot.get(&key).cloned().unwrap_or_default();
            MailboxStatusView {
                id: mailbox.id,
                email_address: mailbox.email_address.clone(),
                mail_server_type: mailbox.mail_server_type.clone(),
                state: if state.is_scanning {
                    ScanningState::Scanning
                } else {
                    ScanningState::Idle
                },
                last_scan: state.last_scan,
                emails_scanned: state.emails_scanned,
                threats_found: state.threats_found,
            }
        })
        .collect()
}

pub fn summarize(views: &[MailboxStatusView]) -> DashboardSummary {
    views.iter().fold(
        DashboardSummary {
            mailboxes: views.len(),
            ..DashboardSummary::default()
        },
        |mut acc, view| {
            if view.state == ScanningState::Scanning {
                acc.scanning += 1;
            }
            acc.emails_scanned += view.emails_scanned;
            acc.threats_found += view.threats_found;
            acc
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionUpdate;

    fn mailbox(id: i64, email: &str) -> MailboxRecord {
        MailboxRecord {
            id,
            email_address: email.into(),
            mail_server_type: "gmail".into(),
        }
    }

    #[test]
    fn missing_entries_default_to_idle() {
        let registry = SessionRegistry::new();
        registry.set(
            &MailboxSessionKey::new("a@x.com", "u1"),
            &SessionUpdate {
                is_scanning: Some(true),
                emails_scanned: Some(5),
                threats_found: Some(1),
                ..SessionUpdate::default()
            },
        );
        let views = project(
            &[mailbox(1, "a@x.com"), mailbox(2, "b@x.com")],
            "u1",
            &registry,
        );
        assert_eq!(views[0].state, ScanningState::Scanning);
        assert_eq!(views[0].emails_scanned, 5);
        assert_eq!(views[1].state, ScanningState::Idle);
        assert_eq!(views[1].last_scan, None);

        let summary = summarize(&views);
        assert_eq!(
            summary,
            DashboardSummary {
                mailboxes: 2,
                scanning: 1,
                emails_scanned: 5,
                threats_found: 1,
            }
        );
    }

    #[test]
    fn other_users_sessions_are_not_shown() {
        let registry = SessionRegistry::new();
        registry.set(
            &MailboxSessionKey::new("a@x.com", "u2"),
            &SessionUpdate::scanning(true),
        );
        let views = project(&[mailbox(1, "a@x.com")], "u1", &registry);
        assert_eq!(views[0].state, ScanningState::Idle);
        assert_eq!(ScanningState::Idle.label(), "idle");
    }
}
