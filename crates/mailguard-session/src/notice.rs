//! Transient user-facing notifications raised by the connection manager.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::event::ThreatLevel;
use crate::key::MailboxSessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// What happened, before it is rendered into a [`Notice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    Connected,
    Rejected { cause: Option<String> },
    ThreatDetected { level: ThreatLevel },
    ConnectionLost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub key: MailboxSessionKey,
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(key: MailboxSessionKey, kind: NoticeKind) -> Self {
        let (level, message) = match &kind {
            NoticeKind::Connected => (
                NoticeLevel::Info,
                format!("Scanning started for {}", key.email),
            ),
            NoticeKind::Rejected { cause } => (
                NoticeLevel::Error,
                match cause {
                    Some(cause) => format!("Could not connect to {}: {cause}", key.email),
                    None => format!("Could not connect to {}", key.email),
                },
            ),
            NoticeKind::ThreatDetected { level } => (
                NoticeLevel::Warning,
                format!("Threat detected in {} (severity {level})", key.email),
            ),
            NoticeKind::ConnectionLost { reason } => (
                NoticeLevel::Error,
                format!("Lost connection to {}: {reason}", key.email),
            ),
        };
        Self {
            level,
            key,
            kind,
            message,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Forwards notices to whoever renders them. Dropped receivers are ignored.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        let email = notice.key.email.as_str();
        let user_id = notice.key.user_id.as_str();
        let message = notice.message.as_str();
        match notice.level {
            NoticeLevel::Info => {
                info!(target = "mailguard.notice", email, user_id, "{message}")
            }
            NoticeLevel::Warning => {
                warn!(target = "mailguard.notice", email, user_id, "{message}")
            }
            NoticeLevel::Error => {
                error!(target = "mailguard.notice", email, user_id, "{message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_levels_and_messages() {
        let key = MailboxSessionKey::new("a@x.com", "u1");
        let notice = Notice::new(
            key.clone(),
            NoticeKind::Rejected {
                cause: Some("bad credentials".into()),
            },
        );
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, "Could not connect to a@x.com: bad credentials");

        let notice = Notice::new(
            key,
            NoticeKind::ThreatDetected {
                level: ThreatLevel::High,
            },
        );
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert!(notice.message.contains("severity high"));
    }

    #[tokio::test]
    async fn channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let key = MailboxSessionKey::new("a@x.com", "u1");
        notifier.notify(Notice::new(key.clone(), NoticeKind::Connected));
        notifier.notify(Notice::new(
            key,
            NoticeKind::ConnectionLost {
                reason: "closed".into(),
            },
        ));
        assert_eq!(rx.recv().await.unwrap().kind, NoticeKind::Connected);
        assert_eq!(rx.recv().await.unwrap().level, NoticeLevel::Error);
    }
}
