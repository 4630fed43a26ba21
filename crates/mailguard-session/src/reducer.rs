//! Pure per-session state transitions.
//!
//! The connection manager feeds every inbound [`SessionEvent`] for a live
//! handle through [`reduce`] and applies the result; no transport types leak
//! in here.

use time::OffsetDateTime;

use crate::event::SessionEvent;
use crate::notice::NoticeKind;
use crate::state::MailboxSessionState;

/// Lifecycle of a session's connection: `Idle -> Connecting -> Active -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub phase: Phase,
    pub state: MailboxSessionState,
    pub notice: Option<NoticeKind>,
}

impl Transition {
    fn stay(phase: Phase, state: &MailboxSessionState) -> Self {
        Self {
            phase,
            state: state.clone(),
            notice: None,
        }
    }

    fn idle(state: &MailboxSessionState, notice: NoticeKind) -> Self {
        Self {
            phase: Phase::Idle,
            state: MailboxSessionState {
                is_scanning: false,
                ..state.clone()
            },
            notice: Some(notice),
        }
    }
}

pub fn reduce(
    phase: Phase,
    state: &MailboxSessionState,
    event: &SessionEvent,
    now: OffsetDateTime,
) -> Transition {
    match (phase, event) {
        (Phase::Idle, _) => Transition::stay(Phase::Idle, state),

        (Phase::Connecting, SessionEvent::Acknowledged) => Transition {
            phase: Phase::Active,
            state: MailboxSessionState {
                is_scanning: true,
                last_scan: Some(now),
                ..state.clone()
            },
            notice: Some(NoticeKind::Connected),
        },
        (Phase::Active, SessionEvent::Acknowledged) => Transition::stay(Phase::Active, state),

        (_, SessionEvent::Rejected { cause }) => Transition::idle(
            state,
            NoticeKind::Rejected {
                cause: cause.clone(),
            },
        ),

        // Results only count once the handshake has been acknowledged.
        (Phase::Connecting, SessionEvent::ScanEvent { .. }) => {
            Transition::stay(Phase::Connecting, state)
        }
        (Phase::Active, SessionEvent::ScanEvent { threat }) => {
            let threat = *threat;
            Transition {
                phase: Phase::Active,
                state: MailboxSessionState {
                    emails_scanned: state.emails_scanned + 1,
                    threats_found: state.threats_found + u64::from(threat.is_threat()),
                    ..state.clone()
                },
                notice: threat
                    .is_threat()
                    .then_some(NoticeKind::ThreatDetected { level: threat }),
            }
        }

        (_, SessionEvent::Disconnected { reason }) => Transition::idle(
            state,
            NoticeKind::ConnectionLost {
                reason: reason.clone(),
            },
        ),
    }
}
