//! Inbound session traffic, parsed into tagged events.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Qualitative severity attached to every scanned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

impl ThreatLevel {
    pub fn is_threat(self) -> bool {
        !matches!(self, ThreatLevel::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLevel {
    type Err = EventDecodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "none" => Ok(ThreatLevel::None),
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            _ => Err(EventDecodeError::UnknownValue(raw.to_string())),
        }
    }
}

impl TryFrom<String> for ThreatLevel {
    type Error = EventDecodeError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AckStatus {
    Success,
    Error,
}

impl TryFrom<String> for AckStatus {
    type Error = EventDecodeError;

    fn try_from(raw: String) -> Result<Self, EventDecodeError> {
        match raw.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(AckStatus::Success),
            "ERROR" => Ok(AckStatus::Error),
            _ => Err(EventDecodeError::UnknownValue(raw)),
        }
    }
}

/// Handshake acknowledgment as published on the per-mailbox connect topic.
#[derive(Debug, Clone, Deserialize)]
pub struct AckMessage {
    pub error: AckStatus,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Per-message scan result as published on the per-mailbox events topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEventMessage {
    pub threat_level: ThreatLevel,
}

/// Which subscription a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ack,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Acknowledged,
    Rejected { cause: Option<String> },
    ScanEvent { threat: ThreatLevel },
    Disconnected { reason: String },
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown value {0:?}")]
    UnknownValue(String),
}

pub fn decode(channel: Channel, payload: &[u8]) -> Result<SessionEvent, EventDecodeError> {
    match channel {
        Channel::Ack => {
            let ack: AckMessage = serde_json::from_slice(payload)?;
            Ok(match ack.error {
                AckStatus::Success => SessionEvent::Acknowledged,
                AckStatus::Error => SessionEvent::Rejected {
                    cause: ack.cause.filter(|cause| !cause.trim().is_empty()),
                },
            })
        }
        Channel::Scan => {
            let event: ScanEventMessage = serde_json::from_slice(payload)?;
            Ok(SessionEvent::ScanEvent {
                threat: event.threat_level,
            })
        }
    }
}
