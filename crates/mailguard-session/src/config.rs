use std::time::Duration;

use crate::key::MailboxSessionKey;

/// Wire destinations and timeouts used by the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connect_destination: String,
    pub disconnect_destination: String,
    pub ack_topic_prefix: String,
    pub scan_topic_prefix: String,
    /// How long a session may stay `Connecting` without an acknowledgment.
    pub handshake_timeout: Duration,
    /// Upper bound on graceful close during teardown.
    pub teardown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_destination: "/app/connect".into(),
            disconnect_destination: "/app/disconnect".into(),
            ack_topic_prefix: "/topic/connect".into(),
            scan_topic_prefix: "/topic/emails".into(),
            handshake_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(2),
        }
    }
}

impl ManagerConfig {
    pub fn ack_topic(&self, key: &MailboxSessionKey) -> String {
        format!("{}/{}/{}", self.ack_topic_prefix, key.email, key.user_id)
    }

    pub fn scan_topic(&self, key: &MailboxSessionKey) -> String {
        format!("{}/{}/{}", self.scan_topic_prefix, key.email, key.user_id)
    }
}
