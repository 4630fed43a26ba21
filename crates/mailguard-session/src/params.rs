//! Connection parameters and the control requests built from them.

use mailguard_sdk::MailboxRecord;
use serde::Serialize;

use crate::key::MailboxSessionKey;

pub const DEFAULT_PROTOCOL: &str = "imap";
pub const DEFAULT_PORT: u16 = 993;

/// Well-known provider shorthands stored as a mailbox's server type.
const HOST_ALIASES: &[(&str, &str)] = &[
    ("wp", "imap.wp.pl"),
    ("gmail", "imap.gmail.com"),
    ("onet", "imap.poczta.onet.pl"),
];

/// What the backend needs to open an IMAP session for a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectionParams {
    pub fn from_mailbox(mailbox: &MailboxRecord) -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: resolve_host(&mailbox.mail_server_type),
            port: DEFAULT_PORT,
            username: mailbox.email_address.clone(),
        }
    }
}

pub fn resolve_host(server_type: &str) -> String {
    let lowered = server_type.trim().to_ascii_lowercase();
    HOST_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, host)| host.to_string())
        .unwrap_or_else(|| server_type.trim().to_string())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest<'a> {
    pub protocol: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub user_id: &'a str,
}

impl<'a> ConnectRequest<'a> {
    pub fn new(params: &'a ConnectionParams, key: &'a MailboxSessionKey) -> Self {
        Self {
            protocol: &params.protocol,
            host: &params.host,
            port: params.port,
            username: &params.username,
            user_id: &key.user_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest<'a> {
    pub email: &'a str,
    pub user_id: &'a str,
}

impl<'a> From<&'a MailboxSessionKey> for DisconnectRequest<'a> {
    fn from(key: &'a MailboxSessionKey) -> Self {
        Self {
            email: &key.email,
            user_id: &key.user_id,
        }
    }
}
