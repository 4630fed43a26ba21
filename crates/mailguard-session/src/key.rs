use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one mailbox session: the external mailbox address scanned on
/// behalf of one user.
///
/// The same address may be registered by several users, so the user id is
/// always part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxSessionKey {
    pub email: String,
    pub user_id: String,
}

impl MailboxSessionKey {
    pub fn new(email: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            user_id: user_id.into(),
        }
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

impl fmt::Display for MailboxSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (user {})", self.email, self.user_id)
    }
}
