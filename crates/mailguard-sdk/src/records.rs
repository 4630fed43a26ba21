use serde::{Deserialize, Serialize};

/// The authenticated user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    #[serde(alias = "sub")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// A registered IMAP mailbox, reduced to the fields the scanner needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxRecord {
    pub id: i64,
    #[serde(alias = "email")]
    pub email_address: String,
    #[serde(alias = "type")]
    pub mail_server_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_accepts_backend_field_names() {
        let record: MailboxRecord =
            serde_json::from_str(r#"{"id":7,"email":"a@x.com","type":"gmail"}"#)
                .expect("backend shape");
        assert_eq!(record.email_address, "a@x.com");
        assert_eq!(record.mail_server_type, "gmail");

        let record: MailboxRecord = serde_json::from_str(
            r#"{"id":7,"emailAddress":"a@x.com","mailServerType":"wp"}"#,
        )
        .expect("camel case shape");
        assert_eq!(record.mail_server_type, "wp");
    }

    #[test]
    fn current_user_reads_oidc_subject() {
        let user: CurrentUser =
            serde_json::from_str(r#"{"sub":"auth0|42","name":"Ada","nickname":"ada"}"#)
                .expect("oidc attributes");
        assert_eq!(user.id, "auth0|42");
        assert_eq!(user.name.as_deref(), Some("Ada"));
        assert_eq!(user.email, None);
    }
}
