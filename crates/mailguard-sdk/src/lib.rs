//! Asynchronous client for the mailguard REST API.
//!
//! Covers the slice of the backend the scanning client consumes: the current
//! user, logout, the mailbox list, and the per-user connection-state map used
//! to reconcile locally cached scanning status.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

mod connection_states;
mod records;

pub use connection_states::{ConnectionStateSource, InMemoryConnectionStates};
pub use records::{CurrentUser, MailboxRecord};

#[derive(Clone)]
pub struct MailguardClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl MailguardClient {
    /// `base_url` is the API root, e.g. `http://localhost:8080/api`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub async fn current_user(&self) -> Result<CurrentUser, SdkError> {
        let url = format!("{}/auth/user", self.base_url);
        self.fetch_json(self.http.get(url)).await
    }

    pub async fn logout(&self) -> Result<(), SdkError> {
        let url = format!("{}/auth/logout", self.base_url);
        self.send(self.http.post(url)).await?;
        Ok(())
    }

    pub async fn list_mailboxes(&self, user_id: &str) -> Result<Vec<MailboxRecord>, SdkError> {
        let url = format!("{}/mailboxes/{}", self.base_url, user_id);
        self.fetch_json(self.http.get(url)).await
    }

    async fn fetch_json<T>(&self, request: RequestBuilder) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
    {
        let res = self.send(request).await?;
        Ok(res.json::<T>().await?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SdkError> {
        let res = request.bearer_auth(&self.token).send().await?;

        if res.status().is_success() {
            Ok(res)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(SdkError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl ConnectionStateSource for MailguardClient {
    async fn connection_states(&self, user_id: &str) -> Result<BTreeMap<String, bool>, SdkError> {
        let url = format!("{}/mailbox-connections/{}", self.base_url, user_id);
        let states: BTreeMap<String, bool> = self.fetch_json(self.http.get(url)).await?;
        debug!(
            target = "mailguard.sdk",
            user_id,
            reported = states.len(),
            "fetched mailbox connection states"
        );
        Ok(states)
    }
}
