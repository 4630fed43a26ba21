use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::SdkError;

/// Server-side view of which mailboxes have a live scanning session.
#[async_trait]
pub trait ConnectionStateSource: Send + Sync {
    /// Maps mailbox address to "actively connected" for `user_id`.
    async fn connection_states(&self, user_id: &str) -> Result<BTreeMap<String, bool>, SdkError>;
}

/// In-memory adapter for tests and offline wiring.
#[derive(Default)]
pub struct InMemoryConnectionStates {
    states: Mutex<HashMap<String, BTreeMap<String, bool>>>,
    failing: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl InMemoryConnectionStates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, user_id: &str, email: &str, connected: bool) {
        self.states
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(email.to_string(), connected);
    }

    /// Makes every following fetch fail with the given message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failing.lock() = Some(message.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionStateSource for InMemoryConnectionStates {
    async fn connection_states(&self, user_id: &str) -> Result<BTreeMap<String, bool>, SdkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failing.lock().clone() {
            return Err(SdkError::Unavailable(message));
        }
        Ok(self
            .states
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}
