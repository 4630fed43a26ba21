//! Topic publish/subscribe plumbing for the mailguard scanning client.
//!
//! A [`Connector`] opens one connection per mailbox session; each connection is
//! a [`Bus`] that multiplexes topic subscriptions and control publishes. Two
//! backends ship here: the in-memory [`LocalBus`] for tests and embedding, and
//! a STOMP-over-WebSocket connector for talking to the scanning backend.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

mod local;
pub mod stomp;

pub use local::{LocalBus, LocalConnection, LocalConnector};
pub use stomp::{StompConfig, StompConnector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus handshake rejected: {0}")]
    Handshake(String),
    #[error("bus operation timed out")]
    Timeout,
}

pub type BusResult<T> = Result<T, BusError>;

/// A live connection carrying topic traffic.
///
/// Receivers handed out by [`Bus::subscribe`] observe
/// [`broadcast::error::RecvError::Closed`] once the connection is gone.
#[async_trait]
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    /// Requests a graceful shutdown and waits for the transport to settle.
    async fn close(&self) -> BusResult<()>;
    fn is_closed(&self) -> bool;
}

/// Opens new bus connections. Every call yields an independent connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>>;
}

/// Receiver that reports `Closed` on first poll.
pub(crate) fn closed_receiver() -> broadcast::Receiver<BusMessage> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}
