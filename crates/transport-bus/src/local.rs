use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{closed_receiver, Bus, BusError, BusMessage, BusResult, Connector};

const TOPIC_DEPTH: usize = 64;

/// Simple in-memory broker shared by every connection opened on it.
///
/// Publishing to a topic nobody listens on drops the message, the way a
/// broker would.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_DEPTH).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    pub fn publish(&self, topic: &str, payload: Bytes) {
        let sender = self.sender_for(topic);
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Drops the topic so that every current subscriber sees the channel close.
    /// Used to simulate a transport failure.
    pub fn sever(&self, topic: &str) -> bool {
        self.topics.write().remove(topic).is_some()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// One client connection onto a [`LocalBus`].
pub struct LocalConnection {
    bus: Arc<LocalBus>,
    closed: AtomicBool,
}

impl LocalConnection {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self {
            bus,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Bus for LocalConnection {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        if self.is_closed() {
            return closed_receiver();
        }
        self.bus.subscribe(topic)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.bus.publish(topic, payload);
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens [`LocalConnection`]s onto a shared [`LocalBus`].
#[derive(Default)]
pub struct LocalConnector {
    bus: Arc<LocalBus>,
    refuse: AtomicBool,
    opened: AtomicUsize,
}

impl LocalConnector {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self {
            bus,
            refuse: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn bus(&self) -> Arc<LocalBus> {
        Arc::clone(&self.bus)
    }

    /// When set, subsequent connection attempts fail with a transport error.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BusError::Transport("connection refused".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalConnection::new(Arc::clone(&self.bus))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let connector = LocalConnector::new(Arc::new(LocalBus::new()));
        let conn = connector.connect().await.expect("connect");
        let mut sub = conn.subscribe("/topic/connect/a@x.com/u1");
        conn.publish("/topic/connect/a@x.com/u1", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "/topic/connect/a@x.com/u1");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert_eq!(connector.connections_opened(), 1);
    }

    #[tokio::test]
    async fn publish_without_listeners_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("/app/connect", Bytes::from_static(b"{}"));
        assert_eq!(bus.subscriber_count("/app/connect"), 0);
    }

    #[tokio::test]
    async fn closed_connection_rejects_traffic() {
        let conn = LocalConnection::new(Arc::new(LocalBus::new()));
        conn.close().await.expect("close");
        assert!(conn.is_closed());
        assert!(matches!(
            conn.publish("t", Bytes::new()),
            Err(BusError::Closed)
        ));
        let mut rx = conn.subscribe("t");
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn sever_closes_subscribers() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe("/topic/emails/a@x.com/u1");
        assert!(bus.sever("/topic/emails/a@x.com/u1"));
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn refusing_connector_fails() {
        let connector = LocalConnector::new(Arc::new(LocalBus::new()));
        connector.set_refuse(true);
        assert!(matches!(
            connector.connect().await,
            Err(BusError::Transport(_))
        ));
        assert_eq!(connector.connections_opened(), 0);
    }
}
