use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusMessage, Connector};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::event::{self, Channel, SessionEvent};
use crate::key::MailboxSessionKey;
use crate::notice::{Notice, NoticeKind, Notifier};
use crate::params::{ConnectRequest, ConnectionParams, DisconnectRequest};
use crate::reducer::{reduce, Phase};
use crate::registry::SessionRegistry;
use crate::state::SessionUpdate;

/// Owns one streaming connection per mailbox session and keeps the registry's
/// `is_scanning` flag in step with it.
///
/// Every connection is tagged with a generation id. Inbound traffic is applied
/// only while that generation is still the registered handle for its key, so
/// late acknowledgments and events from a torn-down connection are dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    registry: SessionRegistry,
    notifier: Arc<dyn Notifier>,
    config: ManagerConfig,
    handles: Mutex<HashMap<MailboxSessionKey, ConnectionHandle>>,
}

struct ConnectionHandle {
    generation: Uuid,
    phase: Phase,
    bus: Option<Arc<dyn Bus>>,
    task: Option<JoinHandle<()>>,
}

enum Dispatch {
    Continue(Phase),
    Finished,
    Discarded,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: SessionRegistry,
        notifier: Arc<dyn Notifier>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                registry,
                notifier,
                config,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn phase(&self, key: &MailboxSessionKey) -> Phase {
        self.inner
            .handles
            .lock()
            .get(key)
            .map(|handle| handle.phase)
            .unwrap_or(Phase::Idle)
    }

    /// True while an acknowledged connection is registered for `key`.
    pub fn is_connected(&self, key: &MailboxSessionKey) -> bool {
        self.phase(key) == Phase::Active
    }

    pub fn has_handle(&self, key: &MailboxSessionKey) -> bool {
        self.inner.handles.lock().contains_key(key)
    }

    pub fn live_keys(&self) -> Vec<MailboxSessionKey> {
        let mut keys: Vec<_> = self.inner.handles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Opens a scanning session for `key` unless one is already connecting or
    /// connected. Failures end in the idle state plus a user notice; nothing is
    /// returned to the caller.
    pub async fn start_scan(&self, key: MailboxSessionKey, params: ConnectionParams) {
        let generation = {
            let mut handles = self.inner.handles.lock();
            if let Some(existing) = handles.get(&key) {
                debug!(
                    target = "mailguard.session",
                    email = %key.email,
                    user_id = %key.user_id,
                    phase = ?existing.phase,
                    "scan already in progress"
                );
                return;
            }
            let generation = Uuid::new_v4();
            handles.insert(
                key.clone(),
                ConnectionHandle {
                    generation,
                    phase: Phase::Connecting,
                    bus: None,
                    task: None,
                },
            );
            if !self.inner.registry.contains(&key) {
                self.inner.registry.set(&key, &SessionUpdate::default());
            }
            generation
        };
        info!(
            target = "mailguard.session",
            email = %key.email,
            user_id = %key.user_id,
            host = %params.host,
            %generation,
            "opening scan connection"
        );

        let bus = match self.inner.connector.connect().await {
            Ok(bus) => bus,
            Err(err) => {
                warn!(
                    target = "mailguard.session",
                    email = %key.email,
                    user_id = %key.user_id,
                    error = %err,
                    "scan connection failed"
                );
                self.apply(
                    &key,
                    generation,
                    SessionEvent::Rejected {
                        cause: Some(err.to_string()),
                    },
                );
                return;
            }
        };

        let subscriptions = {
            let mut handles = self.inner.handles.lock();
            match handles.get_mut(&key) {
                Some(handle) if handle.generation == generation => {
                    let acks = bus.subscribe(&self.inner.config.ack_topic(&key));
                    let scans = bus.subscribe(&self.inner.config.scan_topic(&key));
                    handle.bus = Some(Arc::clone(&bus));
                    Some((acks, scans))
                }
                _ => None,
            }
        };
        let Some((acks, scans)) = subscriptions else {
            debug!(
                target = "mailguard.session",
                email = %key.email,
                user_id = %key.user_id,
                "scan stopped while connecting; closing new connection"
            );
            self.close_bus(&key, bus).await;
            return;
        };

        let sent = json_body(&ConnectRequest::new(&params, &key))
            .map_err(|err| err.to_string())
            .and_then(|body| {
                bus.publish(&self.inner.config.connect_destination, body)
                    .map_err(|err| err.to_string())
            });
        if let Err(cause) = sent {
            self.apply(&key, generation, SessionEvent::Rejected { cause: Some(cause) });
            return;
        }
        counter!("mailguard_handshakes_total", 1, "outcome" => "requested");

        let task = tokio::spawn(dispatch_loop(
            self.clone(),
            key.clone(),
            generation,
            acks,
            scans,
        ));
        let mut handles = self.inner.handles.lock();
        match handles.get_mut(&key) {
            Some(handle) if handle.generation == generation => handle.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Releases the session for `key`. The backend is told to stop on a
    /// best-effort basis; local state is always idle afterwards.
    pub async fn stop_scan(&self, key: &MailboxSessionKey) {
        self.teardown(key, false).await;
    }

    /// Stops every session owned by `user_id`, leaving other users untouched.
    pub async fn stop_all(&self, user_id: &str) {
        let mut keys: BTreeSet<MailboxSessionKey> = self
            .inner
            .handles
            .lock()
            .keys()
            .filter(|key| key.belongs_to(user_id))
            .cloned()
            .collect();
        keys.extend(
            self.inner
                .registry
                .keys_for_user(user_id)
                .into_iter()
                .filter(|key| self.inner.registry.get(key).is_scanning),
        );
        info!(
            target = "mailguard.session",
            user_id,
            sessions = keys.len(),
            "stopping all scans for user"
        );
        join_all(keys.iter().map(|key| self.stop_scan(key))).await;
    }

    /// Tears down the session and forgets its cached status.
    pub async fn remove_mailbox(&self, key: &MailboxSessionKey) {
        self.teardown(key, true).await;
    }

    /// Stops every live session regardless of owner.
    pub async fn shutdown(&self) {
        let keys = self.live_keys();
        join_all(keys.iter().map(|key| self.stop_scan(key))).await;
    }

    /// Overwrites `is_scanning` from server-reported truth. Keys with a live
    /// handle belong to this manager and are left alone.
    pub(crate) fn reconcile_status(&self, key: &MailboxSessionKey, connected: bool) -> bool {
        let handles = self.inner.handles.lock();
        if handles.contains_key(key) {
            return false;
        }
        if self.inner.registry.get(key).is_scanning == connected {
            return false;
        }
        self.inner
            .registry
            .set(key, &SessionUpdate::scanning(connected));
        true
    }

    async fn teardown(&self, key: &MailboxSessionKey, forget: bool) {
        let released = {
            let mut handles = self.inner.handles.lock();
            let released = handles.remove(key);
            if forget {
                self.inner.registry.remove(key);
            } else if released.is_some() || self.inner.registry.contains(key) {
                self.inner.registry.set(key, &SessionUpdate::scanning(false));
            }
            released
        };
        let Some(handle) = released else {
            return;
        };
        if let Some(task) = handle.task {
            task.abort();
        }
        counter!("mailguard_teardowns_total", 1, "reason" => "requested");
        info!(
            target = "mailguard.session",
            email = %key.email,
            user_id = %key.user_id,
            phase = ?handle.phase,
            "stopping scan"
        );

        if let Some(bus) = handle.bus {
            let notice = json_body(&DisconnectRequest::from(key)).map_err(|err| err.to_string());
            if let Err(err) = notice.and_then(|body| {
                bus.publish(&self.inner.config.disconnect_destination, body)
                    .map_err(|err| err.to_string())
            }) {
                debug!(
                    target = "mailguard.session",
                    email = %key.email,
                    user_id = %key.user_id,
                    error = %err,
                    "disconnect notice not delivered"
                );
            }
            self.close_bus(key, bus).await;
        }
    }

    /// Runs `event` through the reducer if `generation` is still the live
    /// handle for `key`, tearing the handle down when the session goes idle.
    fn apply(&self, key: &MailboxSessionKey, generation: Uuid, event: SessionEvent) -> Dispatch {
        let mut handles = self.inner.handles.lock();
        let Some(handle) = handles
            .get_mut(key)
            .filter(|handle| handle.generation == generation)
        else {
            debug!(
                target = "mailguard.session",
                email = %key.email,
                user_id = %key.user_id,
                event = ?event,
                "discarding event for superseded connection"
            );
            return Dispatch::Discarded;
        };

        let current = self.inner.registry.get(key);
        let transition = reduce(handle.phase, &current, &event, OffsetDateTime::now_utc());
        let update = SessionUpdate::between(&current, &transition.state);
        if !update.is_empty() {
            self.inner.registry.set(key, &update);
        }

        let outcome = match transition.phase {
            Phase::Idle => {
                let released = handles.remove(key);
                drop(handles);
                counter!("mailguard_teardowns_total", 1, "reason" => "failure");
                warn!(
                    target = "mailguard.session",
                    email = %key.email,
                    user_id = %key.user_id,
                    event = ?event,
                    "scan session ended"
                );
                if let Some(bus) = released.and_then(|handle| handle.bus) {
                    let manager = self.clone();
                    let key = key.clone();
                    tokio::spawn(async move { manager.close_bus(&key, bus).await });
                }
                Dispatch::Finished
            }
            phase => {
                if handle.phase == Phase::Connecting && phase == Phase::Active {
                    counter!("mailguard_handshakes_total", 1, "outcome" => "accepted");
                    info!(
                        target = "mailguard.session",
                        email = %key.email,
                        user_id = %key.user_id,
                        "scan session acknowledged"
                    );
                }
                handle.phase = phase;
                drop(handles);
                Dispatch::Continue(phase)
            }
        };

        if let Some(kind) = transition.notice {
            if matches!(kind, NoticeKind::ThreatDetected { .. }) {
                counter!("mailguard_threats_total", 1);
            }
            self.inner.notifier.notify(Notice::new(key.clone(), kind));
        }
        outcome
    }

    async fn close_bus(&self, key: &MailboxSessionKey, bus: Arc<dyn Bus>) {
        match tokio::time::timeout(self.inner.config.teardown_timeout, bus.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(
                target = "mailguard.session",
                email = %key.email,
                user_id = %key.user_id,
                error = %err,
                "connection close reported an error"
            ),
            Err(_) => warn!(
                target = "mailguard.session",
                email = %key.email,
                user_id = %key.user_id,
                "timed out closing connection"
            ),
        }
    }
}

async fn dispatch_loop(
    manager: ConnectionManager,
    key: MailboxSessionKey,
    generation: Uuid,
    mut acks: broadcast::Receiver<BusMessage>,
    mut scans: broadcast::Receiver<BusMessage>,
) {
    let handshake = tokio::time::sleep(manager.inner.config.handshake_timeout);
    tokio::pin!(handshake);
    let mut acknowledged = false;

    loop {
        let event = tokio::select! {
            msg = acks.recv() => inbound(&key, Channel::Ack, msg),
            msg = scans.recv() => inbound(&key, Channel::Scan, msg),
            _ = &mut handshake, if !acknowledged => Some(SessionEvent::Rejected {
                cause: Some("handshake timed out".into()),
            }),
        };
        let Some(event) = event else {
            continue;
        };
        match manager.apply(&key, generation, event) {
            Dispatch::Continue(phase) => acknowledged = phase == Phase::Active,
            Dispatch::Finished | Dispatch::Discarded => break,
        }
    }
}

fn inbound(
    key: &MailboxSessionKey,
    channel: Channel,
    msg: Result<BusMessage, RecvError>,
) -> Option<SessionEvent> {
    match msg {
        Ok(msg) => match event::decode(channel, &msg.payload) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(
                    target = "mailguard.session",
                    email = %key.email,
                    topic = %msg.topic,
                    error = %err,
                    "ignoring undecodable message"
                );
                None
            }
        },
        Err(RecvError::Lagged(skipped)) => {
            warn!(
                target = "mailguard.session",
                email = %key.email,
                skipped,
                "subscriber lagged; messages dropped"
            );
            None
        }
        Err(RecvError::Closed) => Some(SessionEvent::Disconnected {
            reason: "transport closed".into(),
        }),
    }
}

fn json_body<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(Bytes::from)
}
