//! STOMP over WebSocket, as spoken by the scanning backend's message broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{closed_receiver, Bus, BusError, BusMessage, BusResult, Connector};

mod frame;

pub use frame::{Command, Frame, FrameError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOPIC_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct StompConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws`.
    pub url: String,
    /// Value of the STOMP `host` header.
    pub virtual_host: String,
    /// Extra CONNECT headers such as `Authorization`.
    pub connect_headers: Vec<(String, String)>,
    pub handshake_timeout: Duration,
}

impl StompConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            virtual_host: "/".into(),
            connect_headers: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.connect_headers
            .push(("Authorization".into(), format!("Bearer {token}")));
        self
    }
}

pub struct StompConnector {
    config: StompConfig,
}

impl StompConnector {
    pub fn new(config: StompConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>> {
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.config.virtual_host.clone())
            .header("heart-beat", "0,0");
        for (name, value) in &self.config.connect_headers {
            connect = connect.header(name.clone(), value.clone());
        }
        send_frame(&mut sink, &connect).await?;

        let connected = tokio::time::timeout(
            self.config.handshake_timeout,
            await_connected(&mut stream),
        )
        .await
        .map_err(|_| BusError::Timeout)??;
        debug!(
            target = "transport.stomp",
            url = %self.config.url,
            version = connected.get("version").unwrap_or("?"),
            "stomp session established"
        );

        Ok(StompConnection::start(sink, stream))
    }
}

async fn send_frame(sink: &mut SplitSink<WsStream, Message>, frame: &Frame) -> BusResult<()> {
    sink.send(frame_message(frame))
        .await
        .map_err(|err| BusError::Transport(err.to_string()))
}

/// Text message when the encoded frame is valid UTF-8, binary otherwise, so
/// payload bytes are never rewritten.
fn frame_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

async fn await_connected(stream: &mut SplitStream<WsStream>) -> BusResult<Frame> {
    while let Some(msg) = stream.next().await {
        let bytes = match msg.map_err(|err| BusError::Transport(err.to_string()))? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        let Some((frame, _)) =
            Frame::decode(&bytes).map_err(|err| BusError::Transport(err.to_string()))?
        else {
            continue;
        };
        return match frame.command {
            Command::Connected => Ok(frame),
            Command::Error => Err(BusError::Handshake(error_text(&frame))),
            other => Err(BusError::Handshake(format!(
                "unexpected {} before CONNECTED",
                other.as_str()
            ))),
        };
    }
    Err(BusError::Closed)
}

fn error_text(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned())
}

enum Outbound {
    Frame(Frame),
    Close(oneshot::Sender<()>),
}

struct StompConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
    next_subscription: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    closed: AtomicBool,
}

impl Shared {
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.lock().clear();
    }
}

impl StompConnection {
    fn start(sink: SplitSink<WsStream, Message>, stream: SplitStream<WsStream>) -> Arc<dyn Bus> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(write_loop(sink, rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));
        Arc::new(StompConnection {
            outbound,
            shared,
            next_subscription: AtomicU64::new(0),
            reader: Mutex::new(Some(reader)),
        })
    }

    fn send(&self, frame: Frame) -> BusResult<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl Bus for StompConnection {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        if self.is_closed() {
            return closed_receiver();
        }
        let mut topics = self.shared.topics.lock();
        if let Some(sender) = topics.get(topic) {
            return sender.subscribe();
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(Command::Subscribe)
            .header("id", format!("sub-{id}"))
            .header("destination", topic)
            .header("ack", "auto");
        if self.send(frame).is_err() {
            return closed_receiver();
        }
        let (sender, receiver) = broadcast::channel(TOPIC_DEPTH);
        topics.insert(topic.to_string(), sender);
        receiver
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.send(
            Frame::new(Command::Send)
                .header("destination", topic)
                .header("content-type", "application/json")
                .body(payload),
        )
    }

    async fn close(&self) -> BusResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (done, wait) = oneshot::channel();
        let flushed = self.outbound.send(Outbound::Close(done)).is_ok();
        if flushed {
            let _ = wait.await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.shut();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    warn!(target = "transport.stomp", error = %err, "stomp write failed");
                    break;
                }
            }
            Outbound::Close(done) => {
                let _ = send_frame(&mut sink, &Frame::new(Command::Disconnect)).await;
                let _ = sink.close().await;
                let _ = done.send(());
                return;
            }
        }
    }
    shared.shut();
}

/// Shuts the connection down when the reader ends, including on panic or
/// abort, so subscribers always observe `Closed`.
struct ShutOnExit(Arc<Shared>);

impl Drop for ShutOnExit {
    fn drop(&mut self) {
        self.0.shut();
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    let _guard = ShutOnExit(Arc::clone(&shared));
    while let Some(msg) = stream.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(target = "transport.stomp", error = %err, "stomp read failed");
                break;
            }
        };
        let mut rest = bytes.as_slice();
        loop {
            match Frame::decode(rest) {
                Ok(Some((frame, used))) => {
                    rest = &rest[used..];
                    route(&shared, frame);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target = "transport.stomp",
                        error = %err,
                        "dropping undecodable stomp frame"
                    );
                    break;
                }
            }
        }
    }
    debug!(target = "transport.stomp", "stomp reader finished");
}

fn route(shared: &Shared, frame: Frame) {
    match frame.command {
        Command::Message => {
            let Some(destination) = frame.get("destination") else {
                return;
            };
            let sender = shared.topics.lock().get(destination).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(BusMessage {
                    topic: destination.to_string(),
                    payload: frame.body.clone(),
                });
            }
        }
        Command::Error => {
            warn!(
                target = "transport.stomp",
                message = %error_text(&frame),
                "broker reported an error"
            );
        }
        _ => {}
    }
}
