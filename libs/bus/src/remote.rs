//! Bus over a byte stream.
//!
//! The side that owns a real bus runs [`serve`] for each connection; the
//! other side talks through a [`RemoteBus`], which implements [`MessageBus`]
//! by forwarding every operation over the connection. Frames are
//! newline-delimited JSON with base64 payloads.
//!
//! Requests flow both ways: a client request is executed against the served
//! bus, and a message delivered to a client subscription can be answered by
//! the client with [`InboundMessage::respond`] as if it were local.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    validate_pattern, validate_subject, BusError, InboundMessage, MessageBus, Subscription,
};

/// How long a subscription waits for the server to confirm it.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of a request's own timeout, covering the round trip.
const REQUEST_MARGIN: Duration = Duration::from_millis(250);

const CODE_NO_RESPONDERS: &str = "no_responders";
const CODE_TIMEOUT: &str = "timeout";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Pub {
        subject: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    Req {
        id: u64,
        subject: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
        timeout_ms: u64,
    },
    Sub {
        id: u64,
        sid: u64,
        pattern: String,
    },
    Unsub {
        sid: u64,
    },
    Respond {
        reply: u64,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    Msg {
        sid: u64,
        subject: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<u64>,
    },
    Ack {
        id: u64,
        #[serde(default, with = "b64")]
        payload: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Frame {
    fn ack(id: u64, result: Result<Vec<u8>, BusError>) -> Self {
        match result {
            Ok(payload) => Frame::Ack {
                id,
                payload,
                error: None,
                code: None,
            },
            Err(e) => {
                let code = match e {
                    BusError::NoResponders(_) => Some(CODE_NO_RESPONDERS.to_string()),
                    BusError::Timeout(_) => Some(CODE_TIMEOUT.to_string()),
                    _ => None,
                };
                Frame::Ack {
                    id,
                    payload: Vec::new(),
                    error: Some(e.to_string()),
                    code,
                }
            }
        }
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Aborts the task when dropped, so a cancelled connection takes its helper
/// tasks with it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode bus frame");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            debug!(error = %e, "Bus connection write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "Bus connection flush failed");
            break;
        }
    }
}

// =============================================================================
// Server side
// =============================================================================

/// Messages delivered to the client that still await its reply.
type PendingReplies = Arc<Mutex<HashMap<u64, InboundMessage>>>;

/// Accepts TCP connections and serves `bus` on each until the listener fails.
pub async fn serve_listener(listener: TcpListener, bus: Arc<dyn MessageBus>) -> Result<(), BusError> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Serving bus connections");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "Bus client connected");
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            if let Err(e) = serve(stream, bus).await {
                debug!(peer = %peer, error = %e, "Bus client connection ended");
            }
        });
    }
}

/// Serves `bus` to one client connection until it closes.
pub async fn serve<S>(stream: S, bus: Arc<dyn MessageBus>) -> Result<(), BusError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let _writer = AbortOnDrop(tokio::spawn(write_frames(writer, rx)));

    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let next_reply = Arc::new(AtomicU64::new(0));
    let mut forwarders: HashMap<u64, AbortOnDrop> = HashMap::new();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) => return Err(BusError::Io(e)),
        };
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bus frame");
                continue;
            }
        };

        match frame {
            Frame::Pub { subject, payload } => {
                if let Err(e) = bus.publish(&subject, payload).await {
                    debug!(subject = %subject, error = %e, "Client publish rejected");
                }
            }
            Frame::Req {
                id,
                subject,
                payload,
                timeout_ms,
            } => {
                let bus = Arc::clone(&bus);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = bus
                        .request(&subject, payload, Duration::from_millis(timeout_ms))
                        .await;
                    tx.send(Frame::ack(id, result)).ok();
                });
            }
            Frame::Sub { id, sid, pattern } => match bus.subscribe(&pattern).await {
                Ok(subscription) => {
                    let forwarder = tokio::spawn(forward(
                        subscription,
                        sid,
                        tx.clone(),
                        Arc::clone(&pending),
                        Arc::clone(&next_reply),
                    ));
                    forwarders.insert(sid, AbortOnDrop(forwarder));
                    tx.send(Frame::ack(id, Ok(Vec::new()))).ok();
                }
                Err(e) => {
                    tx.send(Frame::ack(id, Err(e))).ok();
                }
            },
            Frame::Unsub { sid } => {
                forwarders.remove(&sid);
            }
            Frame::Respond { reply, payload } => {
                let message = pending.lock().ok().and_then(|mut p| p.remove(&reply));
                match message {
                    Some(message) => {
                        if let Err(e) = message.respond(payload) {
                            debug!(error = %e, "Client reply arrived after requester left");
                        }
                    }
                    None => debug!(reply, "Client reply for unknown request"),
                }
            }
            Frame::Msg { .. } | Frame::Ack { .. } => {
                warn!("Ignoring server-bound frame sent by client");
            }
        }
    }
}

/// Relays one server-side subscription to the client.
async fn forward(
    mut subscription: Subscription,
    sid: u64,
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingReplies,
    next_reply: Arc<AtomicU64>,
) {
    while let Some(message) = subscription.next().await {
        let frame = if message.expects_reply() {
            let reply = next_reply.fetch_add(1, Ordering::Relaxed);
            let frame = Frame::Msg {
                sid,
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                reply: Some(reply),
            };
            if let Ok(mut pending) = pending.lock() {
                pending.retain(|_, m| !m.reply_abandoned());
                pending.insert(reply, message);
            }
            frame
        } else {
            Frame::Msg {
                sid,
                subject: message.subject,
                payload: message.payload,
                reply: None,
            }
        };
        if tx.send(frame).is_err() {
            break;
        }
    }
}

// =============================================================================
// Client side
// =============================================================================

type AckWaiter = (String, oneshot::Sender<Result<Vec<u8>, BusError>>);

#[derive(Default)]
struct ClientShared {
    acks: Mutex<HashMap<u64, AckWaiter>>,
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<InboundMessage>>>,
    closed: AtomicBool,
}

impl ClientShared {
    fn take_ack(&self, id: u64) -> Option<AckWaiter> {
        self.acks.lock().ok().and_then(|mut acks| acks.remove(&id))
    }

    fn drop_subscription(&self, sid: u64) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.remove(&sid);
        }
    }

    /// Fails every waiter and ends every subscription.
    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut acks) = self.acks.lock() {
            acks.clear();
        }
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
    }
}

/// Client end of a served bus.
pub struct RemoteBus {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<ClientShared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteBus {
    /// Dials a bus served with [`serve_listener`].
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Speaks the bus protocol over an established stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared::default());

        let writer = tokio::spawn(write_frames(writer, rx));
        let reader = tokio::spawn(read_frames(reader, tx.clone(), Arc::clone(&shared)));

        Self {
            tx,
            shared,
            next_id: AtomicU64::new(0),
            reader,
            writer,
        }
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: Frame) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.tx.send(frame).map_err(|_| BusError::Disconnected)
    }

    fn await_ack(&self, id: u64, subject: &str) -> Result<oneshot::Receiver<Result<Vec<u8>, BusError>>, BusError> {
        let (waiter, rx) = oneshot::channel();
        self.shared
            .acks
            .lock()
            .map_err(|_| BusError::Disconnected)?
            .insert(id, (subject.to_string(), waiter));
        Ok(rx)
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_frames<R>(reader: R, tx: mpsc::UnboundedSender<Frame>, shared: Arc<ClientShared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Bus connection read failed");
                break;
            }
        };
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bus frame");
                continue;
            }
        };

        match frame {
            Frame::Msg {
                sid,
                subject,
                payload,
                reply,
            } => {
                let sender = shared
                    .subscriptions
                    .lock()
                    .ok()
                    .and_then(|subscriptions| subscriptions.get(&sid).cloned());
                let Some(sender) = sender else {
                    continue;
                };

                let message = match reply {
                    Some(reply) => {
                        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Some(payload) = reply_rx.recv().await {
                                tx.send(Frame::Respond { reply, payload }).ok();
                            }
                        });
                        InboundMessage::with_reply(subject, payload, reply_tx)
                    }
                    None => InboundMessage::new(subject, payload),
                };

                if sender.send(message).is_err() {
                    shared.drop_subscription(sid);
                    tx.send(Frame::Unsub { sid }).ok();
                }
            }
            Frame::Ack {
                id,
                payload,
                error,
                code,
            } => {
                let Some((subject, waiter)) = shared.take_ack(id) else {
                    continue;
                };
                let result = match (error, code.as_deref()) {
                    (None, _) => Ok(payload),
                    (Some(_), Some(CODE_NO_RESPONDERS)) => Err(BusError::NoResponders(subject)),
                    (Some(_), Some(CODE_TIMEOUT)) => Err(BusError::Timeout(subject)),
                    (Some(error), _) => Err(BusError::Remote(error)),
                };
                waiter.send(result).ok();
            }
            _ => warn!("Ignoring client-bound frame sent by server"),
        }
    }
    shared.disconnect();
}

#[async_trait]
impl MessageBus for RemoteBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_subject(subject)?;
        self.send(Frame::Pub {
            subject: subject.to_string(),
            payload,
        })
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        validate_subject(subject)?;

        let id = self.next_id();
        let ack = self.await_ack(id, subject)?;
        let sent = self.send(Frame::Req {
            id,
            subject: subject.to_string(),
            payload,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
        if let Err(e) = sent {
            self.shared.take_ack(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout + REQUEST_MARGIN, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                self.shared.take_ack(id);
                Err(BusError::Timeout(subject.to_string()))
            }
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern)?;

        let sid = self.next_id();
        let (sender, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .map_err(|_| BusError::Disconnected)?
            .insert(sid, sender);

        let ack = self.await_ack(sid, pattern)?;
        let confirmed = match self.send(Frame::Sub {
            id: sid,
            sid,
            pattern: pattern.to_string(),
        }) {
            Ok(()) => match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack).await {
                Ok(Ok(result)) => result.map(|_| ()),
                Ok(Err(_)) => Err(BusError::Disconnected),
                Err(_) => Err(BusError::Timeout(pattern.to_string())),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = confirmed {
            self.shared.take_ack(sid);
            self.shared.drop_subscription(sid);
            return Err(e);
        }
        Ok(Subscription::new(pattern.to_string(), rx))
    }
}
