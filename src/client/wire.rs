//! TCP client for the binary frame protocol
//!
//! A `WireClient` owns one reader task and one writer task:
//! - the writer drains an unbounded outbound channel, sends a PINGREQ every
//!   keep-alive interval, and on shutdown flushes what is queued before
//!   closing the socket
//! - the reader decodes inbound PUBLISH frames and dispatches them to the
//!   local callbacks whose filters match the topic
//!
//! A publish is also dispatched to this client's own matching callbacks, since
//! the broker excludes the sender when forwarding.
//!
//! CONNECT is a standard MQTT 3.1.1 packet so that external brokers accept the
//! session; `WireProtocolBroker` ignores its body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::{Callback, Message, invoke};
use crate::broker::topic::{SubscriberId, TopicRouter};
use crate::client::pubsub_client::{
    Backend, BackendKind, DisconnectNotifier, Publisher, Subscriber,
};
use crate::transport::codec::{self, DISCONNECT_FRAME, PINGREQ_FRAME, Packet};
use crate::utils::error::{BrokerError, Result};

#[derive(Default)]
struct Routes {
    router: TopicRouter<SubscriberId>,
    callbacks: HashMap<SubscriberId, Callback>,
}

pub struct WireClient {
    kind: BackendKind,
    client_id: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
    next_packet_id: AtomicU16,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Connection parameters for a `WireClient`.
#[derive(Clone)]
pub struct WireClientOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub on_disconnect: Option<DisconnectNotifier>,
}

impl Default for WireClientOptions {
    fn default() -> Self {
        Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            on_disconnect: None,
        }
    }
}

impl WireClient {
    /// Connects to `addr` and waits for CONNACK. Anything that does not
    /// complete within `options.connect_timeout` is a `ConnectFailure`.
    pub async fn connect(addr: &str, kind: BackendKind, options: WireClientOptions) -> Result<Self> {
        codec::check_string_len(&options.client_id)?;
        let handshake = handshake(addr, &options.client_id, options.keep_alive);
        let (stream, leftover) = tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| {
                BrokerError::ConnectFailure(format!(
                    "no CONNACK from {addr} within {:?}",
                    options.connect_timeout
                ))
            })??;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let routes = Arc::new(Mutex::new(Routes::default()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            shutdown_rx.clone(),
            options.keep_alive,
        ));
        tokio::spawn(read_loop(
            reader,
            leftover,
            routes.clone(),
            connected.clone(),
            shutdown_rx,
            kind,
            options.on_disconnect,
        ));

        info!("{} connected to {kind} at {addr}", options.client_id);
        Ok(Self {
            kind,
            client_id: options.client_id,
            outbound,
            routes,
            connected,
            next_packet_id: AtomicU16::new(1),
            shutdown,
        })
    }

    /// The id sent in CONNECT.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::Stopped);
        }
        self.outbound.send(frame).map_err(|_| BrokerError::Stopped)
    }
}

impl Publisher for WireClient {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        codec::check_frame_size(topic, &payload)?;
        self.send(codec::encode_publish(topic, &payload, retain))?;
        dispatch(&self.routes, &Message::new(topic, payload, retain));
        Ok(())
    }
}

impl Subscriber for WireClient {
    fn subscribe(&self, filter: &str, callback: Callback) -> Result<()> {
        codec::check_string_len(filter)?;
        let id: SubscriberId = Uuid::new_v4().to_string();
        {
            let mut routes = lock(&self.routes);
            routes.router.subscribe(filter, id.clone());
            routes.callbacks.insert(id, callback);
        }
        self.send(codec::encode_subscribe(self.packet_id(), filter))
    }
}

impl Backend for WireClient {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Bytes::from_static(&DISCONNECT_FRAME));
        let _ = self.shutdown.send(true);
        info!("{} disconnected from {}", self.client_id, self.kind);
    }

    fn as_publisher(&self) -> &dyn Publisher {
        self
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

/// TCP connect, CONNECT, then read until CONNACK. Returns the stream and any
/// bytes that arrived after the CONNACK.
async fn handshake(addr: &str, client_id: &str, keep_alive: Duration) -> Result<(TcpStream, BytesMut)> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| BrokerError::ConnectFailure(format!("cannot reach {addr}: {e}")))?;
    let keep_alive_secs = u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX);
    stream
        .write_all(&codec::encode_connect(client_id, keep_alive_secs))
        .await?;

    let mut buf = BytesMut::new();
    loop {
        let Some(frame) = codec::read_frame(&mut stream, &mut buf).await? else {
            return Err(BrokerError::ConnectFailure(format!(
                "{addr} closed the connection before CONNACK"
            )));
        };
        match codec::decode_packet(&frame)? {
            Packet::ConnAck { return_code: 0 } => return Ok((stream, buf)),
            Packet::ConnAck { return_code } => {
                return Err(BrokerError::ConnectFailure(format!(
                    "{addr} refused the connection (code {return_code})"
                )));
            }
            other => debug!("Ignoring {other:?} before CONNACK"),
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    keep_alive: Duration,
) {
    let mut ping = tokio::time::interval(keep_alive.max(Duration::from_secs(1)));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("Write failed: {e}");
                    break;
                }
            }
            _ = ping.tick(), if !keep_alive.is_zero() => {
                if writer.write_all(&PINGREQ_FRAME).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    kind: BackendKind,
    on_disconnect: Option<DisconnectNotifier>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => return,
            next = codec::read_frame(&mut reader, &mut buf) => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Connection to {kind} failed: {e}");
                break;
            }
        };
        match codec::decode_packet(&frame) {
            Ok(Packet::Publish {
                topic,
                payload,
                retain,
            }) => dispatch(&routes, &Message { topic, payload, retain }),
            Ok(Packet::SubAck { packet_id }) => debug!("Subscription {packet_id} acknowledged"),
            Ok(other) => debug!("Ignoring {other:?} from {kind}"),
            Err(e) => {
                warn!("Malformed frame from {kind}: {e}");
                break;
            }
        }
    }

    if connected.swap(false, Ordering::SeqCst) {
        warn!("Lost connection to {kind}");
        if let Some(notify) = on_disconnect {
            notify(kind);
        }
    }
}

fn dispatch(routes: &Mutex<Routes>, msg: &Message) {
    let targets: Vec<(SubscriberId, Callback)> = {
        let routes = lock(routes);
        routes
            .router
            .publish(&msg.topic)
            .into_iter()
            .filter_map(|id| routes.callbacks.get(&id).map(|cb| (id, cb.clone())))
            .collect()
    };
    for (id, callback) in &targets {
        invoke(id, callback, msg);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
