//! TCP wire-protocol broker
//!
//! Responsibilities:
//! - Accept TCP connections and give each one a `Session` with its own
//!   reader task and writer task
//! - Decode frames and apply CONNECT / PUBLISH / SUBSCRIBE / PINGREQ /
//!   DISCONNECT against a `TopicRouter` and `RetainedStore` owned by this
//!   listener
//! - Tear a session down on EOF, read failure, decode failure, DISCONNECT or
//!   shutdown, removing every subscription it owned
//!
//! Every PUBLISH is retained. The frame forwarded to subscribers is the
//! publisher's original frame, byte for byte, so subscribers must accept the
//! publisher's framing (flags included).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::retained::RetainedStore;
use crate::broker::topic::TopicRouter;
use crate::transport::codec::{self, CONNACK_ACCEPTED, Frame, PINGRESP_FRAME, Packet};
use crate::transport::session::{Session, SessionId, SessionState};
use crate::utils::error::{BrokerError, DecodeError, Result};

struct WireState {
    router: TopicRouter<SessionId>,
    retained: RetainedStore,
    sessions: HashMap<SessionId, Session>,
    /// Publishes `sessions.len()` on every insert and removal.
    session_count: watch::Sender<usize>,
}

impl WireState {
    fn new() -> Self {
        let (session_count, _) = watch::channel(0);
        Self {
            router: TopicRouter::new(),
            retained: RetainedStore::new(),
            sessions: HashMap::new(),
            session_count,
        }
    }

    fn sessions_changed(&self) {
        self.session_count.send_replace(self.sessions.len());
    }
}

enum Flow {
    Continue,
    Close,
}

pub struct WireProtocolBroker {
    state: Arc<Mutex<WireState>>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for WireProtocolBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireProtocolBroker")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl WireProtocolBroker {
    /// Binds `addr` and starts accepting connections.
    pub async fn start(addr: &str, shutdown_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BrokerError::ConnectFailure(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(WireState::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            state.clone(),
            running.clone(),
            shutdown_rx,
        ));

        info!("Wire broker listening on {local_addr}");
        Ok(Self {
            state,
            local_addr,
            running,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Closes the listener and every session. Stopping twice is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.shutdown_timeout, task).await.is_err() {
                warn!("Accept loop did not exit within {:?}; aborting", self.shutdown_timeout);
                abort.abort();
            }
        }

        let mut state = lock(&self.state);
        let ids: Vec<SessionId> = state.sessions.keys().cloned().collect();
        for id in &ids {
            state.router.remove_all_for(id);
        }
        state.sessions.clear();
        state.sessions_changed();
        info!("Wire broker on {} stopped ({} session(s) closed)", self.local_addr, ids.len());
    }

    /// Injects a message as if a client had published it: retained, then
    /// sent to every matching session.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        if !self.is_running() {
            return Err(BrokerError::Stopped);
        }
        let payload = payload.into();
        codec::check_frame_size(topic, &payload)?;
        let frame = codec::encode_publish(topic, &payload, false);

        let mut state = lock(&self.state);
        state.retained.put(topic, payload);
        let targets = state.router.publish(topic);
        for id in &targets {
            if let Some(session) = state.sessions.get(id) {
                session.send(frame.clone());
            }
        }
        debug!("Server published to {topic} ({} subscriber(s))", targets.len());
        Ok(())
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        lock(&self.state).retained.get(topic)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Sessions that have completed CONNECT.
    pub fn active_session_count(&self) -> usize {
        lock(&self.state)
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }

    /// Follows the number of open sessions.
    pub fn watch_sessions(&self) -> watch::Receiver<usize> {
        lock(&self.state).session_count.subscribe()
    }

    /// Number of sessions registered under exactly `filter`.
    pub fn subscriber_count(&self, filter: &str) -> usize {
        lock(&self.state)
            .router
            .subscribers_of(filter)
            .map_or(0, |subs| subs.len())
    }
}

impl Drop for WireProtocolBroker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<WireState>>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(run_session(stream, addr, state.clone(), shutdown.clone()));
                }
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        error!("Error accepting connection: {e}");
                    }
                }
            },
        }
    }
    debug!("Accept loop exited");
}

async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<WireState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let session = Session::new(addr, tx);
    let session_id = session.id.clone();
    {
        let mut state = lock(&state);
        state.sessions.insert(session_id.clone(), session);
        state.sessions_changed();
    }
    info!("New client {session_id} connected from {addr}");

    let writer_id = session_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("Failed to send to {writer_id}: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = BytesMut::new();
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = codec::read_frame(&mut reader, &mut buf) => next,
        };
        match next {
            Ok(Some(frame)) => match handle_frame(&state, &session_id, frame) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    warn!("Dropping {session_id}: {}", BrokerError::from(e));
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping {session_id}: {e}");
                break;
            }
        }
    }

    cleanup_session(&state, &session_id);
}

fn handle_frame(
    state: &Mutex<WireState>,
    session_id: &SessionId,
    frame: Frame,
) -> std::result::Result<Flow, DecodeError> {
    let packet = codec::decode_packet(&frame)?;
    let mut state = lock(state);
    let state = &mut *state;

    match packet {
        Packet::Connect => {
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.state = SessionState::Active;
                session.send(Bytes::from_static(&CONNACK_ACCEPTED));
                info!("Client {session_id} ({}) connected", session.addr);
            }
        }
        Packet::Publish { topic, payload, .. } => {
            debug!("{session_id} published {} byte(s) to {topic}", payload.len());
            state.retained.put(&topic, payload);
            for id in state.router.publish(&topic) {
                if &id == session_id {
                    continue;
                }
                if let Some(subscriber) = state.sessions.get(&id) {
                    subscriber.send(frame.raw.clone());
                }
            }
        }
        Packet::Subscribe { packet_id, filter } => {
            state.router.subscribe(&filter, session_id.clone());
            if let Some(session) = state.sessions.get(session_id) {
                session.send(codec::encode_suback(packet_id));
                if let Some(payload) = state.retained.get(&filter) {
                    session.send(codec::encode_publish(&filter, &payload, false));
                }
            }
            info!("{session_id} subscribed to {filter}");
        }
        Packet::PingReq => {
            if let Some(session) = state.sessions.get(session_id) {
                session.send(Bytes::from_static(&PINGRESP_FRAME));
            }
        }
        Packet::Disconnect => return Ok(Flow::Close),
        other => debug!("Ignoring {other:?} from {session_id}"),
    }
    Ok(Flow::Continue)
}

/// Removes the session and everything it subscribed to. Dropping the session
/// closes its writer channel, which closes the socket.
fn cleanup_session(state: &Mutex<WireState>, session_id: &SessionId) {
    let mut state = lock(state);
    let filters = state.router.remove_all_for(session_id);
    if let Some(session) = state.sessions.remove(session_id) {
        state.sessions_changed();
        info!(
            "Client {session_id} ({}) disconnected, released {} subscription(s)",
            session.addr,
            filters.len()
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
