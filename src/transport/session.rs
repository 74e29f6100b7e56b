//! Server-side state for one connected wire client.
//!
//! The `sender` feeds the session's writer task; dropping the `Session`
//! closes that channel, which in turn closes the socket's write half.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no CONNECT seen yet.
    Open,
    /// CONNECT acknowledged.
    Active,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub state: SessionState,
    pub sender: UnboundedSender<Bytes>,
}

impl Session {
    pub fn new(addr: SocketAddr, sender: UnboundedSender<Bytes>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            addr,
            state: SessionState::Open,
            sender,
        }
    }

    /// Queues bytes for the writer task. A closed channel means the session
    /// is already being torn down, so the frame is dropped.
    pub fn send(&self, frame: Bytes) {
        if self.sender.send(frame).is_err() {
            debug!("Dropping frame for closing session {}", self.id);
        }
    }
}
