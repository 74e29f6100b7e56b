//! Client capability interface
//!
//! Application code talks to whichever backend the supervisor selected
//! through these traits. Both variants deliver inbound messages to
//! `Callback`s and report the loss of their backend through a
//! `DisconnectNotifier`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::broker::message::Callback;
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Wire broker started and owned by this process.
    WireBroker,
    /// Broker already listening at the configured address.
    RemoteBroker,
    /// In-process loopback broker.
    Embedded,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::WireBroker => "wire broker",
            BackendKind::RemoteBroker => "remote broker",
            BackendKind::Embedded => "embedded broker",
        };
        f.write_str(name)
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;
}

pub trait Subscriber: Send + Sync {
    fn subscribe(&self, filter: &str, callback: Callback) -> Result<()>;
}

/// A connected backend as seen by the supervisor.
pub trait Backend: Publisher + Subscriber {
    fn kind(&self) -> BackendKind;

    fn is_connected(&self) -> bool;

    /// Detaches from the broker. Further publishes fail with `Stopped`.
    fn disconnect(&self);

    fn as_publisher(&self) -> &dyn Publisher;
}

/// Invoked once when a backend drops after it was connected.
pub type DisconnectNotifier = Arc<dyn Fn(BackendKind) + Send + Sync>;
