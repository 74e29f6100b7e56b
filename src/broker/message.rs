//! Message definitions for the broker
//!
//! `Message` is the internal representation handed to subscriber callbacks
//! by every backend. Delivery is at-most-once.
//!
//! Notes on fields:
//! - `topic`: exact topic used for routing
//! - `payload`: opaque bytes; the application layer uses UTF-8 text and JSON
//! - `retain`: store as the topic's retained entry before routing

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, warn};

use crate::utils::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type CallbackResult = Result<(), CallbackError>;

/// Subscriber callback. Invoked from the dispatching task; must not block.
pub type Callback = Arc<dyn Fn(&Message) -> CallbackResult + Send + Sync>;

/// Runs one callback, logging failures and panics instead of propagating them.
pub(crate) fn invoke(subscriber: &str, callback: &Callback, msg: &Message) {
    match catch_unwind(AssertUnwindSafe(|| callback(msg))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let err = BrokerError::Callback(e.to_string());
            warn!("Subscriber {subscriber} on {}: {err}", msg.topic);
        }
        Err(_) => error!("Subscriber {subscriber} panicked while handling {}", msg.topic),
    }
}
