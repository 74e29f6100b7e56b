use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::broker::engine::InProcessBroker;
use crate::broker::message::Callback;
use crate::broker::topic::SubscriberId;
use crate::client::pubsub_client::{Backend, BackendKind, Publisher, Subscriber};
use crate::utils::error::{BrokerError, Result};

/// Backend attached directly to an `InProcessBroker`. Subscribing replays
/// retained state synchronously, before `subscribe` returns.
#[derive(Debug)]
pub struct InProcessClient {
    broker: Arc<InProcessBroker>,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<SubscriberId>>,
}

impl InProcessClient {
    pub fn new(broker: Arc<InProcessBroker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) && self.broker.is_running() {
            Ok(())
        } else {
            Err(BrokerError::Stopped)
        }
    }
}

impl Publisher for InProcessClient {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        self.broker.publish(topic, payload, retain)
    }
}

impl Subscriber for InProcessClient {
    fn subscribe(&self, filter: &str, callback: Callback) -> Result<()> {
        self.ensure_connected()?;
        let id = self.broker.subscribe(filter, callback);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);
        Ok(())
    }
}

impl Backend for InProcessClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.broker.is_running()
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for id in &ids {
            self.broker.remove_subscriber(id);
        }
        debug!("In-process client detached ({} subscription(s))", ids.len());
    }

    fn as_publisher(&self) -> &dyn Publisher {
        self
    }
}
