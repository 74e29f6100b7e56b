//! Broker engine
//!
//! This module contains the in-process broker used when publishers and
//! subscribers live in the same process. It is responsible for:
//! - managing filters and subscriber callbacks through a `TopicRouter`
//! - keeping retained payloads in a `RetainedStore` and replaying them on subscribe
//! - delivering queued messages from a single dispatch task
//!
//! Concurrency and usage notes:
//! - `publish` never blocks; it pushes onto an unbounded queue drained by the
//!   dispatch task in FIFO order.
//! - The broker lock is held while storing a retained payload and collecting
//!   the matching callbacks, never while a dispatched callback runs.
//! - `subscribe` replays retained entries while holding the lock, so a
//!   subscriber always observes retained state before any later message.
//!   Callbacks must therefore not call `subscribe` on the same broker from
//!   inside a retained replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::{Callback, Message, invoke};
use crate::broker::retained::RetainedStore;
use crate::broker::topic::{SubscriberId, TopicRouter};
use crate::utils::error::{BrokerError, Result};

#[derive(Default)]
struct BrokerState {
    router: TopicRouter<SubscriberId>,
    retained: RetainedStore,
    callbacks: HashMap<SubscriberId, Callback>,
}

struct Dispatcher {
    queue: mpsc::UnboundedSender<Message>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct InProcessBroker {
    state: Arc<Mutex<BrokerState>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for InProcessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroker")
            .field("running", &self.is_running())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl InProcessBroker {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            dispatcher: Mutex::new(None),
            shutdown_timeout,
        }
    }

    /// Spawns the dispatch task. Starting a running broker is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_some() {
            return;
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch_loop(self.state.clone(), rx, stop_rx));
        *dispatcher = Some(Dispatcher { queue, stop, task });
        info!("In-process broker started");
    }

    /// Stops the dispatch task, delivering whatever was already queued.
    /// Stopping a stopped broker is a no-op.
    pub async fn stop(&self) {
        let Some(dispatcher) = lock(&self.dispatcher).take() else {
            return;
        };

        let _ = dispatcher.stop.send(());
        drop(dispatcher.queue);

        let abort = dispatcher.task.abort_handle();
        if tokio::time::timeout(self.shutdown_timeout, dispatcher.task)
            .await
            .is_err()
        {
            warn!(
                "In-process dispatch did not finish within {:?}; aborting",
                self.shutdown_timeout
            );
            abort.abort();
        }
        info!("In-process broker stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.dispatcher).is_some()
    }

    /// Enqueues a message for dispatch and returns immediately.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) -> Result<()> {
        let dispatcher = lock(&self.dispatcher);
        let dispatcher = dispatcher.as_ref().ok_or(BrokerError::Stopped)?;
        dispatcher
            .queue
            .send(Message::new(topic, payload, retain))
            .map_err(|_| BrokerError::Stopped)
    }

    /// Registers `callback` under `filter`, replaying every matching retained
    /// entry to it before returning.
    pub fn subscribe(&self, filter: &str, callback: Callback) -> SubscriberId {
        let id: SubscriberId = Uuid::new_v4().to_string();
        let mut state = lock(&self.state);

        for (topic, payload) in state.retained.matching_entries(filter) {
            let replay = Message::new(topic, payload, true);
            invoke(&id, &callback, &replay);
        }

        state.router.subscribe(filter, id.clone());
        state.callbacks.insert(id.clone(), callback);
        debug!("{id} subscribed to {filter}");
        id
    }

    pub fn unsubscribe(&self, filter: &str, id: &SubscriberId) {
        let mut state = lock(&self.state);
        state.router.unsubscribe(filter, id);
        if !state.router.holds(id) {
            state.callbacks.remove(id);
        }
    }

    /// Drops every subscription owned by `id`.
    pub fn remove_subscriber(&self, id: &SubscriberId) {
        let mut state = lock(&self.state);
        let filters = state.router.remove_all_for(id);
        state.callbacks.remove(id);
        debug!("Removed subscriber {id} from {} filter(s)", filters.len());
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        lock(&self.state).retained.get(topic)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).callbacks.len()
    }
}

async fn dispatch_loop(
    state: Arc<Mutex<BrokerState>>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                while let Ok(msg) = rx.try_recv() {
                    deliver(&state, msg);
                }
                break;
            }
            msg = rx.recv() => match msg {
                Some(msg) => deliver(&state, msg),
                None => break,
            },
        }
    }
    debug!("In-process dispatch loop exited");
}

fn deliver(state: &Mutex<BrokerState>, msg: Message) {
    let targets: Vec<(SubscriberId, Callback)> = {
        let mut state = lock(state);
        if msg.retain {
            state.retained.put(&msg.topic, msg.payload.clone());
        }
        state
            .router
            .publish(&msg.topic)
            .into_iter()
            .filter_map(|id| state.callbacks.get(&id).map(|cb| (id, cb.clone())))
            .collect()
    };

    for (id, callback) in &targets {
        invoke(id, callback, &msg);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
