//! Backend selection and lifecycle
//!
//! `ConnectionSupervisor::start` walks the fallback chain once: wire broker
//! owned by this process, then a broker already listening at the configured
//! address, then the in-process broker. The first backend that connects is
//! kept until `stop`.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::broker::engine::InProcessBroker;
use crate::broker::message::{Callback, CallbackResult, Message};
use crate::client::inprocess::InProcessClient;
use crate::client::pubsub_client::{Backend, BackendKind, Publisher, Subscriber};
use crate::client::wire::{WireClient, WireClientOptions};
use crate::config::settings::{ServerSettings, SupervisorSettings};
use crate::supervisor::control::{ControlCommand, ControlHandler, STATUS_OFFLINE, STATUS_ONLINE, topics};
use crate::supervisor::state::SupervisorState;
use crate::transport::server::WireProtocolBroker;
use crate::utils::error::{BrokerError, Result, StartError};

pub struct ConnectionSupervisor {
    server: ServerSettings,
    settings: SupervisorSettings,
    handler: Arc<dyn ControlHandler>,
    state: SupervisorState,
    history: Vec<SupervisorState>,
    backend: Option<Arc<dyn Backend>>,
    wire_broker: Option<WireProtocolBroker>,
    embedded_broker: Option<Arc<InProcessBroker>>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state)
            .field("backend", &self.backend_kind())
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(
        server: ServerSettings,
        settings: SupervisorSettings,
        handler: Arc<dyn ControlHandler>,
    ) -> Self {
        Self {
            server,
            settings,
            handler,
            state: SupervisorState::Unstarted,
            history: vec![SupervisorState::Unstarted],
            backend: None,
            wire_broker: None,
            embedded_broker: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state visited so far, oldest first.
    pub fn history(&self) -> &[SupervisorState] {
        &self.history
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn is_connected(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.is_connected())
    }

    /// The wire broker started by this supervisor, if that stage won.
    pub fn wire_broker(&self) -> Option<&WireProtocolBroker> {
        self.wire_broker.as_ref()
    }

    /// The in-process broker started by this supervisor, if that stage won.
    pub fn embedded_broker(&self) -> Option<Arc<InProcessBroker>> {
        self.embedded_broker.clone()
    }

    fn transition(&mut self, next: SupervisorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!("Supervisor {} -> {next}", self.state);
        self.state = next;
        self.history.push(next);
    }

    /// Runs the fallback chain. Calling it again while connected returns the
    /// current backend kind without reconnecting; once that backend has
    /// dropped, the supervisor is stopped and the chain runs again.
    pub async fn start(&mut self) -> std::result::Result<BackendKind, StartError> {
        if self.state == SupervisorState::Connected {
            if let Some(kind) = self.backend_kind().filter(|_| self.is_connected()) {
                return Ok(kind);
            }
            info!("Backend lost; restarting the fallback chain");
            self.stop().await;
        }

        self.transition(SupervisorState::TryingWireBroker);
        let wire = match self.try_wire_broker().await {
            Ok(backend) => return Ok(self.connected(backend)),
            Err(e) => {
                warn!("Wire broker unavailable: {e}");
                e.to_string()
            }
        };

        self.transition(SupervisorState::TryingRemoteBroker);
        let remote = match self.try_remote_broker().await {
            Ok(backend) => return Ok(self.connected(backend)),
            Err(e) => {
                warn!("Remote broker unavailable: {e}");
                e.to_string()
            }
        };

        self.transition(SupervisorState::TryingEmbeddedBroker);
        let embedded = match self.try_embedded_broker() {
            Ok(backend) => return Ok(self.connected(backend)),
            Err(e) => {
                error!("Embedded broker unavailable: {e}");
                e.to_string()
            }
        };

        self.transition(SupervisorState::Stopped);
        Err(StartError::Exhausted {
            wire,
            remote,
            embedded,
        })
    }

    fn client_options(&self) -> WireClientOptions {
        let handler = self.handler.clone();
        WireClientOptions {
            client_id: self.settings.client_id.clone(),
            keep_alive: self.settings.keep_alive(),
            connect_timeout: self.settings.connect_timeout(),
            on_disconnect: Some(Arc::new(move |kind: BackendKind| handler.on_disconnect(kind))),
        }
    }

    async fn try_wire_broker(&mut self) -> Result<Arc<dyn Backend>> {
        let broker =
            WireProtocolBroker::start(&self.server.bind_addr(), self.settings.shutdown_timeout()).await?;
        // Dial the port actually bound; the configured one may be 0.
        let dial = ServerSettings {
            host: self.server.host.clone(),
            port: broker.local_addr().port(),
        }
        .dial_addr();

        match WireClient::connect(&dial, BackendKind::WireBroker, self.client_options()).await {
            Ok(client) => {
                self.wire_broker = Some(broker);
                Ok(Arc::new(client))
            }
            Err(e) => {
                broker.stop().await;
                Err(e)
            }
        }
    }

    async fn try_remote_broker(&self) -> Result<Arc<dyn Backend>> {
        let client = WireClient::connect(
            &self.server.dial_addr(),
            BackendKind::RemoteBroker,
            self.client_options(),
        )
        .await?;
        Ok(Arc::new(client))
    }

    fn try_embedded_broker(&mut self) -> Result<Arc<dyn Backend>> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::ConnectFailure(format!("no async runtime: {e}")))?;
        let broker = Arc::new(InProcessBroker::new(self.settings.shutdown_timeout()));
        broker.start();
        let client = InProcessClient::new(broker.clone());
        self.embedded_broker = Some(broker);
        Ok(Arc::new(client))
    }

    fn connected(&mut self, backend: Arc<dyn Backend>) -> BackendKind {
        let kind = backend.kind();
        let dispatch = control_dispatcher(Arc::downgrade(&backend), self.handler.clone());
        for topic in topics::INBOUND {
            if let Err(e) = backend.subscribe(topic, dispatch.clone()) {
                error!("Failed to subscribe to {topic}: {e}");
            }
        }
        if let Err(e) = backend.publish(topics::STATUS, Bytes::from_static(STATUS_ONLINE.as_bytes()), true) {
            error!("Failed to publish status: {e}");
        }

        self.backend = Some(backend);
        self.transition(SupervisorState::Connected);
        info!("Connected to {kind}");
        kind
    }

    /// Publishes `OFFLINE`, disconnects and stops the broker this supervisor
    /// owns. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        if self.state == SupervisorState::Stopped {
            return;
        }
        if let Some(backend) = self.backend.take() {
            if let Err(e) = backend.publish(topics::STATUS, Bytes::from_static(STATUS_OFFLINE.as_bytes()), true) {
                warn!("Failed to publish status: {e}");
            }
            let sessions = self.wire_broker.as_ref().map(|b| {
                let mut rx = b.watch_sessions();
                let open = *rx.borrow_and_update();
                (rx, open)
            });
            backend.disconnect();

            if let Some((mut sessions, before)) = sessions {
                // Our session closes once the broker has handled the final frames.
                let closed = sessions.wait_for(|&open| open < before);
                if tokio::time::timeout(self.settings.shutdown_timeout(), closed)
                    .await
                    .is_err()
                {
                    debug!("Own session still open after {:?}", self.settings.shutdown_timeout());
                }
            }
        }

        if let Some(broker) = self.wire_broker.take() {
            broker.stop().await;
        }
        if let Some(broker) = self.embedded_broker.take() {
            broker.stop().await;
        }

        self.transition(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }
}

impl Publisher for ConnectionSupervisor {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        match &self.backend {
            Some(backend) => backend.publish(topic, payload, retain),
            None => Err(BrokerError::Stopped),
        }
    }
}

impl Subscriber for ConnectionSupervisor {
    fn subscribe(&self, filter: &str, callback: Callback) -> Result<()> {
        match &self.backend {
            Some(backend) => backend.subscribe(filter, callback),
            None => Err(BrokerError::Stopped),
        }
    }
}

/// The callback holds the backend weakly: the backend owns its callbacks.
fn control_dispatcher(backend: Weak<dyn Backend>, handler: Arc<dyn ControlHandler>) -> Callback {
    Arc::new(move |msg: &Message| -> CallbackResult {
        let command = match ControlCommand::parse(msg) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(failure) => {
                warn!("{failure}");
                return Ok(());
            }
        };
        let Some(backend) = backend.upgrade() else {
            debug!("Dropping {command:?}: backend released");
            return Ok(());
        };
        debug!("Dispatching {command:?}");
        handler.on_command(command, backend.as_publisher());
        Ok(())
    })
}
