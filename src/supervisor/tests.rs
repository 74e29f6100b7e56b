use super::{ConnectionSupervisor, ControlCommand, ControlHandler, SupervisorState, topics};
use crate::broker::message::{Callback, CallbackResult, Message};
use crate::client::wire::WireClientOptions;
use crate::client::{Backend, BackendKind, Publisher, Subscriber, WireClient};
use crate::config::settings::{ServerSettings, SupervisorSettings};
use crate::transport::WireProtocolBroker;
use crate::utils::error::BrokerError;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<ControlCommand>>,
    disconnects: Mutex<Vec<BackendKind>>,
}

impl Recorder {
    fn commands(&self) -> Vec<ControlCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl ControlHandler for Recorder {
    fn on_command(&self, command: ControlCommand, publisher: &dyn Publisher) {
        if command == ControlCommand::GenerateReading {
            publisher
                .publish(topics::DATA_READING, Bytes::from_static(b"{\"C\": 3.6}"), true)
                .unwrap();
        }
        self.commands.lock().unwrap().push(command);
    }

    fn on_disconnect(&self, kind: BackendKind) {
        self.disconnects.lock().unwrap().push(kind);
    }
}

fn server(port: u16) -> ServerSettings {
    ServerSettings {
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn supervisor_settings() -> SupervisorSettings {
    SupervisorSettings {
        client_id: "test-supervisor".to_string(),
        connect_timeout_ms: 300,
        keep_alive_secs: 30,
        shutdown_timeout_ms: 500,
    }
}

fn supervisor(port: u16) -> (ConnectionSupervisor, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let supervisor = ConnectionSupervisor::new(server(port), supervisor_settings(), recorder.clone());
    (supervisor, recorder)
}

fn channel_callback() -> (Callback, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |msg: &Message| -> CallbackResult {
        tx.send(msg.clone())?;
        Ok(())
    });
    (callback, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn observer(addr: &str) -> WireClient {
    let options = WireClientOptions {
        client_id: "observer".to_string(),
        ..WireClientOptions::default()
    };
    WireClient::connect(addr, BackendKind::RemoteBroker, options)
        .await
        .unwrap()
}

fn message(topic: &str, payload: &'static str) -> Message {
    Message::new(topic, Bytes::from_static(payload.as_bytes()), false)
}

#[test]
fn test_state_transitions() {
    use SupervisorState::*;
    assert!(Unstarted.can_transition_to(TryingWireBroker));
    assert!(TryingWireBroker.can_transition_to(TryingRemoteBroker));
    assert!(TryingRemoteBroker.can_transition_to(Connected));
    assert!(TryingEmbeddedBroker.can_transition_to(Stopped));
    assert!(Connected.can_transition_to(Stopped));
    assert!(Stopped.can_transition_to(TryingWireBroker));

    assert!(!Unstarted.can_transition_to(Connected));
    assert!(!TryingWireBroker.can_transition_to(TryingEmbeddedBroker));
    assert!(!Connected.can_transition_to(TryingWireBroker));
    assert!(!Stopped.can_transition_to(Connected));
}

#[test]
fn test_parse_control_commands() {
    assert_eq!(
        ControlCommand::parse(&message(topics::CONFIG_METAL_GRADE, "Grey-Iron")),
        Ok(Some(ControlCommand::SetMetalGrade("Grey-Iron".to_string())))
    );
    assert_eq!(
        ControlCommand::parse(&message(topics::CONFIG_INCORRECT_ELEMENTS, " 7\n")),
        Ok(Some(ControlCommand::SetIncorrectElements(7)))
    );
    assert_eq!(
        ControlCommand::parse(&message(topics::CONTROL_GENERATE_READING, "")),
        Ok(Some(ControlCommand::GenerateReading))
    );
    assert_eq!(ControlCommand::parse(&message("spectrometer/status", "ONLINE")), Ok(None));
}

#[test]
fn test_parse_failures_carry_payload() {
    let failure = ControlCommand::parse(&message(topics::CONFIG_INCORRECT_ELEMENTS, "abc"))
        .unwrap_err();
    assert_eq!(failure.topic, topics::CONFIG_INCORRECT_ELEMENTS);
    assert_eq!(failure.payload, "abc");

    assert!(ControlCommand::parse(&message(topics::CONFIG_INCORRECT_ELEMENTS, "-1")).is_err());
    assert!(ControlCommand::parse(&message(topics::CONFIG_METAL_GRADE, "  ")).is_err());
}

#[tokio::test]
async fn test_publish_before_start_fails() {
    let (supervisor, _) = supervisor(0);
    assert_eq!(supervisor.state(), SupervisorState::Unstarted);
    assert!(matches!(
        supervisor.publish("a", Bytes::new(), false),
        Err(BrokerError::Stopped)
    ));
}

#[tokio::test]
async fn test_wire_backed_supervisor_end_to_end() {
    let (mut supervisor, recorder) = supervisor(0);
    let kind = supervisor.start().await.unwrap();
    assert_eq!(kind, BackendKind::WireBroker);
    assert_eq!(
        supervisor.history(),
        &[
            SupervisorState::Unstarted,
            SupervisorState::TryingWireBroker,
            SupervisorState::Connected
        ]
    );

    let addr = supervisor.wire_broker().unwrap().local_addr().to_string();
    let broker = supervisor.wire_broker().unwrap();
    wait_until(|| broker.retained(topics::STATUS).as_deref() == Some(&b"ONLINE"[..])).await;
    wait_until(|| broker.subscriber_count(topics::CONTROL_GENERATE_READING) == 1).await;

    let console = observer(&addr).await;
    let (status_cb, mut status_rx) = channel_callback();
    console.subscribe(topics::STATUS, status_cb).unwrap();
    assert_eq!(next(&mut status_rx).await.payload_str(), "ONLINE");

    let (data_cb, mut data_rx) = channel_callback();
    console.subscribe("spectrometer/data/#", data_cb).unwrap();
    wait_until(|| broker.subscriber_count("spectrometer/data/#") == 1).await;

    console
        .publish(topics::CONFIG_INCORRECT_ELEMENTS, Bytes::from_static(b"abc"), false)
        .unwrap();
    console
        .publish(topics::CONFIG_INCORRECT_ELEMENTS, Bytes::from_static(b"5"), false)
        .unwrap();
    console
        .publish(topics::CONTROL_GENERATE_READING, Bytes::new(), false)
        .unwrap();

    let reading = next(&mut data_rx).await;
    assert_eq!(reading.topic, topics::DATA_READING);
    assert_eq!(
        recorder.commands(),
        vec![
            ControlCommand::SetIncorrectElements(5),
            ControlCommand::GenerateReading
        ]
    );

    supervisor.stop().await;
    assert_eq!(next(&mut status_rx).await.payload_str(), "OFFLINE");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(recorder.disconnects.lock().unwrap().is_empty());
    console.disconnect();
}

#[tokio::test]
async fn test_falls_back_to_remote_broker() {
    let external = WireProtocolBroker::start("127.0.0.1:0", Duration::from_secs(1))
        .await
        .unwrap();
    let (mut supervisor, _) = supervisor(external.local_addr().port());

    assert_eq!(supervisor.start().await.unwrap(), BackendKind::RemoteBroker);
    assert!(supervisor.history().contains(&SupervisorState::TryingRemoteBroker));
    assert!(supervisor.wire_broker().is_none());
    wait_until(|| external.retained(topics::STATUS).as_deref() == Some(&b"ONLINE"[..])).await;

    supervisor.stop().await;
    wait_until(|| external.retained(topics::STATUS).as_deref() == Some(&b"OFFLINE"[..])).await;
    assert!(external.is_running(), "a broker the supervisor does not own keeps running");
    external.stop().await;
}

#[tokio::test]
async fn test_occupied_port_falls_back_to_embedded() {
    // Accepts TCP connections but never answers CONNECT.
    let squatter = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut supervisor, recorder) = supervisor(squatter.local_addr().unwrap().port());

    assert_eq!(supervisor.start().await.unwrap(), BackendKind::Embedded);
    assert_eq!(
        supervisor.history(),
        &[
            SupervisorState::Unstarted,
            SupervisorState::TryingWireBroker,
            SupervisorState::TryingRemoteBroker,
            SupervisorState::TryingEmbeddedBroker,
            SupervisorState::Connected
        ]
    );

    let embedded = supervisor.embedded_broker().unwrap();
    wait_until(|| embedded.retained(topics::STATUS).as_deref() == Some(&b"ONLINE"[..])).await;
    let (status_cb, mut status_rx) = channel_callback();
    embedded.subscribe(topics::STATUS, status_cb);
    assert_eq!(next(&mut status_rx).await.payload_str(), "ONLINE");

    let (data_cb, mut data_rx) = channel_callback();
    supervisor.subscribe("spectrometer/data/#", data_cb).unwrap();
    supervisor
        .publish(topics::CONFIG_METAL_GRADE, Bytes::from_static(b"Grey-Iron"), false)
        .unwrap();
    supervisor
        .publish(topics::CONTROL_GENERATE_READING, Bytes::new(), false)
        .unwrap();
    assert_eq!(next(&mut data_rx).await.topic, topics::DATA_READING);
    assert_eq!(
        recorder.commands(),
        vec![
            ControlCommand::SetMetalGrade("Grey-Iron".to_string()),
            ControlCommand::GenerateReading
        ]
    );

    supervisor.stop().await;
    assert_eq!(next(&mut status_rx).await.payload_str(), "OFFLINE");
    assert!(!embedded.is_running());
    drop(squatter);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let (mut supervisor, _) = supervisor(0);
    let first = supervisor.start().await.unwrap();
    let visited = supervisor.history().len();
    assert_eq!(supervisor.start().await.unwrap(), first);
    assert_eq!(supervisor.history().len(), visited);

    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.backend_kind(), None);
    assert!(supervisor.publish("a", Bytes::new(), false).is_err());

    assert_eq!(supervisor.start().await.unwrap(), BackendKind::WireBroker);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_lost_remote_broker_notifies_handler() {
    let external = WireProtocolBroker::start("127.0.0.1:0", Duration::from_secs(1))
        .await
        .unwrap();
    let (mut supervisor, recorder) = supervisor(external.local_addr().port());
    assert_eq!(supervisor.start().await.unwrap(), BackendKind::RemoteBroker);

    external.stop().await;
    wait_until(|| !supervisor.is_connected()).await;
    wait_until(|| recorder.disconnects.lock().unwrap().len() == 1).await;
    assert_eq!(recorder.disconnects.lock().unwrap()[0], BackendKind::RemoteBroker);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

async fn assert_own_publishes_delivered(supervisor: &ConnectionSupervisor) {
    let (callback, mut rx) = channel_callback();
    supervisor.subscribe("spectrometer/data/#", callback).unwrap();
    supervisor
        .publish(topics::DATA_TEMPERATURE, Bytes::from_static(b"21.5"), true)
        .unwrap();

    let msg = next(&mut rx).await;
    assert_eq!(msg.topic, topics::DATA_TEMPERATURE);
    assert_eq!(msg.payload_str(), "21.5");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "delivered exactly once");
}

#[tokio::test]
async fn test_own_publishes_reach_own_subscriptions_on_every_backend() {
    let (mut wire, _) = supervisor(0);
    assert_eq!(wire.start().await.unwrap(), BackendKind::WireBroker);
    assert_own_publishes_delivered(&wire).await;
    wire.stop().await;

    let squatter = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut embedded, _) = supervisor(squatter.local_addr().unwrap().port());
    assert_eq!(embedded.start().await.unwrap(), BackendKind::Embedded);
    assert_own_publishes_delivered(&embedded).await;
    embedded.stop().await;
}

#[tokio::test]
async fn test_start_after_lost_backend_reconnects() {
    let external = WireProtocolBroker::start("127.0.0.1:0", Duration::from_secs(1))
        .await
        .unwrap();
    let (mut supervisor, _) = supervisor(external.local_addr().port());
    assert_eq!(supervisor.start().await.unwrap(), BackendKind::RemoteBroker);

    external.stop().await;
    wait_until(|| !supervisor.is_connected()).await;

    supervisor.start().await.unwrap();
    assert!(supervisor.is_connected());
    assert_eq!(supervisor.state(), SupervisorState::Connected);
    let history = supervisor.history();
    assert!(history.contains(&SupervisorState::Stopped));
    assert_eq!(history.last(), Some(&SupervisorState::Connected));

    supervisor.stop().await;
}
