//! The `client` module defines how the application reaches a broker.
//!
//! It provides the `Publisher` / `Subscriber` capability traits and their two
//! implementations: `InProcessClient`, attached directly to an
//! `InProcessBroker`, and `WireClient`, which speaks the binary frame protocol
//! over TCP to a `WireProtocolBroker` or any compatible external broker.

pub mod inprocess;
pub mod pubsub_client;
pub mod wire;

pub use inprocess::InProcessClient;
pub use pubsub_client::{Backend, BackendKind, DisconnectNotifier, Publisher, Subscriber};
pub use wire::WireClient;
