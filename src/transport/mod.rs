//! The `transport` module is responsible for handling network communication
//! with clients over raw TCP.
//!
//! It defines the binary framing used between clients and the server, the
//! per-connection session state, and the wire-protocol broker itself, which
//! accepts connections, decodes frames, and applies them to its own topic
//! router and retained store.

pub mod codec;
pub mod server;
pub mod session;

pub use server::WireProtocolBroker;
pub use session::{Session, SessionId, SessionState};

#[cfg(test)]
mod tests;
