//! The `supervisor` module chooses a broker backend and drives the
//! application's control topics.
//!
//! It contains:
//! - `ConnectionSupervisor`: the wire → remote → embedded fallback chain.
//! - `SupervisorState`: the lifecycle it moves through.
//! - `ControlCommand` / `ControlHandler`: how inbound config and control
//!   messages reach the application.

pub mod connection;
pub mod control;
pub mod state;

pub use connection::ConnectionSupervisor;
pub use control::{ControlCommand, ControlHandler, STATUS_OFFLINE, STATUS_ONLINE, topics};
pub use state::SupervisorState;

#[cfg(test)]
mod tests;
