//! # Spectrobus
//!
//! `spectrobus` serves a simulated spectrometer over a small publish/subscribe
//! broker. The application publishes readings, temperature and status on
//! fixed topics and takes its configuration from control topics; whichever
//! broker backend is reachable carries the traffic.
//!
//! ## Core Modules
//!
//! - `broker`: topic matching, retained messages and the in-process broker.
//! - `transport`: the binary frame codec and the TCP wire broker.
//! - `client`: the `Publisher` / `Subscriber` interface and its in-process
//!   and TCP implementations.
//! - `supervisor`: backend selection (wire → remote → embedded) and control
//!   topic dispatch.
//! - `spectrometer`: composition profiles, the reading generator and the
//!   simulated instrument.
//! - `config`: layered settings from file and environment.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod spectrometer;
pub mod supervisor;
pub mod transport;
pub mod utils;
