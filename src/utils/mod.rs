//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `spectrobus` application.
//!
//! This module centralizes the error taxonomy shared by the broker,
//! transport, supervisor and application layers, together with the logging
//! bootstrap used by the binary and the tests.

pub mod error;
pub mod logging;
