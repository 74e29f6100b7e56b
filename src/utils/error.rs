//! The `error` module defines the error taxonomy used within `spectrobus`.
//!
//! Per-connection and per-message failures (`DecodeError`, callback failures,
//! `ConfigParseFailure`) are isolated to the connection or message they came
//! from. Only `StartError::Exhausted` is surfaced to the user as a failed start.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Malformed wire frame. The offending session is torn down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("remaining length uses more than four bytes")]
    LengthOverflow,

    #[error("topic is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected packet type {0:#04x}")]
    UnexpectedPacket(u8),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Backend unreachable. Triggers the next fallback stage.
    #[error("backend unreachable: {0}")]
    ConnectFailure(String),

    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),

    #[error("subscriber callback failed: {0}")]
    Callback(String),

    #[error("broker is stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every backend in the fallback chain failed.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(
        "no broker backend available (wire: {wire}; remote: {remote}; embedded: {embedded})"
    )]
    Exhausted {
        wire: String,
        remote: String,
        embedded: String,
    },
}

/// Unknown material grade. Surfaced synchronously, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no composition range found for metal grade: {grade}")]
pub struct NotFound {
    pub grade: String,
}

/// A control payload that could not be parsed. Configuration is left unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid payload {payload:?} on {topic}: {reason}")]
pub struct ConfigParseFailure {
    pub topic: String,
    pub payload: String,
    pub reason: String,
}

/// A composition profile file that could not be loaded.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("cannot read profiles: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid profile JSON: {0}")]
    Json(#[from] serde_json::Error),
}
