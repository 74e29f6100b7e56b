//! Application-level topic namespace and control dispatch
//!
//! Inbound messages on the config/control topics are parsed into a
//! `ControlCommand` and handed to the application's `ControlHandler`. A
//! payload that cannot be parsed is reported as a `ConfigParseFailure` and the
//! handler is not called, so the application's configuration stays as it was.

use crate::broker::message::Message;
use crate::client::pubsub_client::{BackendKind, Publisher};
use crate::utils::error::ConfigParseFailure;

pub mod topics {
    pub const CONFIG_METAL_GRADE: &str = "spectrometer/config/metal_grade";
    pub const CONFIG_INCORRECT_ELEMENTS: &str = "spectrometer/config/incorrect_elements";
    pub const CONTROL_GENERATE_READING: &str = "spectrometer/control/generate_reading";
    pub const DATA_READING: &str = "spectrometer/data/reading";
    pub const DATA_TEMPERATURE: &str = "spectrometer/data/temperature";
    pub const STATUS: &str = "spectrometer/status";

    /// Topics the supervisor subscribes to on behalf of the application.
    pub const INBOUND: [&str; 3] = [
        CONFIG_METAL_GRADE,
        CONFIG_INCORRECT_ELEMENTS,
        CONTROL_GENERATE_READING,
    ];
}

pub const STATUS_ONLINE: &str = "ONLINE";
pub const STATUS_OFFLINE: &str = "OFFLINE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    SetMetalGrade(String),
    SetIncorrectElements(u32),
    GenerateReading,
}

impl ControlCommand {
    /// `Ok(None)` for topics outside the control namespace.
    pub fn parse(msg: &Message) -> Result<Option<Self>, ConfigParseFailure> {
        let failure = |reason: String| ConfigParseFailure {
            topic: msg.topic.clone(),
            payload: msg.payload_str().into_owned(),
            reason,
        };

        match msg.topic.as_str() {
            topics::CONFIG_METAL_GRADE => {
                let grade = std::str::from_utf8(&msg.payload)
                    .map_err(|e| failure(e.to_string()))?
                    .trim();
                if grade.is_empty() {
                    return Err(failure("empty grade name".to_string()));
                }
                Ok(Some(Self::SetMetalGrade(grade.to_string())))
            }
            topics::CONFIG_INCORRECT_ELEMENTS => msg
                .payload_str()
                .trim()
                .parse::<u32>()
                .map(|count| Some(Self::SetIncorrectElements(count)))
                .map_err(|e| failure(e.to_string())),
            topics::CONTROL_GENERATE_READING => Ok(Some(Self::GenerateReading)),
            _ => Ok(None),
        }
    }
}

/// Application callbacks driven by the supervisor.
pub trait ControlHandler: Send + Sync {
    /// Called from the backend's delivery task; `publisher` is the backend
    /// the command arrived on.
    fn on_command(&self, command: ControlCommand, publisher: &dyn Publisher);

    /// The backend dropped after the supervisor reached `Connected`.
    fn on_disconnect(&self, _kind: BackendKind) {}
}
