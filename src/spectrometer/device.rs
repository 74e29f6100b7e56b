use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::pubsub_client::{BackendKind, Publisher};
use crate::config::settings::SpectrometerSettings;
use crate::spectrometer::composition::{CompositionSource, StaticCompositionSource};
use crate::spectrometer::reading::{Reading, ReadingGenerator};
use crate::supervisor::control::{ControlCommand, ControlHandler, topics};
use crate::utils::error::{NotFound, ProfileError};

/// Snapshot of the simulated instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrometerConfig {
    pub metal_grade: String,
    pub incorrect_elements_count: u32,
    pub temperature: f64,
    pub latest_reading: String,
}

/// Simulated spectrometer driven by the supervisor's control topics.
pub struct Spectrometer {
    state: Mutex<SpectrometerConfig>,
    generator: ReadingGenerator,
}

impl Spectrometer {
    pub fn new(settings: &SpectrometerSettings, source: Arc<dyn CompositionSource>) -> Self {
        Self {
            state: Mutex::new(SpectrometerConfig {
                metal_grade: settings.metal_grade.clone(),
                incorrect_elements_count: settings.incorrect_elements_count,
                temperature: 0.0,
                latest_reading: String::new(),
            }),
            generator: ReadingGenerator::new(source),
        }
    }

    /// Uses the profile file named in `settings`, or the built-in profiles.
    pub fn from_settings(settings: &SpectrometerSettings) -> Result<Self, ProfileError> {
        let source = match &settings.profiles_path {
            Some(path) => StaticCompositionSource::from_file(path)?,
            None => StaticCompositionSource::builtin(),
        };
        Ok(Self::new(settings, Arc::new(source)))
    }

    pub fn current_config(&self) -> SpectrometerConfig {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SpectrometerConfig> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generates a reading for the current grade and publishes it with the
    /// temperature, both retained. On an unknown grade nothing is published.
    pub fn generate_reading(&self, publisher: &dyn Publisher) -> Result<Reading, NotFound> {
        let (grade, count) = {
            let state = self.lock();
            (state.metal_grade.clone(), state.incorrect_elements_count)
        };
        let reading = self
            .generator
            .generate(&grade, usize::try_from(count).unwrap_or(usize::MAX))?;

        let body = match serde_json::to_string_pretty(&reading) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize reading: {e}");
                return Ok(reading);
            }
        };
        let temperature = reading.get("temperature").unwrap_or(0.0);
        {
            let mut state = self.lock();
            state.latest_reading = body.clone();
            state.temperature = temperature;
        }

        if let Err(e) = publisher.publish(topics::DATA_READING, Bytes::from(body), true) {
            warn!("Failed to publish reading: {e}");
        }
        if let Err(e) = publisher.publish(
            topics::DATA_TEMPERATURE,
            Bytes::from(format!("{temperature:?}")),
            true,
        ) {
            warn!("Failed to publish temperature: {e}");
        }
        info!("Published {grade} reading at {}", reading.timestamp);
        Ok(reading)
    }
}

impl ControlHandler for Spectrometer {
    fn on_command(&self, command: ControlCommand, publisher: &dyn Publisher) {
        match command {
            ControlCommand::SetMetalGrade(grade) => {
                info!("Metal grade set to {grade}");
                self.lock().metal_grade = grade;
            }
            ControlCommand::SetIncorrectElements(count) => {
                info!("Incorrect elements count set to {count}");
                self.lock().incorrect_elements_count = count;
            }
            ControlCommand::GenerateReading => {
                debug!("Reading requested");
                if let Err(e) = self.generate_reading(publisher) {
                    error!("{e}");
                }
            }
        }
    }

    fn on_disconnect(&self, kind: BackendKind) {
        warn!("Spectrometer lost its {kind}");
    }
}
