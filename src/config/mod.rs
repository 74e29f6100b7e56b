pub mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    LogSettings, ServerSettings, Settings, SpectrometerSettings, SupervisorSettings,
};

/// Prefix for environment overrides, e.g. `SPECTROBUS_SERVER__PORT=1884`.
pub const ENV_PREFIX: &str = "SPECTROBUS";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing every section
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config`, reading the optional file at `path` (extension
/// inferred by the `config` crate).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();
    let server = partial.server;
    let supervisor = partial.supervisor;
    let spectrometer = partial.spectrometer;

    Ok(Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        supervisor: SupervisorSettings {
            client_id: supervisor
                .as_ref()
                .and_then(|s| s.client_id.clone())
                .unwrap_or(default.supervisor.client_id),
            connect_timeout_ms: supervisor
                .as_ref()
                .and_then(|s| s.connect_timeout_ms)
                .unwrap_or(default.supervisor.connect_timeout_ms),
            keep_alive_secs: supervisor
                .as_ref()
                .and_then(|s| s.keep_alive_secs)
                .unwrap_or(default.supervisor.keep_alive_secs),
            shutdown_timeout_ms: supervisor
                .as_ref()
                .and_then(|s| s.shutdown_timeout_ms)
                .unwrap_or(default.supervisor.shutdown_timeout_ms),
        },
        spectrometer: SpectrometerSettings {
            metal_grade: spectrometer
                .as_ref()
                .and_then(|s| s.metal_grade.clone())
                .unwrap_or(default.spectrometer.metal_grade),
            incorrect_elements_count: spectrometer
                .as_ref()
                .and_then(|s| s.incorrect_elements_count)
                .unwrap_or(default.spectrometer.incorrect_elements_count),
            profiles_path: spectrometer
                .as_ref()
                .and_then(|s| s.profiles_path.clone())
                .or(default.spectrometer.profiles_path),
        },
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    })
}
