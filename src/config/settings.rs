use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the wire broker listener, the connection
/// supervisor, the simulated spectrometer and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub supervisor: SupervisorSettings,
    pub spectrometer: SpectrometerSettings,
    pub log: LogSettings,
}

/// Address the wire broker binds and the clients dial.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Address a client should dial. The unspecified address is replaced by
    /// loopback.
    pub fn dial_addr(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" | "[::]" => "::1",
            other => other,
        };
        join_host_port(host, self.port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Fallback chain and client session parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub client_id: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub shutdown_timeout_ms: u64,
}

impl SupervisorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Initial sensor configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SpectrometerSettings {
    pub metal_grade: String,
    pub incorrect_elements_count: u32,
    /// JSON file of composition profiles; built-in profiles when absent.
    pub profiles_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub supervisor: Option<PartialSupervisorSettings>,
    pub spectrometer: Option<PartialSpectrometerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSupervisorSettings {
    pub client_id: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub keep_alive_secs: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSpectrometerSettings {
    pub metal_grade: Option<String>,
    pub incorrect_elements_count: Option<u32>,
    pub profiles_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 1883,
            },
            supervisor: SupervisorSettings {
                client_id: "spectrometer_server".to_string(),
                connect_timeout_ms: 2000,
                keep_alive_secs: 60,
                shutdown_timeout_ms: 2000,
            },
            spectrometer: SpectrometerSettings {
                metal_grade: "SG-Iron".to_string(),
                incorrect_elements_count: 2,
                profiles_path: None,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
