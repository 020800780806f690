//! Configuration system using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `BENCH_PSU_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BENCH_PSU_APPLICATION__LOG_LEVEL=debug
//! BENCH_PSU_TRANSPORT__KIND=serial
//! BENCH_PSU_TRANSPORT__RESOURCE=/dev/ttyUSB0
//! BENCH_PSU_SESSION__ADMISSION=queue
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bench_psu::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Channels: {}", settings.session.channel_count);
//! # Ok::<(), bench_psu::config::ConfigError>(())
//! ```

use crate::channel::MAX_CHANNELS;
use crate::transport::TransportSpec;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BENCH_PSU_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session and sequencer timing
    #[serde(default)]
    pub session: SessionConfig,
    /// Which transport `connect` opens
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "bench-psu".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// How a session treats a request that arrives while another one is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Refuse with [`PsuError::Busy`](crate::error::PsuError::Busy).
    #[default]
    Reject,
    /// Run it after the in-flight work, in arrival order.
    Queue,
}

/// Session and sequencer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of output channels on the instrument
    #[serde(default = "default_channel_count")]
    pub channel_count: u8,
    /// Delay before the first step of every operation
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
    /// Settle time after `*RST`
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
    /// Gap between replayed commands during restore
    #[serde(default = "default_replay_interval")]
    pub replay_interval_ms: u64,
    /// Concurrent request policy
    #[serde(default)]
    pub admission: Admission,
    /// Depth of the pending-request queue
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_count: default_channel_count(),
            step_delay_ms: default_step_delay(),
            reset_settle_ms: default_reset_settle(),
            replay_interval_ms: default_replay_interval(),
            admission: Admission::default(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl SessionConfig {
    /// Delay before the first step of every operation.
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    /// Settle time after `*RST`.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Gap between replayed commands.
    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }
}

/// Transport backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process simulator
    #[default]
    Simulated,
    /// Serial port (needs the `instrument_serial` feature)
    Serial,
    /// VISA resource (needs the `instrument_visa` feature)
    Visa,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Backend kind
    #[serde(default)]
    pub kind: TransportKind,
    /// Port path or VISA resource string
    #[serde(default)]
    pub resource: String,
    /// Baud rate (serial only)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-call request/response bound
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            resource: String::new(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout(),
        }
    }
}

impl TransportConfig {
    /// Per-call request/response bound.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds the [`TransportSpec`] that `connect` opens.
    pub fn spec(&self) -> TransportSpec {
        match self.kind {
            TransportKind::Simulated => TransportSpec::Simulated,
            TransportKind::Serial => TransportSpec::Serial {
                port: self.resource.clone(),
                baud_rate: self.baud_rate,
                timeout: self.timeout(),
            },
            TransportKind::Visa => TransportSpec::Visa {
                resource: self.resource.clone(),
                timeout: self.timeout(),
            },
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_channel_count() -> u8 {
    4
}

fn default_step_delay() -> u64 {
    10
}

fn default_reset_settle() -> u64 {
    300
}

fn default_replay_interval() -> u64 {
    30
}

fn default_mailbox_capacity() -> usize {
    16
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> u64 {
    1000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a provider fails to parse or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - The instrument has three or four channels
    /// - The request queue holds at least one entry
    /// - Real transports name a resource and have a non-zero timeout
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(3..=MAX_CHANNELS).contains(&self.session.channel_count) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid channel_count {}. Must be between 3 and {MAX_CHANNELS}",
                self.session.channel_count
            )));
        }

        if self.session.mailbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }

        if self.transport.kind != TransportKind::Simulated {
            if self.transport.resource.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "transport.resource cannot be empty for a {:?} transport",
                    self.transport.kind
                )));
            }
            if self.transport.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "transport.timeout_ms must be greater than zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_when_file_missing() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.session.reset_settle(), Duration::from_millis(300));
        assert_eq!(settings.session.replay_interval(), Duration::from_millis(30));
        assert_eq!(settings.transport.spec(), TransportSpec::Simulated);
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
[application]
name = "lab bench"
log_level = "debug"

[session]
channel_count = 3
admission = "queue"

[transport]
kind = "serial"
resource = "/dev/ttyUSB0"
baud_rate = 115200
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "lab bench");
        assert_eq!(settings.session.channel_count, 3);
        assert_eq!(settings.session.admission, Admission::Queue);
        assert_eq!(settings.session.replay_interval_ms, 30);
        assert_eq!(
            settings.transport.spec(),
            TransportSpec::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 115200,
                timeout: Duration::from_millis(1000),
            }
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[session]\nreset_settle_ms = 500\n");
        std::env::set_var("BENCH_PSU_SESSION__RESET_SETTLE_MS", "50");
        let result = Settings::load_from(file.path());
        std::env::remove_var("BENCH_PSU_SESSION__RESET_SETTLE_MS");
        assert_eq!(result.unwrap().session.reset_settle_ms, 50);
    }

    #[test]
    #[serial]
    fn test_rejects_bad_log_level() {
        let file = write_config("[application]\nname = \"x\"\nlog_level = \"loud\"\n");
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_real_transport_without_resource() {
        let mut settings = Settings::default();
        settings.transport.kind = TransportKind::Visa;
        assert!(settings.validate().is_err());
        settings.transport.resource = "ASRL6::INSTR".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_channel_count_out_of_range() {
        let mut settings = Settings::default();
        settings.session.channel_count = 2;
        assert!(settings.validate().is_err());
        settings.session.channel_count = 5;
        assert!(settings.validate().is_err());
    }
}
