//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ZehnderError};
use crate::fan::ControllerSettings;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub fan: FanConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial bridge configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Fan controller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FanConfig {
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,

    #[serde(default = "default_speed_count")]
    pub speed_count: u8,

    #[serde(default = "default_tx_retries")]
    pub tx_retries: u8,

    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u8,

    /// Fixed source for our device id; a random one is drawn when absent
    #[serde(default)]
    pub identity_byte: Option<u8>,
}

/// Pairing persistence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_pairing_file")]
    pub pairing_file: PathBuf,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Diagnostic log output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Also write daily-rotated log files here
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud_rate() -> u32 { 115200 }

fn default_update_interval_ms() -> u64 { 15000 }
fn default_startup_delay_ms() -> u64 { 15000 }
fn default_speed_count() -> u8 { 4 }
fn default_tx_retries() -> u8 { 10 }
fn default_discovery_retries() -> u8 { 20 }

fn default_pairing_file() -> PathBuf { PathBuf::from("./zehnder-pairing.json") }

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            speed_count: default_speed_count(),
            tx_retries: default_tx_retries(),
            discovery_retries: default_discovery_retries(),
            identity_byte: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pairing_file: default_pairing_file(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl FanConfig {
    /// Timing and retry settings for the fan controller
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            update_interval: Duration::from_millis(self.update_interval_ms),
            speed_count: self.speed_count,
            tx_retries: self.tx_retries,
            discovery_retries: self.discovery_retries,
            ..ControllerSettings::default()
        }
    }
}

fn invalid(message: &str) -> ZehnderError {
    ZehnderError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use zehnder_rf::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if ![9600, 57600, 115200, 230400, 460800, 921600].contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        if !(1000..=3_600_000).contains(&self.fan.update_interval_ms) {
            return Err(invalid("update_interval_ms must be between 1000 and 3600000"));
        }

        if self.fan.startup_delay_ms > 120_000 {
            return Err(invalid("startup_delay_ms must be between 0 and 120000"));
        }

        if !(1..=4).contains(&self.fan.speed_count) {
            return Err(invalid("speed_count must be between 1 and 4"));
        }

        if self.fan.tx_retries > 50 {
            return Err(invalid("tx_retries must be between 0 and 50"));
        }

        if self.fan.discovery_retries > 100 {
            return Err(invalid("discovery_retries must be between 0 and 100"));
        }

        if self.storage.pairing_file.as_os_str().is_empty() {
            return Err(invalid("pairing_file cannot be empty"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if let Some(dir) = &self.logging.dir {
            if dir.as_os_str().is_empty() {
                return Err(invalid("logging dir cannot be empty when set"));
            }
        }

        Ok(())
    }
}
