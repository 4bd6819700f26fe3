//! # Configuration Management Module
//!
//! Static device settings consumed once at process start. The pipeline treats
//! credentials, endpoints and TLS material as opaque inputs.
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/holter-relay/config.toml
//! - Linux: ~/.config/holter-relay/config.toml
//! - Windows: %APPDATA%\holter-relay\config.toml
//!
//! A path given with `--config` overrides the default location. A missing file
//! is created with defaults so it can be edited by hand.

use crate::error::ConfigError;
use crate::sampling::{ECG_RECORD_SIZE, IMU_RECORD_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    pub tls: TlsConfig,
    pub transfer: TransferConfig,
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Broker client id and the suffix of the response channel
    pub id: String,
    /// Identifier written into the container header
    pub numeric_id: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "esp32-holter-001".to_string(),
            numeric_id: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub ecg_rate_hz: u16,
    pub imu_rate_hz: u16,
    pub duration_secs: u64,
    pub storage_dir: PathBuf,
    pub write_buffer_bytes: usize,
    /// Use the synthetic ECG front-end instead of reporting it absent
    pub simulate_ecg: bool,
    /// Use the synthetic accelerometer instead of reporting it absent
    pub simulate_imu: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ecg_rate_hz: 250,
            imu_rate_hz: 25,
            duration_secs: 10,
            storage_dir: default_storage_dir(),
            write_buffer_bytes: 512,
            simulate_ecg: true,
            simulate_imu: true,
        }
    }
}

impl CaptureConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub link_attempts: u32,
    pub link_poll_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link_attempts: 20,
            link_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub endpoint: String,
    pub port: u16,
    pub request_topic: String,
    pub response_topic_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_attempts: u32,
    pub connect_retry_ms: u64,
    /// How long one attempt waits for the broker's CONNACK
    pub connack_timeout_ms: u64,
    pub confirm_polls: u32,
    pub confirm_poll_ms: u64,
    pub response_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost".to_string(),
            port: 8883,
            request_topic: "holter/upload-request".to_string(),
            response_topic_prefix: "holter/upload-url".to_string(),
            keep_alive_secs: 60,
            connect_attempts: 3,
            connect_retry_ms: 2000,
            connack_timeout_ms: 5000,
            confirm_polls: 20,
            confirm_poll_ms: 50,
            response_timeout_secs: 60,
        }
    }
}

impl BrokerConfig {
    /// Per-device channel the presigned URL is delivered on
    pub fn response_topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.response_topic_prefix.trim_end_matches('/'), device_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            progress_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub success_cooldown_secs: u64,
    pub error_cooldown_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            success_cooldown_secs: 10,
            error_cooldown_secs: 30,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("holter-relay")
        .join("sessions")
}

impl Config {
    /// Get the default path to the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("holter-relay")
            .join("config.toml")
    }

    /// Load config from `path`, or create it with defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents).map_err(ConfigError::ParseFailed)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Self::default();
                config.save_to(path)?;
                config
            }
            Err(e) => return Err(ConfigError::ReadFailed(e)),
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.ecg_rate_hz == 0 || capture.imu_rate_hz == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".into()));
        }
        if capture.duration_secs == 0 {
            return Err(ConfigError::Invalid("capture duration must be non-zero".into()));
        }
        let largest_record = ECG_RECORD_SIZE.max(IMU_RECORD_SIZE);
        if capture.write_buffer_bytes < largest_record {
            return Err(ConfigError::Invalid(format!(
                "write buffer must hold at least one record ({} bytes)",
                largest_record
            )));
        }
        if self.device.id.is_empty() {
            return Err(ConfigError::Invalid("device id must not be empty".into()));
        }
        if self.broker.connect_attempts == 0 || self.network.link_attempts == 0 {
            return Err(ConfigError::Invalid("attempt budgets must be non-zero".into()));
        }
        Ok(())
    }
}
