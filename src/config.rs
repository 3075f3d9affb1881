//! Application configuration
//!
//! Loaded from a TOML file; every section and field falls back to its
//! default, so a config file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEVICE_FAMILY, ZERO_DBM};
use crate::device::{Device, Driver};
use crate::error::{DeviceError, Error, Result};
use crate::protocol::MemorySize;
use crate::streaming::{PacerConfig, PacketMetadata};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub transmitter: TransmitterConfig,
    pub receiver: ReceiverConfig,
    pub stream: PacerConfig,
}

/// Device discovery and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub family: String,
    /// Serial to open; empty picks the first device found
    pub serial: String,
    pub memory: MemorySize,
    pub rescan_timeout_ms: u64,
    pub start_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            family: DEVICE_FAMILY.to_string(),
            serial: String::new(),
            memory: MemorySize::Medium,
            rescan_timeout_ms: 3000,
            start_timeout_ms: 5000,
            poll_interval_ms: 100,
        }
    }
}

impl DeviceConfig {
    /// Device type string for a given mode, e.g. `spectranv6/iqreceiver`
    pub fn kind(&self, mode: &str) -> String {
        format!("{}/{}", self.family, mode)
    }

    pub fn rescan_timeout(&self) -> Duration {
        Duration::from_millis(self.rescan_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Transmitter front-end and waveform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    pub center_frequency: f64,
    pub span_frequency: f64,
    /// Transmit gain in dB
    pub gain: f64,
    /// Linear amplitude of the sweep; 0 dBm by default
    pub amplitude: f64,
    /// Packets per segment
    pub packets: usize,
    pub segments: usize,
    pub metadata: PacketMetadata,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            center_frequency: 2440.0e6,
            span_frequency: 50.0e6,
            gain: 0.0,
            amplitude: ZERO_DBM,
            packets: 100,
            segments: 1,
            metadata: PacketMetadata::default(),
        }
    }
}

impl TransmitterConfig {
    /// Write the front-end parameters into the device tree
    pub fn apply<D: Driver>(&self, device: &Device<D>) -> std::result::Result<(), DeviceError> {
        device.config_set_float("main/centerfreq", self.center_frequency)?;
        device.config_set_float("main/spanfreq", self.span_frequency)?;
        device.config_set_float("main/transgain", self.gain)?;
        Ok(())
    }
}

/// Receiver front-end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub center_frequency: f64,
    pub span_frequency: f64,
    pub reference_level: f64,
    pub output_format: String,
    /// Receive queue poll interval
    pub poll_interval_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            center_frequency: 2440.0e6,
            span_frequency: 1.0e6,
            reference_level: -20.0,
            output_format: "iq".to_string(),
            poll_interval_ms: 10,
        }
    }
}

impl ReceiverConfig {
    pub fn apply<D: Driver>(&self, device: &Device<D>) -> std::result::Result<(), DeviceError> {
        device.config_set_float("main/centerfreq", self.center_frequency)?;
        device.config_set_float("main/spanfreq", self.span_frequency)?;
        device.config_set_float("main/reflevel", self.reference_level)?;
        device.config_set_string("device/outputformat", &self.output_format)?;
        Ok(())
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.stream.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Per-user config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "rtsa", "rtsa-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load `path`, or the per-user file, or fall back to defaults
    ///
    /// An explicitly given path must exist; a missing per-user file is not
    /// an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let text = r#"
            [transmitter]
            center_frequency = 915.0e6
            packets = 10

            [stream]
            lookahead = 0.5
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.transmitter.center_frequency, 915.0e6);
        assert_eq!(config.transmitter.packets, 10);
        assert_eq!(config.transmitter.span_frequency, 50.0e6);
        assert_eq!(config.stream.lookahead, 0.5);
        assert_eq!(config.stream.max_queue_fill, 0.045);
        assert_eq!(config.device.family, "spectranv6");
        assert_eq!(config.device.memory, MemorySize::Medium);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("rtsa-streamer-config-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.device.serial = "SIM000042".to_string();
        config.device.memory = MemorySize::Large;
        config.stream.sample_rate = 2.0e6;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.device.serial, "SIM000042");
        assert_eq!(loaded.device.memory, MemorySize::Large);
        assert_eq!(loaded.stream.sample_rate, 2.0e6);
        assert_eq!(loaded.device.kind("iqtransmitter"), "spectranv6/iqtransmitter");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_stream_rejected() {
        let dir = std::env::temp_dir().join(format!("rtsa-streamer-invalid-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[stream]\nsample_rate = -1.0\n").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(Error::Stream(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let path = Path::new("/nonexistent/rtsa-streamer/config.toml");
        assert!(matches!(AppConfig::load_or_default(Some(path)), Err(Error::Io(_))));
    }
}
