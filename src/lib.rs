//! # RTSA Streamer
//!
//! Host-side control and streaming layer for real-time spectrum analyzers
//! and I/Q transmitters.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              HOST                                        │
//! │                                                                          │
//! │  ┌──────────────────┐       ┌──────────────────────────────────────┐    │
//! │  │   AppConfig      │       │   Sample Block Source                 │    │
//! │  │   (config)       │       │   (streaming::source)                 │    │
//! │  └────────┬─────────┘       │   forward / reverse sweep blocks      │    │
//! │           │                 └──────────────────┬───────────────────┘    │
//! │           ▼                                    │ block(index)           │
//! │  ┌──────────────────┐                          ▼                        │
//! │  │ Configuration    │       ┌──────────────────────────────────────┐    │
//! │  │ Tree (tree)      │       │   Pacing Engine (streaming::pacer)    │    │
//! │  │ path lookup,     │       │   cursor = now + lookahead            │    │
//! │  │ typed get/set    │       │   wait while now + fill < cursor      │    │
//! │  └────────┬─────────┘       │   flag, send, cursor += duration      │    │
//! │           │                 │   drain until now >= cursor           │    │
//! │           │                 └──────────────────┬───────────────────┘    │
//! │           │                                    │                        │
//! │           ▼                                    ▼                        │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │  Device Session (device::Device)                                  │   │
//! │  │  lifecycle, master clock, packet I/O, config handles              │   │
//! │  │  every driver status classified (status): ok/warning/soft/error   │   │
//! │  └──────────────────────────────┬───────────────────────────────────┘   │
//! │                                 │ Driver trait                          │
//! └─────────────────────────────────┼───────────────────────────────────────┘
//!                                   ▼
//!                ┌─────────────────────────────────────┐
//!                │  Driver (hardware or device::sim)    │
//!                │  master clock, channel queues        │
//!                └─────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod status;
pub mod streaming;
pub mod tree;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Linear amplitude of a 0 dBm complex tone
    pub const ZERO_DBM: f64 = 0.223_606_797_749_978_97;

    /// Device family handled by the simulated backend
    pub const DEVICE_FAMILY: &str = "spectranv6";

    /// Complex samples per transmitted packet
    pub const DEFAULT_PACKET_SAMPLES: usize = 16384;

    /// Default channel sample rate in samples per second
    pub const DEFAULT_SAMPLE_RATE: f64 = 1.0e6;

    /// Device-clock seconds between "now" and the first packet
    pub const DEFAULT_LOOKAHEAD: f64 = 0.2;

    /// Seconds of data kept queued ahead of the device clock
    pub const DEFAULT_MAX_QUEUE_FILL: f64 = 0.045;

    /// Shortest sleep taken while waiting on the device clock
    pub const MIN_SLEEP: Duration = Duration::from_millis(1);
}

#[cfg(test)]
mod tests {
    use super::constants::ZERO_DBM;

    #[test]
    fn test_zero_dbm_reference() {
        assert!((ZERO_DBM - (1.0f64 / 20.0).sqrt()).abs() < 1e-15);
    }
}
