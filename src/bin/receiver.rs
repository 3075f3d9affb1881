//! I/Q Receiver Application
//!
//! Opens a receiver, drains its outbound packet queue on a polling thread
//! and reports throughput, level and dropped-data warnings.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtsa_streamer::{
    clock::{CancelToken, SimClock},
    config::AppConfig,
    device::{Backend, Device, Driver, SimulatedBackend},
    error::DeviceError,
    protocol::{DeviceState, PacketFlags},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive and monitor I/Q packets", long_about = None)]
struct Args {
    /// Config file (defaults to the per-user config, then built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device serial number; empty opens the first device
    #[arg(short, long)]
    serial: Option<String>,

    /// Stop after this many seconds (runs until Ctrl+C otherwise)
    #[arg(short, long)]
    duration: Option<f64>,
}

/// What the polling thread reports per packet
struct PacketSummary {
    start_time: f64,
    end_time: f64,
    samples: u64,
    peak: f32,
    flags: PacketFlags,
}

/// Receive statistics for the report loop
#[derive(Debug, Default)]
struct ReceiveStats {
    packets: u64,
    samples: u64,
    dropped: u64,
    gaps: u64,
    peak: f32,
    last_end: Option<f64>,
}

impl ReceiveStats {
    fn record(&mut self, packet: &PacketSummary) {
        if let Some(last_end) = self.last_end {
            if (packet.start_time - last_end).abs() > 1e-9 {
                self.gaps += 1;
            }
        }
        if packet.flags.contains(PacketFlags::WARN_DROPPED) {
            self.dropped += 1;
        }
        self.packets += 1;
        self.samples += packet.samples;
        self.peak = self.peak.max(packet.peak);
        self.last_end = Some(packet.end_time);
    }
}

fn device_time(seconds: f64) -> String {
    let secs = seconds.floor();
    let nanos = ((seconds - secs) * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs as i64, nanos)
        .map(|t| t.format("%H:%M:%S%.6f").to_string())
        .unwrap_or_else(|| format!("{:.6}", seconds))
}

/// Drain the receive queue until cancelled
fn poll_packets<D: Driver>(
    device: &mut Device<D>,
    tx: &crossbeam_channel::Sender<PacketSummary>,
    cancel: &CancelToken,
    interval: Duration,
) -> Result<(), DeviceError> {
    while !cancel.is_cancelled() {
        if device.available_packets(0)? == 0 {
            cancel.wait_timeout(interval);
            continue;
        }
        let summary = match device.get_packet(0, 0)? {
            Some(packet) => PacketSummary {
                start_time: packet.start_time,
                end_time: packet.end_time,
                samples: packet.num,
                peak: packet.peak_magnitude(),
                flags: packet.flags,
            },
            None => continue,
        };
        device.consume_packets(0, 1)?;
        if tx.send(summary).is_err() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("Starting RTSA I/Q Receiver");

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(serial) = args.serial {
        config.device.serial = serial;
    }

    let mut backend = SimulatedBackend::new(SimClock::wall(), config.device.memory).with_device("SIM000001");
    backend.rescan(config.device.rescan_timeout())?;

    let mut device = backend
        .open(&config.device.kind("iqreceiver"), &config.device.serial)
        .context("opening receiver")?;
    config.receiver.apply(&device)?;

    device.connect()?;
    device.start()?;
    device.wait_for_state(
        DeviceState::Running,
        config.device.start_timeout(),
        config.device.poll_interval(),
    )?;
    tracing::info!(
        "Receiving at {:.3} MHz, {:.3} MHz span",
        config.receiver.center_frequency / 1e6,
        config.receiver.span_frequency / 1e6
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping receiver");
                cancel.cancel();
            }
        });
    }
    if let Some(seconds) = args.duration {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            cancel.cancel();
        });
    }

    // Polling thread -> report loop
    let (tx, rx) = bounded::<PacketSummary>(1024);
    let interval = Duration::from_millis(config.receiver.poll_interval_ms);
    let poll_cancel = cancel.clone();
    let poller = tokio::task::spawn_blocking(move || {
        let result = poll_packets(&mut device, &tx, &poll_cancel, interval);
        poll_cancel.cancel();
        device.close();
        result
    });

    let report_cancel = cancel.clone();
    let reporter = tokio::task::spawn_blocking(move || {
        let mut stats = ReceiveStats::default();
        let mut last_report = Instant::now();
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(packet) => stats.record(&packet),
                Err(RecvTimeoutError::Timeout) if !report_cancel.is_cancelled() => {}
                Err(_) => break,
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                tracing::info!(
                    "[{}] {} packets, {} samples, peak {:.4}, {} dropped, {} gaps",
                    stats.last_end.map(device_time).unwrap_or_default(),
                    stats.packets,
                    stats.samples,
                    stats.peak,
                    stats.dropped,
                    stats.gaps
                );
            }
        }
        stats
    });

    poller.await??;
    let stats = reporter.await?;
    tracing::info!(
        "Received {} packets / {} samples ({} dropped warnings, {} gaps)",
        stats.packets,
        stats.samples,
        stats.dropped,
        stats.gaps
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(start_time: f64, end_time: f64, flags: PacketFlags) -> PacketSummary {
        PacketSummary {
            start_time,
            end_time,
            samples: 100,
            peak: 0.2,
            flags,
        }
    }

    #[test]
    fn test_stats_track_gaps_and_drops() {
        let mut stats = ReceiveStats::default();
        stats.record(&summary(0.0, 0.1, PacketFlags::STREAM_START));
        stats.record(&summary(0.1, 0.2, PacketFlags::empty()));
        stats.record(&summary(0.3, 0.4, PacketFlags::WARN_DROPPED));
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.samples, 300);
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_device_time_format() {
        assert_eq!(device_time(3661.5), "01:01:01.500000");
    }
}
