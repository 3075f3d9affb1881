//! I/Q Transmitter Application
//!
//! Opens a transmitter, configures its front end and streams an
//! alternating chirp sweep paced against the device clock.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtsa_streamer::{
    clock::SimClock,
    config::AppConfig,
    device::{Backend, Device, Driver, SimulatedBackend},
    error::StreamError,
    protocol::DeviceState,
    streaming::{Pacer, StreamStats, SweepSource},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream an I/Q sweep to a transmitter", long_about = None)]
struct Args {
    /// Config file (defaults to the per-user config, then built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Packets per segment
    #[arg(short, long)]
    packets: Option<usize>,

    /// Number of segments to send
    #[arg(long)]
    segments: Option<usize>,

    /// Device serial number; empty opens the first device
    #[arg(short, long)]
    serial: Option<String>,

    /// Print the device config tree and exit
    #[arg(long)]
    dump_tree: bool,
}

/// Print every config item below the root and the health tree as JSON
fn dump_tree<D: Driver>(device: &Device<D>) -> Result<()> {
    let mut items = Vec::new();
    for (label, root) in [("config", device.config_root()?), ("health", device.config_health()?)] {
        for (path, info) in root.walk()? {
            let value = match root.find(&path) {
                Some(node) => node.display_value()?,
                None => None,
            };
            items.push(serde_json::json!({
                "tree": label,
                "path": path,
                "info": info,
                "value": value,
            }));
        }
    }
    println!("{}", serde_json::to_string_pretty(&items)?);
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
    tracing::info!("Starting RTSA I/Q Transmitter");

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(packets) = args.packets {
        config.transmitter.packets = packets;
    }
    if let Some(segments) = args.segments {
        config.transmitter.segments = segments;
    }
    if let Some(serial) = args.serial {
        config.device.serial = serial;
    }

    let mut backend = SimulatedBackend::new(SimClock::wall(), config.device.memory).with_device("SIM000001");
    tracing::info!("Driver version {:#010x}", backend.version());
    backend.rescan(config.device.rescan_timeout())?;

    println!("\n=== Available Devices ===");
    let devices = backend.enumerate(&config.device.family);
    for info in &devices {
        let speed = if info.superspeed { "SuperSpeed" } else { "HighSpeed" };
        let ready = if info.ready { "ready" } else { "busy" };
        println!("  {} ({}, {})", info.serial_number, speed, ready);
    }
    println!();

    let mut device = backend
        .open(&config.device.kind("iqtransmitter"), &config.device.serial)
        .context("opening transmitter")?;

    config.transmitter.apply(&device)?;

    if args.dump_tree {
        dump_tree(&device)?;
        device.close();
        return Ok(());
    }

    device.connect()?;
    device.start()?;
    device.wait_for_state(
        DeviceState::Running,
        config.device.start_timeout(),
        config.device.poll_interval(),
    )?;
    tracing::info!("Device {} running", device.serial());

    let mut pacer = Pacer::new(config.stream.clone(), config.transmitter.metadata.clone())?;
    let cancel = pacer.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping stream");
            cancel.cancel();
        }
    });

    let transmitter = config.transmitter.clone();
    let samples = config.stream.packet_samples;
    tracing::info!(
        "Streaming {} x {} packets of {} samples ({:.1} ms each)",
        transmitter.segments,
        transmitter.packets,
        samples,
        config.stream.packet_duration() * 1e3
    );

    let (device, result) = tokio::task::spawn_blocking(move || {
        let mut source = SweepSource::new(samples, transmitter.amplitude);
        let mut result: Result<StreamStats, StreamError> = Ok(StreamStats::default());
        for segment in 0..transmitter.segments {
            if let Err(e) = pacer.run_segment(&device, &mut source, transmitter.packets) {
                tracing::error!("Segment {} failed: {}", segment, e);
                result = Err(e);
                break;
            }
        }
        let result = result.map(|_| pacer.stats().clone());
        (device, result)
    })
    .await?;

    let driver = device.driver();
    tracing::info!(
        "Device accepted {} packets ({} late, {} discontinuities)",
        driver.sent_count(),
        driver.late_packets(),
        driver.discontinuities()
    );
    device.close();

    match result {
        Ok(stats) => {
            tracing::info!(
                "Sent {} packets / {} samples, max lead {:.1} ms, {} warnings",
                stats.packets_sent,
                stats.samples_sent,
                stats.max_lead * 1e3,
                stats.warnings
            );
            Ok(())
        }
        Err(StreamError::Cancelled) => {
            tracing::info!("Stream cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
