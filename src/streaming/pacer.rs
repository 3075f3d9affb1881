//! Streaming pacing engine
//!
//! Pushes a segment of packets into an inbound device channel, scheduled
//! against the device master clock. Packet 0 starts `lookahead` seconds in
//! the device future; every following packet starts exactly where the
//! previous one ended. Before each send the engine blocks until the packet
//! is no more than `max_queue_fill` seconds ahead of the device clock, and
//! after the last send it blocks until the device has played it out.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::source::BlockSource;
use crate::clock::{CancelToken, Sleeper, ThreadSleeper};
use crate::constants::{
    DEFAULT_LOOKAHEAD, DEFAULT_MAX_QUEUE_FILL, DEFAULT_PACKET_SAMPLES, DEFAULT_SAMPLE_RATE, MIN_SLEEP,
};
use crate::device::{Device, Driver};
use crate::error::StreamError;
use crate::protocol::{DeviceState, Packet, PacketFlags};

/// Timing parameters of the pacing engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Device-clock seconds between "now" and the first packet's start
    pub lookahead: f64,
    /// Most data (seconds) kept queued ahead of the device clock
    pub max_queue_fill: f64,
    /// Complex samples per packet
    pub packet_samples: usize,
    /// Samples per second on the channel
    pub sample_rate: f64,
    /// Inbound channel index
    pub channel: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
            max_queue_fill: DEFAULT_MAX_QUEUE_FILL,
            packet_samples: DEFAULT_PACKET_SAMPLES,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel: 0,
        }
    }
}

impl PacerConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.packet_samples == 0 {
            return Err(StreamError::InvalidConfig("packet_samples must be non-zero".into()));
        }
        if !(self.max_queue_fill.is_finite() && self.max_queue_fill >= 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "max_queue_fill must be non-negative, got {}",
                self.max_queue_fill
            )));
        }
        if !(self.lookahead.is_finite() && self.lookahead >= self.max_queue_fill) {
            return Err(StreamError::InvalidConfig(format!(
                "lookahead ({}) must not be shorter than max_queue_fill ({})",
                self.lookahead, self.max_queue_fill
            )));
        }
        Ok(())
    }

    /// Seconds covered by one packet
    pub fn packet_duration(&self) -> f64 {
        self.packet_samples as f64 / self.sample_rate
    }
}

/// Frequency-domain metadata stamped on every packet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketMetadata {
    pub stream_id: u64,
    pub start_frequency: f64,
    pub step_frequency: f64,
    pub span_frequency: f64,
    pub rbw_frequency: f64,
}

impl Default for PacketMetadata {
    fn default() -> Self {
        Self {
            stream_id: 0,
            start_frequency: 2430.0e6,
            step_frequency: 1.0e6,
            span_frequency: 0.0,
            rbw_frequency: 0.0,
        }
    }
}

/// Cumulative engine statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub segments: u64,
    pub packets_sent: u64,
    pub samples_sent: u64,
    pub backpressure_sleeps: u64,
    pub drain_sleeps: u64,
    pub warnings: u64,
    /// Largest `start_time - now` observed at submission
    pub max_lead: f64,
}

/// Outcome of one completed segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub packets: usize,
    /// Start of the first packet, device-clock seconds
    pub start_time: f64,
    /// End of the last packet
    pub end_time: f64,
    pub warnings: u64,
    pub backpressure_sleeps: u64,
}

/// Pacing engine for one inbound channel
pub struct Pacer<S: Sleeper = ThreadSleeper> {
    config: PacerConfig,
    metadata: PacketMetadata,
    sleeper: S,
    cancel: CancelToken,
    stats: StreamStats,
}

impl Pacer<ThreadSleeper> {
    pub fn new(config: PacerConfig, metadata: PacketMetadata) -> Result<Self, StreamError> {
        Self::with_sleeper(config, metadata, ThreadSleeper)
    }
}

impl<S: Sleeper> Pacer<S> {
    pub fn with_sleeper(config: PacerConfig, metadata: PacketMetadata, sleeper: S) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            config,
            metadata,
            sleeper,
            cancel: CancelToken::new(),
            stats: StreamStats::default(),
        })
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &PacketMetadata {
        &self.metadata
    }

    /// Token that aborts a running segment from another thread
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Stream `packets` blocks from `source` as one segment
    ///
    /// Returns once the device clock has passed the end of the last packet.
    /// The first failed send aborts the segment; packets already accepted
    /// stay queued on the device.
    pub fn run_segment<D, B>(
        &mut self,
        device: &Device<D>,
        source: &mut B,
        packets: usize,
    ) -> Result<SegmentReport, StreamError>
    where
        D: Driver,
        B: BlockSource + ?Sized,
    {
        let state = device.state();
        if state != Some(DeviceState::Running) {
            return Err(StreamError::NotRunning(state));
        }
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let duration = self.config.packet_duration();
        let samples = self.config.packet_samples;
        let expected_len = samples * 2;

        let mut cursor = device.master_clock_time()? + self.config.lookahead;
        let mut report = SegmentReport {
            packets: 0,
            start_time: cursor,
            end_time: cursor,
            warnings: 0,
            backpressure_sleeps: 0,
        };
        if packets == 0 {
            return Ok(report);
        }

        tracing::debug!(
            "Segment of {} packets starting at {:.6} ({:.3} ms each)",
            packets,
            cursor,
            duration * 1e3
        );

        for index in 0..packets {
            let end = cursor + duration;

            let (now, sleeps) = self.wait_until(device, cursor - self.config.max_queue_fill)?;
            report.backpressure_sleeps += sleeps;
            self.stats.backpressure_sleeps += sleeps;

            let block = source.block(index);
            if block.len() < expected_len {
                return Err(StreamError::BlockSize {
                    index,
                    got: block.len(),
                    expected: expected_len,
                });
            }

            let mut packet = Packet::iq(&block[..expected_len]);
            packet.stream_id = self.metadata.stream_id;
            packet.flags = PacketFlags::boundary(index, packets);
            packet.start_time = cursor;
            packet.end_time = end;
            packet.start_frequency = self.metadata.start_frequency;
            packet.step_frequency = self.metadata.step_frequency;
            packet.span_frequency = self.metadata.span_frequency;
            packet.rbw_frequency = self.metadata.rbw_frequency;
            packet.total = (samples * packets) as u64;

            let status = device
                .send_packet(self.config.channel, &packet)
                .map_err(|source| StreamError::Send { index, source })?;
            if status.is_warning() {
                report.warnings += 1;
                self.stats.warnings += 1;
            }

            self.stats.packets_sent += 1;
            self.stats.samples_sent += samples as u64;
            self.stats.max_lead = self.stats.max_lead.max(cursor - now);
            report.packets += 1;

            cursor = end;
        }
        report.end_time = cursor;

        let (_, sleeps) = self.wait_until(device, cursor)?;
        self.stats.drain_sleeps += sleeps;
        self.stats.segments += 1;

        tracing::info!(
            "Segment complete: {} packets, {} warnings, {} backpressure sleeps",
            report.packets,
            report.warnings,
            report.backpressure_sleeps
        );
        Ok(report)
    }

    /// Block until the device clock reaches `target`
    ///
    /// Re-reads the clock after every sleep since device time need not
    /// track host time. Returns the last clock reading and the number of
    /// sleeps taken.
    fn wait_until<D: Driver>(&self, device: &Device<D>, target: f64) -> Result<(f64, u64), StreamError> {
        let mut sleeps = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            let now = device.master_clock_time()?;
            if !now.is_finite() {
                return Err(StreamError::InvalidClock(now));
            }
            let remaining = target - now;
            if remaining <= 0.0 {
                return Ok((now, sleeps));
            }
            let nap = Duration::try_from_secs_f64(remaining)
                .map_err(|_| StreamError::InvalidClock(target))?
                .max(MIN_SLEEP);
            if !self.sleeper.sleep(nap, &self.cancel) {
                return Err(StreamError::Cancelled);
            }
            sleeps += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ThreadSleeper, VirtualClock};
    use crate::device::sim::SimulatedDevice;
    use crate::status::Status;
    use crate::streaming::source::SweepSource;

    fn running_device(clock: &VirtualClock) -> Device<SimulatedDevice> {
        let driver = SimulatedDevice::transmitter(clock.clone()).with_startup_polls(0);
        let mut device = Device::new(driver, "spectranv6/iqtransmitter", "SIM000001");
        device.connect().unwrap();
        device.start().unwrap();
        assert_eq!(device.state(), Some(DeviceState::Running));
        device
    }

    fn small_config() -> PacerConfig {
        PacerConfig {
            packet_samples: 1000,
            sample_rate: 1.0e6,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(PacerConfig::default().validate().is_ok());
        assert!((PacerConfig::default().packet_duration() - 0.016384).abs() < 1e-12);

        let bad = PacerConfig {
            sample_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(StreamError::InvalidConfig(_))));

        let inverted = PacerConfig {
            lookahead: 0.01,
            max_queue_fill: 0.05,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_boundary_flags_and_contiguity() {
        let clock = VirtualClock::new(1000.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock.clone()).unwrap();

        let report = pacer.run_segment(&device, &mut source, 10).unwrap();
        assert_eq!(report.packets, 10);

        let sent = device.driver().sent_packets();
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[0].flags, PacketFlags::STREAM_START | PacketFlags::SEGMENT_START);
        assert_eq!(sent[9].flags, PacketFlags::STREAM_END | PacketFlags::SEGMENT_END);
        for packet in &sent[1..9] {
            assert!(!packet.flags.intersects(PacketFlags::BOUNDARIES));
        }
        for pair in sent.windows(2) {
            assert_eq!(pair[1].start_time, pair[0].end_time);
        }
        assert!((sent[0].start_time - 1000.2).abs() < 1e-9);
        assert_eq!(device.driver().discontinuities(), 0);

        // Drain wait ran past the final window
        assert!(clock.now() >= report.end_time);
    }

    #[test]
    fn test_queue_fill_bounded() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let config = small_config();
        let mut pacer = Pacer::with_sleeper(config.clone(), PacketMetadata::default(), clock.clone()).unwrap();

        pacer.run_segment(&device, &mut source, 200).unwrap();

        for packet in device.driver().sent_packets() {
            assert!(packet.lead() <= config.max_queue_fill + 1e-9, "lead {}", packet.lead());
            assert!(packet.lead() >= 0.0);
        }
        assert!(clock.sleeps().iter().all(|s| *s > 0.0));
        assert_eq!(device.driver().late_packets(), 0);
    }

    #[test]
    fn test_drifting_clock_is_rechecked() {
        // Device time runs at half host speed: every sleep undershoots
        let clock = VirtualClock::with_rate(0.0, 0.5);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let config = small_config();
        let mut pacer = Pacer::with_sleeper(config.clone(), PacketMetadata::default(), clock.clone()).unwrap();

        pacer.run_segment(&device, &mut source, 50).unwrap();

        for packet in device.driver().sent_packets() {
            assert!(packet.lead() <= config.max_queue_fill + 1e-9);
        }
        assert!(pacer.stats().backpressure_sleeps > 50);
    }

    #[test]
    fn test_send_error_aborts_segment() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        device.driver().fail_send_at(3, Status::ERROR_BUFFER_SIZE);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock.clone()).unwrap();

        match pacer.run_segment(&device, &mut source, 10) {
            Err(StreamError::Send { index, source }) => {
                assert_eq!(index, 3);
                assert_eq!(source.status(), Some(Status::ERROR_BUFFER_SIZE));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(device.driver().sent_count(), 3);
        assert_eq!(pacer.stats().segments, 0);
    }

    #[test]
    fn test_send_warning_is_counted() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        device.driver().fail_send_at(1, Status::WARNING);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock.clone()).unwrap();

        let report = pacer.run_segment(&device, &mut source, 4).unwrap();
        assert_eq!(report.packets, 4);
        assert_eq!(report.warnings, 1);
        assert_eq!(device.driver().sent_count(), 4);
    }

    #[test]
    fn test_cancelled_before_send() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock.clone()).unwrap();

        pacer.cancel_token().cancel();
        assert!(matches!(
            pacer.run_segment(&device, &mut source, 10),
            Err(StreamError::Cancelled)
        ));
        assert_eq!(device.driver().sent_count(), 0);
    }

    #[test]
    fn test_cancel_during_drain_wait() {
        // Frozen device clock: the drain wait can only end by cancellation
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let config = PacerConfig {
            lookahead: 0.5,
            max_queue_fill: 0.5,
            ..small_config()
        };
        let mut pacer = Pacer::with_sleeper(config, PacketMetadata::default(), ThreadSleeper).unwrap();

        let cancel = pacer.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let result = pacer.run_segment(&device, &mut source, 1);
        canceller.join().unwrap();

        assert!(matches!(result, Err(StreamError::Cancelled)));
        // The drain nap is 0.5 s; cancellation must cut it short
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(device.driver().sent_count(), 1);
        assert_eq!(pacer.stats().packets_sent, 1);
        assert_eq!(pacer.stats().segments, 0);
    }

    #[test]
    fn test_cancel_during_backpressure_wait() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let config = PacerConfig {
            lookahead: 0.045,
            ..small_config()
        };
        let mut pacer = Pacer::with_sleeper(config, PacketMetadata::default(), ThreadSleeper).unwrap();

        let cancel = pacer.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let result = pacer.run_segment(&device, &mut source, 10);
        canceller.join().unwrap();

        assert!(matches!(result, Err(StreamError::Cancelled)));
        // Packet 0 was due immediately; packet 1 waits on a clock that never moves
        assert_eq!(device.driver().sent_count(), 1);
        assert!(device.driver().sent_packets()[0].flags.contains(PacketFlags::STREAM_START));
    }

    #[test]
    fn test_non_finite_clock_rejected() {
        let clock = VirtualClock::new(f64::NAN);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock).unwrap();

        assert!(matches!(
            pacer.run_segment(&device, &mut source, 2),
            Err(StreamError::InvalidClock(_))
        ));
        assert_eq!(device.driver().sent_count(), 0);
    }

    #[test]
    fn test_not_running_refused() {
        let clock = VirtualClock::new(0.0);
        let driver = SimulatedDevice::transmitter(clock.clone());
        let device = Device::new(driver, "spectranv6/iqtransmitter", "SIM000001");
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock).unwrap();

        assert!(matches!(
            pacer.run_segment(&device, &mut source, 1),
            Err(StreamError::NotRunning(Some(DeviceState::Idle)))
        ));
    }

    #[test]
    fn test_short_block_rejected() {
        let clock = VirtualClock::new(0.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(500);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock).unwrap();

        assert!(matches!(
            pacer.run_segment(&device, &mut source, 2),
            Err(StreamError::BlockSize { index: 0, got: 1000, expected: 2000 })
        ));
    }

    #[test]
    fn test_empty_and_single_segments() {
        let clock = VirtualClock::new(5.0);
        let device = running_device(&clock);
        let mut source = SweepSource::reference(1000);
        let mut pacer = Pacer::with_sleeper(small_config(), PacketMetadata::default(), clock.clone()).unwrap();

        let report = pacer.run_segment(&device, &mut source, 0).unwrap();
        assert_eq!(report.packets, 0);
        assert_eq!(device.driver().sent_count(), 0);
        assert_eq!(clock.now(), 5.0);

        pacer.run_segment(&device, &mut source, 1).unwrap();
        let sent = device.driver().sent_packets();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].flags.contains(PacketFlags::BOUNDARIES));
    }
}
