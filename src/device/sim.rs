//! Simulated RTSA device
//!
//! Implements [`Driver`] without hardware so sessions, the config tree and
//! the pacing engine can run against a virtual or wall-clock device.
//!
//! # Behaviour
//!
//! - **Lifecycle**: idle → connected → starting → running. `start` needs a
//!   connection; the device reports `starting` for a few state polls first.
//! - **Config tree**: in-memory [`SimTree`] with range clamping and step
//!   snapping (reported as `WARNING_VALUE_ADJUSTED`), disabled enum choices
//!   (`WARNING_VALUE_DISABLED`) and type checks.
//! - **Transmit**: the most recent accepted packets are recorded together
//!   with how far ahead of the device clock they arrived. Sample data is
//!   only kept when capture is enabled. Failures can be injected per send
//!   attempt.
//! - **Receive**: in transmitter mode, packets can loop back once their
//!   time window has passed; in receiver mode the device synthesizes sweep
//!   packets as its clock advances.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{Backend, ConfigHandle, Device, Driver};
use crate::clock::SimClock;
use crate::constants::DEVICE_FAMILY;
use crate::error::DeviceError;
use crate::protocol::{DeviceInfo, DeviceState, MemorySize, Packet, PacketFlags};
use crate::status::Status;
use crate::streaming::source::{BlockSource, SweepSource};
use crate::tree::{ConfigInfo, ConfigType};

/// Handles into the health tree carry this bit
const HEALTH_BIT: u64 = 1 << 32;

/// Receive queue depth before the oldest packets are dropped
const RECEIVE_QUEUE_LIMIT: usize = 256;

/// Accepted packets kept for inspection
const SENT_HISTORY_LIMIT: usize = 1024;

/// Stored value of a simulated config item
#[derive(Debug, Clone, PartialEq)]
pub enum SimValue {
    None,
    Float(f64),
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone)]
struct SimNode {
    info: ConfigInfo,
    value: SimValue,
    first_child: Option<usize>,
    last_child: Option<usize>,
    next_sibling: Option<usize>,
}

/// In-memory parameter tree
#[derive(Debug, Clone)]
pub struct SimTree {
    nodes: Vec<SimNode>,
}

impl Default for SimTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTree {
    /// Empty tree holding only the root group
    pub fn new() -> Self {
        Self {
            nodes: vec![SimNode {
                info: ConfigInfo::group("root", "Root"),
                value: SimValue::None,
                first_child: None,
                last_child: None,
                next_sibling: None,
            }],
        }
    }

    fn child_named(&self, parent: usize, name: &str) -> Option<usize> {
        let mut cursor = self.nodes[parent].first_child;
        while let Some(index) = cursor {
            if self.nodes[index].info.name == name {
                return Some(index);
            }
            cursor = self.nodes[index].next_sibling;
        }
        None
    }

    fn push_child(&mut self, parent: usize, info: ConfigInfo, value: SimValue) -> usize {
        let index = self.nodes.len();
        self.nodes.push(SimNode {
            info,
            value,
            first_child: None,
            last_child: None,
            next_sibling: None,
        });
        match self.nodes[parent].last_child {
            Some(last) => self.nodes[last].next_sibling = Some(index),
            None => self.nodes[parent].first_child = Some(index),
        }
        self.nodes[parent].last_child = Some(index);
        index
    }

    /// Add an item, creating missing groups on the way
    ///
    /// Fails if the path is malformed, already exists, or passes through a
    /// non-group item.
    pub fn insert_checked(&mut self, path: &str, mut info: ConfigInfo, value: SimValue) -> Result<usize, String> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(format!("malformed path '{}'", path));
        }
        let (leaf, groups) = segments
            .split_last()
            .ok_or_else(|| format!("malformed path '{}'", path))?;

        let mut parent = 0;
        for segment in groups {
            parent = match self.child_named(parent, segment) {
                Some(index) if self.nodes[index].info.is_group() => index,
                Some(_) => return Err(format!("'{}' in '{}' is not a group", segment, path)),
                None => self.push_child(parent, ConfigInfo::group(*segment, *segment), SimValue::None),
            };
        }
        if self.child_named(parent, leaf).is_some() {
            return Err(format!("'{}' already exists", path));
        }
        info.name = leaf.to_string();
        Ok(self.push_child(parent, info, value))
    }

    /// Add an item, logging and skipping it if the path is unusable
    pub fn insert(&mut self, path: &str, info: ConfigInfo, value: SimValue) -> &mut Self {
        if let Err(e) = self.insert_checked(path, info, value) {
            tracing::warn!("Skipping simulated config item: {}", e);
        }
        self
    }

    /// Every item path, depth first
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths(0, "", &mut paths);
        paths
    }

    fn collect_paths(&self, parent: usize, prefix: &str, paths: &mut Vec<String>) {
        let mut cursor = self.nodes[parent].first_child;
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            let path = if prefix.is_empty() {
                node.info.name.clone()
            } else {
                format!("{}/{}", prefix, node.info.name)
            };
            paths.push(path.clone());
            self.collect_paths(index, &path, paths);
            cursor = node.next_sibling;
        }
    }

    fn lookup(&self, path: &str) -> Option<usize> {
        path.split('/')
            .try_fold(0, |parent, segment| self.child_named(parent, segment))
    }

    fn float_at(&self, path: &str) -> Option<f64> {
        match self.lookup(path).map(|i| &self.nodes[i].value) {
            Some(SimValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    /// Spectran-style parameter layout
    pub fn spectran() -> Self {
        let mut tree = SimTree::new();
        tree.insert(
            "main/centerfreq",
            ConfigInfo::number("centerfreq", "Center Frequency", 1.0e6, 6.0e9, 1.0, "Hz"),
            SimValue::Float(2440.0e6),
        )
        .insert(
            "main/spanfreq",
            ConfigInfo::number("spanfreq", "Span Frequency", 1.0e3, 245.0e6, 1.0, "Hz"),
            SimValue::Float(1.0e6),
        )
        .insert(
            "main/transgain",
            ConfigInfo::number("transgain", "Transmit Gain", -100.0, 10.0, 0.5, "dB"),
            SimValue::Float(0.0),
        )
        .insert(
            "main/reflevel",
            ConfigInfo::number("reflevel", "Reference Level", -20.0, 10.0, 0.5, "dBm"),
            SimValue::Float(-20.0),
        )
        .insert(
            "main/decimation",
            ConfigInfo::choice(
                "decimation",
                "Decimation",
                &["Full", "1 / 2", "1 / 4", "1 / 8", "1 / 16", "1 / 32", "1 / 64", "1 / 128", "1 / 256", "1 / 512"],
            ),
            SimValue::Text("Full".to_string()),
        );

        let mut channel = ConfigInfo::choice("receiverchannel", "Receiver Channel", &["Rx1", "Rx2", "Rx1+Rx2", "Rx1/Rx2", "Rx Off"]);
        channel.disabled_options = 0b01000;
        tree.insert("device/receiverchannel", channel, SimValue::Text("Rx1".to_string()))
            .insert(
                "device/outputformat",
                ConfigInfo::choice("outputformat", "Output Format", &["iq", "spectra", "both", "auto"]),
                SimValue::Text("iq".to_string()),
            )
            .insert(
                "device/receiverclock",
                ConfigInfo::choice("receiverclock", "Receiver Clock", &["92MHz", "122MHz", "184MHz", "245MHz"]),
                SimValue::Text("92MHz".to_string()),
            )
            .insert(
                "device/gaincontrol",
                ConfigInfo::choice("gaincontrol", "Gain Control", &["manual", "peak", "power"]),
                SimValue::Text("manual".to_string()),
            )
            .insert(
                "device/powersaving",
                ConfigInfo {
                    config_type: ConfigType::Bool,
                    title: "Power Saving".to_string(),
                    max: 1.0,
                    step: 1.0,
                    ..Default::default()
                },
                SimValue::Integer(0),
            )
            .insert(
                "calibration/preamp",
                ConfigInfo::choice("preamp", "Preamplifier", &["Disabled", "Auto", "None", "Amp", "Preamp", "Both"]),
                SimValue::Text("Auto".to_string()),
            )
            .insert(
                "calibration/rffilter",
                ConfigInfo::choice("rffilter", "RF Filter", &["Calibration", "Bypass", "Auto", "Auto Extended"]),
                SimValue::Text("Auto".to_string()),
            );
        tree
    }

    /// Read-only health tree
    pub fn health() -> Self {
        let mut tree = SimTree::new();
        tree.insert(
            "temperature",
            ConfigInfo::number("temperature", "Device Temperature", -40.0, 125.0, 0.0, "°C"),
            SimValue::Float(42.5),
        )
        .insert(
            "voltage",
            ConfigInfo::number("voltage", "Supply Voltage", 0.0, 20.0, 0.0, "V"),
            SimValue::Float(12.1),
        )
        .insert(
            "usb/superspeed",
            ConfigInfo {
                config_type: ConfigType::Bool,
                title: "USB SuperSpeed".to_string(),
                max: 1.0,
                step: 1.0,
                ..Default::default()
            },
            SimValue::Integer(1),
        );
        tree
    }
}

/// Snap to the step grid and clamp to bounds
fn adjust_number(info: &ConfigInfo, value: f64) -> f64 {
    let mut adjusted = value;
    if info.step > 0.0 {
        adjusted = info.min + ((adjusted - info.min) / info.step).round() * info.step;
    }
    if info.max > info.min {
        adjusted = adjusted.clamp(info.min, info.max);
    }
    adjusted
}

fn write_value(node: &mut SimNode, value: SimValue) -> Status {
    let info = &node.info;
    match (info.config_type, value) {
        (ConfigType::Number, SimValue::Float(v)) => {
            if !v.is_finite() {
                return Status::ERROR_VALUE_MALFORMED;
            }
            let adjusted = adjust_number(info, v);
            node.value = SimValue::Float(adjusted);
            if (adjusted - v).abs() > 1e-12 * v.abs().max(1.0) {
                Status::WARNING_VALUE_ADJUSTED
            } else {
                Status::OK
            }
        }
        (ConfigType::Number, SimValue::Integer(v)) => write_value(node, SimValue::Float(v as f64)),
        (ConfigType::Enum, SimValue::Text(choice)) => match info.option_index(&choice) {
            Some(index) => {
                let disabled = info.is_option_disabled(index);
                node.value = SimValue::Text(choice);
                if disabled {
                    Status::WARNING_VALUE_DISABLED
                } else {
                    Status::OK
                }
            }
            None => Status::ERROR_VALUE_INVALID,
        },
        (ConfigType::Enum, SimValue::Integer(index)) => {
            let choice = usize::try_from(index)
                .ok()
                .and_then(|i| info.option_list().get(i).map(|o| o.to_string()));
            match choice {
                Some(choice) => write_value(node, SimValue::Text(choice)),
                None => Status::ERROR_VALUE_INVALID,
            }
        }
        (ConfigType::Enum, SimValue::Float(v)) => {
            if v.fract() != 0.0 {
                return Status::ERROR_VALUE_INVALID;
            }
            write_value(node, SimValue::Integer(v as i64))
        }
        (ConfigType::Bool, SimValue::Integer(v)) => {
            node.value = SimValue::Integer((v != 0) as i64);
            Status::OK
        }
        (ConfigType::Bool, SimValue::Float(v)) => write_value(node, SimValue::Integer((v != 0.0) as i64)),
        (ConfigType::Bool, SimValue::Text(text)) => match text.as_str() {
            "true" => write_value(node, SimValue::Integer(1)),
            "false" => write_value(node, SimValue::Integer(0)),
            _ => Status::ERROR_VALUE_MALFORMED,
        },
        (ConfigType::String, SimValue::Text(text)) => {
            node.value = SimValue::Text(text);
            Status::OK
        }
        _ => Status::ERROR_INVALID_PARAMETER,
    }
}

fn read_float(node: &SimNode) -> (Status, f64) {
    match (node.info.config_type, &node.value) {
        (ConfigType::Number, SimValue::Float(v)) => (Status::OK, *v),
        (ConfigType::Bool, SimValue::Integer(v)) => (Status::OK, *v as f64),
        (ConfigType::Enum, SimValue::Text(choice)) => match node.info.option_index(choice) {
            Some(index) => (Status::OK, index as f64),
            None => (Status::ERROR_VALUE_INVALID, 0.0),
        },
        _ => (Status::ERROR_INVALID_PARAMETER, 0.0),
    }
}

fn read_string(node: &SimNode) -> (Status, String) {
    match (node.info.config_type, &node.value) {
        (ConfigType::String | ConfigType::Enum, SimValue::Text(text)) => (Status::OK, text.clone()),
        (ConfigType::Bool, SimValue::Integer(v)) => (Status::OK, (*v != 0).to_string()),
        _ => (Status::ERROR_INVALID_PARAMETER, String::new()),
    }
}

/// Packet accepted by the simulated transmitter
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub stream_id: u64,
    pub flags: PacketFlags,
    pub start_time: f64,
    pub end_time: f64,
    pub start_frequency: f64,
    pub step_frequency: f64,
    pub num: u64,
    /// Device clock when the packet arrived
    pub submitted_at: f64,
    /// Empty unless sample capture or loopback is enabled
    pub data: Vec<f32>,
}

impl SentPacket {
    /// How far ahead of the device clock the packet was queued
    pub fn lead(&self) -> f64 {
        self.start_time - self.submitted_at
    }

    pub fn view(&self) -> Packet<'_> {
        let mut packet = Packet::iq(&self.data);
        packet.stream_id = self.stream_id;
        packet.flags = self.flags;
        packet.start_time = self.start_time;
        packet.end_time = self.end_time;
        packet.start_frequency = self.start_frequency;
        packet.step_frequency = self.step_frequency;
        packet.num = self.num;
        packet
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimMode {
    Transmitter { loopback: bool },
    Receiver,
}

struct Receiver {
    source: SweepSource,
    next_time: Option<f64>,
    next_index: usize,
    dropped: bool,
}

struct SimInner {
    state: DeviceState,
    startup_polls: u32,
    polls_left: u32,
    send_attempts: usize,
    failures: HashMap<usize, Status>,
    sent: VecDeque<SentPacket>,
    accepted: usize,
    capture_samples: bool,
    pending: VecDeque<SentPacket>,
    last_end: Option<f64>,
    discontinuities: usize,
    late_packets: usize,
}

/// Simulated device driver
pub struct SimulatedDevice {
    clock: SimClock,
    mode: SimMode,
    config: Mutex<SimTree>,
    health: SimTree,
    inner: Mutex<SimInner>,
    receiver: Receiver,
    outbound: VecDeque<SentPacket>,
    /// Backend registry entry to release on drop
    lease: Option<(DeviceRegistry, String)>,
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        if let Some((registry, serial)) = self.lease.take() {
            if let Some(info) = registry.lock().iter_mut().find(|d| d.serial_number == serial) {
                info.active = false;
            }
            tracing::debug!("Released simulated {}", serial);
        }
    }
}

impl SimulatedDevice {
    /// Transmitter-mode device over the given trees
    pub fn new(clock: impl Into<SimClock>, config: SimTree, health: SimTree) -> Self {
        Self {
            clock: clock.into(),
            mode: SimMode::Transmitter { loopback: false },
            config: Mutex::new(config),
            health,
            inner: Mutex::new(SimInner {
                state: DeviceState::Idle,
                startup_polls: 2,
                polls_left: 0,
                send_attempts: 0,
                failures: HashMap::new(),
                sent: VecDeque::new(),
                accepted: 0,
                capture_samples: false,
                pending: VecDeque::new(),
                last_end: None,
                discontinuities: 0,
                late_packets: 0,
            }),
            receiver: Receiver {
                source: SweepSource::reference(1024),
                next_time: None,
                next_index: 0,
                dropped: false,
            },
            outbound: VecDeque::new(),
            lease: None,
        }
    }

    pub fn transmitter(clock: impl Into<SimClock>) -> Self {
        Self::new(clock, SimTree::spectran(), SimTree::health())
    }

    /// Receiver-mode device producing sweep packets at the configured span
    pub fn receiver(clock: impl Into<SimClock>) -> Self {
        let mut device = Self::transmitter(clock);
        device.mode = SimMode::Receiver;
        device
    }

    /// Feed transmitted packets back into the receive queue once played
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        if let SimMode::Transmitter { .. } = self.mode {
            self.mode = SimMode::Transmitter { loopback };
        }
        self
    }

    /// State polls spent in `starting` before reaching `running`
    pub fn with_startup_polls(self, polls: u32) -> Self {
        self.inner.lock().startup_polls = polls;
        self
    }

    /// Complex samples per synthesized receive packet
    pub fn with_receive_block(mut self, samples: usize) -> Self {
        self.receiver.source = SweepSource::reference(samples.max(1));
        self
    }

    /// Make send attempt `attempt` (0-based, counted over the device's
    /// lifetime) return `status`. Warnings still accept the packet.
    pub fn fail_send_at(&self, attempt: usize, status: Status) {
        self.inner.lock().failures.insert(attempt, status);
    }

    /// Keep sample data of accepted packets in the send history
    pub fn capture_samples(&self, enabled: bool) {
        self.inner.lock().capture_samples = enabled;
    }

    /// Most recent accepted packets, oldest first
    pub fn sent_packets(&self) -> Vec<SentPacket> {
        self.inner.lock().sent.iter().cloned().collect()
    }

    /// Packets accepted over the device's lifetime
    pub fn sent_count(&self) -> usize {
        self.inner.lock().accepted
    }

    /// Packets whose start did not continue the previous packet's end
    pub fn discontinuities(&self) -> usize {
        self.inner.lock().discontinuities
    }

    /// Packets that arrived after their start time had passed
    pub fn late_packets(&self) -> usize {
        self.inner.lock().late_packets
    }

    /// Seconds of queued transmit data not yet played
    pub fn queue_fill(&self) -> f64 {
        let now = self.clock.now();
        self.inner
            .lock()
            .last_end
            .map_or(0.0, |end| (end - now).max(0.0))
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    fn node_op<R>(&self, handle: ConfigHandle, f: impl FnOnce(&SimNode) -> R) -> Option<R> {
        let index = (handle.0 & !HEALTH_BIT) as usize;
        if handle.0 & HEALTH_BIT != 0 {
            self.health.nodes.get(index).map(f)
        } else {
            self.config.lock().nodes.get(index).map(f)
        }
    }

    fn sibling_handle(handle: ConfigHandle, index: usize) -> ConfigHandle {
        ConfigHandle((handle.0 & HEALTH_BIT) | index as u64)
    }

    fn link(&self, handle: ConfigHandle, pick: impl FnOnce(&SimNode) -> Option<usize>) -> (Status, Option<ConfigHandle>) {
        match self.node_op(handle, pick) {
            Some(Some(index)) => (Status::OK, Some(Self::sibling_handle(handle, index))),
            Some(None) => (Status::EMPTY, None),
            None => (Status::ERROR_INVALID_PARAMETER, None),
        }
    }

    fn write(&self, handle: ConfigHandle, value: SimValue) -> Status {
        if handle.0 & HEALTH_BIT != 0 {
            return Status::ERROR_INVALID_CONFIG;
        }
        let mut tree = self.config.lock();
        match tree.nodes.get_mut(handle.0 as usize) {
            Some(node) => write_value(node, value),
            None => Status::ERROR_INVALID_PARAMETER,
        }
    }

    /// Move due packets into the receive queue
    fn refill(&mut self) {
        let now = self.clock.now();
        match self.mode {
            SimMode::Transmitter { loopback: true } => {
                let inner = self.inner.get_mut();
                while inner.pending.front().map_or(false, |p| p.end_time <= now) {
                    if let Some(packet) = inner.pending.pop_front() {
                        self.outbound.push_back(packet);
                    }
                }
            }
            SimMode::Transmitter { loopback: false } => {}
            SimMode::Receiver => {
                if self.inner.get_mut().state != DeviceState::Running {
                    return;
                }
                let (center, span) = {
                    let tree = self.config.get_mut();
                    (
                        tree.float_at("main/centerfreq").unwrap_or(0.0),
                        tree.float_at("main/spanfreq").unwrap_or(1.0e6),
                    )
                };
                let samples = self.receiver.source.samples_per_block();
                let duration = samples as f64 / span;
                let mut start = *self.receiver.next_time.get_or_insert(now);
                while start + duration <= now {
                    let index = self.receiver.next_index;
                    let mut flags = PacketFlags::empty();
                    if index == 0 {
                        flags |= PacketFlags::STREAM_START | PacketFlags::SEGMENT_START;
                    }
                    if self.receiver.dropped {
                        flags |= PacketFlags::WARN_DROPPED;
                        self.receiver.dropped = false;
                    }
                    let data = self.receiver.source.block(index).to_vec();
                    self.outbound.push_back(SentPacket {
                        stream_id: 0,
                        flags,
                        start_time: start,
                        end_time: start + duration,
                        start_frequency: center - span / 2.0,
                        step_frequency: span,
                        num: samples as u64,
                        submitted_at: start + duration,
                        data,
                    });
                    if self.outbound.len() > RECEIVE_QUEUE_LIMIT {
                        self.outbound.pop_front();
                        self.receiver.dropped = true;
                    }
                    start += duration;
                    self.receiver.next_index += 1;
                }
                self.receiver.next_time = Some(start);
            }
        }
    }
}

impl Driver for SimulatedDevice {
    fn connect(&mut self) -> Status {
        let inner = self.inner.get_mut();
        match inner.state {
            DeviceState::Idle => {
                inner.state = DeviceState::Connected;
                Status::OK
            }
            DeviceState::Connected => Status::OK,
            _ => Status::ERROR_BUSY,
        }
    }

    fn disconnect(&mut self) -> Status {
        let inner = self.inner.get_mut();
        inner.state = DeviceState::Idle;
        inner.pending.clear();
        inner.last_end = None;
        self.outbound.clear();
        self.receiver.next_time = None;
        self.receiver.next_index = 0;
        Status::OK
    }

    fn start(&mut self) -> Status {
        let inner = self.inner.get_mut();
        match inner.state {
            DeviceState::Connected => {
                inner.state = DeviceState::Starting;
                inner.polls_left = inner.startup_polls;
                Status::OK
            }
            DeviceState::Starting | DeviceState::Running => Status::OK,
            _ => Status::ERROR_NOT_CONNECTED,
        }
    }

    fn stop(&mut self) -> Status {
        let inner = self.inner.get_mut();
        match inner.state {
            DeviceState::Starting | DeviceState::Running => {
                inner.state = DeviceState::Connected;
                Status::OK
            }
            DeviceState::Connected => Status::OK,
            _ => Status::ERROR_NOT_CONNECTED,
        }
    }

    fn state(&self) -> Status {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Starting {
            if inner.polls_left == 0 {
                inner.state = DeviceState::Running;
            } else {
                inner.polls_left -= 1;
            }
        }
        inner.state.status()
    }

    fn master_stream_time(&self) -> (Status, f64) {
        (Status::OK, self.clock.now())
    }

    fn send_packet(&self, channel: u32, packet: &Packet<'_>) -> Status {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let attempt = inner.send_attempts;
        inner.send_attempts += 1;
        let injected = inner.failures.remove(&attempt);
        if let Some(status) = injected {
            if !status.is_warning() {
                return status;
            }
        }

        if channel != 0 || self.mode == SimMode::Receiver {
            return Status::ERROR_INVALID_CHANNEL;
        }
        if inner.state != DeviceState::Running {
            return Status::ERROR_NOT_CONNECTED;
        }
        if !(packet.end_time > packet.start_time) {
            return Status::ERROR_INVALID_PARAMETER;
        }
        let required = match packet.required_len() {
            Some(len) if packet.size > 0 && len <= packet.data.len() => len,
            _ => return Status::ERROR_INVALID_SIZE,
        };

        if packet.start_time < now {
            inner.late_packets += 1;
            tracing::debug!("Packet for {:.6} arrived late at {:.6}", packet.start_time, now);
        }
        if let Some(last_end) = inner.last_end {
            if !packet.flags.contains(PacketFlags::STREAM_START) && packet.start_time != last_end {
                inner.discontinuities += 1;
            }
        }
        inner.last_end = Some(packet.end_time);

        let loopback = self.mode == SimMode::Transmitter { loopback: true };
        let data = if inner.capture_samples || loopback {
            packet.data[..required].to_vec()
        } else {
            Vec::new()
        };
        let mut sent = SentPacket {
            stream_id: packet.stream_id,
            flags: packet.flags,
            start_time: packet.start_time,
            end_time: packet.end_time,
            start_frequency: packet.start_frequency,
            step_frequency: packet.step_frequency,
            num: packet.num,
            submitted_at: now,
            data,
        };
        if loopback {
            if inner.pending.len() >= RECEIVE_QUEUE_LIMIT {
                inner.pending.pop_front();
            }
            inner.pending.push_back(sent.clone());
        }
        if !inner.capture_samples {
            sent.data = Vec::new();
        }
        if inner.sent.len() >= SENT_HISTORY_LIMIT {
            inner.sent.pop_front();
        }
        inner.sent.push_back(sent);
        inner.accepted += 1;

        injected.unwrap_or(Status::OK)
    }

    fn avail_packets(&mut self, channel: u32) -> (Status, usize) {
        if channel != 0 {
            return (Status::ERROR_INVALID_CHANNEL, 0);
        }
        self.refill();
        match self.outbound.len() {
            0 => (Status::EMPTY, 0),
            n => (Status::OK, n),
        }
    }

    fn get_packet(&mut self, channel: u32, index: usize) -> (Status, Option<Packet<'_>>) {
        if channel != 0 {
            return (Status::ERROR_INVALID_CHANNEL, None);
        }
        self.refill();
        match self.outbound.get(index) {
            Some(packet) => (Status::OK, Some(packet.view())),
            None => (Status::EMPTY, None),
        }
    }

    fn consume_packets(&mut self, channel: u32, count: usize) -> Status {
        if channel != 0 {
            return Status::ERROR_INVALID_CHANNEL;
        }
        let count = count.min(self.outbound.len());
        self.outbound.drain(..count);
        Status::OK
    }

    fn config_root(&self) -> (Status, ConfigHandle) {
        (Status::OK, ConfigHandle(0))
    }

    fn config_health(&self) -> (Status, ConfigHandle) {
        (Status::OK, ConfigHandle(HEALTH_BIT))
    }

    fn config_first(&self, group: ConfigHandle) -> (Status, Option<ConfigHandle>) {
        self.link(group, |node| node.first_child)
    }

    fn config_next(&self, item: ConfigHandle) -> (Status, Option<ConfigHandle>) {
        self.link(item, |node| node.next_sibling)
    }

    fn config_name(&self, item: ConfigHandle) -> (Status, String) {
        self.node_op(item, |node| (Status::OK, node.info.name.clone()))
            .unwrap_or((Status::ERROR_INVALID_PARAMETER, String::new()))
    }

    fn config_info(&self, item: ConfigHandle) -> (Status, ConfigInfo) {
        self.node_op(item, |node| (Status::OK, node.info.clone()))
            .unwrap_or((Status::ERROR_INVALID_PARAMETER, ConfigInfo::default()))
    }

    fn config_get_float(&self, item: ConfigHandle) -> (Status, f64) {
        self.node_op(item, |node| read_float(node))
            .unwrap_or((Status::ERROR_INVALID_PARAMETER, 0.0))
    }

    fn config_set_float(&self, item: ConfigHandle, value: f64) -> Status {
        self.write(item, SimValue::Float(value))
    }

    fn config_get_string(&self, item: ConfigHandle) -> (Status, String) {
        self.node_op(item, |node| read_string(node))
            .unwrap_or((Status::ERROR_INVALID_PARAMETER, String::new()))
    }

    fn config_set_string(&self, item: ConfigHandle, value: &str) -> Status {
        self.write(item, SimValue::Text(value.to_string()))
    }

    fn config_get_integer(&self, item: ConfigHandle) -> (Status, i64) {
        let (status, value) = self.config_get_float(item);
        (status, value.round() as i64)
    }

    fn config_set_integer(&self, item: ConfigHandle, value: i64) -> Status {
        self.write(item, SimValue::Integer(value))
    }
}

type DeviceRegistry = Arc<Mutex<Vec<DeviceInfo>>>;

/// Device factory over a set of simulated units
pub struct SimulatedBackend {
    clock: SimClock,
    memory: MemorySize,
    devices: DeviceRegistry,
    scanned: bool,
}

impl SimulatedBackend {
    pub fn new(clock: impl Into<SimClock>, memory: MemorySize) -> Self {
        tracing::debug!("Simulated backend initialised with {:?} memory", memory);
        Self {
            clock: clock.into(),
            memory,
            devices: Arc::new(Mutex::new(Vec::new())),
            scanned: false,
        }
    }

    /// Attach another simulated unit
    pub fn with_device(self, serial: &str) -> Self {
        self.devices.lock().push(DeviceInfo {
            serial_number: serial.to_string(),
            ready: true,
            boost: false,
            superspeed: true,
            active: false,
        });
        self
    }

    pub fn memory(&self) -> MemorySize {
        self.memory
    }
}

impl Backend for SimulatedBackend {
    type Driver = SimulatedDevice;

    fn version(&self) -> u32 {
        0x0001_0000
    }

    fn rescan(&mut self, timeout: Duration) -> Result<Status, DeviceError> {
        tracing::debug!("Rescanning simulated devices ({} ms budget)", timeout.as_millis());
        self.scanned = true;
        Ok(Status::OK)
    }

    fn enumerate(&self, family: &str) -> Vec<DeviceInfo> {
        if !self.scanned || family != DEVICE_FAMILY {
            return Vec::new();
        }
        self.devices.lock().clone()
    }

    fn open(&mut self, kind: &str, serial: &str) -> Result<Device<SimulatedDevice>, DeviceError> {
        let (family, mode) = kind
            .split_once('/')
            .ok_or_else(|| DeviceError::InvalidKind(kind.to_string()))?;
        if family != DEVICE_FAMILY {
            return Err(DeviceError::InvalidKind(kind.to_string()));
        }

        let mut devices = self.devices.lock();
        let info = devices
            .iter_mut()
            .find(|d| serial.is_empty() || d.serial_number == serial)
            .ok_or_else(|| DeviceError::NotFound(serial.to_string()))?;
        if info.active {
            return Err(DeviceError::Call {
                operation: "OpenDevice",
                status: Status::ERROR_BUSY,
            });
        }

        let mut driver = match mode {
            "iqtransmitter" => SimulatedDevice::transmitter(self.clock.clone()),
            "iqreceiver" | "raw" => SimulatedDevice::receiver(self.clock.clone()),
            _ => return Err(DeviceError::InvalidKind(kind.to_string())),
        };
        driver.lease = Some((Arc::clone(&self.devices), info.serial_number.clone()));
        info.active = true;
        tracing::info!("Opened simulated {} ({})", info.serial_number, kind);
        Ok(Device::new(driver, kind, info.serial_number.clone()))
    }
}
