//! Data exchanged with the device driver
//!
//! Packet flags, the IQ packet itself, the driver-side packet layout and
//! the small descriptive types reported during discovery.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::status::Status;

/// Packet flag bitmask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u64);

impl PacketFlags {
    pub const STREAM_START: PacketFlags = PacketFlags(0x0000_0001);
    pub const STREAM_END: PacketFlags = PacketFlags(0x0000_0002);
    pub const SEGMENT_START: PacketFlags = PacketFlags(0x0000_0004);
    pub const SEGMENT_END: PacketFlags = PacketFlags(0x0000_0008);

    pub const PUSH: PacketFlags = PacketFlags(0x0000_8000);

    pub const WARN_OVERFLOW: PacketFlags = PacketFlags(0x0000_0100);
    pub const WARN_DROPPED: PacketFlags = PacketFlags(0x0000_0200);
    pub const WARN_INACCURATE: PacketFlags = PacketFlags(0x0000_0400);
    pub const WARN_RESAMPLED: PacketFlags = PacketFlags(0x0000_0800);

    pub const TIME_DISCONTINUITY: PacketFlags = PacketFlags(0x0001_0000);
    pub const WARN_DIRECTION: PacketFlags = PacketFlags(0x0002_0000);

    pub const CONDITION_0: PacketFlags = PacketFlags(0x1000_0000);
    pub const CONDITION_1: PacketFlags = PacketFlags(0x2000_0000);
    pub const CONDITION_2: PacketFlags = PacketFlags(0x4000_0000);
    pub const CONDITION_3: PacketFlags = PacketFlags(0x8000_0000);

    /// The four stream/segment boundary bits
    pub const BOUNDARIES: PacketFlags = PacketFlags(0x0000_000f);

    const NAMES: [(PacketFlags, &'static str); 15] = [
        (Self::STREAM_START, "STREAM_START"),
        (Self::STREAM_END, "STREAM_END"),
        (Self::SEGMENT_START, "SEGMENT_START"),
        (Self::SEGMENT_END, "SEGMENT_END"),
        (Self::PUSH, "PUSH"),
        (Self::WARN_OVERFLOW, "WARN_OVERFLOW"),
        (Self::WARN_DROPPED, "WARN_DROPPED"),
        (Self::WARN_INACCURATE, "WARN_INACCURATE"),
        (Self::WARN_RESAMPLED, "WARN_RESAMPLED"),
        (Self::TIME_DISCONTINUITY, "TIME_DISCONTINUITY"),
        (Self::WARN_DIRECTION, "WARN_DIRECTION"),
        (Self::CONDITION_0, "CONDITION_0"),
        (Self::CONDITION_1, "CONDITION_1"),
        (Self::CONDITION_2, "CONDITION_2"),
        (Self::CONDITION_3, "CONDITION_3"),
    ];

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    pub const fn intersects(self, other: PacketFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Boundary flags for packet `index` of a segment with `count` packets
    pub fn boundary(index: usize, count: usize) -> Self {
        let mut flags = PacketFlags::empty();
        if index == 0 {
            flags |= Self::STREAM_START | Self::SEGMENT_START;
        }
        if index + 1 == count {
            flags |= Self::STREAM_END | Self::SEGMENT_END;
        }
        flags
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PacketFlags {
    type Output = PacketFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        let mut rest = self.0;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "0x{:x}", rest)?;
        }
        Ok(())
    }
}

/// One timestamped block of IQ samples
///
/// The sample buffer is borrowed: it must stay alive until the call that
/// consumes the packet returns.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub stream_id: u64,
    pub flags: PacketFlags,
    /// Device-clock seconds
    pub start_time: f64,
    pub end_time: f64,
    pub start_frequency: f64,
    pub step_frequency: f64,
    pub span_frequency: f64,
    pub rbw_frequency: f64,
    /// Samples in this packet
    pub num: u64,
    /// Samples in the logical segment, 0 if unknown
    pub total: u64,
    /// Components per sample
    pub size: u64,
    /// Element stride between samples
    pub stride: u64,
    pub interleave: u64,
    pub data: &'a [f32],
}

impl<'a> Packet<'a> {
    /// Complex (I/Q) packet over an interleaved buffer
    pub fn iq(data: &'a [f32]) -> Self {
        Self {
            stream_id: 0,
            flags: PacketFlags::empty(),
            start_time: 0.0,
            end_time: 0.0,
            start_frequency: 0.0,
            step_frequency: 0.0,
            span_frequency: 0.0,
            rbw_frequency: 0.0,
            num: (data.len() / 2) as u64,
            total: 0,
            size: 2,
            stride: 2,
            interleave: 1,
            data,
        }
    }

    /// Time window covered by the packet in seconds
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Minimum buffer length for `num` samples at the declared stride
    ///
    /// `None` if the declared layout does not fit in memory.
    pub fn required_len(&self) -> Option<usize> {
        if self.num == 0 {
            return Some(0);
        }
        let len = (self.num - 1)
            .checked_mul(self.stride.max(1))?
            .checked_add(self.size)?;
        usize::try_from(len).ok()
    }

    /// Sample `index` as an (I, Q) pair
    pub fn sample(&self, index: usize) -> Option<(f32, f32)> {
        if index as u64 >= self.num {
            return None;
        }
        let stride = usize::try_from(self.stride.max(1)).ok()?;
        let base = index.checked_mul(stride)?;
        let i = *self.data.get(base)?;
        let q = if self.size >= 2 {
            *self.data.get(base.checked_add(1)?)?
        } else {
            0.0
        };
        Some((i, q))
    }

    /// Largest sample magnitude in the packet
    pub fn peak_magnitude(&self) -> f32 {
        let limit = usize::try_from(self.num).unwrap_or(usize::MAX).min(self.data.len());
        (0..limit)
            .map_while(|i| self.sample(i))
            .map(|(i, q)| (i * i + q * q).sqrt())
            .fold(0.0, f32::max)
    }
}

/// Driver-side packet layout
///
/// Field order and widths match the structure the vendor driver reads and
/// writes, including the leading structure size.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPacket {
    pub cbsize: i64,
    pub stream_id: u64,
    pub flags: u64,
    pub start_time: f64,
    pub end_time: f64,
    pub start_frequency: f64,
    pub step_frequency: f64,
    pub span_frequency: f64,
    pub rbw_frequency: f64,
    pub num: i64,
    pub total: i64,
    pub size: i64,
    pub stride: i64,
    pub fp32: *const f32,
    pub interleave: i64,
}

impl RawPacket {
    pub const SIZE: usize = std::mem::size_of::<RawPacket>();
}

impl From<&Packet<'_>> for RawPacket {
    fn from(packet: &Packet<'_>) -> Self {
        Self {
            cbsize: Self::SIZE as i64,
            stream_id: packet.stream_id,
            flags: packet.flags.bits(),
            start_time: packet.start_time,
            end_time: packet.end_time,
            start_frequency: packet.start_frequency,
            step_frequency: packet.step_frequency,
            span_frequency: packet.span_frequency,
            rbw_frequency: packet.rbw_frequency,
            num: packet.num as i64,
            total: packet.total as i64,
            size: packet.size as i64,
            stride: packet.stride as i64,
            fp32: packet.data.as_ptr(),
            interleave: packet.interleave as i64,
        }
    }
}

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Connecting,
    Connected,
    Starting,
    Running,
    Stopping,
    Disconnecting,
}

impl DeviceState {
    /// Decode a state report. Unknown codes yield `None`.
    pub fn from_status(status: Status) -> Option<Self> {
        let state = match status {
            Status::IDLE => DeviceState::Idle,
            Status::CONNECTING => DeviceState::Connecting,
            Status::CONNECTED => DeviceState::Connected,
            Status::STARTING => DeviceState::Starting,
            Status::RUNNING => DeviceState::Running,
            Status::STOPPING => DeviceState::Stopping,
            Status::DISCONNECTING => DeviceState::Disconnecting,
            _ => return None,
        };
        Some(state)
    }

    pub fn status(self) -> Status {
        match self {
            DeviceState::Idle => Status::IDLE,
            DeviceState::Connecting => Status::CONNECTING,
            DeviceState::Connected => Status::CONNECTED,
            DeviceState::Starting => Status::STARTING,
            DeviceState::Running => Status::RUNNING,
            DeviceState::Stopping => Status::STOPPING,
            DeviceState::Disconnecting => Status::DISCONNECTING,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Starting => "starting",
            DeviceState::Running => "running",
            DeviceState::Stopping => "stopping",
            DeviceState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Discovered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub ready: bool,
    pub boost: bool,
    pub superspeed: bool,
    pub active: bool,
}

/// Memory preset requested when a backend is initialised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySize {
    Small = 0,
    #[default]
    Medium = 1,
    Large = 2,
    Ludicrous = 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_flag_values() {
        assert_eq!(PacketFlags::STREAM_START.bits(), 0x1);
        assert_eq!(PacketFlags::SEGMENT_END.bits(), 0x8);
        assert_eq!(PacketFlags::PUSH.bits(), 0x8000);
        assert_eq!(PacketFlags::WARN_DIRECTION.bits(), 0x20000);
        assert_eq!(PacketFlags::CONDITION_3.bits(), 0x8000_0000);
    }

    #[test]
    fn test_boundary_flags() {
        let first = PacketFlags::boundary(0, 3);
        assert_eq!(first, PacketFlags::STREAM_START | PacketFlags::SEGMENT_START);
        assert!(PacketFlags::boundary(1, 3).is_empty());
        let last = PacketFlags::boundary(2, 3);
        assert_eq!(last, PacketFlags::STREAM_END | PacketFlags::SEGMENT_END);

        // A single-packet segment opens and closes on the same packet
        assert_eq!(PacketFlags::boundary(0, 1), PacketFlags::BOUNDARIES);
    }

    #[test]
    fn test_flags_debug() {
        let flags = PacketFlags::STREAM_START | PacketFlags::from_bits(0x40);
        assert_eq!(format!("{:?}", flags), "STREAM_START | 0x40");
        assert_eq!(format!("{:?}", PacketFlags::empty()), "(empty)");
    }

    #[test]
    fn test_raw_packet_layout() {
        if size_of::<usize>() != 8 {
            return;
        }
        assert_eq!(size_of::<RawPacket>(), 120);
        assert_eq!(align_of::<RawPacket>(), 8);
        assert_eq!(offset_of!(RawPacket, stream_id), 8);
        assert_eq!(offset_of!(RawPacket, start_time), 24);
        assert_eq!(offset_of!(RawPacket, rbw_frequency), 64);
        assert_eq!(offset_of!(RawPacket, num), 72);
        assert_eq!(offset_of!(RawPacket, fp32), 104);
        assert_eq!(offset_of!(RawPacket, interleave), 112);
    }

    #[test]
    fn test_raw_packet_from_packet() {
        let data = vec![0.5f32; 8];
        let mut packet = Packet::iq(&data);
        packet.flags = PacketFlags::SEGMENT_START;
        packet.start_time = 10.0;
        packet.end_time = 10.5;

        let raw = RawPacket::from(&packet);
        assert_eq!(raw.cbsize, RawPacket::SIZE as i64);
        assert_eq!(raw.num, 4);
        assert_eq!(raw.flags, 0x4);
        assert_eq!(raw.fp32, data.as_ptr());
    }

    #[test]
    fn test_packet_samples() {
        let data = [3.0f32, 4.0, 0.0, 1.0, 9.0, 9.0];
        let packet = Packet::iq(&data);
        assert_eq!(packet.num, 3);
        assert_eq!(packet.sample(1), Some((0.0, 1.0)));
        assert_eq!(packet.sample(3), None);
        assert!((packet.peak_magnitude() - 12.727_922).abs() < 1e-4);
        assert_eq!(packet.required_len(), Some(6));
    }

    #[test]
    fn test_oversized_layout_does_not_overflow() {
        let data = [0.5f32; 8];
        let mut packet = Packet::iq(&data);
        packet.num = u64::MAX;
        packet.stride = 2;
        assert_eq!(packet.required_len(), None);
        assert!((packet.peak_magnitude() - 0.5f32.hypot(0.5)).abs() < 1e-6);

        packet.num = 2;
        packet.stride = u64::MAX;
        assert_eq!(packet.required_len(), None);
        assert_eq!(packet.sample(1), None);
    }

    #[test]
    fn test_state_codes() {
        for state in [
            DeviceState::Idle,
            DeviceState::Connecting,
            DeviceState::Connected,
            DeviceState::Starting,
            DeviceState::Running,
            DeviceState::Stopping,
            DeviceState::Disconnecting,
        ] {
            assert_eq!(DeviceState::from_status(state.status()), Some(state));
        }
        assert_eq!(DeviceState::from_status(Status::OK), None);
    }
}
