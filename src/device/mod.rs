//! Device driver seam and session management
//!
//! [`Driver`] is the fixed primitive set a vendor driver exposes. Every
//! primitive reports a raw [`Status`]; [`Device`] wraps a driver, applies
//! the status classification uniformly and owns the connection lifecycle.
//! [`Backend`] replaces a process-wide library handle: it discovers and
//! opens devices.

pub mod session;
pub mod sim;

pub use session::Device;
pub use sim::{SimTree, SimValue, SimulatedBackend, SimulatedDevice};

use std::time::Duration;

use crate::error::DeviceError;
use crate::protocol::{DeviceInfo, Packet};
use crate::status::Status;
use crate::tree::ConfigInfo;

/// Opaque reference to a config item inside a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigHandle(pub u64);

/// Primitive operations of a device driver
///
/// Outputs paired with a status are only meaningful when the status is not
/// an error.
pub trait Driver {
    fn connect(&mut self) -> Status;
    fn disconnect(&mut self) -> Status;
    fn start(&mut self) -> Status;
    fn stop(&mut self) -> Status;

    /// Current state, reported as one of the `0x1000_000x` codes
    fn state(&self) -> Status;

    /// Device master clock in seconds
    fn master_stream_time(&self) -> (Status, f64);

    fn send_packet(&self, channel: u32, packet: &Packet<'_>) -> Status;
    fn avail_packets(&mut self, channel: u32) -> (Status, usize);
    fn get_packet(&mut self, channel: u32, index: usize) -> (Status, Option<Packet<'_>>);
    fn consume_packets(&mut self, channel: u32, count: usize) -> Status;

    fn config_root(&self) -> (Status, ConfigHandle);
    fn config_health(&self) -> (Status, ConfigHandle);
    fn config_first(&self, group: ConfigHandle) -> (Status, Option<ConfigHandle>);
    fn config_next(&self, item: ConfigHandle) -> (Status, Option<ConfigHandle>);
    fn config_name(&self, item: ConfigHandle) -> (Status, String);
    fn config_info(&self, item: ConfigHandle) -> (Status, ConfigInfo);

    fn config_get_float(&self, item: ConfigHandle) -> (Status, f64);
    fn config_set_float(&self, item: ConfigHandle, value: f64) -> Status;
    fn config_get_string(&self, item: ConfigHandle) -> (Status, String);
    fn config_set_string(&self, item: ConfigHandle, value: &str) -> Status;
    fn config_get_integer(&self, item: ConfigHandle) -> (Status, i64);
    fn config_set_integer(&self, item: ConfigHandle, value: i64) -> Status;
}

/// Device discovery and opening
pub trait Backend {
    type Driver: Driver;

    /// Library version, upper 16 bits version and lower 16 bits revision
    fn version(&self) -> u32;

    /// Rescan attached hardware within the given budget
    fn rescan(&mut self, timeout: Duration) -> Result<Status, DeviceError>;

    /// Devices of a family such as `spectranv6`
    fn enumerate(&self, family: &str) -> Vec<DeviceInfo>;

    /// Open a device for exclusive use. `kind` is `family/mode`,
    /// e.g. `spectranv6/iqtransmitter`.
    fn open(&mut self, kind: &str, serial: &str) -> Result<Device<Self::Driver>, DeviceError>;
}
