//! Device session: lifecycle, packet I/O and config access over a driver

use std::thread;
use std::time::{Duration, Instant};

use super::Driver;
use crate::error::DeviceError;
use crate::protocol::{DeviceState, Packet};
use crate::status::{Status, StatusClass};
use crate::tree::ConfigNode;

/// Classify a driver status, logging warnings
fn check(status: Status, operation: &'static str) -> Result<Status, DeviceError> {
    let status = status.check(operation)?;
    if status.is_warning() {
        tracing::warn!("{}: {}", operation, status);
    }
    Ok(status)
}

/// An opened device
///
/// Config nodes and received packets borrow the session, so none of them
/// can be used once the session is disconnected or closed.
pub struct Device<D: Driver> {
    driver: D,
    kind: String,
    serial: String,
}

impl<D: Driver> Device<D> {
    pub fn new(driver: D, kind: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            driver,
            kind: kind.into(),
            serial: serial.into(),
        }
    }

    /// Device type with mode, e.g. `spectranv6/iqtransmitter`
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // --- Connection lifecycle ---

    pub fn connect(&mut self) -> Result<Status, DeviceError> {
        tracing::debug!("Connecting {} ({})", self.serial, self.kind);
        check(self.driver.connect(), "ConnectDevice")
    }

    pub fn disconnect(&mut self) -> Result<Status, DeviceError> {
        tracing::debug!("Disconnecting {}", self.serial);
        check(self.driver.disconnect(), "DisconnectDevice")
    }

    pub fn start(&mut self) -> Result<Status, DeviceError> {
        check(self.driver.start(), "StartDevice")
    }

    pub fn stop(&mut self) -> Result<Status, DeviceError> {
        check(self.driver.stop(), "StopDevice")
    }

    /// Current state, `None` if the driver reports an unknown code
    pub fn state(&self) -> Option<DeviceState> {
        DeviceState::from_status(self.driver.state())
    }

    /// Poll the device state until it matches `expected`
    pub fn wait_for_state(
        &self,
        expected: DeviceState,
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state();
            if state == Some(expected) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::StateTimeout {
                    expected,
                    last: state,
                });
            }
            thread::sleep(poll);
        }
    }

    /// Device master clock in seconds
    pub fn master_clock_time(&self) -> Result<f64, DeviceError> {
        let (status, time) = self.driver.master_stream_time();
        check(status, "GetMasterStreamTime")?;
        Ok(time)
    }

    // --- Data packets ---

    /// Send a packet to an inbound channel
    ///
    /// A retry advisory is not acted upon here and is reported as failure.
    pub fn send_packet(&self, channel: u32, packet: &Packet<'_>) -> Result<Status, DeviceError> {
        let status = self.driver.send_packet(channel, packet);
        if status == Status::RETRY {
            return Err(DeviceError::Call {
                operation: "SendPacket",
                status,
            });
        }
        check(status, "SendPacket")
    }

    /// Number of packets waiting on an outbound channel
    pub fn available_packets(&mut self, channel: u32) -> Result<usize, DeviceError> {
        let (status, count) = self.driver.avail_packets(channel);
        match check(status, "AvailPackets")?.class() {
            StatusClass::SoftCondition => Ok(0),
            _ => Ok(count),
        }
    }

    /// Peek at a packet in an outbound queue; `None` if the queue is empty
    pub fn get_packet(&mut self, channel: u32, index: usize) -> Result<Option<Packet<'_>>, DeviceError> {
        let (status, packet) = self.driver.get_packet(channel, index);
        match check(status, "GetPacket")?.class() {
            StatusClass::SoftCondition => Ok(None),
            _ => Ok(packet),
        }
    }

    /// Remove packets from the front of an outbound queue
    pub fn consume_packets(&mut self, channel: u32, count: usize) -> Result<Status, DeviceError> {
        check(self.driver.consume_packets(channel, count), "ConsumePackets")
    }

    // --- Configuration ---

    pub fn config_root(&self) -> Result<ConfigNode<'_, D>, DeviceError> {
        let (status, handle) = self.driver.config_root();
        check(status, "ConfigRoot")?;
        Ok(ConfigNode::new(self, handle))
    }

    /// Root of the read-only health/diagnostic tree
    pub fn config_health(&self) -> Result<ConfigNode<'_, D>, DeviceError> {
        let (status, handle) = self.driver.config_health();
        check(status, "ConfigHealth")?;
        Ok(ConfigNode::new(self, handle))
    }

    /// Resolve a `/` separated path from the config root
    pub fn config_find(&self, path: &str) -> Result<Option<ConfigNode<'_, D>>, DeviceError> {
        Ok(self.config_root()?.find(path))
    }

    fn config_require(&self, path: &str) -> Result<ConfigNode<'_, D>, DeviceError> {
        self.config_find(path)?
            .ok_or_else(|| DeviceError::ConfigNotFound(path.to_string()))
    }

    pub fn config_set_float(&self, path: &str, value: f64) -> Result<Status, DeviceError> {
        self.config_require(path)?.set_float(value)
    }

    pub fn config_set_string(&self, path: &str, value: &str) -> Result<Status, DeviceError> {
        self.config_require(path)?.set_string(value)
    }

    pub fn config_set_integer(&self, path: &str, value: i64) -> Result<Status, DeviceError> {
        self.config_require(path)?.set_integer(value)
    }

    pub(crate) fn check_config(&self, status: Status, operation: &'static str) -> Result<Status, DeviceError> {
        check(status, operation)
    }

    /// Close the session, stopping and disconnecting first if needed
    pub fn close(self) {
        tracing::info!("Closing device {}", self.serial);
        drop(self);
    }

    fn shutdown(&mut self) {
        match self.state() {
            Some(DeviceState::Running) | Some(DeviceState::Starting) => {
                if let Err(e) = self.stop() {
                    tracing::warn!("Stop during close failed: {}", e);
                }
                if let Err(e) = self.disconnect() {
                    tracing::warn!("Disconnect during close failed: {}", e);
                }
            }
            Some(DeviceState::Connected) | Some(DeviceState::Connecting) => {
                if let Err(e) = self.disconnect() {
                    tracing::warn!("Disconnect during close failed: {}", e);
                }
            }
            _ => {}
        }
    }
}

impl<D: Driver> Drop for Device<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::device::sim::SimulatedDevice;

    fn device() -> Device<SimulatedDevice> {
        let driver = SimulatedDevice::transmitter(VirtualClock::new(100.0));
        Device::new(driver, "spectranv6/iqtransmitter", "SIM0001")
    }

    #[test]
    fn test_lifecycle() {
        let mut device = device();
        assert_eq!(device.state(), Some(DeviceState::Idle));

        // Starting before connecting is rejected by the driver
        let err = device.start().unwrap_err();
        assert_eq!(err.status(), Some(Status::ERROR_NOT_CONNECTED));

        device.connect().unwrap();
        assert_eq!(device.state(), Some(DeviceState::Connected));
        device.start().unwrap();
        device
            .wait_for_state(DeviceState::Running, Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();

        device.stop().unwrap();
        device.disconnect().unwrap();
        assert_eq!(device.state(), Some(DeviceState::Idle));
    }

    #[test]
    fn test_send_retry_is_failure() {
        let mut device = device();
        device.connect().unwrap();
        device.start().unwrap();
        device
            .wait_for_state(DeviceState::Running, Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        device.driver().fail_send_at(0, Status::RETRY);

        let data = vec![0.0f32; 32];
        let mut packet = Packet::iq(&data);
        packet.start_time = 101.0;
        packet.end_time = 101.1;
        let err = device.send_packet(0, &packet).unwrap_err();
        assert_eq!(err.status(), Some(Status::RETRY));
    }

    #[test]
    fn test_config_setters_by_path() {
        let device = device();
        let status = device.config_set_float("main/centerfreq", 2440.0e6).unwrap();
        assert!(status.is_ok());

        let node = device.config_find("main/centerfreq").unwrap().unwrap();
        assert_eq!(node.get_float().unwrap(), 2440.0e6);

        match device.config_set_float("main/nosuchthing", 1.0) {
            Err(DeviceError::ConfigNotFound(path)) => assert_eq!(path, "main/nosuchthing"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_receive_queue_is_not_failure() {
        let mut device = device();
        assert_eq!(device.available_packets(0).unwrap(), 0);
        assert!(device.get_packet(0, 0).unwrap().is_none());
    }
}
