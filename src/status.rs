//! Driver status codes and their classification
//!
//! Every driver primitive returns a 32-bit status word. Bit 31 marks an
//! error, bit 30 (without bit 31) a warning. A handful of low values are
//! informational: `EMPTY` and `RETRY` signal "nothing to do right now"
//! rather than failure, and the `0x1000_000x` range reports device state.

use std::fmt;

use crate::error::DeviceError;

/// Classification of a [`Status`] word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// Operation succeeded
    Ok,
    /// Operation took effect with a caveat (value clamped, option disabled)
    Warning,
    /// Expected non-failure condition such as an empty queue
    SoftCondition,
    /// Operation did not take effect
    Error,
}

/// Raw status word returned by a driver call
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u32);

impl Status {
    pub const OK: Status = Status(0x0000_0000);
    pub const EMPTY: Status = Status(0x0000_0001);
    pub const RETRY: Status = Status(0x0000_0002);

    pub const IDLE: Status = Status(0x1000_0000);
    pub const CONNECTING: Status = Status(0x1000_0001);
    pub const CONNECTED: Status = Status(0x1000_0002);
    pub const STARTING: Status = Status(0x1000_0003);
    pub const RUNNING: Status = Status(0x1000_0004);
    pub const STOPPING: Status = Status(0x1000_0005);
    pub const DISCONNECTING: Status = Status(0x1000_0006);

    pub const WARNING: Status = Status(0x4000_0000);
    pub const WARNING_VALUE_ADJUSTED: Status = Status(0x4000_0001);
    pub const WARNING_VALUE_DISABLED: Status = Status(0x4000_0002);

    pub const ERROR: Status = Status(0x8000_0000);
    pub const ERROR_NOT_INITIALIZED: Status = Status(0x8000_0001);
    pub const ERROR_NOT_FOUND: Status = Status(0x8000_0002);
    pub const ERROR_BUSY: Status = Status(0x8000_0003);
    pub const ERROR_NOT_OPEN: Status = Status(0x8000_0004);
    pub const ERROR_NOT_CONNECTED: Status = Status(0x8000_0005);
    pub const ERROR_INVALID_CONFIG: Status = Status(0x8000_0006);
    pub const ERROR_BUFFER_SIZE: Status = Status(0x8000_0007);
    pub const ERROR_INVALID_CHANNEL: Status = Status(0x8000_0008);
    pub const ERROR_INVALID_PARAMETER: Status = Status(0x8000_0009);
    pub const ERROR_INVALID_SIZE: Status = Status(0x8000_000a);
    pub const ERROR_MISSING_PATHS_FILE: Status = Status(0x8000_000b);
    pub const ERROR_VALUE_INVALID: Status = Status(0x8000_000c);
    pub const ERROR_VALUE_MALFORMED: Status = Status(0x8000_000d);

    /// Error class mask (bit 31)
    pub const ERROR_MASK: u32 = 0x8000_0000;

    /// Warning class mask (bit 30)
    pub const WARNING_MASK: u32 = 0x4000_0000;

    pub const fn from_raw(raw: u32) -> Self {
        Status(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Classify this status word
    pub const fn class(self) -> StatusClass {
        if self.0 & Self::ERROR_MASK != 0 {
            StatusClass::Error
        } else if self.0 & Self::WARNING_MASK != 0 {
            StatusClass::Warning
        } else if self.0 == Self::EMPTY.0 || self.0 == Self::RETRY.0 {
            StatusClass::SoftCondition
        } else {
            StatusClass::Ok
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self.class(), StatusClass::Error)
    }

    pub const fn is_warning(self) -> bool {
        matches!(self.class(), StatusClass::Warning)
    }

    pub const fn is_soft(self) -> bool {
        matches!(self.class(), StatusClass::SoftCondition)
    }

    /// True for exactly `OK`
    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    /// Turn an error-class status into a [`DeviceError`] tagged with the
    /// originating operation. Warnings and soft conditions pass through.
    pub fn check(self, operation: &'static str) -> Result<Status, DeviceError> {
        match self.class() {
            StatusClass::Error => Err(DeviceError::Call {
                operation,
                status: self,
            }),
            _ => Ok(self),
        }
    }

    /// Symbolic name for known codes
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::OK => "OK",
            Self::EMPTY => "EMPTY",
            Self::RETRY => "RETRY",
            Self::IDLE => "IDLE",
            Self::CONNECTING => "CONNECTING",
            Self::CONNECTED => "CONNECTED",
            Self::STARTING => "STARTING",
            Self::RUNNING => "RUNNING",
            Self::STOPPING => "STOPPING",
            Self::DISCONNECTING => "DISCONNECTING",
            Self::WARNING => "WARNING",
            Self::WARNING_VALUE_ADJUSTED => "WARNING_VALUE_ADJUSTED",
            Self::WARNING_VALUE_DISABLED => "WARNING_VALUE_DISABLED",
            Self::ERROR => "ERROR",
            Self::ERROR_NOT_INITIALIZED => "ERROR_NOT_INITIALIZED",
            Self::ERROR_NOT_FOUND => "ERROR_NOT_FOUND",
            Self::ERROR_BUSY => "ERROR_BUSY",
            Self::ERROR_NOT_OPEN => "ERROR_NOT_OPEN",
            Self::ERROR_NOT_CONNECTED => "ERROR_NOT_CONNECTED",
            Self::ERROR_INVALID_CONFIG => "ERROR_INVALID_CONFIG",
            Self::ERROR_BUFFER_SIZE => "ERROR_BUFFER_SIZE",
            Self::ERROR_INVALID_CHANNEL => "ERROR_INVALID_CHANNEL",
            Self::ERROR_INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            Self::ERROR_INVALID_SIZE => "ERROR_INVALID_SIZE",
            Self::ERROR_MISSING_PATHS_FILE => "ERROR_MISSING_PATHS_FILE",
            Self::ERROR_VALUE_INVALID => "ERROR_VALUE_INVALID",
            Self::ERROR_VALUE_MALFORMED => "ERROR_VALUE_MALFORMED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08x})", name, self.0),
            None => write!(f, "UNKNOWN(0x{:08x})", self.0),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<u32> for Status {
    fn from(raw: u32) -> Self {
        Status(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(Status::OK.class(), StatusClass::Ok);
        assert_eq!(Status::EMPTY.class(), StatusClass::SoftCondition);
        assert_eq!(Status::RETRY.class(), StatusClass::SoftCondition);
        assert_eq!(Status::RUNNING.class(), StatusClass::Ok);
        assert_eq!(Status::WARNING_VALUE_ADJUSTED.class(), StatusClass::Warning);
        assert_eq!(Status::ERROR_VALUE_MALFORMED.class(), StatusClass::Error);
    }

    #[test]
    fn test_check_keeps_warnings() {
        let status = Status::WARNING_VALUE_DISABLED.check("ConfigSetString").unwrap();
        assert!(status.is_warning());

        let err = Status::ERROR_BUSY.check("ConnectDevice").unwrap_err();
        match err {
            DeviceError::Call { operation, status } => {
                assert_eq!(operation, "ConnectDevice");
                assert_eq!(status, Status::ERROR_BUSY);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::ERROR_BUSY.to_string(), "ERROR_BUSY (0x80000003)");
        assert_eq!(Status::from_raw(0x1234).to_string(), "UNKNOWN(0x00001234)");
    }

    proptest! {
        #[test]
        fn error_bit_always_wins(k in any::<u32>()) {
            let status = Status::from_raw(Status::ERROR_MASK | k);
            prop_assert_eq!(status.class(), StatusClass::Error);
        }

        #[test]
        fn warning_bit_without_error_bit(k in 0u32..0x4000_0000) {
            let status = Status::from_raw(Status::WARNING_MASK | k);
            prop_assert_eq!(status.class(), StatusClass::Warning);
        }

        #[test]
        fn low_codes_never_fail(k in 3u32..0x4000_0000) {
            prop_assert_eq!(Status::from_raw(k).class(), StatusClass::Ok);
        }
    }
}
