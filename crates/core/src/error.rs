//! Error types for open-link-hub-core.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID device communication failure.
    #[error("HID error: {0}")]
    Hid(String),

    /// Device not found during enumeration.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The transport could not be opened.
    #[error("unable to open HID device: {0}")]
    HidOpen(String),

    /// The device was stopped; no further I/O is possible.
    #[error("device is closed")]
    Closed,

    /// Value out of safe range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Two mutually exclusive settings were requested together.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Profile validation or lookup error.
    #[error("profile error: {0}")]
    Profile(String),

    /// Blob store failure (bad key, missing directory, ...).
    #[error("store error: {0}")]
    Store(String),

    /// Malformed packet on the external color target protocol or HID response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Permission denied (likely missing udev rule).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes returned by configuration operations.
///
/// The numeric values are consumed by external front-ends and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Generic failure or rejected validation.
    Failure = 0,
    Ok = 1,
    /// The profile is active and cannot be deleted.
    ProfileActive = 2,
    /// A liquid-temperature speed profile was assigned to a device without a pump.
    PumpRequired = 3,
    /// External integration and RGB cluster are mutually exclusive.
    SourceConflict = 4,
    /// The requested DPI stage does not exist.
    MissingDpiStage = 5,
    /// The profile file could not be removed from the store.
    RemoveFailed = 6,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Status::Failure.code(), 0);
        assert_eq!(Status::Ok.code(), 1);
        assert_eq!(Status::ProfileActive.code(), 2);
        assert_eq!(Status::PumpRequired.code(), 3);
        assert_eq!(Status::SourceConflict.code(), 4);
        assert_eq!(Status::MissingDpiStage.code(), 5);
        assert_eq!(Status::RemoveFailed.code(), 6);
    }

    #[test]
    fn out_of_range_message_names_field() {
        let err = Error::OutOfRange {
            field: "brightness",
            value: 120,
            min: 0,
            max: 100,
        };
        assert_eq!(
            err.to_string(),
            "value out of range: brightness = 120 (allowed 0..=100)"
        );
    }
}
