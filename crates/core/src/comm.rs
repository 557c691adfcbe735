//! Device communication policy: error classification and retry strategies.
//!
//! The framer never retries on its own. Callers that need retries use the
//! helpers here: [`retry_transient`] for fallible operations such as opening
//! a transport, and [`write_with_ack_retry`] for the fan-speed write, which
//! the device may refuse with a non-zero ack status.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::framer::{Framer, RESPONSE_STATUS_OFFSET};
use tracing::{debug, warn};

/// Attempts made by [`retry_transient`] after the first failure.
pub const MAX_RETRIES: u32 = 3;

/// Attempts for a write the device acked with a non-zero status.
pub const ACK_RETRY_ATTEMPTS: u32 = 20;

/// Delay between two ack retries.
pub const ACK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pause between two transient retries.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What a failure says about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Busy or slow; the same call may work a moment later.
    Transient,
    /// The device is gone.
    Disconnected,
    /// The hidraw or tty node is not accessible; usually a missing udev rule.
    PermissionDenied,
    /// The peer sent bytes we refuse to interpret.
    Protocol,
    /// Bad data or a rejected request. Retrying will not help.
    InvalidResponse,
}

/// hidapi and the kernel only report some failures as text.
fn classify_message(msg: &str) -> ErrorClass {
    const GONE: [&str; 3] = ["disconnect", "not found", "no such device"];
    const DENIED: [&str; 3] = ["permission", "access denied", "access is denied"];
    const BUSY: [&str; 3] = ["timeout", "timed out", "busy"];

    let msg = msg.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));
    if any(&GONE) {
        ErrorClass::Disconnected
    } else if any(&DENIED) {
        ErrorClass::PermissionDenied
    } else if any(&BUSY) {
        ErrorClass::Transient
    } else {
        ErrorClass::InvalidResponse
    }
}

impl ErrorClass {
    pub fn classify(err: &Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Timeout(_) => Self::Transient,
            Error::PermissionDenied(_) => Self::PermissionDenied,
            Error::DeviceNotFound(_) | Error::Closed => Self::Disconnected,
            Error::Protocol(_) => Self::Protocol,
            Error::Hid(msg) | Error::HidOpen(msg) => classify_message(msg),
            Error::Io(e) => match e.kind() {
                ErrorKind::PermissionDenied => Self::PermissionDenied,
                ErrorKind::NotFound => Self::Disconnected,
                ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => Self::Transient,
                _ => Self::InvalidResponse,
            },
            Error::OutOfRange { .. }
            | Error::Conflict(_)
            | Error::Profile(_)
            | Error::Store(_)
            | Error::Json(_) => Self::InvalidResponse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        *self == Self::Transient
    }
}

/// Call `op` until it succeeds, fails with a non-transient error, or has
/// been retried `retries` times. Blocks between attempts.
pub fn retry_transient<T>(retries: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        let err = match op() {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let class = ErrorClass::classify(&err);
        if !class.is_retryable() || attempt >= retries {
            warn!(?class, attempts = attempt + 1, error = %err, "giving up");
            return Err(err);
        }
        attempt += 1;
        debug!(attempt, error = %err, "transient failure, retrying");
        std::thread::sleep(TRANSIENT_RETRY_DELAY);
    }
}

/// Ack status of a write response; `None` when the device sent no ack.
pub fn ack_status(response: &[u8]) -> Option<u8> {
    response.get(RESPONSE_STATUS_OFFSET).copied()
}

/// Write a command, repeating it while the device acks with a non-zero
/// status. A missing ack counts as accepted; a failed transaction does not
/// and is not repeated.
///
/// Blocks the calling thread between attempts.
pub fn write_with_ack_retry(
    framer: &Framer,
    endpoint: &[u8],
    payload: &[u8],
    attempts: u32,
    delay: Duration,
) -> bool {
    for attempt in 1..=attempts.max(1) {
        let Ok(ack) = framer.write_command_checked(endpoint, payload, 0) else {
            return false;
        };
        match ack_status(&ack) {
            None | Some(0) => {
                if attempt > 1 {
                    debug!(attempt, "write accepted after retry");
                }
                return true;
            }
            Some(status) => {
                debug!(attempt, status, "device refused write");
                if framer.is_exiting() {
                    break;
                }
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    warn!(
        endpoint = format_args!("{:02X?}", endpoint),
        attempts, "write refused by device"
    );
    false
}
