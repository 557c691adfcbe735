//! HID transport abstraction for device communication.
//!
//! Provides a trait-based transport layer so that real HID devices, the PSU
//! serial dongle and mock devices share the same interface.

use crate::error::{Error, Result};
use tracing::{debug, trace};

/// Report buffer size used for reads.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Default wait for a response to a written report.
pub const DEFAULT_READ_TIMEOUT_MS: i32 = 500;

/// Strings reported by the device descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// Abstraction over raw HID read/write.
pub trait HidTransport: Send {
    /// Write a raw output report. `data[0]` is the report id.
    fn write_report(&self, data: &[u8]) -> Result<usize>;

    /// Read one input report, waiting at most `timeout_ms`.
    /// An empty buffer means the wait timed out.
    fn read_report(&self, timeout_ms: i32) -> Result<Vec<u8>>;

    /// Descriptor strings.
    fn info(&self) -> TransportInfo {
        TransportInfo::default()
    }

    /// Write a report and return the device's response.
    fn send_report(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.write_report(data)?;
        let resp = self.read_report(DEFAULT_READ_TIMEOUT_MS)?;
        if resp.is_empty() {
            return Err(Error::Timeout(format!(
                "no response within {DEFAULT_READ_TIMEOUT_MS}ms"
            )));
        }
        Ok(resp)
    }
}

/// [`HidTransport`] over a hidapi device handle.
pub struct HidapiTransport {
    device: hidapi::HidDevice,
}

impl HidapiTransport {
    /// Open by path when given, otherwise by `(vid, pid, serial)`.
    pub fn open(vendor_id: u16, product_id: u16, serial_or_path: Option<&str>) -> Result<Self> {
        let api = hidapi::HidApi::new().map_err(|e| Error::HidOpen(format!("hidapi init: {e}")))?;
        let device = match serial_or_path {
            Some(p) if p.starts_with('/') => {
                let path = std::ffi::CString::new(p)
                    .map_err(|e| Error::HidOpen(format!("bad path {p}: {e}")))?;
                api.open_path(&path)
            }
            Some(serial) => api.open_serial(vendor_id, product_id, serial),
            None => api.open(vendor_id, product_id),
        }
        .map_err(|e| {
            Error::HidOpen(format!(
                "VID=0x{vendor_id:04X} PID=0x{product_id:04X}: {e}"
            ))
        })?;
        debug!(
            vid = format_args!("0x{:04X}", vendor_id),
            pid = format_args!("0x{:04X}", product_id),
            "HID device opened"
        );
        Ok(Self { device })
    }

    /// Open a specific interface of a device; used for the input endpoint.
    pub fn open_interface(vendor_id: u16, product_id: u16, interface: i32) -> Result<Self> {
        let api = hidapi::HidApi::new().map_err(|e| Error::HidOpen(format!("hidapi init: {e}")))?;
        let info = api
            .device_list()
            .find(|d| {
                d.vendor_id() == vendor_id
                    && d.product_id() == product_id
                    && d.interface_number() == interface
            })
            .ok_or_else(|| {
                Error::DeviceNotFound(format!(
                    "VID=0x{vendor_id:04X} PID=0x{product_id:04X} interface {interface}"
                ))
            })?;
        let device = info
            .open_device(&api)
            .map_err(|e| Error::HidOpen(format!("interface {interface}: {e}")))?;
        Ok(Self { device })
    }
}

impl HidTransport for HidapiTransport {
    fn write_report(&self, data: &[u8]) -> Result<usize> {
        trace!(report_hex = format_args!("{:02X?}", data), "HID TX");
        self.device
            .write(data)
            .map_err(|e| Error::Hid(format!("write: {e}")))
    }

    fn read_report(&self, timeout_ms: i32) -> Result<Vec<u8>> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = self
            .device
            .read_timeout(&mut buf, timeout_ms)
            .map_err(|e| Error::Hid(format!("read_timeout: {e}")))?;
        if n > 0 {
            trace!(report_hex = format_args!("{:02X?}", &buf[..n]), "HID RX");
        }
        Ok(buf[..n].to_vec())
    }

    fn info(&self) -> TransportInfo {
        let get = |r: hidapi::HidResult<Option<String>>| r.ok().flatten().unwrap_or_default();
        TransportInfo {
            manufacturer: get(self.device.get_manufacturer_string()),
            product: get(self.device.get_product_string()),
            serial: get(self.device.get_serial_number_string()),
        }
    }
}

/// A mock HID transport for testing.
///
/// Records every written report and replays queued responses in order. When
/// the queue is empty, reads return the configured default response.
#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct State {
        written: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
        default_response: Vec<u8>,
        fail_writes: bool,
        info: TransportInfo,
    }

    /// Cloneable handle; clones share the same recorded state.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<State>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_info(serial: &str, product: &str) -> Self {
            let mock = Self::new();
            mock.state.lock().info = TransportInfo {
                manufacturer: "Mock".into(),
                product: product.into(),
                serial: serial.into(),
            };
            mock
        }

        /// Queue a response for the next read.
        pub fn push_response(&self, response: Vec<u8>) {
            self.state.lock().responses.push_back(response);
        }

        /// Response returned when the queue is empty.
        pub fn set_default_response(&self, response: Vec<u8>) {
            self.state.lock().default_response = response;
        }

        pub fn fail_writes(&self, fail: bool) {
            self.state.lock().fail_writes = fail;
        }

        /// All reports written so far.
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().written.clone()
        }

        pub fn clear_written(&self) {
            self.state.lock().written.clear();
        }
    }

    impl HidTransport for MockTransport {
        fn write_report(&self, data: &[u8]) -> Result<usize> {
            let mut state = self.state.lock();
            if state.fail_writes {
                return Err(Error::Hid("mock: write failure injected".into()));
            }
            state.written.push(data.to_vec());
            Ok(data.len())
        }

        fn read_report(&self, _timeout_ms: i32) -> Result<Vec<u8>> {
            let mut state = self.state.lock();
            Ok(state
                .responses
                .pop_front()
                .unwrap_or_else(|| state.default_response.clone()))
        }

        fn info(&self) -> TransportInfo {
            self.state.lock().info.clone()
        }
    }
}
