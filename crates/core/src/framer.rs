//! Packet framer: the open/write/close transaction bracket on top of a
//! [`HidTransport`].
//!
//! Every output report has the layout
//! `[0x00 report id][write marker][command bytes][data]`, zero-padded to the
//! device's report size. Logical operations:
//!
//! - color frame: `close`, `open color endpoint`, `write color`,
//!   `write color continuation`… (no trailing close);
//! - command: `close`, `open(endpoint)`, `write`, `close`;
//! - read: `close`, `open(endpoint)`, `read`, `close`.
//!
//! Payloads carry a 2-byte little-endian length prefix counting the bytes
//! that follow it (data-type tag and data).
//!
//! All transactions of one device are serialized by the transport mutex.
//! Transaction errors are logged and surface as empty results.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::device::{CommandTable, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::transport::{HidTransport, TransportInfo, DEFAULT_READ_TIMEOUT_MS};

/// Report id and write marker in front of every command.
const REPORT_PREFIX_LEN: usize = 2;
/// Size of the little-endian length prefix on payloads.
pub const LENGTH_PREFIX_LEN: usize = 2;
/// Index of the ack status byte in a response.
pub const RESPONSE_STATUS_OFFSET: usize = 2;
/// First data byte of a response.
pub const RESPONSE_DATA_OFFSET: usize = 3;

/// Prefix `body` with its length as a u16 LE, adjusted by `extra_len_adjust`.
pub fn length_prefixed(body: &[u8], extra_len_adjust: i32) -> Vec<u8> {
    let len = (body.len() as i64 + extra_len_adjust as i64).clamp(0, u16::MAX as i64) as u16;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Color payload: `[len u16 LE][data type][colors]`.
pub fn color_payload(data_type: [u8; 2], colors: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + colors.len());
    body.extend_from_slice(&data_type);
    body.extend_from_slice(colors);
    length_prefixed(&body, 0)
}

/// Per-device transaction layer.
pub struct Framer {
    transport: Mutex<Option<Box<dyn HidTransport>>>,
    commands: &'static CommandTable,
    report_size: usize,
    exit: AtomicBool,
}

/// Exclusive access to the transport for a multi-step sequence.
pub struct FramerGuard<'a> {
    framer: &'a Framer,
    transport: MutexGuard<'a, Option<Box<dyn HidTransport>>>,
}

impl Framer {
    pub fn new(transport: Box<dyn HidTransport>, descriptor: &DeviceDescriptor) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            commands: descriptor.commands,
            report_size: descriptor.report_size,
            exit: AtomicBool::new(false),
        }
    }

    pub fn commands(&self) -> &'static CommandTable {
        self.commands
    }

    /// Largest data slice carried by one report after `command`.
    pub fn max_chunk(&self, command: &[u8]) -> usize {
        self.report_size
            .saturating_sub(REPORT_PREFIX_LEN + command.len())
            .max(1)
    }

    /// Mark the device as exiting: reads short-circuit, writes still go out.
    pub fn set_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Drop the transport. Every later transaction fails with `Closed`.
    pub fn close(&self) {
        if self.transport.lock().take().is_some() {
            debug!("transport closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.lock().is_none()
    }

    /// Descriptor strings of the underlying transport.
    pub fn info(&self) -> TransportInfo {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.info())
            .unwrap_or_default()
    }

    /// Take the transport lock for a sequence of brackets.
    pub fn lock(&self) -> FramerGuard<'_> {
        FramerGuard {
            framer: self,
            transport: self.transport.lock(),
        }
    }

    /// Split a color buffer into the data slices written per report.
    pub fn color_chunks(&self, colors: &[u8]) -> Vec<Vec<u8>> {
        let payload = color_payload(self.commands.data_type_color, colors);
        let first = self.max_chunk(self.commands.write_color);
        let rest = self.max_chunk(self.commands.write_color_continuation);
        let mut chunks = Vec::new();
        let split = first.min(payload.len());
        chunks.push(payload[..split].to_vec());
        chunks.extend(payload[split..].chunks(rest).map(<[u8]>::to_vec));
        chunks
    }

    /// Write one color frame. Returns false when any report failed.
    pub fn write_frame(&self, colors: &[u8]) -> bool {
        self.lock().write_frame(colors)
    }

    /// Build a color frame once the transport lock is held and write it.
    /// Nothing is written when `build` returns `None`.
    pub fn write_frame_with(&self, build: impl FnOnce() -> Option<Vec<u8>>) -> bool {
        let mut guard = self.lock();
        match build() {
            Some(colors) => guard.write_frame(&colors),
            None => false,
        }
    }

    /// Write `payload` to `endpoint`; returns the write ack.
    pub fn write_command(&self, endpoint: &[u8], payload: &[u8], extra_len_adjust: i32) -> Vec<u8> {
        self.lock().write_command(endpoint, payload, extra_len_adjust)
    }

    /// Like [`Framer::write_command`], but a failed transaction is an
    /// error instead of an empty ack.
    pub fn write_command_checked(&self, endpoint: &[u8], payload: &[u8], extra_len_adjust: i32) -> Result<Vec<u8>> {
        let guard = self.lock();
        guard
            .try_write_command(endpoint, payload, extra_len_adjust)
            .inspect_err(|e| guard.log_failure("write_command", e))
    }

    /// Read `endpoint`; returns response data, empty on error or exit.
    pub fn read_endpoint(&self, endpoint: &[u8]) -> Vec<u8> {
        self.lock().read_endpoint(endpoint)
    }

    /// Single raw transaction outside any bracket (mode switches, firmware).
    pub fn transfer(&self, command: &[u8], data: &[u8]) -> Vec<u8> {
        self.lock().transfer(command, data)
    }
}

impl FramerGuard<'_> {
    fn report(&self, command: &[u8], data: &[u8]) -> Vec<u8> {
        let size = self
            .framer
            .report_size
            .max(REPORT_PREFIX_LEN + command.len() + data.len());
        let mut buf = Vec::with_capacity(size);
        buf.push(0x00);
        buf.push(self.framer.commands.write_marker);
        buf.extend_from_slice(command);
        buf.extend_from_slice(data);
        buf.resize(size, 0x00);
        buf
    }

    fn exchange(&self, command: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let transport = self.transport.as_ref().ok_or(Error::Closed)?;
        let report = self.report(command, data);
        transport.write_report(&report)?;
        if self.framer.is_exiting() {
            return Ok(Vec::new());
        }
        transport.read_report(DEFAULT_READ_TIMEOUT_MS)
    }

    fn log_failure(&self, op: &'static str, err: &Error) {
        warn!(op, error = %err, "HID transaction failed");
    }

    /// Raw transaction; see [`Framer::transfer`].
    pub fn transfer(&mut self, command: &[u8], data: &[u8]) -> Vec<u8> {
        match self.exchange(command, data) {
            Ok(resp) => resp,
            Err(e) => {
                self.log_failure("transfer", &e);
                Vec::new()
            }
        }
    }

    fn try_write_frame(&self, colors: &[u8]) -> Result<()> {
        let cmd = self.framer.commands;
        self.exchange(cmd.close_endpoint, cmd.endpoints.color)?;
        self.exchange(cmd.open_color_endpoint, cmd.endpoints.color)?;
        for (i, chunk) in self.framer.color_chunks(colors).iter().enumerate() {
            let command = if i == 0 {
                cmd.write_color
            } else {
                cmd.write_color_continuation
            };
            self.exchange(command, chunk)?;
        }
        trace!(bytes = colors.len(), "color frame written");
        Ok(())
    }

    pub fn write_frame(&mut self, colors: &[u8]) -> bool {
        match self.try_write_frame(colors) {
            Ok(()) => true,
            Err(e) => {
                self.log_failure("write_frame", &e);
                false
            }
        }
    }

    fn try_write_command(&self, endpoint: &[u8], payload: &[u8], adjust: i32) -> Result<Vec<u8>> {
        let cmd = self.framer.commands;
        self.exchange(cmd.close_endpoint, endpoint)?;
        self.exchange(cmd.open_endpoint, endpoint)?;
        let ack = self.exchange(cmd.write, &length_prefixed(payload, adjust))?;
        self.exchange(cmd.close_endpoint, endpoint)?;
        Ok(ack)
    }

    pub fn write_command(&mut self, endpoint: &[u8], payload: &[u8], extra_len_adjust: i32) -> Vec<u8> {
        match self.try_write_command(endpoint, payload, extra_len_adjust) {
            Ok(ack) => ack,
            Err(e) => {
                self.log_failure("write_command", &e);
                Vec::new()
            }
        }
    }

    fn try_read_endpoint(&self, endpoint: &[u8]) -> Result<Vec<u8>> {
        if self.framer.is_exiting() {
            return Ok(Vec::new());
        }
        let cmd = self.framer.commands;
        self.exchange(cmd.close_endpoint, endpoint)?;
        self.exchange(cmd.open_endpoint, endpoint)?;
        let resp = self.exchange(cmd.read, endpoint)?;
        self.exchange(cmd.close_endpoint, endpoint)?;
        Ok(resp.get(RESPONSE_DATA_OFFSET..).unwrap_or_default().to_vec())
    }

    pub fn read_endpoint(&mut self, endpoint: &[u8]) -> Vec<u8> {
        match self.try_read_endpoint(endpoint) {
            Ok(data) => data,
            Err(e) => {
                self.log_failure("read_endpoint", &e);
                Vec::new()
            }
        }
    }
}
