//! tty transport for PSUs reached through the USB-serial dongle.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::codec;
use crate::error::{Error, Result};
use crate::transport::{HidTransport, TransportInfo};

/// Register byte plus a 16-bit value.
const BODY_LEN: usize = 3;

/// Serial link to the PSU dongle, 115200 baud 8N1 in raw mode.
pub struct SerialTransport {
    file: File,
    path: String,
    pending: Mutex<Vec<u8>>,
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(path)
            .map_err(|e| Error::HidOpen(format!("{path}: {e}")))?;
        configure(&file).map_err(|e| Error::HidOpen(format!("{path}: {e}")))?;
        debug!(path, "serial link opened");
        Ok(Self {
            file,
            path: path.to_string(),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Wait up to `timeout_ms` for the tty to become readable.
    fn wait_readable(&self, timeout_ms: i32) -> Result<bool> {
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, timeout).map_err(std::io::Error::from)?;
        Ok(ready > 0)
    }

    /// Split a complete frame off the pending buffer.
    fn take_frame(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
        let end = pending.iter().position(|b| *b == codec::TERMINATOR)?;
        let frame: Vec<u8> = pending.drain(..=end).collect();
        Some(frame)
    }
}

fn configure(file: &File) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, BaudRate::B115200)?;
    tio.control_flags &=
        !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE | ControlFlags::CRTSCTS);
    tio.control_flags |= ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;
    termios::tcflush(file, FlushArg::TCIOFLUSH)
}

impl HidTransport for SerialTransport {
    /// Takes a framed report `[id][marker][op][register, value...]`. The op
    /// becomes the command symbol; register and value are nibble-encoded and
    /// the report padding is dropped.
    fn write_report(&self, data: &[u8]) -> Result<usize> {
        let command = data.get(2).copied().unwrap_or(0);
        let body = data.get(3..).unwrap_or_default();
        let body = &body[..body.len().min(BODY_LEN)];
        let frame = codec::encode(command, body);
        trace!(frame_hex = format_args!("{:02X?}", frame), "serial TX");
        (&self.file).write_all(&frame)?;
        Ok(data.len())
    }

    /// Returns `[0x00, command, data...]` so responses line up with HID
    /// reports.
    fn read_report(&self, timeout_ms: i32) -> Result<Vec<u8>> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(frame) = Self::take_frame(&mut pending) {
                trace!(frame_hex = format_args!("{:02X?}", frame), "serial RX");
                let (command, data) = codec::decode(&frame)?;
                let mut report = Vec::with_capacity(2 + data.len());
                report.push(0x00);
                report.push(command);
                report.extend_from_slice(&data);
                return Ok(report);
            }
            if !self.wait_readable(timeout_ms)? {
                return Ok(Vec::new());
            }
            let mut buf = [0u8; 256];
            let n = (&self.file).read(&mut buf)?;
            if n == 0 {
                return Ok(Vec::new());
            }
            pending.extend_from_slice(&buf[..n]);
        }
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            manufacturer: crate::openrgb::VENDOR.to_string(),
            product: "PSU serial dongle".to_string(),
            serial: self.path.rsplit('/').next().unwrap_or_default().to_string(),
        }
    }
}
