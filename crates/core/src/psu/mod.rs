//! Power supply telemetry over PMBus-style register reads.
//!
//! A register read is the raw transaction `[READ, register]`; the reply
//! carries the value little-endian at bytes 2..4. Rails are selected by
//! writing the PMBus PAGE register first, under one transport lock.

pub mod codec;
pub mod serial;

use serde::Serialize;
use tracing::trace;

use crate::device::DeviceDescriptor;
use crate::framer::Framer;

pub use serial::SerialTransport;

/// Transaction kinds.
const PSU_WRITE: u8 = 0x02;
const PSU_READ: u8 = 0x03;

/// Registers.
pub mod register {
    pub const PAGE: u8 = 0x00;
    pub const READ_VOUT: u8 = 0x8B;
    pub const READ_IOUT: u8 = 0x8C;
    pub const READ_TEMPERATURE_1: u8 = 0x8D;
    pub const READ_TEMPERATURE_2: u8 = 0x8E;
    pub const READ_FAN_SPEED_1: u8 = 0x90;
    pub const READ_POUT: u8 = 0x96;
    /// Vendor register: total output power.
    pub const TOTAL_POWER: u8 = 0xEE;
}

/// Offset of the value in a register reply.
const VALUE_OFFSET: usize = 2;

/// Decode a PMBus LINEAR11 word: 5-bit signed exponent, 11-bit signed
/// mantissa.
pub fn linear11(raw: u16) -> f64 {
    let exponent = ((raw as i16) >> 11) as i32;
    let mantissa = (((raw & 0x07FF) as i16) << 5 >> 5) as i32;
    mantissa as f64 * 2f64.powi(exponent)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RailStats {
    pub name: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PsuStats {
    pub rails: Vec<RailStats>,
    pub total_power: f64,
    pub fan_rpm: f64,
    pub temperatures: Vec<f64>,
}

fn read_register(guard: &mut crate::framer::FramerGuard<'_>, register: u8) -> Option<f64> {
    let resp = guard.transfer(&[PSU_READ, register], &[]);
    let b = resp.get(VALUE_OFFSET..VALUE_OFFSET + 2)?;
    let value = linear11(u16::from_le_bytes([b[0], b[1]]));
    trace!(register = format_args!("0x{register:02X}"), value, "PSU register");
    Some(value)
}

/// Read every rail plus totals. Registers that return nothing read as 0.
pub fn read_stats(framer: &Framer, desc: &DeviceDescriptor) -> Option<PsuStats> {
    if framer.is_exiting() {
        return None;
    }
    let mut guard = framer.lock();
    let mut read = |reg: u8| read_register(&mut guard, reg).unwrap_or(0.0);
    let mut stats = PsuStats {
        total_power: read(register::TOTAL_POWER),
        fan_rpm: read(register::READ_FAN_SPEED_1),
        temperatures: [register::READ_TEMPERATURE_1, register::READ_TEMPERATURE_2]
            .iter()
            .take(desc.temperature_probes as usize)
            .map(|r| read(*r))
            .collect(),
        rails: Vec::with_capacity(desc.rails.len()),
    };
    drop(read);
    for rail in desc.rails {
        guard.transfer(&[PSU_WRITE, register::PAGE], &[rail.page]);
        let mut read = |reg: u8| read_register(&mut guard, reg).unwrap_or(0.0);
        stats.rails.push(RailStats {
            name: rail.name.to_string(),
            voltage: read(register::READ_VOUT),
            current: read(register::READ_IOUT),
            power: read(register::READ_POUT),
        });
    }
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::transport::mock::MockTransport;

    #[test]
    fn linear11_decoding() {
        // exponent -2, mantissa 48 → 12.0
        assert_eq!(linear11(0xF030), 12.0);
        // exponent 0, mantissa 5
        assert_eq!(linear11(0x0005), 5.0);
        // exponent 1, mantissa -1 → -2
        assert_eq!(linear11(0x0FFF), -2.0);
        // exponent -1, mantissa 3 → 1.5
        assert_eq!(linear11(0xF803), 1.5);
    }

    #[test]
    fn stats_cover_every_rail() {
        let mock = MockTransport::new();
        mock.set_default_response(vec![0x00, 0x03, 0x30, 0xF0]);
        let desc = descriptor(VENDOR_ID, pids::HX1200I).unwrap();
        let framer = Framer::new(Box::new(mock.clone()), desc);
        let stats = read_stats(&framer, desc).unwrap();
        assert_eq!(stats.rails.len(), 3);
        assert_eq!(stats.rails[0].name, "12V");
        assert_eq!(stats.rails[2].voltage, 12.0);
        assert_eq!(stats.temperatures.len(), 2);
        // totals (4 reads) + per rail (page + 3 reads)
        assert_eq!(mock.written().len(), 4 + 3 * 4);

        framer.set_exit();
        assert!(read_stats(&framer, desc).is_none());
    }
}
