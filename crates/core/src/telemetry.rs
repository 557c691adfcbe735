//! Telemetry poller: RPM, temperatures, battery and PSU rails.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::device::{DeviceDescriptor, ProductKind};
use crate::framer::Framer;
use crate::psu::{self, PsuStats};

/// Telemetry cadence.
pub const TELEMETRY_TICK: Duration = Duration::from_secs(1);

/// Per-entry status byte meaning "sensor present".
const STATUS_CONNECTED: u8 = 0x00;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanStats {
    pub channel: u8,
    pub connected: bool,
    pub rpm: u16,
    /// Last duty written by the speed controller.
    pub duty: Option<u8>,
}

/// Exported device state, updated under the device's state lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub fans: Vec<FanStats>,
    /// Probe temperatures in °C; `None` for a disconnected probe.
    pub temperatures: Vec<Option<f32>>,
    pub battery: Option<u8>,
    pub psu: Option<PsuStats>,
}

impl DeviceStats {
    /// Reading of probe `index`, if connected.
    pub fn probe(&self, index: usize) -> Option<f32> {
        self.temperatures.get(index).copied().flatten()
    }

    pub fn set_duty(&mut self, channel: u8, duty: u8) {
        match self.fans.iter_mut().find(|f| f.channel == channel) {
            Some(fan) => fan.duty = Some(duty),
            None => self.fans.push(FanStats {
                channel,
                duty: Some(duty),
                ..FanStats::default()
            }),
        }
    }
}

/// Decode a speeds read: `[count][status, rpm u16 LE]…`.
pub fn parse_speeds(data: &[u8]) -> Vec<FanStats> {
    let Some((&count, rest)) = data.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(3)
        .take(count as usize)
        .enumerate()
        .map(|(i, e)| FanStats {
            channel: i as u8,
            connected: e[0] == STATUS_CONNECTED,
            rpm: u16::from_le_bytes([e[1], e[2]]),
            duty: None,
        })
        .collect()
}

/// Decode a temperatures read: `[count][status, tenths i16 LE]…`.
pub fn parse_temperatures(data: &[u8]) -> Vec<Option<f32>> {
    let Some((&count, rest)) = data.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(3)
        .take(count as usize)
        .map(|e| {
            (e[0] == STATUS_CONNECTED).then(|| i16::from_le_bytes([e[1], e[2]]) as f32 / 10.0)
        })
        .collect()
}

/// Decode a battery read: per-mille u16 LE, reported in percent.
pub fn parse_battery(data: &[u8]) -> Option<u8> {
    let b = data.get(..2)?;
    Some((u16::from_le_bytes([b[0], b[1]]) / 10).min(100) as u8)
}

/// Read every sensor the product has and fold the results into `stats`.
///
/// Skipped entirely once the framer is exiting. Blocks on the transport.
pub fn poll(framer: &Framer, desc: &DeviceDescriptor, stats: &Mutex<DeviceStats>) {
    if framer.is_exiting() {
        return;
    }
    let endpoints = framer.commands().endpoints;
    match desc.kind {
        ProductKind::FanHub => {
            let mut fans = parse_speeds(&framer.read_endpoint(endpoints.speeds));
            let temperatures = parse_temperatures(&framer.read_endpoint(endpoints.temperatures));
            trace!(fans = fans.len(), probes = temperatures.len(), "hub telemetry");
            let mut stats = stats.lock();
            for fan in &mut fans {
                fan.duty = stats
                    .fans
                    .iter()
                    .find(|f| f.channel == fan.channel)
                    .and_then(|f| f.duty);
            }
            if !fans.is_empty() {
                stats.fans = fans;
            }
            if !temperatures.is_empty() {
                stats.temperatures = temperatures;
            }
        }
        ProductKind::Mouse if desc.wireless => {
            if let Some(level) = parse_battery(&framer.read_endpoint(endpoints.battery)) {
                stats.lock().battery = Some(level);
            }
        }
        ProductKind::Psu => {
            if let Some(psu_stats) = psu::read_stats(framer, desc) {
                let mut stats = stats.lock();
                stats.temperatures = psu_stats.temperatures.iter().map(|t| Some(*t as f32)).collect();
                stats.psu = Some(psu_stats);
            }
        }
        ProductKind::Mouse | ProductKind::Mousepad => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::transport::mock::MockTransport;

    #[test]
    fn speeds_decode() {
        let data = [3, 0x00, 0xDC, 0x05, 0x01, 0x00, 0x00, 0x00, 0x20, 0x03, 0xFF];
        let fans = parse_speeds(&data);
        assert_eq!(fans.len(), 3);
        assert_eq!(fans[0].rpm, 1500);
        assert!(fans[0].connected);
        assert!(!fans[1].connected);
        assert_eq!(fans[2].rpm, 800);
        assert!(parse_speeds(&[]).is_empty());
    }

    #[test]
    fn temperatures_decode_tenths() {
        let data = [2, 0x00, 0x2C, 0x01, 0x01, 0x00, 0x00];
        assert_eq!(parse_temperatures(&data), vec![Some(30.0), None]);
        assert_eq!(parse_temperatures(&[1, 0x00, 0xF6, 0xFF]), vec![Some(-1.0)]);
    }

    #[test]
    fn battery_is_percent() {
        assert_eq!(parse_battery(&[0xE8, 0x03]), Some(100));
        assert_eq!(parse_battery(&[0x2C, 0x01]), Some(30));
        assert_eq!(parse_battery(&[0x01]), None);
    }

    #[test]
    fn hub_poll_keeps_written_duty() {
        let desc = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        let mock = MockTransport::new();
        let framer = Framer::new(Box::new(mock.clone()), desc);
        // close, open, read, close for speeds then temperatures
        for r in [
            vec![],
            vec![],
            vec![0x08, 0x01, 0x00, 1, 0x00, 0xE8, 0x03],
            vec![],
            vec![],
            vec![],
            vec![0x08, 0x01, 0x00, 1, 0x00, 0x5E, 0x01],
            vec![],
        ] {
            mock.push_response(r);
        }
        let stats = Mutex::new(DeviceStats::default());
        stats.lock().set_duty(0, 45);
        poll(&framer, desc, &stats);
        let s = stats.lock();
        assert_eq!(s.fans[0].rpm, 1000);
        assert_eq!(s.fans[0].duty, Some(45));
        assert_eq!(s.probe(0), Some(35.0));
    }

    #[test]
    fn poll_skips_when_exiting() {
        let desc = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        let mock = MockTransport::new();
        let framer = Framer::new(Box::new(mock.clone()), desc);
        framer.set_exit();
        let stats = Mutex::new(DeviceStats::default());
        poll(&framer, desc, &stats);
        assert!(mock.written().is_empty());
        assert_eq!(*stats.lock(), DeviceStats::default());
    }
}
