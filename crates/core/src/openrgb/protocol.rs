//! Wire format of the external color target.
//!
//! Every packet starts with a 16-byte header: the magic `ORGB` followed by
//! little-endian `u32` device id, packet type and payload size. Strings are
//! `u16 length (including NUL) | bytes | 0`.

use crate::error::{Error, Result};

use super::{ExternalController, ZoneType};

pub const MAGIC: [u8; 4] = *b"ORGB";
pub const HEADER_LEN: usize = 16;
/// Protocol revision spoken by this server.
pub const PROTOCOL_VERSION: u32 = 4;
/// Upper bound on an accepted payload.
pub const MAX_PAYLOAD: u32 = 1 << 20;

/// Packet type codes.
pub mod packet {
    pub const REQUEST_CONTROLLER_COUNT: u32 = 0;
    pub const REQUEST_CONTROLLER_DATA: u32 = 1;
    pub const REQUEST_PROTOCOL_VERSION: u32 = 40;
    pub const SET_CLIENT_NAME: u32 = 50;
    pub const DEVICE_LIST_UPDATED: u32 = 100;
    pub const UPDATE_LEDS: u32 = 1050;
    pub const UPDATE_ZONE_LEDS: u32 = 1051;
    pub const UPDATE_SINGLE_LED: u32 = 1052;
    pub const SET_CUSTOM_MODE: u32 = 1100;
    pub const UPDATE_MODE: u32 = 1101;
}

/// Mode flag: the mode accepts per-LED colors.
const MODE_FLAG_HAS_PER_LED_COLOR: u32 = 1 << 5;
/// Mode color mode: per-LED.
const MODE_COLORS_PER_LED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub device_id: u32,
    pub packet_type: u32,
    pub size: u32,
}

impl Header {
    pub fn new(device_id: u32, packet_type: u32, size: u32) -> Self {
        Self {
            device_id,
            packet_type,
            size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.device_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.packet_type.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        if raw[..4] != MAGIC {
            return Err(Error::Protocol(format!("bad magic {:02X?}", &raw[..4])));
        }
        let header = Self {
            device_id: u32_at(raw, 4),
            packet_type: u32_at(raw, 8),
            size: u32_at(raw, 12),
        };
        if header.size > MAX_PAYLOAD {
            return Err(Error::Protocol(format!("payload of {} bytes", header.size)));
        }
        Ok(header)
    }
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Header plus payload, ready to send.
pub fn frame(device_id: u32, packet_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&Header::new(device_id, packet_type, payload.len() as u32).encode());
    out.extend_from_slice(payload);
    out
}

/// Little-endian payload builder.
#[derive(Debug, Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn string(&mut self, s: &str) -> &mut Self {
        self.u16((s.len() + 1) as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }
}

/// Little-endian payload reader; every short read is a protocol error.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let out = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::Protocol(format!("payload truncated at {}", self.pos)))?;
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `count` colors as `r,g,b,pad`; returns `R,G,B` bytes.
    fn colors(&mut self, count: usize) -> Result<Vec<u8>> {
        let raw = self.take(count * 4)?;
        Ok(raw.chunks_exact(4).flat_map(|c| [c[0], c[1], c[2]]).collect())
    }
}

/// Payload of a controller-count reply.
pub fn controller_count(count: u32) -> Vec<u8> {
    count.to_le_bytes().to_vec()
}

/// Payload of a protocol-version reply.
pub fn protocol_version() -> Vec<u8> {
    PROTOCOL_VERSION.to_le_bytes().to_vec()
}

/// Client name from a set-name payload, trailing NULs trimmed.
pub fn client_name(payload: &[u8]) -> String {
    let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Serialized controller description, `data_size`-prefixed.
pub fn controller_data(controller: &ExternalController) -> Vec<u8> {
    let mut w = Writer::default();
    w.u32(controller.device_type as u32)
        .string(&controller.name)
        .string(&controller.vendor)
        .string(&controller.description)
        .string(&controller.firmware)
        .string(&controller.serial)
        .string(&controller.location);

    // Modes: a single "Direct" mode, active.
    w.u16(1).u32(0);
    w.string("Direct")
        .u32(0) // value
        .u32(MODE_FLAG_HAS_PER_LED_COLOR)
        .u32(0) // speed min
        .u32(0) // speed max
        .u32(0) // brightness min
        .u32(0) // brightness max
        .u32(0) // colors min
        .u32(0) // colors max
        .u32(0) // speed
        .u32(0) // brightness
        .u32(0) // direction
        .u32(MODE_COLORS_PER_LED)
        .u16(0);

    w.u16(controller.zones.len() as u16);
    for zone in &controller.zones {
        w.string(&zone.name)
            .u32(zone.zone_type as u32)
            .u32(zone.led_count)
            .u32(zone.led_count)
            .u32(zone.led_count);
        match (&zone.matrix, zone.zone_type) {
            (Some(m), ZoneType::Matrix) => {
                w.u16((8 + m.map.len() * 4) as u16)
                    .u32(m.height)
                    .u32(m.width);
                for cell in &m.map {
                    w.u32(*cell);
                }
            }
            _ => {
                w.u16(0);
            }
        }
        // Segments.
        w.u16(0);
    }

    w.u16(controller.led_names.len() as u16);
    for (i, name) in controller.led_names.iter().enumerate() {
        w.string(name).u32(i as u32);
    }

    let colors = controller.colors();
    w.u16((colors.len() / 3) as u16);
    for c in colors.chunks_exact(3) {
        w.buf.extend_from_slice(&[c[0], c[1], c[2], 0]);
    }

    let mut out = Vec::with_capacity(4 + w.buf.len());
    out.extend_from_slice(&((4 + w.buf.len()) as u32).to_le_bytes());
    out.extend_from_slice(&w.buf);
    out
}

/// Decode an update-LEDs payload into `R,G,B` bytes.
pub fn update_leds(payload: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(payload);
    let total = r.u32()? as usize;
    if total != payload.len() {
        return Err(Error::Protocol(format!(
            "update size {total} != payload {}",
            payload.len()
        )));
    }
    let count = r.u16()? as usize;
    let colors = r.colors(count)?;
    if r.pos != payload.len() {
        return Err(Error::Protocol("trailing bytes after colors".into()));
    }
    Ok(colors)
}

/// Decode an update-zone payload: zone index and its `R,G,B` bytes.
pub fn update_zone_leds(payload: &[u8]) -> Result<(u32, Vec<u8>)> {
    let mut r = Reader::new(payload);
    let total = r.u32()? as usize;
    if total != payload.len() {
        return Err(Error::Protocol(format!(
            "zone update size {total} != payload {}",
            payload.len()
        )));
    }
    let zone = r.u32()?;
    let count = r.u16()? as usize;
    Ok((zone, r.colors(count)?))
}

/// Decode a single-LED payload: LED index and its color.
pub fn update_single_led(payload: &[u8]) -> Result<(u32, [u8; 3])> {
    let mut r = Reader::new(payload);
    let index = r.u32()?;
    let c = r.colors(1)?;
    Ok((index, [c[0], c[1], c[2]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openrgb::{DeviceType, ExternalZone, Matrix};
    use crate::sink::ColorSink;
    use std::sync::Arc;

    struct Null;

    impl ColorSink for Null {
        fn write(&self, _buffer: &[u8], _channel: u8) -> bool {
            true
        }
    }

    #[test]
    fn header_round_trip_and_magic_check() {
        let h = Header::new(2, packet::UPDATE_LEDS, 18);
        let raw = h.encode();
        assert_eq!(&raw[..4], b"ORGB");
        assert_eq!(Header::decode(&raw).unwrap(), h);

        let mut bad = raw;
        bad[0] = b'X';
        assert!(Header::decode(&bad).is_err());

        let huge = Header::new(0, 1, MAX_PAYLOAD + 1).encode();
        assert!(Header::decode(&huge).is_err());
    }

    #[test]
    fn client_name_trims_nuls() {
        assert_eq!(client_name(b"viewer\0\0"), "viewer");
        assert_eq!(client_name(b"\0"), "");
    }

    #[test]
    fn update_leds_drops_padding() {
        let payload = [
            18, 0, 0, 0, 3, 0, 0xFF, 0, 0, 0, 0, 0xFF, 0, 0, 0, 0, 0xFF, 0,
        ];
        assert_eq!(
            update_leds(&payload).unwrap(),
            vec![0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF]
        );
    }

    #[test]
    fn update_leds_rejects_size_mismatch() {
        assert!(update_leds(&[10, 0, 0, 0, 1, 0, 1, 2, 3, 0]).is_err());
        assert!(update_leds(&[12, 0, 0, 0, 2, 0, 1, 2, 3, 0, 0, 0]).is_err());
        assert!(update_leds(&[1, 0]).is_err());
    }

    #[test]
    fn single_led_payload() {
        assert_eq!(
            update_single_led(&[2, 0, 0, 0, 9, 8, 7, 0]).unwrap(),
            (2, [9, 8, 7])
        );
    }

    #[test]
    fn controller_data_layout() {
        let controller = ExternalController::new(
            DeviceType::Mouse,
            "Mouse",
            "SER",
            "1.2.3",
            vec![
                ExternalZone::linear("Logo", 1),
                ExternalZone {
                    name: "Grid".into(),
                    zone_type: ZoneType::Matrix,
                    led_count: 1,
                    matrix: Some(Matrix {
                        height: 1,
                        width: 1,
                        map: vec![1],
                    }),
                },
            ],
            Arc::new(Null),
        );
        let data = controller_data(&controller);
        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        assert_eq!(size, data.len());
        assert_eq!(u32::from_le_bytes([data[4], data[5], data[6], data[7]]), 6);
        // name string: len 6 ("Mouse" + NUL)
        assert_eq!(&data[8..10], &[6, 0]);
        assert_eq!(&data[10..16], b"Mouse\0");
        // two LEDs, black, at the tail
        assert_eq!(&data[data.len() - 10..], &[2, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let direct = data.windows(7).position(|w| w == b"Direct\0");
        assert!(direct.is_some());
    }
}
