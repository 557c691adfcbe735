//! RGB color primitives shared by the effect engine, the sinks and the
//! external color target.
//!
//! A frame is an ordered list of [`Rgb`] values; on the wire it is flattened
//! to `R,G,B` byte triplets (see [`to_bytes`]).

use serde::{Deserialize, Serialize};

/// A single LED color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Create from HSV (h in degrees, any range; s and v in `[0, 1]`).
    pub fn from_hsv(h: f64, s: f64, v: f64) -> Self {
        let h = h.rem_euclid(360.0);
        let s = s.clamp(0.0, 1.0);
        let v = v.clamp(0.0, 1.0);
        let c = v * s;
        let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
        let m = v - c;
        let (r, g, b) = match (h / 60.0) as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        Self::new(unit_to_byte(r + m), unit_to_byte(g + m), unit_to_byte(b + m))
    }

    /// Scale every component by `factor` in `[0, 1]`, truncating.
    pub fn scale(self, factor: f64) -> Self {
        let f = factor.clamp(0.0, 1.0);
        Self::new(
            (f64::from(self.red) * f) as u8,
            (f64::from(self.green) * f) as u8,
            (f64::from(self.blue) * f) as u8,
        )
    }

    /// Component-wise linear blend; `t = 0` is `a`, `t = 1` is `b`.
    pub fn lerp(a: Rgb, b: Rgb, t: f64) -> Rgb {
        let t = t.clamp(0.0, 1.0);
        let mix = |x: u8, y: u8| (f64::from(x) + (f64::from(y) - f64::from(x)) * t) as u8;
        Rgb::new(
            mix(a.red, b.red),
            mix(a.green, b.green),
            mix(a.blue, b.blue),
        )
    }

    /// Swap red and blue, for devices wired BGR.
    pub fn inverted(self) -> Self {
        Self::new(self.blue, self.green, self.red)
    }

    /// Parse `#RRGGBB` or `RRGGBB`.
    pub fn parse_hex(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self::new(r, g, b))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.red, self.green, self.blue)
    }
}

fn unit_to_byte(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Flatten a frame into `R,G,B` triplets.
pub fn to_bytes(frame: &[Rgb]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() * 3);
    for c in frame {
        out.extend_from_slice(&[c.red, c.green, c.blue]);
    }
    out
}

/// Scale every byte of a flattened frame by `factor`, truncating like
/// [`Rgb::scale`].
pub fn scale_bytes(bytes: &[u8], factor: f64) -> Vec<u8> {
    let f = factor.clamp(0.0, 1.0);
    bytes.iter().map(|b| (f64::from(*b) * f) as u8).collect()
}

/// Rebuild a frame from `R,G,B` triplets; a trailing partial triplet is dropped.
pub fn from_bytes(bytes: &[u8]) -> Vec<Rgb> {
    bytes
        .chunks_exact(3)
        .map(|c| Rgb::new(c[0], c[1], c[2]))
        .collect()
}
