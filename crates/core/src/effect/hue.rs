//! Hue-sweeping effects: the rainbow family, watercolor, rotator and nebula.

use std::f64::consts::TAU;

use super::{fract, EffectConfig, Xorshift};
use crate::color::Rgb;

const PASTEL_ENTRIES: usize = 20;
const PASTEL_SATURATION: f64 = 0.45;
/// Full hue turns across the strip for the spiral variants.
const SPIRAL_TURNS: f64 = 2.0;
const ROTATOR_HUE_STEP: f64 = 30.0;
const NEBULA_TWINKLE_CHANCE: f64 = 0.004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Style {
    Plain,
    Pastel,
    Spiral,
    PastelSpiral,
}

/// The fixed pastel palette: 20 evenly spaced hues at low saturation.
pub(super) fn pastel_palette() -> [Rgb; PASTEL_ENTRIES] {
    let mut palette = [Rgb::BLACK; PASTEL_ENTRIES];
    for (i, slot) in palette.iter_mut().enumerate() {
        let hue = i as f64 * 360.0 / PASTEL_ENTRIES as f64;
        *slot = Rgb::from_hsv(hue, PASTEL_SATURATION, 1.0);
    }
    palette
}

fn pastel_at(palette: &[Rgb; PASTEL_ENTRIES], position: f64) -> Rgb {
    let scaled = fract(position) * PASTEL_ENTRIES as f64;
    let idx = (scaled as usize).min(PASTEL_ENTRIES - 1);
    let next = (idx + 1) % PASTEL_ENTRIES;
    Rgb::lerp(palette[idx], palette[next], scaled - idx as f64)
}

pub(super) fn rainbow(t: f64, cfg: &EffectConfig, n: usize, style: Style) -> Vec<Rgb> {
    let cycle = t / cfg.speed;
    let palette = pastel_palette();
    (0..n)
        .map(|i| {
            let offset = i as f64 / n as f64;
            let position = match style {
                Style::Plain | Style::Pastel => cycle + offset,
                Style::Spiral | Style::PastelSpiral => cycle + offset * SPIRAL_TURNS,
            };
            match style {
                Style::Plain | Style::Spiral => Rgb::from_hsv(fract(position) * 360.0, 1.0, 1.0),
                Style::Pastel | Style::PastelSpiral => pastel_at(&palette, position),
            }
        })
        .collect()
}

pub(super) fn watercolor(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let cycle = t / cfg.speed;
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            let hue = 180.0 + 180.0 * (TAU * (x + cycle * 0.25)).sin();
            let sat = 0.65 + 0.35 * (TAU * (cycle * 0.5 + x * 2.0)).sin();
            let val = 0.75 + 0.25 * (TAU * (cycle * 0.7 + x)).sin();
            Rgb::from_hsv(hue, sat, val)
        })
        .collect()
}

pub(super) fn rotator(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let base = fract(t / cfg.speed) * 360.0;
    (0..n)
        .map(|i| Rgb::from_hsv(base + i as f64 * ROTATOR_HUE_STEP, 1.0, 1.0))
        .collect()
}

pub(super) fn nebula(t: f64, cfg: &EffectConfig, n: usize, rng: &mut Xorshift) -> Vec<Rgb> {
    let cycle = t / cfg.speed;
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            if rng.chance(NEBULA_TWINKLE_CHANCE) {
                return Rgb::WHITE;
            }
            let hue = 250.0 + 70.0 * (TAU * (x * 1.5 + cycle)).sin();
            let val = 0.55 + 0.45 * (TAU * (x * 3.0 - cycle * 0.5)).sin();
            Rgb::from_hsv(hue, 0.85, val)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pastel_palette_is_soft() {
        let palette = pastel_palette();
        assert_eq!(palette[0], Rgb::from_hsv(0.0, PASTEL_SATURATION, 1.0));
        for c in palette {
            // Low saturation keeps every channel well above zero.
            assert!(c.red > 100 && c.green > 100 && c.blue > 100);
        }
    }

    #[test]
    fn spiral_twists_faster_than_plain() {
        let cfg = EffectConfig {
            speed: 1.0,
            ..EffectConfig::default()
        };
        let plain = rainbow(0.0, &cfg, 8, Style::Plain);
        let spiral = rainbow(0.0, &cfg, 8, Style::Spiral);
        assert_eq!(plain[0], spiral[0]);
        // LED 4 is half way round in the plain rainbow and a full turn in the spiral.
        assert_eq!(plain[4], Rgb::new(0, 255, 255));
        assert_eq!(spiral[4], Rgb::new(255, 0, 0));
    }

    #[test]
    fn rotator_advances_with_time() {
        let cfg = EffectConfig {
            speed: 4.0,
            ..EffectConfig::default()
        };
        let a = rotator(0.0, &cfg, 4);
        let b = rotator(1.0, &cfg, 4);
        assert_ne!(a, b);
        assert_eq!(a[0], Rgb::new(255, 0, 0));
        // A quarter cycle later LED 0 sits at 90 degrees.
        assert_eq!(b[0], Rgb::from_hsv(90.0, 1.0, 1.0));
    }
}
