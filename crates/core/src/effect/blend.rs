//! Two-color and palette blends: pulse, shift, warp, gradient, wave and the
//! random per-LED effects (flickering, storm).

use std::f64::consts::TAU;

use super::{fract, EffectConfig, Xorshift};
use crate::color::Rgb;

const FLICKER_CHANCE: f64 = 0.5;
const STORM_FLASH_CHANCE: f64 = 0.03;

pub(super) fn color_pulse(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let phase = fract(t / cfg.speed);
    vec![Rgb::lerp(cfg.start, cfg.end, phase); n]
}

/// Phase that runs 0→1 on even cycles and 1→0 on odd cycles.
fn ping_pong(t: f64, speed: f64) -> (u64, f64) {
    let position = t / speed;
    let cycle = position.floor() as u64;
    let phase = fract(position);
    if cycle % 2 == 0 {
        (cycle, phase)
    } else {
        (cycle, 1.0 - phase)
    }
}

pub(super) fn color_shift(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let (_, phase) = ping_pong(t, cfg.speed);
    vec![Rgb::lerp(cfg.start, cfg.end, phase); n]
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct WarpState {
    end: Rgb,
    last_cycle: u64,
}

impl WarpState {
    pub(super) fn new(end: Rgb) -> Self {
        Self { end, last_cycle: 0 }
    }
}

/// Color shift whose end color is redrawn each time the blend returns to the
/// start color.
pub(super) fn color_warp(
    t: f64,
    cfg: &EffectConfig,
    n: usize,
    state: &mut WarpState,
    rng: &mut Xorshift,
) -> Vec<Rgb> {
    let (cycle, phase) = ping_pong(t, cfg.speed);
    if cycle != state.last_cycle {
        // Even cycles start at the start color: that is the wrap-around.
        if cycle % 2 == 0 {
            state.end = rng.color();
        }
        state.last_cycle = cycle;
    }
    vec![Rgb::lerp(cfg.start, state.end, phase); n]
}

/// Sample a looping palette at `position` in `[0, 1)`.
pub(super) fn sample_palette(palette: &[Rgb], position: f64) -> Rgb {
    match palette.len() {
        0 => Rgb::BLACK,
        1 => palette[0],
        len => {
            let scaled = fract(position) * len as f64;
            let idx = (scaled as usize).min(len - 1);
            let next = (idx + 1) % len;
            Rgb::lerp(palette[idx], palette[next], scaled - idx as f64)
        }
    }
}

pub(super) fn gradient(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let fallback = [cfg.start, cfg.end];
    let palette: &[Rgb] = if cfg.gradient.is_empty() {
        &fallback
    } else {
        &cfg.gradient
    };
    let cycle = t / cfg.speed;
    (0..n)
        .map(|i| sample_palette(palette, cycle + i as f64 / n as f64))
        .collect()
}

pub(super) fn flickering(cfg: &EffectConfig, n: usize, rng: &mut Xorshift) -> Vec<Rgb> {
    (0..n)
        .map(|_| {
            if rng.chance(FLICKER_CHANCE) {
                cfg.start
            } else {
                Rgb::BLACK
            }
        })
        .collect()
}

pub(super) fn storm(cfg: &EffectConfig, n: usize, rng: &mut Xorshift) -> Vec<Rgb> {
    (0..n)
        .map(|_| {
            if rng.chance(STORM_FLASH_CHANCE) {
                cfg.end
            } else {
                cfg.start
            }
        })
        .collect()
}

pub(super) fn wave(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let cycle = t / cfg.speed;
    let span = n.saturating_sub(1).max(1) as f64;
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            let intensity = (1.0 + (TAU * (cycle + x)).sin()) / 2.0;
            Rgb::lerp(cfg.start, cfg.end, i as f64 / span).scale(intensity)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(start: Rgb, end: Rgb, speed: f64) -> EffectConfig {
        EffectConfig {
            start,
            end,
            speed,
            ..EffectConfig::default()
        }
    }

    #[test]
    fn shift_reverses_on_odd_cycles() {
        let c = cfg(Rgb::BLACK, Rgb::WHITE, 1.0);
        assert_eq!(color_shift(0.25, &c, 1)[0], Rgb::new(63, 63, 63));
        assert_eq!(color_shift(1.25, &c, 1)[0], Rgb::new(191, 191, 191));
    }

    #[test]
    fn warp_redraws_end_on_wrap() {
        let c = cfg(Rgb::BLACK, Rgb::WHITE, 1.0);
        let mut state = WarpState::new(c.end);
        let mut rng = Xorshift::new(7);
        color_warp(0.5, &c, 1, &mut state, &mut rng);
        assert_eq!(state.end, Rgb::WHITE);
        color_warp(1.5, &c, 1, &mut state, &mut rng);
        assert_eq!(state.end, Rgb::WHITE, "odd cycle keeps the end color");
        color_warp(2.5, &c, 1, &mut state, &mut rng);
        assert_ne!(state.end, Rgb::WHITE);
    }

    #[test]
    fn gradient_walks_palette() {
        let c = EffectConfig {
            gradient: vec![Rgb::new(255, 0, 0), Rgb::new(0, 255, 0), Rgb::new(0, 0, 255)],
            speed: 3.0,
            ..EffectConfig::default()
        };
        let frame = gradient(0.0, &c, 3);
        assert_eq!(frame[0], Rgb::new(255, 0, 0));
        assert_eq!(frame[1], Rgb::new(0, 255, 0));
        assert_eq!(frame[2], Rgb::new(0, 0, 255));
    }

    #[test]
    fn storm_mostly_start_color() {
        let c = cfg(Rgb::new(0, 0, 40), Rgb::WHITE, 1.0);
        let mut rng = Xorshift::new(99);
        let frame = storm(&c, 1000, &mut rng);
        let flashes = frame.iter().filter(|x| **x == Rgb::WHITE).count();
        assert!(flashes > 0 && flashes < 100, "{flashes} flashes");
    }

    #[test]
    fn flickering_is_base_or_black() {
        let c = cfg(Rgb::new(200, 10, 10), Rgb::WHITE, 1.0);
        let mut rng = Xorshift::new(3);
        for led in flickering(&c, 200, &mut rng) {
            assert!(led == c.start || led == Rgb::BLACK);
        }
    }

    #[test]
    fn wave_peaks_at_quarter_cycle() {
        let c = cfg(Rgb::WHITE, Rgb::WHITE, 1.0);
        let frame = wave(0.25, &c, 1);
        assert_eq!(frame[0], Rgb::WHITE);
        let frame = wave(0.75, &c, 1);
        assert_eq!(frame[0], Rgb::BLACK);
    }
}
