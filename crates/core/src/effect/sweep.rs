//! Position-based effects: fills, spinners, the visor bar, marquee and the
//! two stateful reveals (sequential, rotary stack).

use super::{fract, EffectConfig, Xorshift};
use crate::color::Rgb;

/// Marquee pattern length (2 on, 2 off).
const MARQUEE_PERIOD: usize = 4;
/// Marquee steps per speed cycle.
const MARQUEE_STEPS: f64 = 4.0;

fn lit_count(progress: f64, n: usize) -> usize {
    ((progress * n as f64).floor() as usize).min(n)
}

pub(super) fn circle(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let progress = fract(t / cfg.speed);
    let lit = lit_count(progress, n);
    let color = Rgb::lerp(cfg.start, cfg.end, progress);
    (0..n)
        .map(|i| if i < lit { color } else { Rgb::BLACK })
        .collect()
}

pub(super) fn circle_shift(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let progress = fract(t / cfg.speed);
    let lit = lit_count(progress, n);
    let span = n.saturating_sub(1).max(1) as f64;
    (0..n)
        .map(|i| {
            if i < lit {
                Rgb::lerp(cfg.start, cfg.end, i as f64 / span)
            } else {
                Rgb::BLACK
            }
        })
        .collect()
}

pub(super) fn spinner(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let progress = fract(t / cfg.speed);
    let pos = lit_count(progress, n).min(n - 1);
    (0..n)
        .map(|i| if i == pos { cfg.start } else { Rgb::BLACK })
        .collect()
}

/// Bar position bouncing over `[0, n-1]`; the bar covers `n` LEDs per `speed`
/// seconds.
fn visor_position(t: f64, speed: f64, n: usize) -> f64 {
    let length = n.saturating_sub(1) as f64;
    if length == 0.0 {
        return 0.0;
    }
    let travelled = t * n as f64 / speed;
    let d = travelled % (2.0 * length);
    if d <= length {
        d
    } else {
        2.0 * length - d
    }
}

pub(super) fn visor(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let pos = visor_position(t, cfg.speed, n);
    let sigma = (n as f64 / 8.0).max(1.0);
    (0..n)
        .map(|i| {
            let d = i as f64 - pos;
            let intensity = (-(d * d) / (2.0 * sigma * sigma)).exp();
            Rgb::lerp(cfg.end, cfg.start, intensity).scale(intensity)
        })
        .collect()
}

pub(super) fn marquee(t: f64, cfg: &EffectConfig, n: usize) -> Vec<Rgb> {
    let shift = (t / cfg.speed * MARQUEE_STEPS).floor() as usize;
    (0..n)
        .map(|i| {
            if (i + shift) % MARQUEE_PERIOD < MARQUEE_PERIOD / 2 {
                cfg.start
            } else {
                Rgb::BLACK
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct SequentialState {
    frame: Vec<Rgb>,
    color: Option<Rgb>,
    cycle: u64,
}

impl SequentialState {
    pub(super) fn new(n: usize) -> Self {
        Self {
            frame: vec![Rgb::BLACK; n],
            color: None,
            cycle: 0,
        }
    }
}

/// Reveal LEDs one by one; each cycle paints with a new random color over the
/// previous cycle's frame.
pub(super) fn sequential(
    t: f64,
    cfg: &EffectConfig,
    state: &mut SequentialState,
    rng: &mut Xorshift,
) -> Vec<Rgb> {
    let n = state.frame.len();
    let position = t / cfg.speed;
    let cycle = position.floor() as u64;
    let color = match state.color {
        None => {
            state.cycle = cycle;
            *state.color.insert(cfg.start)
        }
        Some(c) if cycle == state.cycle => c,
        Some(_) => {
            state.cycle = cycle;
            *state.color.insert(rng.color())
        }
    };
    let revealed = (lit_count(fract(position), n) + 1).min(n);
    for led in state.frame.iter_mut().take(revealed) {
        *led = color;
    }
    state.frame.clone()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct RotaryState {
    stacked: usize,
    cycle: u64,
}

/// A rotor sweeps the free part of the strip; each completed sweep parks one
/// more LED at the tail until the strip is full, then the stack resets.
pub(super) fn rotary_stack(t: f64, cfg: &EffectConfig, n: usize, state: &mut RotaryState) -> Vec<Rgb> {
    let position = t / cfg.speed;
    let cycle = position.floor() as u64;
    if cycle > state.cycle {
        let completed = (cycle - state.cycle) as usize;
        state.stacked = (state.stacked + completed) % n;
        state.cycle = cycle;
    }
    let free = n - state.stacked;
    let rotor = lit_count(fract(position), free).min(free - 1);
    (0..n)
        .map(|i| {
            if i >= free {
                cfg.end
            } else if i == rotor {
                cfg.start
            } else {
                Rgb::BLACK
            }
        })
        .collect()
}
