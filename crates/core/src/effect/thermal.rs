//! Temperature-driven effects: blend start→end by where the filtered
//! temperature sits inside `[min_temp, max_temp]`.

use super::EffectConfig;
use crate::color::Rgb;

/// Low-pass coefficient applied to every new reading.
pub const TEMPERATURE_FILTER_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct ThermalState {
    filtered: Option<f64>,
}

impl ThermalState {
    /// Feed a reading and return the filtered value. The first reading seeds
    /// the filter directly.
    fn update(&mut self, reading: f64) -> f64 {
        let next = match self.filtered {
            Some(prev) => prev + TEMPERATURE_FILTER_ALPHA * (reading - prev),
            None => reading,
        };
        self.filtered = Some(next);
        next
    }
}

/// Blend position for `temp`; 0 at or below `min`, 1 at or above `max`.
pub(super) fn blend_factor(temp: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return if temp >= max { 1.0 } else { 0.0 };
    }
    ((temp - min) / (max - min)).clamp(0.0, 1.0)
}

pub(super) fn render(
    cfg: &EffectConfig,
    n: usize,
    state: &mut ThermalState,
    reading: Option<f64>,
) -> Vec<Rgb> {
    let temp = match reading.filter(|r| r.is_finite()) {
        Some(r) => state.update(r),
        None => state.filtered.unwrap_or(cfg.min_temp),
    };
    let color = Rgb::lerp(cfg.start, cfg.end, blend_factor(temp, cfg.min_temp, cfg.max_temp));
    vec![color; n]
}
