//! RGB effect engine.
//!
//! Every effect is a function of the time since playback started and of the
//! [`EffectState`] that owns its parameters. The set of effects is closed:
//! [`EffectKind`] names them and [`EffectState::render`] dispatches over them
//! exhaustively.
//!
//! Post-processing order for every frame:
//! 1. the effect computes raw colors (hue / interpolation),
//! 2. brightness is applied (`component × brightness`, truncating),
//! 3. when `inverted` is set, red and blue are swapped in the output.

mod blend;
mod hue;
mod random;
mod sweep;
mod thermal;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::temperature::TempSource;

pub use random::Xorshift;
pub use thermal::TEMPERATURE_FILTER_ALPHA;

/// Speed bounds; speed is "seconds per cycle" for periodic effects.
pub const SPEED_MIN: f64 = 0.1;
pub const SPEED_MAX: f64 = 10.0;

/// Default delay between rendered frames.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// The closed set of effects a device can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectKind {
    Static,
    Rainbow,
    PastelRainbow,
    SpiralRainbow,
    PastelSpiralRainbow,
    Watercolor,
    ColorPulse,
    ColorShift,
    ColorWarp,
    Gradient,
    Flickering,
    Storm,
    Wave,
    Rotator,
    Circle,
    CircleShift,
    Spinner,
    Visor,
    Marquee,
    Sequential,
    RotaryStack,
    Nebula,
    CpuTemperature,
    GpuTemperature,
    ProbeTemperature,
    Off,
}

impl EffectKind {
    pub const ALL: &'static [EffectKind] = &[
        EffectKind::Static,
        EffectKind::Rainbow,
        EffectKind::PastelRainbow,
        EffectKind::SpiralRainbow,
        EffectKind::PastelSpiralRainbow,
        EffectKind::Watercolor,
        EffectKind::ColorPulse,
        EffectKind::ColorShift,
        EffectKind::ColorWarp,
        EffectKind::Gradient,
        EffectKind::Flickering,
        EffectKind::Storm,
        EffectKind::Wave,
        EffectKind::Rotator,
        EffectKind::Circle,
        EffectKind::CircleShift,
        EffectKind::Spinner,
        EffectKind::Visor,
        EffectKind::Marquee,
        EffectKind::Sequential,
        EffectKind::RotaryStack,
        EffectKind::Nebula,
        EffectKind::CpuTemperature,
        EffectKind::GpuTemperature,
        EffectKind::ProbeTemperature,
        EffectKind::Off,
    ];

    /// Name used in profiles and the RGB library.
    pub fn name(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Rainbow => "rainbow",
            Self::PastelRainbow => "pastelrainbow",
            Self::SpiralRainbow => "spiralrainbow",
            Self::PastelSpiralRainbow => "pastelspiralrainbow",
            Self::Watercolor => "watercolor",
            Self::ColorPulse => "colorpulse",
            Self::ColorShift => "colorshift",
            Self::ColorWarp => "colorwarp",
            Self::Gradient => "gradient",
            Self::Flickering => "flickering",
            Self::Storm => "storm",
            Self::Wave => "wave",
            Self::Rotator => "rotator",
            Self::Circle => "circle",
            Self::CircleShift => "circleshift",
            Self::Spinner => "spinner",
            Self::Visor => "visor",
            Self::Marquee => "marquee",
            Self::Sequential => "sequential",
            Self::RotaryStack => "rotarystack",
            Self::Nebula => "nebula",
            Self::CpuTemperature => "cpu-temperature",
            Self::GpuTemperature => "gpu-temperature",
            Self::ProbeTemperature => "probe-temperature",
            Self::Off => "off",
        }
    }

    /// Look up an effect by its profile name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|k| k.name() == lower)
    }

    /// Temperature source driving this effect, if any.
    pub fn temperature_source(self) -> Option<TempSource> {
        match self {
            Self::CpuTemperature => Some(TempSource::Cpu),
            Self::GpuTemperature => Some(TempSource::Gpu),
            Self::ProbeTemperature => Some(TempSource::Probe(0)),
            _ => None,
        }
    }

    /// Sleep between two frames of this effect.
    pub fn frame_interval(self) -> Duration {
        match self {
            Self::Flickering | Self::Storm => Duration::from_millis(40),
            Self::Visor | Self::Spinner => Duration::from_millis(10),
            Self::CpuTemperature | Self::GpuTemperature | Self::ProbeTemperature => {
                Duration::from_millis(40)
            }
            _ => DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters shared by every effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectConfig {
    pub start: Rgb,
    pub end: Rgb,
    /// Output scale in `[0, 1]`.
    pub brightness: f64,
    /// Seconds per cycle, clamped to `[SPEED_MIN, SPEED_MAX]`.
    pub speed: f64,
    pub smoothness: u32,
    /// Ordered palette for the gradient effect.
    pub gradient: Vec<Rgb>,
    pub min_temp: f64,
    pub max_temp: f64,
    /// Swap red and blue in the output.
    pub inverted: bool,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            start: Rgb::new(255, 0, 0),
            end: Rgb::new(0, 0, 255),
            brightness: 1.0,
            speed: 4.0,
            smoothness: 40,
            gradient: Vec::new(),
            min_temp: 30.0,
            max_temp: 80.0,
            inverted: false,
        }
    }
}

impl EffectConfig {
    /// Clamp speed and brightness into their contract ranges.
    pub fn normalized(mut self) -> Self {
        self.speed = clamp_speed(self.speed);
        self.brightness = if self.brightness.is_finite() {
            self.brightness.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self
    }
}

pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() {
        speed.clamp(SPEED_MIN, SPEED_MAX)
    } else {
        SPEED_MIN
    }
}

/// Per-variant mutable state carried across frames.
#[derive(Debug, Clone, PartialEq)]
enum Variant {
    Stateless,
    Warp(blend::WarpState),
    Sequential(sweep::SequentialState),
    RotaryStack(sweep::RotaryState),
    Temperature(thermal::ThermalState),
}

/// State of one uninterrupted playback.
#[derive(Debug, Clone)]
pub struct EffectState {
    kind: EffectKind,
    config: EffectConfig,
    leds: usize,
    variant: Variant,
    rng: Xorshift,
}

impl EffectState {
    pub fn new(kind: EffectKind, config: EffectConfig, leds: usize) -> Self {
        Self::with_seed(kind, config, leds, random::seed_from_clock())
    }

    /// Deterministic constructor used for reproducible playback.
    pub fn with_seed(kind: EffectKind, config: EffectConfig, leds: usize, seed: u64) -> Self {
        let config = config.normalized();
        let variant = match kind {
            EffectKind::ColorWarp => Variant::Warp(blend::WarpState::new(config.end)),
            EffectKind::Sequential => Variant::Sequential(sweep::SequentialState::new(leds)),
            EffectKind::RotaryStack => Variant::RotaryStack(sweep::RotaryState::default()),
            EffectKind::CpuTemperature
            | EffectKind::GpuTemperature
            | EffectKind::ProbeTemperature => {
                Variant::Temperature(thermal::ThermalState::default())
            }
            _ => Variant::Stateless,
        };
        Self {
            kind,
            config,
            leds,
            variant,
            rng: Xorshift::new(seed),
        }
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }

    pub fn config(&self) -> &EffectConfig {
        &self.config
    }

    pub fn led_count(&self) -> usize {
        self.leds
    }

    /// Change the output scale without restarting playback.
    pub fn set_brightness(&mut self, brightness: f64) {
        self.config.brightness = brightness.clamp(0.0, 1.0);
    }

    /// Render one frame at `t` seconds since playback start.
    ///
    /// `temperature` is the latest raw reading for temperature effects and is
    /// ignored by every other effect.
    pub fn render(&mut self, t: f64, temperature: Option<f64>) -> Vec<Rgb> {
        let n = self.leds;
        if n == 0 {
            return Vec::new();
        }
        let t = t.max(0.0);
        let cfg = &self.config;
        let raw = match (self.kind, &mut self.variant) {
            (EffectKind::Static, _) => vec![cfg.start; n],
            (EffectKind::Off, _) => vec![Rgb::BLACK; n],
            (EffectKind::Rainbow, _) => hue::rainbow(t, cfg, n, hue::Style::Plain),
            (EffectKind::PastelRainbow, _) => hue::rainbow(t, cfg, n, hue::Style::Pastel),
            (EffectKind::SpiralRainbow, _) => hue::rainbow(t, cfg, n, hue::Style::Spiral),
            (EffectKind::PastelSpiralRainbow, _) => {
                hue::rainbow(t, cfg, n, hue::Style::PastelSpiral)
            }
            (EffectKind::Watercolor, _) => hue::watercolor(t, cfg, n),
            (EffectKind::Rotator, _) => hue::rotator(t, cfg, n),
            (EffectKind::Nebula, _) => hue::nebula(t, cfg, n, &mut self.rng),
            (EffectKind::ColorPulse, _) => blend::color_pulse(t, cfg, n),
            (EffectKind::ColorShift, _) => blend::color_shift(t, cfg, n),
            (EffectKind::ColorWarp, Variant::Warp(state)) => {
                blend::color_warp(t, cfg, n, state, &mut self.rng)
            }
            (EffectKind::Gradient, _) => blend::gradient(t, cfg, n),
            (EffectKind::Flickering, _) => blend::flickering(cfg, n, &mut self.rng),
            (EffectKind::Storm, _) => blend::storm(cfg, n, &mut self.rng),
            (EffectKind::Wave, _) => blend::wave(t, cfg, n),
            (EffectKind::Circle, _) => sweep::circle(t, cfg, n),
            (EffectKind::CircleShift, _) => sweep::circle_shift(t, cfg, n),
            (EffectKind::Spinner, _) => sweep::spinner(t, cfg, n),
            (EffectKind::Visor, _) => sweep::visor(t, cfg, n),
            (EffectKind::Marquee, _) => sweep::marquee(t, cfg, n),
            (EffectKind::Sequential, Variant::Sequential(state)) => {
                sweep::sequential(t, cfg, state, &mut self.rng)
            }
            (EffectKind::RotaryStack, Variant::RotaryStack(state)) => {
                sweep::rotary_stack(t, cfg, n, state)
            }
            (
                EffectKind::CpuTemperature
                | EffectKind::GpuTemperature
                | EffectKind::ProbeTemperature,
                Variant::Temperature(state),
            ) => thermal::render(cfg, n, state, temperature),
            // A variant/kind mismatch cannot be built through the constructors.
            (_, _) => vec![Rgb::BLACK; n],
        };
        self.finish(raw)
    }

    /// Render and flatten to `R,G,B` bytes.
    pub fn render_bytes(&mut self, t: f64, temperature: Option<f64>) -> Vec<u8> {
        crate::color::to_bytes(&self.render(t, temperature))
    }

    fn finish(&self, frame: Vec<Rgb>) -> Vec<Rgb> {
        let brightness = self.config.brightness;
        let inverted = self.config.inverted;
        frame
            .into_iter()
            .map(|c| {
                let scaled = c.scale(brightness);
                if inverted {
                    scaled.inverted()
                } else {
                    scaled
                }
            })
            .collect()
    }
}

/// Fractional part of a non-negative cycle position.
pub(crate) fn fract(x: f64) -> f64 {
    x - x.floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: EffectKind, config: EffectConfig, leds: usize) -> EffectState {
        EffectState::with_seed(kind, config, leds, 0x5EED)
    }

    #[test]
    fn names_roundtrip_through_lookup() {
        for kind in EffectKind::ALL {
            assert_eq!(EffectKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(EffectKind::from_name("RAINBOW"), Some(EffectKind::Rainbow));
        assert_eq!(EffectKind::from_name("mouse"), None);
    }

    #[test]
    fn half_brightness_truncates_each_component() {
        let config = EffectConfig {
            start: Rgb::new(255, 128, 0),
            brightness: 0.5,
            ..EffectConfig::default()
        };
        let frame = state(EffectKind::Static, config, 1).render(0.0, None);
        assert_eq!(frame[0], Rgb::new(127, 64, 0));
    }

    #[test]
    fn static_half_brightness_fills_every_led() {
        let config = EffectConfig {
            start: Rgb::new(0xFF, 0x80, 0x00),
            brightness: 0.5,
            ..EffectConfig::default()
        };
        let bytes = state(EffectKind::Static, config, 4).render_bytes(0.0, None);
        assert_eq!(bytes, vec![127, 64, 0, 127, 64, 0, 127, 64, 0, 127, 64, 0]);
    }

    #[test]
    fn rainbow_at_time_zero_spreads_hues() {
        let config = EffectConfig {
            speed: 1.0,
            ..EffectConfig::default()
        };
        let frame = state(EffectKind::Rainbow, config, 6).render(0.0, None);
        assert_eq!(frame[0], Rgb::new(255, 0, 0));
        assert_eq!(frame[1], Rgb::new(255, 255, 0));
        assert_eq!(frame[2], Rgb::new(0, 255, 0));
        assert_eq!(frame[3], Rgb::new(0, 255, 255));
        assert_eq!(frame[4], Rgb::new(0, 0, 255));
    }

    #[test]
    fn colorpulse_half_phase() {
        let config = EffectConfig {
            start: Rgb::BLACK,
            end: Rgb::WHITE,
            speed: 2.0,
            ..EffectConfig::default()
        };
        let frame = state(EffectKind::ColorPulse, config, 3).render(1.0, None);
        assert!(frame.iter().all(|c| *c == Rgb::new(127, 127, 127)));
    }

    #[test]
    fn inverted_swaps_red_and_blue() {
        let config = EffectConfig {
            start: Rgb::new(10, 20, 30),
            inverted: true,
            ..EffectConfig::default()
        };
        let frame = state(EffectKind::Static, config, 1).render(0.0, None);
        assert_eq!(frame[0], Rgb::new(30, 20, 10));
    }

    #[test]
    fn speed_is_clamped() {
        let config = EffectConfig {
            speed: 100.0,
            ..EffectConfig::default()
        };
        assert_eq!(state(EffectKind::Rainbow, config, 1).config().speed, SPEED_MAX);
        let config = EffectConfig {
            speed: 0.0,
            ..EffectConfig::default()
        };
        assert_eq!(state(EffectKind::Rainbow, config, 1).config().speed, SPEED_MIN);
    }

    #[test]
    fn every_effect_yields_full_frames() {
        for kind in EffectKind::ALL {
            let mut s = state(*kind, EffectConfig::default(), 12);
            for step in 0..50 {
                let t = f64::from(step) * 0.37;
                let bytes = s.render_bytes(t, Some(55.0));
                assert_eq!(bytes.len(), 36, "{kind} produced a short frame");
            }
        }
    }

    #[test]
    fn lowering_brightness_never_raises_output() {
        for kind in EffectKind::ALL {
            for step in 0..20 {
                let t = f64::from(step) * 0.53;
                let bright = EffectConfig {
                    brightness: 0.9,
                    ..EffectConfig::default()
                };
                let dim = EffectConfig {
                    brightness: 0.4,
                    ..EffectConfig::default()
                };
                // Same seed so random effects draw the same sequence.
                let a = state(*kind, bright, 8).render_bytes(t, Some(50.0));
                let b = state(*kind, dim, 8).render_bytes(t, Some(50.0));
                for (hi, lo) in a.iter().zip(&b) {
                    assert!(lo <= hi, "{kind} at t={t}: {lo} > {hi}");
                }
            }
        }
    }

    #[test]
    fn zero_leds_renders_nothing() {
        let mut s = state(EffectKind::Rainbow, EffectConfig::default(), 0);
        assert!(s.render(1.0, None).is_empty());
    }
}
