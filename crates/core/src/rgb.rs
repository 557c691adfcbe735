//! Per-device RGB library: effect parameters by effect name.
//!
//! Stored as `rgb/<serial>.json`:
//! `{ "Device": ..., "DefaultColor": {...}, "Profiles": { "<effect>": {...} } }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::color::Rgb;
use crate::effect::{EffectConfig, EffectKind};
use crate::error::Result;
use crate::profile::{RGB_MOUSE, RGB_MOUSEPAD};
use crate::store::{self, ProfileStore, RGB_DIR};

/// Parameters of one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RgbProfile {
    /// Seconds per cycle.
    pub speed: f64,
    /// `[0, 1]`; multiplied with the device brightness slider.
    pub brightness: f64,
    pub smoothness: u32,
    pub start_color: Rgb,
    pub end_color: Rgb,
    pub gradients: Vec<Rgb>,
    pub min_temp: f64,
    pub max_temp: f64,
    pub inverted: bool,
}

impl Default for RgbProfile {
    fn default() -> Self {
        let cfg = EffectConfig::default();
        Self {
            speed: cfg.speed,
            brightness: cfg.brightness,
            smoothness: cfg.smoothness,
            start_color: cfg.start,
            end_color: cfg.end,
            gradients: Vec::new(),
            min_temp: cfg.min_temp,
            max_temp: cfg.max_temp,
            inverted: false,
        }
    }
}

impl RgbProfile {
    /// Defaults tuned per effect.
    pub fn defaults_for(kind: EffectKind) -> Self {
        let base = Self::default();
        match kind {
            EffectKind::Static => Self {
                start_color: Rgb::new(255, 255, 255),
                ..base
            },
            EffectKind::ColorPulse | EffectKind::ColorShift | EffectKind::ColorWarp => Self {
                speed: 2.0,
                ..base
            },
            EffectKind::Gradient => Self {
                gradients: vec![
                    Rgb::new(255, 0, 0),
                    Rgb::new(255, 255, 0),
                    Rgb::new(0, 255, 0),
                    Rgb::new(0, 255, 255),
                    Rgb::new(0, 0, 255),
                ],
                ..base
            },
            EffectKind::Storm => Self {
                start_color: Rgb::new(0, 0, 40),
                end_color: Rgb::new(255, 255, 255),
                ..base
            },
            EffectKind::Visor | EffectKind::Spinner | EffectKind::Marquee => Self {
                speed: 1.0,
                ..base
            },
            EffectKind::CpuTemperature | EffectKind::GpuTemperature | EffectKind::ProbeTemperature => {
                Self {
                    start_color: Rgb::new(0, 255, 0),
                    end_color: Rgb::new(255, 0, 0),
                    ..base
                }
            }
            _ => base,
        }
    }

    /// Effect configuration with the device slider applied.
    pub fn effect_config(&self, slider: f64) -> EffectConfig {
        EffectConfig {
            start: self.start_color,
            end: self.end_color,
            brightness: self.brightness * slider,
            speed: self.speed,
            smoothness: self.smoothness,
            gradient: self.gradients.clone(),
            min_temp: self.min_temp,
            max_temp: self.max_temp,
            inverted: self.inverted,
        }
        .normalized()
    }
}

/// What an `RGBProfile` name selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgbSource {
    Effect(EffectKind),
    /// Per-zone static colors from the device profile.
    Zones,
}

impl RgbSource {
    pub fn resolve(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case(RGB_MOUSE) || name.eq_ignore_ascii_case(RGB_MOUSEPAD) {
            return Some(Self::Zones);
        }
        EffectKind::from_name(name).map(Self::Effect)
    }
}

/// RGB definitions of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RgbLibrary {
    pub device: String,
    pub default_color: Rgb,
    pub profiles: BTreeMap<String, RgbProfile>,
}

impl Default for RgbLibrary {
    fn default() -> Self {
        Self::new("")
    }
}

impl RgbLibrary {
    /// Library holding the defaults of every effect.
    pub fn new(device: &str) -> Self {
        let profiles = EffectKind::ALL
            .iter()
            .map(|k| (k.name().to_string(), RgbProfile::defaults_for(*k)))
            .collect();
        Self {
            device: device.to_string(),
            default_color: Rgb::new(255, 255, 255),
            profiles,
        }
    }

    fn key(serial: &str) -> String {
        store::key(RGB_DIR, serial)
    }

    /// Load the library for `serial`; missing effects are filled with
    /// defaults and a missing file is created.
    pub fn load(store: &dyn ProfileStore, serial: &str, device: &str) -> Result<Self> {
        let key = Self::key(serial);
        match store::load_json::<Self>(store, &key)? {
            Some(mut lib) => {
                for kind in EffectKind::ALL {
                    lib.profiles
                        .entry(kind.name().to_string())
                        .or_insert_with(|| RgbProfile::defaults_for(*kind));
                }
                Ok(lib)
            }
            None => {
                let lib = Self::new(device);
                store::save_json(store, &key, &lib)?;
                info!(serial, "created RGB library");
                Ok(lib)
            }
        }
    }

    pub fn save(&self, store: &dyn ProfileStore, serial: &str) -> Result<()> {
        store::save_json(store, &Self::key(serial), self)
    }

    /// Parameters of `kind`, falling back to its defaults.
    pub fn profile(&self, kind: EffectKind) -> RgbProfile {
        self.profiles
            .get(kind.name())
            .cloned()
            .unwrap_or_else(|| RgbProfile::defaults_for(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn resolve_names() {
        assert_eq!(RgbSource::resolve("mouse"), Some(RgbSource::Zones));
        assert_eq!(RgbSource::resolve("MousePad"), Some(RgbSource::Zones));
        assert_eq!(RgbSource::resolve("off"), Some(RgbSource::Effect(EffectKind::Off)));
        assert_eq!(RgbSource::resolve("static"), Some(RgbSource::Effect(EffectKind::Static)));
        assert_eq!(RgbSource::resolve("disco"), None);
    }

    #[test]
    fn slider_scales_brightness() {
        let p = RgbProfile {
            brightness: 0.8,
            ..RgbProfile::default()
        };
        let cfg = p.effect_config(0.5);
        assert!((cfg.brightness - 0.4).abs() < 1e-9);
    }

    #[test]
    fn speed_is_clamped() {
        let p = RgbProfile {
            speed: 50.0,
            ..RgbProfile::default()
        };
        assert_eq!(p.effect_config(1.0).speed, crate::effect::SPEED_MAX);
    }

    #[test]
    fn load_creates_and_backfills() {
        let store = MemoryStore::new();
        let lib = RgbLibrary::load(&store, "SER", "Hub").unwrap();
        assert_eq!(lib.profiles.len(), EffectKind::ALL.len());
        assert!(store.load("rgb/SER.json").unwrap().is_some());

        let mut partial = RgbLibrary::new("Hub");
        partial.profiles.retain(|k, _| k == "rainbow");
        partial.profiles.get_mut("rainbow").unwrap().speed = 7.0;
        partial.save(&store, "SER").unwrap();
        let lib = RgbLibrary::load(&store, "SER", "Hub").unwrap();
        assert_eq!(lib.profiles.len(), EffectKind::ALL.len());
        assert_eq!(lib.profile(EffectKind::Rainbow).speed, 7.0);
    }
}
