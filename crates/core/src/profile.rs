//! Per-device configuration profiles.
//!
//! Every device has a base profile stored as `profiles/<serial>.json` and any
//! number of user profiles stored as `profiles/<serial>-<user>.json`. Exactly
//! one of them is active.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::color::Rgb;
use crate::device::{DeviceDescriptor, PollingRate, ProductKind};
use crate::error::{Error, Result, Status};
use crate::safety;
use crate::store::{self, is_valid_name, ProfileStore, PROFILES_DIR};

/// Name of the base profile inside a [`ProfileSet`].
pub const DEFAULT_PROFILE: &str = "default";

/// Color source override for the device.
pub const RGB_MOUSE: &str = "mouse";
pub const RGB_MOUSEPAD: &str = "mousepad";

/// Static color written to a group of LED positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ZoneColor {
    pub color: Rgb,
    /// LED positions in the color frame this zone writes to.
    pub packet_index: Vec<usize>,
}

/// One DPI stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DpiStage {
    pub name: String,
    pub value: u16,
    pub color: Rgb,
    #[serde(default)]
    pub sniper: bool,
}

/// Persisted device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceProfile {
    pub active: bool,
    pub product: String,
    pub serial: String,
    #[serde(rename = "RGBProfile")]
    pub rgb_profile: String,
    pub brightness_slider: u8,
    /// Fan channel → speed profile name.
    pub speed_profiles: BTreeMap<u8, String>,
    pub zone_colors: BTreeMap<u8, ZoneColor>,
    #[serde(rename = "DPIProfiles")]
    pub dpi_profiles: Vec<DpiStage>,
    /// Index of the current stage in `dpi_profiles`.
    #[serde(rename = "DPIStage")]
    pub dpi_stage: usize,
    pub key_assignment_hash: String,
    #[serde(rename = "OpenRGBIntegration")]
    pub openrgb_integration: bool,
    #[serde(rename = "RGBCluster")]
    pub rgb_cluster: bool,
    pub polling_rate: u16,
    pub angle_snapping: bool,
    pub lift_height: u8,
    /// Minutes of inactivity before a wireless device sleeps.
    pub sleep_mode: u8,
    pub fan_mode: u8,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            active: true,
            product: String::new(),
            serial: String::new(),
            rgb_profile: "static".into(),
            brightness_slider: 100,
            speed_profiles: BTreeMap::new(),
            zone_colors: BTreeMap::new(),
            dpi_profiles: Vec::new(),
            dpi_stage: 0,
            key_assignment_hash: String::new(),
            openrgb_integration: false,
            rgb_cluster: false,
            polling_rate: 1000,
            angle_snapping: false,
            lift_height: 3,
            sleep_mode: 15,
            fan_mode: 0,
        }
    }
}

/// Stage synthesized when a profile carries no sniper stage.
fn default_sniper() -> DpiStage {
    DpiStage {
        name: "Sniper".into(),
        value: 200,
        color: Rgb::new(255, 0, 0),
        sniper: true,
    }
}

fn default_dpi_stages() -> Vec<DpiStage> {
    let stages = [
        (400, Rgb::new(255, 255, 255)),
        (800, Rgb::new(0, 0, 255)),
        (1200, Rgb::new(0, 255, 0)),
        (1600, Rgb::new(255, 255, 0)),
        (3200, Rgb::new(255, 0, 255)),
    ];
    let mut out: Vec<DpiStage> = stages
        .iter()
        .enumerate()
        .map(|(i, (value, color))| DpiStage {
            name: format!("Stage {}", i + 1),
            value: *value,
            color: *color,
            sniper: false,
        })
        .collect();
    out.push(default_sniper());
    out
}

impl DeviceProfile {
    /// Fresh profile for a device.
    pub fn new(desc: &DeviceDescriptor, serial: &str) -> Self {
        let mut profile = Self {
            product: desc.name.to_string(),
            serial: serial.to_string(),
            ..Self::default()
        };
        match desc.kind {
            ProductKind::Mouse => profile.rgb_profile = RGB_MOUSE.into(),
            ProductKind::Mousepad => profile.rgb_profile = RGB_MOUSEPAD.into(),
            ProductKind::FanHub | ProductKind::Psu => {}
        }
        for zone in desc.zones {
            profile.zone_colors.insert(
                zone.id,
                ZoneColor {
                    color: Rgb::new(255, 255, 255),
                    packet_index: zone.positions.to_vec(),
                },
            );
        }
        if desc.dpi.is_some() {
            profile.dpi_profiles = default_dpi_stages();
            profile.dpi_stage = 1;
        }
        if let Some(rate) = desc.polling_rates.last() {
            profile.polling_rate = rate.as_hz();
        }
        for channel in 0..desc.fan_channels {
            profile.speed_profiles.insert(channel, "Normal".into());
        }
        profile.key_assignment_hash = serial.to_string();
        profile.normalize(desc);
        profile
    }

    /// Restore the profile invariants after loading.
    pub fn normalize(&mut self, desc: &DeviceDescriptor) {
        self.brightness_slider = self.brightness_slider.min(safety::BRIGHTNESS_MAX);
        if let Some(range) = desc.dpi {
            for stage in &mut self.dpi_profiles {
                stage.value = safety::clamp_dpi(&range, stage.value);
            }
            let mut seen_sniper = false;
            for stage in &mut self.dpi_profiles {
                if stage.sniper {
                    if seen_sniper {
                        warn!(serial = %self.serial, "extra sniper stage cleared");
                        stage.sniper = false;
                    }
                    seen_sniper = true;
                }
            }
            if !seen_sniper {
                debug!(serial = %self.serial, "synthesizing sniper stage");
                let mut sniper = default_sniper();
                sniper.value = safety::clamp_dpi(&range, sniper.value);
                self.dpi_profiles.push(sniper);
            }
            if self.dpi_profiles.get(self.dpi_stage).map_or(true, |s| s.sniper) {
                self.dpi_stage = self.dpi_profiles.iter().position(|s| !s.sniper).unwrap_or(0);
            }
        }
        if self.openrgb_integration && self.rgb_cluster {
            warn!(serial = %self.serial, "external integration and cluster both set, disabling cluster");
            self.rgb_cluster = false;
        }
        if !desc.polling_rates.is_empty()
            && PollingRate::from_hz(self.polling_rate).map_or(true, |r| !desc.polling_rates.contains(&r))
        {
            self.polling_rate = desc.polling_rates.last().map_or(1000, PollingRate::as_hz);
        }
        self.lift_height = self
            .lift_height
            .clamp(safety::LIFT_HEIGHT_MIN, safety::LIFT_HEIGHT_MAX);
    }

    /// Brightness as a `[0, 1]` factor.
    pub fn brightness(&self) -> f64 {
        self.brightness_slider.min(safety::BRIGHTNESS_MAX) as f64 / 100.0
    }

    /// Non-sniper stages in order, with their indices.
    pub fn regular_stages(&self) -> impl Iterator<Item = (usize, &DpiStage)> {
        self.dpi_profiles.iter().enumerate().filter(|(_, s)| !s.sniper)
    }

    pub fn sniper_stage(&self) -> Option<&DpiStage> {
        self.dpi_profiles.iter().find(|s| s.sniper)
    }

    pub fn current_stage(&self) -> Option<&DpiStage> {
        self.dpi_profiles.get(self.dpi_stage)
    }

    /// Move `delta` regular stages up or down, stopping at the ends.
    /// Returns true when the stage changed.
    pub fn step_dpi(&mut self, delta: i32) -> bool {
        let regular: Vec<usize> = self.regular_stages().map(|(i, _)| i).collect();
        let Some(pos) = regular.iter().position(|i| *i == self.dpi_stage) else {
            return false;
        };
        let next = (pos as i64 + delta as i64).clamp(0, regular.len() as i64 - 1) as usize;
        if next == pos {
            return false;
        }
        self.dpi_stage = regular[next];
        true
    }
}

/// Store key of a profile.
pub fn profile_key(serial: &str, name: &str) -> String {
    if name == DEFAULT_PROFILE {
        store::key(PROFILES_DIR, serial)
    } else {
        store::key(PROFILES_DIR, &format!("{serial}-{name}"))
    }
}

/// Profile name for a stored base name, if it belongs to `serial`.
pub fn profile_name(serial: &str, base: &str) -> Option<String> {
    if base == serial {
        return Some(DEFAULT_PROFILE.to_string());
    }
    let user = base.strip_prefix(serial)?.strip_prefix('-')?;
    (!user.is_empty()).then(|| user.to_string())
}

/// All profiles of one device.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    serial: String,
    profiles: BTreeMap<String, DeviceProfile>,
    active: String,
}

impl ProfileSet {
    /// A set holding only the base profile.
    pub fn new(serial: &str, base: DeviceProfile) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), base);
        let mut set = Self {
            serial: serial.to_string(),
            profiles,
            active: DEFAULT_PROFILE.to_string(),
        };
        set.fix_active();
        set
    }

    /// Load every profile of `serial`; creates and saves the base profile
    /// when none exist.
    pub fn load(store: &dyn ProfileStore, desc: &DeviceDescriptor, serial: &str) -> Result<Self> {
        let mut profiles = BTreeMap::new();
        for base in store.list(PROFILES_DIR)? {
            let Some(name) = profile_name(serial, &base) else {
                continue;
            };
            let key = profile_key(serial, &name);
            if let Some(mut profile) = store::load_json::<DeviceProfile>(store, &key)? {
                profile.normalize(desc);
                profiles.insert(name, profile);
            }
        }
        if !profiles.contains_key(DEFAULT_PROFILE) {
            let base = DeviceProfile::new(desc, serial);
            store::save_json(store, &profile_key(serial, DEFAULT_PROFILE), &base)?;
            info!(serial, "created default profile");
            profiles.insert(DEFAULT_PROFILE.to_string(), base);
        }
        let mut set = Self {
            serial: serial.to_string(),
            profiles,
            active: DEFAULT_PROFILE.to_string(),
        };
        set.fix_active();
        Ok(set)
    }

    /// Keep exactly one profile active: the first flagged one by name,
    /// otherwise the base profile.
    fn fix_active(&mut self) {
        let active = self
            .profiles
            .iter()
            .find(|(_, p)| p.active)
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        for (name, profile) in &mut self.profiles {
            profile.active = *name == active;
        }
        self.active = active;
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&DeviceProfile> {
        self.profiles.get(name)
    }

    pub fn active(&self) -> &DeviceProfile {
        // fix_active guarantees the key exists.
        &self.profiles[&self.active]
    }

    pub fn active_mut(&mut self) -> &mut DeviceProfile {
        self.profiles
            .entry(self.active.clone())
            .or_default()
    }

    /// Persist the active profile.
    pub fn save_active(&self, store: &dyn ProfileStore) -> Result<()> {
        store::save_json(store, &profile_key(&self.serial, &self.active), self.active())
    }

    fn save_named(&self, store: &dyn ProfileStore, name: &str) -> Result<()> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| Error::Profile(format!("unknown profile {name}")))?;
        store::save_json(store, &profile_key(&self.serial, name), profile)
    }

    /// Make `name` the active profile.
    pub fn switch(&mut self, store: &dyn ProfileStore, name: &str) -> Status {
        if !self.profiles.contains_key(name) {
            return Status::Failure;
        }
        if self.active == name {
            return Status::Ok;
        }
        let previous = std::mem::replace(&mut self.active, name.to_string());
        for (n, profile) in &mut self.profiles {
            profile.active = *n == self.active;
        }
        let saved = self
            .save_named(store, &previous)
            .and_then(|_| self.save_named(store, name));
        if let Err(e) = saved {
            warn!(serial = %self.serial, error = %e, "failed to persist profile switch");
        }
        info!(serial = %self.serial, from = %previous, to = %name, "profile switched");
        Status::Ok
    }

    /// Name of the profile after the active one in alphabetical order,
    /// wrapping around.
    pub fn next_name(&self) -> String {
        let names: Vec<&String> = self.profiles.keys().collect();
        let pos = names.iter().position(|n| **n == self.active).unwrap_or(0);
        names[(pos + 1) % names.len()].clone()
    }

    /// Switch to the next profile; returns its name.
    pub fn rotate(&mut self, store: &dyn ProfileStore) -> String {
        let next = self.next_name();
        self.switch(store, &next);
        next
    }

    /// Create a user profile as a copy of the active one.
    pub fn create(&mut self, store: &dyn ProfileStore, name: &str) -> Status {
        if name == DEFAULT_PROFILE || !is_valid_name(name) || self.profiles.contains_key(name) {
            return Status::Failure;
        }
        let mut profile = self.active().clone();
        profile.active = false;
        self.profiles.insert(name.to_string(), profile);
        if let Err(e) = self.save_named(store, name) {
            warn!(serial = %self.serial, error = %e, "failed to save new profile");
            self.profiles.remove(name);
            return Status::Failure;
        }
        Status::Ok
    }

    /// Delete a user profile. The active and base profiles cannot be
    /// deleted.
    pub fn delete(&mut self, store: &dyn ProfileStore, name: &str) -> Status {
        if name == self.active {
            return Status::ProfileActive;
        }
        if name == DEFAULT_PROFILE || !self.profiles.contains_key(name) {
            return Status::Failure;
        }
        if let Err(e) = store.delete(&profile_key(&self.serial, name)) {
            warn!(serial = %self.serial, profile = name, error = %e, "failed to remove profile");
            return Status::RemoveFailed;
        }
        self.profiles.remove(name);
        Status::Ok
    }
}
