//! Temperature-driven fan and pump speed control.
//!
//! Every channel of a device is assigned a named [`SpeedProfile`]. On each
//! tick the controller reads the profile's temperature source, computes a
//! duty (graph interpolation or band lookup), and writes only the channels
//! whose `(profile, channel, temperature, duty)` fingerprint changed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::comm::{self, ACK_RETRY_ATTEMPTS, ACK_RETRY_DELAY};
use crate::device::DeviceDescriptor;
use crate::error::Result;
use crate::framer::Framer;
use crate::safety;
use crate::store::{self, ProfileStore, SPEED_PROFILES_KEY};
use crate::temperature::TempSource;

/// Speed control cadence.
pub const SPEED_TICK: Duration = Duration::from_secs(3);

/// Profile assigned to channels that have none.
pub const DEFAULT_SPEED_PROFILE: &str = "Normal";

/// One point of a temperature → duty curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurvePoint {
    pub temperature: f32,
    pub duty: u8,
}

/// A temperature band with fixed duties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Band {
    pub min: f32,
    pub max: f32,
    pub fans: u8,
    pub pump: u8,
}

/// Named temperature curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeedProfile {
    pub sensor: TempSource,
    /// Allow fans to stop below the lowest curve point.
    pub zero_rpm: bool,
    pub fan_points: Vec<CurvePoint>,
    pub pump_points: Vec<CurvePoint>,
    pub bands: Vec<Band>,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self::with_bands(
            TempSource::Cpu,
            &[(0.0, 40.0, 30, 50), (40.0, 70.0, 60, 70), (70.0, 100.0, 100, 100)],
        )
    }
}

fn points(raw: &[(f32, u8)]) -> Vec<CurvePoint> {
    raw.iter()
        .map(|(temperature, duty)| CurvePoint {
            temperature: *temperature,
            duty: *duty,
        })
        .collect()
}

impl SpeedProfile {
    /// Profile whose graph curves follow the band table.
    pub fn with_bands(sensor: TempSource, bands: &[(f32, f32, u8, u8)]) -> Self {
        let bands: Vec<Band> = bands
            .iter()
            .map(|(min, max, fans, pump)| Band {
                min: *min,
                max: *max,
                fans: *fans,
                pump: *pump,
            })
            .collect();
        let fan_points = points(
            &bands
                .iter()
                .map(|b| (b.min, b.fans))
                .chain(bands.last().map(|b| (b.max, b.fans)))
                .collect::<Vec<_>>(),
        );
        let pump_points = points(
            &bands
                .iter()
                .map(|b| (b.min, b.pump))
                .chain(bands.last().map(|b| (b.max, b.pump)))
                .collect::<Vec<_>>(),
        );
        Self {
            sensor,
            zero_rpm: false,
            fan_points,
            pump_points,
            bands,
        }
    }

    /// Duty for a channel at `temperature`, before clamping.
    fn raw_duty(&self, temperature: f32, pump: bool, graph: bool) -> f64 {
        if graph {
            let curve = if pump { &self.pump_points } else { &self.fan_points };
            return interpolate(curve, temperature);
        }
        match self
            .bands
            .iter()
            .find(|b| (b.min..=b.max).contains(&temperature))
            .or_else(|| {
                // Outside every band: use the nearest end of the table.
                let first = self.bands.first()?;
                if temperature < first.min {
                    Some(first)
                } else {
                    self.bands.last()
                }
            }) {
            Some(b) if pump => b.pump as f64,
            Some(b) => b.fans as f64,
            None => safety::DUTY_MAX as f64,
        }
    }

    /// Clamped duty for a channel at `temperature`.
    pub fn duty(&self, temperature: f32, pump: bool, graph: bool) -> u8 {
        let raw = self.raw_duty(temperature, pump, graph);
        if !pump && self.zero_rpm && raw <= 0.0 {
            return 0;
        }
        safety::clamp_duty(raw, pump)
    }
}

/// Piecewise-linear lookup; flat beyond both ends.
pub fn interpolate(curve: &[CurvePoint], temperature: f32) -> f64 {
    let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
        return safety::DUTY_MAX as f64;
    };
    if temperature <= first.temperature {
        return first.duty as f64;
    }
    if temperature >= last.temperature {
        return last.duty as f64;
    }
    for pair in curve.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if temperature >= a.temperature && temperature <= b.temperature {
            let span = b.temperature - a.temperature;
            if span <= 0.0 {
                return b.duty as f64;
            }
            let t = ((temperature - a.temperature) / span) as f64;
            return a.duty as f64 + (b.duty as f64 - a.duty as f64) * t;
        }
    }
    last.duty as f64
}

/// Every speed profile, keyed by name; stored as `temperatures.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeedLibrary {
    pub profiles: BTreeMap<String, SpeedProfile>,
}

impl Default for SpeedLibrary {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "Quiet".to_string(),
            SpeedProfile::with_bands(
                TempSource::Cpu,
                &[(0.0, 50.0, 20, 50), (50.0, 75.0, 40, 60), (75.0, 100.0, 80, 90)],
            ),
        );
        profiles.insert(DEFAULT_SPEED_PROFILE.to_string(), SpeedProfile::default());
        profiles.insert(
            "Performance".to_string(),
            SpeedProfile::with_bands(
                TempSource::Cpu,
                &[(0.0, 35.0, 50, 70), (35.0, 60.0, 80, 90), (60.0, 100.0, 100, 100)],
            ),
        );
        profiles.insert(
            "Liquid".to_string(),
            SpeedProfile::with_bands(
                TempSource::Liquid,
                &[(0.0, 30.0, 30, 60), (30.0, 38.0, 60, 80), (38.0, 100.0, 100, 100)],
            ),
        );
        Self { profiles }
    }
}

impl SpeedLibrary {
    /// Load the library; a missing file is created with the defaults.
    pub fn load(store: &dyn ProfileStore) -> Result<Self> {
        match store::load_json(store, SPEED_PROFILES_KEY)? {
            Some(lib) => Ok(lib),
            None => {
                let lib = Self::default();
                lib.save(store)?;
                info!("created speed profile library");
                Ok(lib)
            }
        }
    }

    pub fn save(&self, store: &dyn ProfileStore) -> Result<()> {
        store::save_json(store, SPEED_PROFILES_KEY, self)
    }

    pub fn get(&self, name: &str) -> Option<&SpeedProfile> {
        self.profiles.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    profile: String,
    channel: u8,
    /// Tenths of a degree.
    temperature: i32,
    duty: u8,
}

/// Per-device speed state: the last fingerprint written per channel.
#[derive(Debug)]
pub struct SpeedController {
    desc: &'static DeviceDescriptor,
    last: HashMap<u8, Fingerprint>,
}

impl SpeedController {
    pub fn new(desc: &'static DeviceDescriptor) -> Self {
        Self {
            desc,
            last: HashMap::new(),
        }
    }

    /// Forget every written duty; the next tick rewrites all channels.
    pub fn reset(&mut self) {
        self.last.clear();
    }

    /// Channels whose duty must be written, with their new fingerprints.
    fn plan(
        &self,
        assignments: &BTreeMap<u8, String>,
        library: &SpeedLibrary,
        temperature: &dyn Fn(&TempSource) -> f32,
        graph: bool,
    ) -> Vec<Fingerprint> {
        let mut changes = Vec::new();
        for channel in 0..self.desc.fan_channels {
            let name = assignments
                .get(&channel)
                .map(String::as_str)
                .unwrap_or(DEFAULT_SPEED_PROFILE);
            let Some(profile) = library.get(name) else {
                debug!(channel, profile = name, "speed profile missing");
                continue;
            };
            let temp = temperature(&profile.sensor);
            let pump = self.desc.is_pump(channel);
            let fp = Fingerprint {
                profile: name.to_string(),
                channel,
                temperature: (temp * 10.0).round() as i32,
                duty: profile.duty(temp, pump, graph),
            };
            if self.last.get(&channel) != Some(&fp) {
                changes.push(fp);
            }
        }
        changes
    }

    /// One control step. Returns the `(channel, duty)` pairs written.
    ///
    /// Blocks on the transport; run on a blocking worker.
    pub fn tick(
        &mut self,
        framer: &Framer,
        assignments: &BTreeMap<u8, String>,
        library: &SpeedLibrary,
        temperature: &dyn Fn(&TempSource) -> f32,
        graph: bool,
    ) -> Vec<(u8, u8)> {
        if framer.is_exiting() {
            return Vec::new();
        }
        let changes = self.plan(assignments, library, temperature, graph);
        if changes.is_empty() {
            return Vec::new();
        }
        let duties: Vec<(u8, u8)> = changes.iter().map(|f| (f.channel, f.duty)).collect();
        if !write_duties(framer, &duties) {
            return Vec::new();
        }
        for fp in changes {
            debug!(channel = fp.channel, duty = fp.duty, profile = %fp.profile, "fan duty set");
            self.last.insert(fp.channel, fp);
        }
        duties
    }
}

/// Speed payload: `[data type][count][channel, duty]…`.
pub fn speed_payload(data_type: [u8; 2], duties: &[(u8, u8)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + duties.len() * 2);
    out.extend_from_slice(&data_type);
    out.push(duties.len() as u8);
    for (channel, duty) in duties {
        out.push(*channel);
        out.push(*duty);
    }
    out
}

/// Write duties, retrying while the device refuses them.
pub fn write_duties(framer: &Framer, duties: &[(u8, u8)]) -> bool {
    let cmd = framer.commands();
    let payload = speed_payload(cmd.data_type_speed, duties);
    comm::write_with_ack_retry(
        framer,
        cmd.endpoints.set_speed,
        &payload,
        ACK_RETRY_ATTEMPTS,
        ACK_RETRY_DELAY,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::store::MemoryStore;
    use crate::transport::mock::MockTransport;

    fn curve() -> Vec<CurvePoint> {
        points(&[(30.0, 20), (50.0, 60), (80.0, 100)])
    }

    #[test]
    fn interpolation_is_piecewise_linear() {
        let c = curve();
        assert_eq!(interpolate(&c, 10.0), 20.0);
        assert_eq!(interpolate(&c, 40.0), 40.0);
        assert_eq!(interpolate(&c, 65.0), 80.0);
        assert_eq!(interpolate(&c, 95.0), 100.0);
        assert_eq!(interpolate(&[], 50.0), 100.0);
    }

    #[test]
    fn band_duties_and_clamps() {
        let p = SpeedProfile::default();
        assert_eq!(p.duty(55.0, false, false), 60);
        assert_eq!(p.duty(55.0, true, false), 70);
        assert_eq!(p.duty(120.0, false, false), 100);
        assert_eq!(p.duty(-5.0, false, false), 30);

        let low = SpeedProfile::with_bands(TempSource::Cpu, &[(0.0, 100.0, 5, 10)]);
        assert_eq!(low.duty(50.0, false, false), safety::FAN_DUTY_MIN);
        assert_eq!(low.duty(50.0, true, false), safety::PUMP_DUTY_MIN);
    }

    #[test]
    fn zero_rpm_allows_stopped_fans() {
        let mut p = SpeedProfile::with_bands(TempSource::Cpu, &[(0.0, 100.0, 0, 0)]);
        assert_eq!(p.duty(40.0, false, true), safety::FAN_DUTY_MIN);
        p.zero_rpm = true;
        assert_eq!(p.duty(40.0, false, true), 0);
        assert_eq!(p.duty(40.0, true, true), safety::PUMP_DUTY_MIN);
    }

    #[test]
    fn graph_mode_follows_curves() {
        let mut p = SpeedProfile::default();
        p.fan_points = curve();
        assert_eq!(p.duty(40.0, false, true), 40);
        assert_eq!(p.duty(40.0, false, false), 30);
    }

    #[test]
    fn library_created_on_first_load() {
        let store = MemoryStore::new();
        let lib = SpeedLibrary::load(&store).unwrap();
        assert!(lib.get(DEFAULT_SPEED_PROFILE).is_some());
        assert!(store.load(SPEED_PROFILES_KEY).unwrap().is_some());
        assert_eq!(SpeedLibrary::load(&store).unwrap(), lib);
    }

    #[test]
    fn tick_writes_only_changes() {
        let desc = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        let mock = MockTransport::new();
        let framer = Framer::new(Box::new(mock.clone()), desc);
        let mut ctl = SpeedController::new(desc);
        let lib = SpeedLibrary::default();
        let assignments = BTreeMap::new();
        let temp = std::cell::Cell::new(55.0f32);
        let read = |_: &TempSource| temp.get();

        let written = ctl.tick(&framer, &assignments, &lib, &read, false);
        assert_eq!(written.len(), desc.fan_channels as usize);
        assert!(written.iter().all(|(_, d)| *d == 60));
        assert_eq!(mock.written().len(), 4);

        mock.clear_written();
        assert!(ctl.tick(&framer, &assignments, &lib, &read, false).is_empty());
        assert!(mock.written().is_empty());

        temp.set(75.0);
        assert_eq!(ctl.tick(&framer, &assignments, &lib, &read, false).len(), 6);
    }

    #[test]
    fn failed_write_is_retried_next_tick() {
        let desc = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        let mock = MockTransport::new();
        let framer = Framer::new(Box::new(mock.clone()), desc);
        let mut ctl = SpeedController::new(desc);
        let lib = SpeedLibrary::default();
        let assignments = BTreeMap::new();
        let read = |_: &TempSource| 55.0f32;

        mock.fail_writes(true);
        assert!(ctl.tick(&framer, &assignments, &lib, &read, false).is_empty());

        mock.fail_writes(false);
        let written = ctl.tick(&framer, &assignments, &lib, &read, false);
        assert_eq!(written.len(), desc.fan_channels as usize);
        assert!(written.iter().all(|(_, d)| *d == 60));
        assert_eq!(mock.written().len(), 4);
    }

    #[test]
    fn payload_layout() {
        assert_eq!(
            speed_payload([0x07, 0x00], &[(0, 70), (1, 60)]),
            vec![0x07, 0x00, 2, 0, 70, 1, 60]
        );
    }
}
