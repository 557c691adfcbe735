//! Temperature sources and the shared reading cache.
//!
//! Host sensors (CPU, GPU, storage, memory, external programs) live behind
//! [`TemperatureProvider`]. Device-internal sensors (liquid, probes) are read
//! by the telemetry poller and never go through a provider.
//!
//! [`TemperatureCache`] refreshes every watched source once per second so the
//! speed controller and temperature effects never block on a slow sensor.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Refresh cadence for the temperature cache.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Where a temperature reading comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TempSource {
    Cpu,
    Gpu,
    /// Storage device, by hwmon chip name or serial.
    Storage(String),
    /// Coolant temperature reported by the device itself.
    Liquid,
    Memory,
    /// Device temperature probe by index.
    Probe(u8),
    /// Value produced by an external provider, by name.
    External(String),
}

impl TempSource {
    /// Sources measured by the device rather than the host.
    pub fn is_device_internal(&self) -> bool {
        matches!(self, TempSource::Liquid | TempSource::Probe(_))
    }
}

/// Host temperature provider. Returns degrees Celsius, 0.0 when unavailable.
pub trait TemperatureProvider: Send + Sync {
    fn get_temperature(&self, source: &TempSource) -> f32;
}

/// Provider backed by a fixed table; used for previews and tests.
#[derive(Debug, Default)]
pub struct FixedTemperatures {
    values: RwLock<HashMap<TempSource, f32>>,
}

impl FixedTemperatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source: TempSource, value: f32) {
        self.values.write().insert(source, value);
    }
}

impl TemperatureProvider for FixedTemperatures {
    fn get_temperature(&self, source: &TempSource) -> f32 {
        self.values.read().get(source).copied().unwrap_or(0.0)
    }
}

/// hwmon chip names that report the CPU package temperature.
const CPU_CHIPS: &[&str] = &["k10temp", "coretemp", "zenpower", "cpu_thermal"];
const GPU_CHIPS: &[&str] = &["amdgpu", "nouveau", "i915", "xe"];
const MEMORY_CHIPS: &[&str] = &["spd5118", "jc42"];

/// Provider that reads `temp1_input` from `/sys/class/hwmon` chips.
#[derive(Debug, Clone)]
pub struct HwmonProvider {
    root: PathBuf,
}

impl Default for HwmonProvider {
    fn default() -> Self {
        Self::new("/sys/class/hwmon")
    }
}

impl HwmonProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chip_dirs(&self) -> Vec<(String, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut chips: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let dir = e.path();
                let name = fs::read_to_string(dir.join("name")).ok()?;
                Some((name.trim().to_string(), dir))
            })
            .collect();
        chips.sort();
        chips
    }

    fn read_first(&self, names: &[&str]) -> Option<f32> {
        self.chip_dirs()
            .into_iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .find_map(|(_, dir)| read_millidegrees(&dir.join("temp1_input")))
    }
}

fn read_millidegrees(path: &Path) -> Option<f32> {
    let raw = fs::read_to_string(path).ok()?;
    let milli: i64 = raw.trim().parse().ok()?;
    Some(milli as f32 / 1000.0)
}

impl TemperatureProvider for HwmonProvider {
    fn get_temperature(&self, source: &TempSource) -> f32 {
        let value = match source {
            TempSource::Cpu => self.read_first(CPU_CHIPS),
            TempSource::Gpu => self.read_first(GPU_CHIPS),
            TempSource::Memory => self.read_first(MEMORY_CHIPS),
            TempSource::Storage(name) => self.read_first(&[name.as_str(), "nvme", "drivetemp"]),
            TempSource::External(name) => self.read_first(&[name.as_str()]),
            TempSource::Liquid | TempSource::Probe(_) => None,
        };
        trace!(?source, ?value, "hwmon temperature read");
        value.unwrap_or(0.0)
    }
}

/// Latest host readings for every watched source.
pub struct TemperatureCache {
    provider: Arc<dyn TemperatureProvider>,
    watched: RwLock<BTreeSet<TempSource>>,
    values: RwLock<HashMap<TempSource, f32>>,
}

impl TemperatureCache {
    pub fn new(provider: Arc<dyn TemperatureProvider>) -> Self {
        Self {
            provider,
            watched: RwLock::new(BTreeSet::new()),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Start refreshing `source`; reads it once immediately.
    pub fn watch(&self, source: TempSource) {
        if source.is_device_internal() {
            return;
        }
        let inserted = self.watched.write().insert(source.clone());
        if inserted {
            debug!(?source, "watching temperature source");
            let value = self.provider.get_temperature(&source);
            self.values.write().insert(source, value);
        }
    }

    /// Cached value, reading through to the provider on a miss.
    pub fn get(&self, source: &TempSource) -> f32 {
        if let Some(v) = self.values.read().get(source) {
            return *v;
        }
        self.provider.get_temperature(source)
    }

    /// Re-read every watched source.
    pub fn refresh(&self) {
        let sources: Vec<TempSource> = self.watched.read().iter().cloned().collect();
        let fresh: Vec<(TempSource, f32)> = sources
            .into_iter()
            .map(|s| {
                let v = self.provider.get_temperature(&s);
                (s, v)
            })
            .collect();
        let mut values = self.values.write();
        for (s, v) in fresh {
            values.insert(s, v);
        }
    }

    /// Refresh loop; returns when `cancel` flips to true or its sender drops.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
            if *cancel.borrow() {
                break;
            }
            let cache = Arc::clone(&self);
            // Sensor reads touch sysfs; keep them off the async workers.
            if tokio::task::spawn_blocking(move || cache.refresh())
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("temperature cache refresh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reads_through_and_refreshes() {
        let fixed = Arc::new(FixedTemperatures::new());
        fixed.set(TempSource::Cpu, 40.0);
        let cache = TemperatureCache::new(fixed.clone());
        cache.watch(TempSource::Cpu);
        assert_eq!(cache.get(&TempSource::Cpu), 40.0);

        fixed.set(TempSource::Cpu, 61.5);
        assert_eq!(cache.get(&TempSource::Cpu), 40.0);
        cache.refresh();
        assert_eq!(cache.get(&TempSource::Cpu), 61.5);
    }

    #[test]
    fn device_internal_sources_are_not_watched() {
        let cache = TemperatureCache::new(Arc::new(FixedTemperatures::new()));
        cache.watch(TempSource::Liquid);
        assert!(cache.watched.read().is_empty());
    }

    #[test]
    fn hwmon_provider_reads_named_chip() {
        let dir = tempfile::tempdir().unwrap();
        let chip = dir.path().join("hwmon3");
        fs::create_dir(&chip).unwrap();
        fs::write(chip.join("name"), "k10temp\n").unwrap();
        fs::write(chip.join("temp1_input"), "48250\n").unwrap();

        let provider = HwmonProvider::new(dir.path());
        assert_eq!(provider.get_temperature(&TempSource::Cpu), 48.25);
        assert_eq!(provider.get_temperature(&TempSource::Gpu), 0.0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let cache = Arc::new(TemperatureCache::new(Arc::new(FixedTemperatures::new())));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(cache.run(rx));
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
