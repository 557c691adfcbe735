//! Cross-device RGB cluster.
//!
//! The aggregator renders one global frame covering every registered
//! controller's LEDs and hands each controller its slice. Offsets follow
//! registration order. Controllers are registered by their write function
//! only, so the aggregator never holds a device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::effect::{EffectKind, EffectState};
use crate::error::Result;
use crate::rgb::RgbProfile;
use crate::store::{self, ProfileStore};
use crate::task;
use crate::temperature::TemperatureCache;

/// Cluster render cadence.
pub const CLUSTER_TICK: Duration = Duration::from_millis(10);

/// Store key of the cluster effect settings.
pub const CLUSTER_KEY: &str = "cluster.json";

/// Write callback of one controller: `(slice, channel) -> delivered`.
pub type ClusterWriteFn = Arc<dyn Fn(&[u8], u8) -> bool + Send + Sync>;

/// A registered controller.
#[derive(Clone)]
pub struct ClusterController {
    pub product: String,
    pub serial: String,
    pub led_channels: usize,
    pub write: ClusterWriteFn,
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("product", &self.product)
            .field("serial", &self.serial)
            .field("led_channels", &self.led_channels)
            .finish_non_exhaustive()
    }
}

/// Effect played across the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterProfile {
    pub effect: EffectKind,
    pub profile: RgbProfile,
}

impl Default for ClusterProfile {
    fn default() -> Self {
        Self {
            effect: EffectKind::Rainbow,
            profile: RgbProfile::defaults_for(EffectKind::Rainbow),
        }
    }
}

impl ClusterProfile {
    pub fn load(store: &dyn ProfileStore) -> Result<Self> {
        Ok(store::load_json(store, CLUSTER_KEY)?.unwrap_or_default())
    }

    pub fn save(&self, store: &dyn ProfileStore) -> Result<()> {
        store::save_json(store, CLUSTER_KEY, self)
    }
}

struct Renderer {
    effect: EffectState,
    started: Instant,
}

/// The cluster aggregator.
pub struct Cluster {
    controllers: Mutex<Vec<ClusterController>>,
    profile: Mutex<ClusterProfile>,
    renderer: Mutex<Option<Renderer>>,
    temperatures: Option<Arc<TemperatureCache>>,
}

impl Cluster {
    pub fn new(profile: ClusterProfile, temperatures: Option<Arc<TemperatureCache>>) -> Self {
        if let (Some(cache), Some(source)) = (&temperatures, profile.effect.temperature_source()) {
            cache.watch(source);
        }
        Self {
            controllers: Mutex::new(Vec::new()),
            profile: Mutex::new(profile),
            renderer: Mutex::new(None),
            temperatures,
        }
    }

    /// Add a controller at the end of the frame. A controller already
    /// registered under the same serial is replaced in place.
    pub fn register(&self, controller: ClusterController) {
        let mut controllers = self.controllers.lock();
        info!(
            serial = %controller.serial,
            product = %controller.product,
            leds = controller.led_channels,
            "cluster controller registered"
        );
        match controllers.iter_mut().find(|c| c.serial == controller.serial) {
            Some(slot) => *slot = controller,
            None => controllers.push(controller),
        }
        drop(controllers);
        self.reset_renderer();
    }

    /// Remove a controller; later controllers shift down.
    pub fn unregister(&self, serial: &str) -> bool {
        self.remove_where(serial, |c| c.serial == serial)
    }

    /// Remove the controller registered with `write`, if it is still the
    /// one in place. A controller that replaced it under the same serial
    /// stays.
    pub fn unregister_write(&self, serial: &str, write: &ClusterWriteFn) -> bool {
        self.remove_where(serial, |c| Arc::ptr_eq(&c.write, write))
    }

    fn remove_where(&self, serial: &str, matches: impl Fn(&ClusterController) -> bool) -> bool {
        let mut controllers = self.controllers.lock();
        let before = controllers.len();
        controllers.retain(|c| !matches(c));
        let removed = controllers.len() != before;
        drop(controllers);
        if removed {
            info!(serial, "cluster controller unregistered");
            self.reset_renderer();
        }
        removed
    }

    /// Copy of the controller list in registration order.
    pub fn snapshot(&self) -> Vec<ClusterController> {
        self.controllers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn profile(&self) -> ClusterProfile {
        self.profile.lock().clone()
    }

    /// Replace the cluster effect; playback restarts on the next tick.
    pub fn set_profile(&self, profile: ClusterProfile) {
        if let (Some(cache), Some(source)) = (&self.temperatures, profile.effect.temperature_source()) {
            cache.watch(source);
        }
        *self.profile.lock() = profile;
        self.reset_renderer();
    }

    fn reset_renderer(&self) {
        *self.renderer.lock() = None;
    }

    /// Render the global frame for `controllers`: `total_leds × 3` bytes.
    pub fn render(&self, controllers: &[ClusterController]) -> Vec<u8> {
        let total: usize = controllers.iter().map(|c| c.led_channels).sum();
        let profile = self.profile();
        let temperature = profile
            .effect
            .temperature_source()
            .zip(self.temperatures.as_ref())
            .map(|(source, cache)| f64::from(cache.get(&source)));

        let mut renderer = self.renderer.lock();
        let stale = renderer
            .as_ref()
            .map_or(true, |r| r.effect.led_count() != total);
        if stale {
            *renderer = Some(Renderer {
                effect: EffectState::new(profile.effect, profile.profile.effect_config(1.0), total),
                started: Instant::now(),
            });
        }
        match renderer.as_mut() {
            Some(r) => {
                let t = r.started.elapsed().as_secs_f64();
                r.effect.render_bytes(t, temperature)
            }
            None => vec![0; total * 3],
        }
    }

    /// Cut `frame` into per-controller slices in registration order.
    pub fn slices(controllers: &[ClusterController], frame: &[u8]) -> Vec<Vec<u8>> {
        let mut offset = 0;
        controllers
            .iter()
            .map(|c| {
                let len = c.led_channels * 3;
                let end = (offset + len).min(frame.len());
                let start = offset.min(end);
                offset += len;
                frame[start..end].to_vec()
            })
            .collect()
    }

    /// Render one frame and deliver every slice, one blocking task per
    /// controller, waiting for all of them.
    pub async fn tick(&self) {
        let controllers = self.snapshot();
        if controllers.is_empty() {
            return;
        }
        let frame = self.render(&controllers);
        let slices = Self::slices(&controllers, &frame);
        let handles: Vec<_> = controllers
            .into_iter()
            .zip(slices)
            .map(|(c, slice)| {
                let write = Arc::clone(&c.write);
                (c.serial, tokio::task::spawn_blocking(move || write(&slice, 0)))
            })
            .collect();
        for (serial, handle) in handles {
            if let Err(e) = handle.await {
                warn!(serial = %serial, error = %e, "cluster write task failed");
            }
        }
    }

    /// Render loop at [`CLUSTER_TICK`] until cancelled.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        debug!("cluster render loop started");
        while task::sleep_or_cancel(CLUSTER_TICK, &mut cancel).await {
            self.tick().await;
        }
        debug!("cluster render loop stopped");
    }
}
