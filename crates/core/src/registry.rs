//! Process-wide registry: shared services plus every attached device,
//! keyed by serial.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterProfile};
use crate::comm;
use crate::config::Config;
use crate::device::{self, pids, DeviceDescriptor, DeviceInfo, VENDOR_ID};
use crate::driver::{Device, Services};
use crate::error::{Error, Result};
use crate::macros::{InputSynth, MacroLibrary};
use crate::openrgb::{self, ExternalTarget};
use crate::psu::SerialTransport;
use crate::speed::SpeedLibrary;
use crate::store::ProfileStore;
use crate::task::{Shutdown, TaskSet};
use crate::temperature::{TemperatureCache, TemperatureProvider};
use crate::transport::{HidTransport, HidapiTransport};

pub struct Registry {
    services: Services,
    devices: Mutex<BTreeMap<String, Arc<Device>>>,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl Registry {
    /// Load the shared libraries from `store` and build the services.
    pub fn new(
        config: Config,
        store: Arc<dyn ProfileStore>,
        provider: Arc<dyn TemperatureProvider>,
        synth: Arc<dyn InputSynth>,
    ) -> Result<Self> {
        let temperatures = Arc::new(TemperatureCache::new(provider));
        let cluster = Cluster::new(ClusterProfile::load(&*store)?, Some(Arc::clone(&temperatures)));
        let speed_profiles = SpeedLibrary::load(&*store)?;
        let macros = MacroLibrary::load(&*store)?;
        let services = Services {
            config: Arc::new(config),
            store,
            temperatures,
            synth,
            cluster: Arc::new(cluster),
            external: Arc::new(ExternalTarget::new()),
            speed_profiles: Arc::new(RwLock::new(speed_profiles)),
            macros: Arc::new(RwLock::new(macros)),
        };
        Ok(Self {
            services,
            devices: Mutex::new(BTreeMap::new()),
            shutdown: Shutdown::new(),
            tasks: TaskSet::new(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Start the temperature refresh, the cluster loop and, when enabled,
    /// the external color target.
    pub async fn start(&self) -> Result<()> {
        let temperatures = Arc::clone(&self.services.temperatures);
        self.tasks.spawn("temperatures", temperatures.run(self.shutdown.subscribe()));
        let cluster = Arc::clone(&self.services.cluster);
        self.tasks.spawn("cluster", cluster.run(self.shutdown.subscribe()));

        let config = &self.services.config;
        if config.enable_openrgb_target_server {
            let listener = openrgb::bind(&config.listen_address, config.openrgb_port).await?;
            let target = Arc::clone(&self.services.external);
            self.tasks
                .spawn("openrgb", openrgb::serve(target, listener, self.shutdown.subscribe()));
        }
        Ok(())
    }

    /// Initialize a device over `transport` and track it. A device already
    /// tracked under the same serial is stopped without touching hardware.
    pub async fn attach(
        &self,
        descriptor: &'static DeviceDescriptor,
        transport: Box<dyn HidTransport>,
        input: Option<Box<dyn HidTransport>>,
        serial_hint: Option<&str>,
    ) -> Result<Arc<Device>> {
        let device = Device::init(descriptor, transport, input, serial_hint, self.services.clone()).await?;
        let previous = self
            .devices
            .lock()
            .insert(device.serial().to_string(), Arc::clone(&device));
        if let Some(old) = previous {
            warn!(serial = %old.serial(), "device re-attached, dropping the old instance");
            old.stop_dirty().await;
        }
        Ok(device)
    }

    /// Open an enumerated HID device plus its input interface, if any.
    pub async fn open_hid(&self, info: &DeviceInfo) -> Result<Arc<Device>> {
        let desc = info.descriptor;
        let path = info.path.clone();
        let (transport, input) = tokio::task::spawn_blocking(move || -> Result<_> {
            let transport = comm::retry_transient(comm::MAX_RETRIES, || {
                HidapiTransport::open(desc.vendor_id, desc.product_id, Some(&path))
            })?;
            let input = match desc.input {
                Some(layout) => {
                    match HidapiTransport::open_interface(desc.vendor_id, desc.product_id, layout.interface) {
                        Ok(t) => Some(Box::new(t) as Box<dyn HidTransport>),
                        Err(e) => {
                            warn!(product = desc.name, error = %e, "input interface unavailable");
                            None
                        }
                    }
                }
                None => None,
            };
            Ok((transport, input))
        })
        .await
        .map_err(|e| Error::HidOpen(e.to_string()))??;
        self.attach(desc, Box::new(transport), input, info.serial.as_deref())
            .await
    }

    /// Open a PSU behind the USB-serial dongle at `tty`.
    pub async fn open_serial(&self, tty: &str) -> Result<Arc<Device>> {
        let desc = device::descriptor(VENDOR_ID, pids::AXI_DONGLE)
            .ok_or_else(|| Error::DeviceNotFound("serial PSU descriptor".into()))?;
        let path = tty.to_string();
        let transport = tokio::task::spawn_blocking(move || SerialTransport::open(&path))
            .await
            .map_err(|e| Error::HidOpen(e.to_string()))??;
        self.attach(desc, Box::new(transport), None, None).await
    }

    /// Enumerate and open every supported HID device. Returns how many came
    /// up; failures are logged and skipped.
    pub async fn discover(&self) -> Result<usize> {
        let found = tokio::task::spawn_blocking(device::discover_devices)
            .await
            .map_err(|e| Error::Hid(e.to_string()))??;
        let mut opened = 0;
        for info in &found {
            match self.open_hid(info).await {
                Ok(device) => {
                    info!(product = %device.product(), serial = %device.serial(), "device attached");
                    opened += 1;
                }
                Err(e) => warn!(product = info.descriptor.name, path = %info.path, error = %e, "device skipped"),
            }
        }
        Ok(opened)
    }

    pub fn device(&self, serial: &str) -> Option<Arc<Device>> {
        self.devices.lock().get(serial).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    /// Stop and forget one device. `clean` hands it back to its firmware.
    pub async fn remove(&self, serial: &str, clean: bool) -> bool {
        let Some(device) = self.devices.lock().remove(serial) else {
            return false;
        };
        if clean {
            device.stop().await;
        } else {
            device.stop_dirty().await;
        }
        true
    }

    /// Stop every device, then the shared loops.
    pub async fn stop_all(&self) {
        let devices: Vec<Arc<Device>> = std::mem::take(&mut *self.devices.lock()).into_values().collect();
        for device in devices {
            device.stop().await;
        }
        self.shutdown.trigger();
        self.tasks.join_all().await;
        info!("registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::RecordingSynth;
    use crate::store::MemoryStore;
    use crate::temperature::FixedTemperatures;
    use crate::transport::mock::MockTransport;

    fn registry() -> Registry {
        Registry::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedTemperatures::new()),
            Arc::new(RecordingSynth::new()),
        )
        .unwrap()
    }

    fn hub_mock(serial: &str) -> MockTransport {
        let mock = MockTransport::with_info(serial, "iCUE LINK System Hub");
        mock.push_response(vec![0x00, 0x02, 0x00, 2, 5, 0x10, 0x00]);
        mock
    }

    #[tokio::test]
    async fn attach_track_and_remove() {
        let registry = registry();
        registry.start().await.unwrap();
        let desc = device::descriptor(VENDOR_ID, pids::LINK_SYSTEM_HUB).unwrap();
        registry
            .attach(desc, Box::new(hub_mock("LH01")), None, None)
            .await
            .unwrap();
        assert!(registry.device("LH01").is_some());
        assert_eq!(registry.devices().len(), 1);
        assert!(registry.remove("LH01", true).await);
        assert!(!registry.remove("LH01", true).await);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn reattach_replaces_and_stops_old_instance() {
        let registry = registry();
        let desc = device::descriptor(VENDOR_ID, pids::LINK_SYSTEM_HUB).unwrap();
        let first = registry
            .attach(desc, Box::new(hub_mock("LH02")), None, None)
            .await
            .unwrap();
        let second = registry
            .attach(desc, Box::new(hub_mock("LH02")), None, None)
            .await
            .unwrap();
        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        registry.stop_all().await;
        assert!(second.is_stopped());
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn reattach_keeps_the_new_cluster_registration() {
        let registry = registry();
        let desc = device::descriptor(VENDOR_ID, pids::LINK_SYSTEM_HUB).unwrap();
        let first = registry
            .attach(desc, Box::new(hub_mock("LH09")), None, None)
            .await
            .unwrap();
        assert_eq!(first.toggle_rgb_cluster().await, crate::error::Status::Ok);
        assert_eq!(registry.services().cluster.len(), 1);

        let second = registry
            .attach(desc, Box::new(hub_mock("LH09")), None, None)
            .await
            .unwrap();
        assert!(first.is_stopped());
        assert_eq!(second.color_source(), crate::sink::ColorSource::Cluster);
        let controllers = registry.services().cluster.snapshot();
        assert_eq!(controllers.len(), 1);
        assert!((controllers[0].write)(&vec![0; desc.led_channels * 3], 0));
        registry.stop_all().await;
        assert!(registry.services().cluster.is_empty());
    }

    #[tokio::test]
    async fn libraries_are_created_on_first_start() {
        let store = Arc::new(MemoryStore::new());
        Registry::new(
            Config::default(),
            store.clone(),
            Arc::new(FixedTemperatures::new()),
            Arc::new(RecordingSynth::new()),
        )
        .unwrap();
        assert!(store.load(crate::store::SPEED_PROFILES_KEY).unwrap().is_some());
    }
}
