//! External color target: a TCP server speaking the OpenRGB SDK protocol so
//! a remote process can drive per-LED colors.
//!
//! Devices that enable the integration register an [`ExternalController`];
//! its device id on the wire is its position in registration order. Colors
//! received for a controller go to its [`ColorSink`], normally the device's
//! bounded external queue.

pub mod protocol;
pub mod server;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::device::{DeviceDescriptor, ProductKind};
use crate::sink::ColorSink;

pub use server::{bind, serve};

/// Vendor string reported for every controller.
pub const VENDOR: &str = "Corsair";

/// Controller classification, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Cooler = 3,
    LedStrip = 4,
    Mouse = 6,
    MouseMat = 7,
    Unknown = 19,
}

impl From<ProductKind> for DeviceType {
    fn from(kind: ProductKind) -> Self {
        match kind {
            ProductKind::FanHub => Self::Cooler,
            ProductKind::Mouse => Self::Mouse,
            ProductKind::Mousepad => Self::MouseMat,
            ProductKind::Psu => Self::Unknown,
        }
    }
}

/// Zone layout, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ZoneType {
    Single = 0,
    Linear = 1,
    Matrix = 2,
}

/// Row-major LED index map of a matrix zone; `0xFFFF_FFFF` marks an empty cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub height: u32,
    pub width: u32,
    pub map: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalZone {
    pub name: String,
    pub zone_type: ZoneType,
    pub led_count: u32,
    pub matrix: Option<Matrix>,
}

impl ExternalZone {
    pub fn linear(name: impl Into<String>, led_count: u32) -> Self {
        let zone_type = if led_count == 1 {
            ZoneType::Single
        } else {
            ZoneType::Linear
        };
        Self {
            name: name.into(),
            zone_type,
            led_count,
            matrix: None,
        }
    }
}

/// Zones exposed for a device: one per catalog zone, or a single linear
/// zone covering every LED.
pub fn zones_for(desc: &DeviceDescriptor) -> Vec<ExternalZone> {
    if desc.zones.is_empty() {
        return vec![ExternalZone::linear("LEDs", desc.led_channels as u32)];
    }
    desc.zones
        .iter()
        .map(|z| ExternalZone::linear(z.name, z.positions.len() as u32))
        .collect()
}

/// One controller as seen by the remote client.
pub struct ExternalController {
    pub device_type: DeviceType,
    pub name: String,
    pub vendor: String,
    pub description: String,
    pub firmware: String,
    pub serial: String,
    pub location: String,
    pub zones: Vec<ExternalZone>,
    pub led_names: Vec<String>,
    colors: Mutex<Vec<u8>>,
    sink: Arc<dyn ColorSink>,
}

impl std::fmt::Debug for ExternalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalController")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("zones", &self.zones.len())
            .finish_non_exhaustive()
    }
}

impl ExternalController {
    pub fn new(
        device_type: DeviceType,
        name: &str,
        serial: &str,
        firmware: &str,
        zones: Vec<ExternalZone>,
        sink: Arc<dyn ColorSink>,
    ) -> Self {
        let led_names: Vec<String> = zones
            .iter()
            .flat_map(|z| (1..=z.led_count).map(move |i| format!("{} LED {i}", z.name)))
            .collect();
        let colors = vec![0; led_names.len() * 3];
        Self {
            device_type,
            name: name.to_string(),
            vendor: VENDOR.to_string(),
            description: name.to_string(),
            firmware: firmware.to_string(),
            serial: serial.to_string(),
            location: format!("HID: {serial}"),
            zones,
            led_names,
            colors: Mutex::new(colors),
            sink,
        }
    }

    pub fn led_count(&self) -> usize {
        self.led_names.len()
    }

    /// Last colors received, `R,G,B` per LED.
    pub fn colors(&self) -> Vec<u8> {
        self.colors.lock().clone()
    }

    /// Replace every LED color and forward the frame. Extra colors are
    /// ignored, missing ones keep their previous value.
    pub fn update(&self, rgb: &[u8]) -> bool {
        let frame = {
            let mut colors = self.colors.lock();
            let n = rgb.len().min(colors.len());
            colors[..n].copy_from_slice(&rgb[..n]);
            colors.clone()
        };
        self.sink.write(&frame, 0)
    }

    /// Replace the colors of one zone.
    pub fn update_zone(&self, zone: usize, rgb: &[u8]) -> bool {
        let Some(start) = self.zone_offset(zone) else {
            return false;
        };
        let frame = {
            let mut colors = self.colors.lock();
            let len = (self.zones[zone].led_count as usize * 3).min(rgb.len());
            colors[start..start + len].copy_from_slice(&rgb[..len]);
            colors.clone()
        };
        self.sink.write(&frame, 0)
    }

    /// Replace one LED's color.
    pub fn update_led(&self, index: usize, rgb: [u8; 3]) -> bool {
        if index >= self.led_count() {
            return false;
        }
        let frame = {
            let mut colors = self.colors.lock();
            colors[index * 3..index * 3 + 3].copy_from_slice(&rgb);
            colors.clone()
        };
        self.sink.write(&frame, 0)
    }

    fn zone_offset(&self, zone: usize) -> Option<usize> {
        if zone >= self.zones.len() {
            return None;
        }
        Some(
            self.zones[..zone]
                .iter()
                .map(|z| z.led_count as usize * 3)
                .sum(),
        )
    }
}

/// Controller registry and the single connected client.
#[derive(Default)]
pub struct ExternalTarget {
    controllers: Mutex<Vec<Arc<ExternalController>>>,
    client: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    client_name: Mutex<String>,
}

impl ExternalTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller; one with the same serial is replaced in place.
    pub fn register(&self, controller: Arc<ExternalController>) {
        {
            let mut controllers = self.controllers.lock();
            info!(serial = %controller.serial, leds = controller.led_count(), "external controller registered");
            match controllers.iter_mut().find(|c| c.serial == controller.serial) {
                Some(slot) => *slot = controller,
                None => controllers.push(controller),
            }
        }
        self.notify();
    }

    pub fn unregister(&self, serial: &str) -> bool {
        self.remove_where(serial, |c| c.serial == serial)
    }

    /// Remove `controller` if it is still registered; a newer controller
    /// under the same serial stays.
    pub fn unregister_controller(&self, controller: &Arc<ExternalController>) -> bool {
        self.remove_where(&controller.serial, |c| Arc::ptr_eq(c, controller))
    }

    fn remove_where(&self, serial: &str, matches: impl Fn(&Arc<ExternalController>) -> bool) -> bool {
        let removed = {
            let mut controllers = self.controllers.lock();
            let before = controllers.len();
            controllers.retain(|c| !matches(c));
            controllers.len() != before
        };
        if removed {
            info!(serial, "external controller unregistered");
            self.notify();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn controller(&self, device_id: u32) -> Option<Arc<ExternalController>> {
        self.controllers.lock().get(device_id as usize).cloned()
    }

    pub fn client_name(&self) -> String {
        self.client_name.lock().clone()
    }

    pub(crate) fn set_client_name(&self, name: String) {
        *self.client_name.lock() = name;
    }

    /// Route outgoing notifications to a newly accepted client.
    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
        *self.client.lock() = Some(tx);
    }

    pub(crate) fn detach(&self) {
        *self.client.lock() = None;
        self.client_name.lock().clear();
    }

    /// Tell the connected client that the controller list changed.
    pub fn notify(&self) {
        if let Some(tx) = self.client.lock().as_ref() {
            let packet = protocol::frame(0, protocol::packet::DEVICE_LIST_UPDATED, &[]);
            if tx.send(packet).is_err() {
                debug!("client gone before list notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};

    #[derive(Default)]
    struct Capture {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ColorSink for Capture {
        fn write(&self, buffer: &[u8], _channel: u8) -> bool {
            self.frames.lock().push(buffer.to_vec());
            true
        }
    }

    fn controller(sink: Arc<Capture>) -> ExternalController {
        let desc = descriptor(VENDOR_ID, pids::MM700_RGB).unwrap();
        ExternalController::new(desc.kind.into(), desc.name, "PAD", "1.0", zones_for(desc), sink)
    }

    #[test]
    fn led_names_follow_zones() {
        let c = controller(Arc::new(Capture::default()));
        assert_eq!(c.led_count(), 3);
        assert_eq!(c.device_type, DeviceType::MouseMat);
        assert_eq!(c.colors().len(), 9);
    }

    #[test]
    fn partial_updates_keep_other_leds() {
        let sink = Arc::new(Capture::default());
        let c = controller(Arc::clone(&sink));
        assert!(c.update(&[1, 1, 1, 2, 2, 2, 3, 3, 3]));
        assert!(c.update_led(1, [9, 9, 9]));
        assert!(!c.update_led(3, [9, 9, 9]));
        assert!(c.update_zone(2, &[7, 7, 7]));
        assert!(!c.update_zone(5, &[7, 7, 7]));
        let frames = sink.frames.lock();
        assert_eq!(frames.last().unwrap(), &vec![1, 1, 1, 9, 9, 9, 7, 7, 7]);
    }

    #[test]
    fn registry_notifies_client() {
        let target = ExternalTarget::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        target.attach(tx);
        target.register(Arc::new(controller(Arc::new(Capture::default()))));
        let packet = rx.try_recv().unwrap();
        assert_eq!(&packet[..4], b"ORGB");
        assert_eq!(u32::from_le_bytes([packet[8], packet[9], packet[10], packet[11]]), 100);
        assert!(target.unregister("PAD"));
        assert!(rx.try_recv().is_ok());
        assert!(target.is_empty());
    }

    #[test]
    fn replaced_controller_is_not_removed_by_its_predecessor() {
        let target = ExternalTarget::new();
        let old = Arc::new(controller(Arc::new(Capture::default())));
        let new = Arc::new(controller(Arc::new(Capture::default())));
        target.register(Arc::clone(&old));
        target.register(Arc::clone(&new));
        assert_eq!(target.len(), 1);
        assert!(!target.unregister_controller(&old));
        assert_eq!(target.len(), 1);
        assert!(target.unregister_controller(&new));
        assert!(target.is_empty());
    }
}
