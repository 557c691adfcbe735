//! Device catalog: supported products, their immutable descriptors and
//! enumeration of what is currently plugged in.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Vendor ID shared by every supported product.
pub const VENDOR_ID: u16 = 0x1B1C;

/// Known product IDs.
pub mod pids {
    pub const LINK_SYSTEM_HUB: u16 = 0x0C3F;
    pub const COMMANDER_CORE_XT: u16 = 0x0C2A;
    pub const KATAR_PRO_XT: u16 = 0x1BAC;
    pub const DARK_CORE_RGB_PRO: u16 = 0x1B80;
    pub const MM700_RGB: u16 = 0x1B9B;
    pub const HX1200I: u16 = 0x1C23;
    /// USB-serial dongle shipped with the AXi power supplies.
    pub const AXI_DONGLE: u16 = 0x1C11;
}

/// Broad product family; decides which background loops a device runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductKind {
    FanHub,
    Mouse,
    Mousepad,
    Psu,
}

/// How the control interface is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Hid,
    /// tty exposed by a USB-serial bridge.
    Serial,
}

/// Opcode byte strings and endpoint ids used by the transaction bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTable {
    /// Marker written after the report id on every output report.
    pub write_marker: u8,
    pub open_endpoint: &'static [u8],
    pub open_color_endpoint: &'static [u8],
    pub close_endpoint: &'static [u8],
    pub write: &'static [u8],
    pub write_color: &'static [u8],
    pub write_color_continuation: &'static [u8],
    pub read: &'static [u8],
    pub software_mode: &'static [u8],
    pub hardware_mode: &'static [u8],
    pub get_firmware: &'static [u8],
    /// Data-type tag prepended to color payloads.
    pub data_type_color: [u8; 2],
    /// Data-type tag prepended to speed payloads.
    pub data_type_speed: [u8; 2],
    pub endpoints: Endpoints,
}

/// Endpoint ids; opened before a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub color: &'static [u8],
    pub speeds: &'static [u8],
    pub set_speed: &'static [u8],
    pub temperatures: &'static [u8],
    pub battery: &'static [u8],
    pub polling_rate: &'static [u8],
    pub lift_height: &'static [u8],
    pub angle_snapping: &'static [u8],
    pub sleep_mode: &'static [u8],
    pub dpi: &'static [u8],
    pub keep_alive: &'static [u8],
}

/// Command table shared by the product family.
pub const DEFAULT_COMMANDS: CommandTable = CommandTable {
    write_marker: 0x01,
    open_endpoint: &[0x0D, 0x01],
    open_color_endpoint: &[0x0D, 0x00],
    close_endpoint: &[0x05, 0x01, 0x01],
    write: &[0x06, 0x01],
    write_color: &[0x06, 0x00],
    write_color_continuation: &[0x07, 0x00],
    read: &[0x08, 0x01],
    software_mode: &[0x01, 0x03, 0x00, 0x02],
    hardware_mode: &[0x01, 0x03, 0x00, 0x01],
    get_firmware: &[0x02, 0x13],
    data_type_color: [0x12, 0x00],
    data_type_speed: [0x07, 0x00],
    endpoints: Endpoints {
        color: &[0x22],
        speeds: &[0x17],
        set_speed: &[0x18],
        temperatures: &[0x21],
        battery: &[0x0F],
        polling_rate: &[0x01],
        lift_height: &[0x03],
        angle_snapping: &[0x07],
        sleep_mode: &[0x37],
        dpi: &[0x21, 0x00],
        keep_alive: &[0x12],
    },
};

/// Polling rate options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PollingRate {
    Hz125 = 125,
    Hz250 = 250,
    Hz500 = 500,
    Hz1000 = 1000,
    Hz2000 = 2000,
    Hz4000 = 4000,
    Hz8000 = 8000,
}

impl PollingRate {
    /// Convert from raw Hz value.
    pub fn from_hz(hz: u16) -> Option<Self> {
        match hz {
            125 => Some(Self::Hz125),
            250 => Some(Self::Hz250),
            500 => Some(Self::Hz500),
            1000 => Some(Self::Hz1000),
            2000 => Some(Self::Hz2000),
            4000 => Some(Self::Hz4000),
            8000 => Some(Self::Hz8000),
            _ => None,
        }
    }

    /// Get the Hz value.
    pub fn as_hz(&self) -> u16 {
        *self as u16
    }

    /// Byte the device expects for this rate.
    pub fn code(&self) -> u8 {
        match self {
            Self::Hz125 => 1,
            Self::Hz250 => 2,
            Self::Hz500 => 3,
            Self::Hz1000 => 4,
            Self::Hz2000 => 5,
            Self::Hz4000 => 6,
            Self::Hz8000 => 7,
        }
    }

    /// All known rates.
    pub const ALL: &'static [PollingRate] = &[
        PollingRate::Hz125,
        PollingRate::Hz250,
        PollingRate::Hz500,
        PollingRate::Hz1000,
        PollingRate::Hz2000,
        PollingRate::Hz4000,
        PollingRate::Hz8000,
    ];
}

impl std::fmt::Display for PollingRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz", self.as_hz())
    }
}

/// DPI limits of a mouse sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiRange {
    pub min: u16,
    pub max: u16,
    pub step: u16,
}

/// What a physical button does out of the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonRole {
    Left,
    Right,
    Middle,
    Back,
    Forward,
    DpiUp,
    DpiDown,
    Sniper,
    ProfileSwitch,
}

/// One physical button: its bit in the input mask and its default role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonDef {
    pub mask: u32,
    pub name: &'static str,
    pub role: ButtonRole,
}

/// Named group of LED positions inside the color frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneDef {
    pub id: u8,
    pub name: &'static str,
    pub positions: &'static [usize],
}

/// Layout of reports on the input interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
    pub interface: i32,
    /// Byte 1 of an input report that carries the button mask.
    pub button_report: u8,
    /// Byte 1 of a report that carries the battery level.
    pub battery_report: u8,
    /// Offset of the little-endian u32 button mask.
    pub mask_offset: usize,
    /// Offset of the little-endian u16 battery value (per-mille).
    pub battery_offset: usize,
}

/// One PSU output rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsuRail {
    pub name: &'static str,
    /// PMBus PAGE selecting this rail.
    pub page: u8,
}

/// Immutable description of a supported product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: &'static str,
    pub kind: ProductKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub link: Link,
    /// Output report size including the report id.
    pub report_size: usize,
    pub led_channels: usize,
    pub zones: &'static [ZoneDef],
    pub fan_channels: u8,
    /// Fan channels that drive a pump.
    pub pump_channels: &'static [u8],
    pub temperature_probes: u8,
    pub rails: &'static [PsuRail],
    pub wireless: bool,
    pub input: Option<InputLayout>,
    pub buttons: &'static [ButtonDef],
    pub dpi: Option<DpiRange>,
    pub polling_rates: &'static [PollingRate],
    pub lift_height: bool,
    pub angle_snapping: bool,
    pub sleep_mode: bool,
    pub commands: &'static CommandTable,
}

impl DeviceDescriptor {
    pub fn is_pump(&self, channel: u8) -> bool {
        self.pump_channels.contains(&channel)
    }

    pub fn zone(&self, id: u8) -> Option<&'static ZoneDef> {
        self.zones.iter().find(|z| z.id == id)
    }
}

const MOUSE_BUTTONS: &[ButtonDef] = &[
    ButtonDef { mask: 0x01, name: "Left Button", role: ButtonRole::Left },
    ButtonDef { mask: 0x02, name: "Right Button", role: ButtonRole::Right },
    ButtonDef { mask: 0x04, name: "Middle Button", role: ButtonRole::Middle },
    ButtonDef { mask: 0x08, name: "Back Button", role: ButtonRole::Back },
    ButtonDef { mask: 0x10, name: "Forward Button", role: ButtonRole::Forward },
    ButtonDef { mask: 0x20, name: "DPI Up", role: ButtonRole::DpiUp },
    ButtonDef { mask: 0x40, name: "DPI Down", role: ButtonRole::DpiDown },
    ButtonDef { mask: 0x80, name: "Profile Switch", role: ButtonRole::ProfileSwitch },
];

const MOUSE_ZONES: &[ZoneDef] = &[
    ZoneDef { id: 1, name: "Logo", positions: &[0] },
    ZoneDef { id: 2, name: "Scroll", positions: &[1] },
];

const MOUSE_INPUT: InputLayout = InputLayout {
    interface: 1,
    button_report: 0x02,
    battery_report: 0x0F,
    mask_offset: 2,
    battery_offset: 2,
};

const RATES_1K: &[PollingRate] = &[
    PollingRate::Hz125,
    PollingRate::Hz250,
    PollingRate::Hz500,
    PollingRate::Hz1000,
];

const RATES_2K: &[PollingRate] = &[
    PollingRate::Hz125,
    PollingRate::Hz250,
    PollingRate::Hz500,
    PollingRate::Hz1000,
    PollingRate::Hz2000,
];

const HX_RAILS: &[PsuRail] = &[
    PsuRail { name: "12V", page: 0 },
    PsuRail { name: "5V", page: 1 },
    PsuRail { name: "3.3V", page: 2 },
];

/// Every supported product.
pub const CATALOG: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        name: "iCUE LINK System Hub",
        kind: ProductKind::FanHub,
        vendor_id: VENDOR_ID,
        product_id: pids::LINK_SYSTEM_HUB,
        link: Link::Hid,
        report_size: 513,
        led_channels: 84,
        zones: &[],
        fan_channels: 7,
        pump_channels: &[0],
        temperature_probes: 1,
        rails: &[],
        wireless: false,
        input: None,
        buttons: &[],
        dpi: None,
        polling_rates: &[],
        lift_height: false,
        angle_snapping: false,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "Commander Core XT",
        kind: ProductKind::FanHub,
        vendor_id: VENDOR_ID,
        product_id: pids::COMMANDER_CORE_XT,
        link: Link::Hid,
        report_size: 385,
        led_channels: 204,
        zones: &[],
        fan_channels: 6,
        pump_channels: &[],
        temperature_probes: 2,
        rails: &[],
        wireless: false,
        input: None,
        buttons: &[],
        dpi: None,
        polling_rates: &[],
        lift_height: false,
        angle_snapping: false,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "KATAR PRO XT",
        kind: ProductKind::Mouse,
        vendor_id: VENDOR_ID,
        product_id: pids::KATAR_PRO_XT,
        link: Link::Hid,
        report_size: 65,
        led_channels: 2,
        zones: MOUSE_ZONES,
        fan_channels: 0,
        pump_channels: &[],
        temperature_probes: 0,
        rails: &[],
        wireless: false,
        input: Some(MOUSE_INPUT),
        buttons: MOUSE_BUTTONS,
        dpi: Some(DpiRange { min: 100, max: 18000, step: 50 }),
        polling_rates: RATES_1K,
        lift_height: true,
        angle_snapping: true,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "DARK CORE RGB PRO",
        kind: ProductKind::Mouse,
        vendor_id: VENDOR_ID,
        product_id: pids::DARK_CORE_RGB_PRO,
        link: Link::Hid,
        report_size: 65,
        led_channels: 2,
        zones: MOUSE_ZONES,
        fan_channels: 0,
        pump_channels: &[],
        temperature_probes: 0,
        rails: &[],
        wireless: true,
        input: Some(MOUSE_INPUT),
        buttons: MOUSE_BUTTONS,
        dpi: Some(DpiRange { min: 100, max: 18000, step: 50 }),
        polling_rates: RATES_2K,
        lift_height: true,
        angle_snapping: true,
        sleep_mode: true,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "MM700 RGB",
        kind: ProductKind::Mousepad,
        vendor_id: VENDOR_ID,
        product_id: pids::MM700_RGB,
        link: Link::Hid,
        report_size: 65,
        led_channels: 3,
        zones: &[
            ZoneDef { id: 1, name: "Left", positions: &[0] },
            ZoneDef { id: 2, name: "Right", positions: &[1] },
            ZoneDef { id: 3, name: "Logo", positions: &[2] },
        ],
        fan_channels: 0,
        pump_channels: &[],
        temperature_probes: 0,
        rails: &[],
        wireless: false,
        input: None,
        buttons: &[],
        dpi: None,
        polling_rates: &[],
        lift_height: false,
        angle_snapping: false,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "HX1200i",
        kind: ProductKind::Psu,
        vendor_id: VENDOR_ID,
        product_id: pids::HX1200I,
        link: Link::Hid,
        report_size: 65,
        led_channels: 0,
        zones: &[],
        fan_channels: 1,
        pump_channels: &[],
        temperature_probes: 2,
        rails: HX_RAILS,
        wireless: false,
        input: None,
        buttons: &[],
        dpi: None,
        polling_rates: &[],
        lift_height: false,
        angle_snapping: false,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
    DeviceDescriptor {
        name: "AXi Series PSU",
        kind: ProductKind::Psu,
        vendor_id: VENDOR_ID,
        product_id: pids::AXI_DONGLE,
        link: Link::Serial,
        report_size: 65,
        led_channels: 0,
        zones: &[],
        fan_channels: 1,
        pump_channels: &[],
        temperature_probes: 2,
        rails: HX_RAILS,
        wireless: false,
        input: None,
        buttons: &[],
        dpi: None,
        polling_rates: &[],
        lift_height: false,
        angle_snapping: false,
        sleep_mode: false,
        commands: &DEFAULT_COMMANDS,
    },
];

/// Look up a descriptor by USB ids.
pub fn descriptor(vendor_id: u16, product_id: u16) -> Option<&'static DeviceDescriptor> {
    CATALOG
        .iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
}

/// A supported device found during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub descriptor: &'static DeviceDescriptor,
    pub path: String,
    pub serial: Option<String>,
}

/// Control interface number for HID products.
const CONTROL_INTERFACE: i32 = 0;

/// Discover all connected supported devices.
///
/// Enumerates USB HID devices and returns one entry per product, on its
/// control interface.
pub fn discover_devices() -> Result<Vec<DeviceInfo>> {
    debug!("Starting HID device enumeration");
    let api = hidapi::HidApi::new().map_err(|e| Error::Hid(e.to_string()))?;

    let mut devices = Vec::new();
    for info in api.device_list() {
        let Some(desc) = descriptor(info.vendor_id(), info.product_id()) else {
            continue;
        };
        if desc.link == Link::Hid && info.interface_number() != CONTROL_INTERFACE {
            continue;
        }
        info!(
            product = desc.name,
            vid = format_args!("0x{:04X}", info.vendor_id()),
            pid = format_args!("0x{:04X}", info.product_id()),
            path = %info.path().to_string_lossy(),
            "Found supported device"
        );
        devices.push(DeviceInfo {
            descriptor: desc,
            path: info.path().to_string_lossy().into_owned(),
            serial: info.serial_number().map(|s| s.to_string()),
        });
    }

    debug!(count = devices.len(), "Device enumeration complete");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_from_known_pid() {
        let d = descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap();
        assert_eq!(d.kind, ProductKind::Mouse);
        assert!(d.input.is_some());
    }

    #[test]
    fn descriptor_from_unknown_pid() {
        assert!(descriptor(VENDOR_ID, 0x1234).is_none());
        assert!(descriptor(0x046D, pids::KATAR_PRO_XT).is_none());
    }

    #[test]
    fn catalog_is_consistent() {
        for d in CATALOG {
            for zone in d.zones {
                assert!(zone.positions.iter().all(|p| *p < d.led_channels), "{}", d.name);
            }
            for pump in d.pump_channels {
                assert!(*pump < d.fan_channels, "{}", d.name);
            }
            if let Some(dpi) = d.dpi {
                assert!(dpi.min < dpi.max);
            }
            let masks: Vec<u32> = d.buttons.iter().map(|b| b.mask).collect();
            assert!(masks.iter().all(|m| m.count_ones() == 1));
        }
    }

    #[test]
    fn polling_rate_roundtrip() {
        for rate in PollingRate::ALL {
            assert_eq!(PollingRate::from_hz(rate.as_hz()), Some(*rate));
        }
        assert_eq!(PollingRate::Hz1000.code(), 4);
    }

    #[test]
    fn polling_rate_rejects_invalid() {
        assert_eq!(PollingRate::from_hz(200), None);
        assert_eq!(PollingRate::from_hz(0), None);
    }
}
