//! open-link-hub-core: user-space control plane for Corsair USB HID fan
//! hubs, mice, mousepads and power supplies.
//!
//! Devices are framed over a vendor transaction bracket ([`framer`]), driven
//! by a per-device harness ([`driver`]) and tracked by a process-wide
//! [`registry`]. Colors come from the effect engine, the cross-device
//! cluster or an OpenRGB-compatible TCP client.

pub mod cluster;
pub mod color;
pub mod comm;
pub mod config;
pub mod device;
pub mod driver;
pub mod effect;
pub mod error;
pub mod framer;
pub mod input;
pub mod keyassign;
pub mod macros;
pub mod openrgb;
pub mod profile;
pub mod psu;
pub mod registry;
pub mod rgb;
pub mod safety;
pub mod sink;
pub mod speed;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod temperature;
pub mod transport;
