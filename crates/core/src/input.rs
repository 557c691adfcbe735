//! HID input dispatcher: reads the input interface and decodes button masks
//! and battery reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::comm::ErrorClass;
use crate::device::InputLayout;
use crate::transport::HidTransport;

/// Read timeout on the input interface; bounds how long a stop waits.
pub const INPUT_READ_TIMEOUT_MS: i32 = 100;

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Decoded input report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Current button mask.
    Buttons(u32),
    /// Battery level in percent.
    Battery(u8),
}

/// Decode one input report.
pub fn decode(layout: &InputLayout, report: &[u8]) -> Option<InputEvent> {
    let kind = *report.get(1)?;
    if kind == layout.button_report {
        let bytes = report.get(layout.mask_offset..layout.mask_offset + 4)?;
        let mask = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        return Some(InputEvent::Buttons(mask));
    }
    if kind == layout.battery_report {
        let bytes = report.get(layout.battery_offset..layout.battery_offset + 2)?;
        let per_mille = u16::from_le_bytes([bytes[0], bytes[1]]);
        return Some(InputEvent::Battery((per_mille / 10).min(100) as u8));
    }
    None
}

/// Read the input interface until `exit` is set or the device goes away.
///
/// Blocks the calling thread; run it on a blocking worker.
pub fn run(
    transport: &dyn HidTransport,
    layout: &InputLayout,
    exit: &AtomicBool,
    mut on_event: impl FnMut(InputEvent),
) {
    debug!(interface = layout.interface, "input dispatcher started");
    while !exit.load(Ordering::SeqCst) {
        let report = match transport.read_report(INPUT_READ_TIMEOUT_MS) {
            Ok(r) => r,
            Err(e) => {
                if ErrorClass::classify(&e) == ErrorClass::Disconnected {
                    warn!(error = %e, "input interface disconnected");
                    break;
                }
                warn!(error = %e, "input read failed");
                std::thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };
        if report.is_empty() {
            continue;
        }
        trace!(report_hex = format_args!("{:02X?}", report), "input RX");
        if let Some(event) = decode(layout, &report) {
            on_event(event);
        }
    }
    debug!("input dispatcher stopped");
}
