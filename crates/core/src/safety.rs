//! Safety layer: validates write parameters against known-safe ranges
//! before anything reaches the device.
//!
//! ## Bounds
//! - **Brightness slider**: 0 – 100 (percent)
//! - **DPI**: per-sensor `[min, max]`, rounded to the sensor's step
//! - **Polling rate**: only rates listed by the descriptor
//! - **Lift height**: 2 – 6 (sensor units)
//! - **Fan duty**: 20 – 100 %, pumps 50 – 100 %
//! - **Effect speed**: 0.1 – 10 seconds per cycle
//!
//! All validation happens before any HID traffic: invalid values never reach
//! the device.

use crate::device::{DeviceDescriptor, DpiRange, PollingRate};
use crate::error::{Error, Result};

pub const BRIGHTNESS_MIN: u8 = 0;
pub const BRIGHTNESS_MAX: u8 = 100;

pub const LIFT_HEIGHT_MIN: u8 = 2;
pub const LIFT_HEIGHT_MAX: u8 = 6;

/// Lowest duty written to a fan channel.
pub const FAN_DUTY_MIN: u8 = 20;
/// Lowest duty written to a pump channel.
pub const PUMP_DUTY_MIN: u8 = 50;
pub const DUTY_MAX: u8 = 100;

/// Minutes after which a wireless mouse may sleep.
pub const SLEEP_MINUTES_MIN: u8 = 1;
pub const SLEEP_MINUTES_MAX: u8 = 60;

fn out_of_range(field: &'static str, value: i64, min: i64, max: i64) -> Error {
    Error::OutOfRange {
        field,
        value,
        min,
        max,
    }
}

/// Validate a brightness slider value.
pub fn validate_brightness(value: i64) -> Result<u8> {
    if !(BRIGHTNESS_MIN as i64..=BRIGHTNESS_MAX as i64).contains(&value) {
        return Err(out_of_range(
            "brightness",
            value,
            BRIGHTNESS_MIN as i64,
            BRIGHTNESS_MAX as i64,
        ));
    }
    Ok(value as u8)
}

/// Validate a DPI value against the sensor range and align it to the step.
pub fn validate_dpi(range: &DpiRange, dpi: i64) -> Result<u16> {
    let (min, max) = (range.min as i64, range.max as i64);
    if !(min..=max).contains(&dpi) {
        return Err(out_of_range("dpi", dpi, min, max));
    }
    let step = range.step.max(1) as i64;
    let rounded = ((dpi + step / 2) / step) * step;
    Ok(rounded.clamp(min, max) as u16)
}

/// Clamp a stored DPI value into the sensor range; used when loading
/// profiles written for another sensor.
pub fn clamp_dpi(range: &DpiRange, dpi: u16) -> u16 {
    dpi.clamp(range.min, range.max)
}

/// Validate a polling rate against what the product supports.
pub fn validate_polling_rate(desc: &DeviceDescriptor, hz: u16) -> Result<PollingRate> {
    let max = desc
        .polling_rates
        .iter()
        .map(PollingRate::as_hz)
        .max()
        .unwrap_or(0) as i64;
    PollingRate::from_hz(hz)
        .filter(|r| desc.polling_rates.contains(r))
        .ok_or_else(|| out_of_range("polling_rate", hz as i64, 125, max))
}

/// Validate a lift height value.
pub fn validate_lift_height(value: i64) -> Result<u8> {
    if !(LIFT_HEIGHT_MIN as i64..=LIFT_HEIGHT_MAX as i64).contains(&value) {
        return Err(out_of_range(
            "lift_height",
            value,
            LIFT_HEIGHT_MIN as i64,
            LIFT_HEIGHT_MAX as i64,
        ));
    }
    Ok(value as u8)
}

/// Validate a sleep timeout in minutes.
pub fn validate_sleep_minutes(value: i64) -> Result<u8> {
    if !(SLEEP_MINUTES_MIN as i64..=SLEEP_MINUTES_MAX as i64).contains(&value) {
        return Err(out_of_range(
            "sleep_mode",
            value,
            SLEEP_MINUTES_MIN as i64,
            SLEEP_MINUTES_MAX as i64,
        ));
    }
    Ok(value as u8)
}

/// Clamp a computed duty to the channel's allowed window.
pub fn clamp_duty(duty: f64, pump: bool) -> u8 {
    let min = if pump { PUMP_DUTY_MIN } else { FAN_DUTY_MIN } as f64;
    if !duty.is_finite() {
        return DUTY_MAX;
    }
    duty.round().clamp(min, DUTY_MAX as f64) as u8
}

/// Validate that a fan channel exists on the product.
pub fn validate_channel(desc: &DeviceDescriptor, channel: u8) -> Result<()> {
    if channel >= desc.fan_channels {
        return Err(out_of_range(
            "channel",
            channel as i64,
            0,
            desc.fan_channels as i64 - 1,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};

    const RANGE: DpiRange = DpiRange {
        min: 100,
        max: 18000,
        step: 50,
    };

    #[test]
    fn validate_dpi_in_range() {
        assert_eq!(validate_dpi(&RANGE, 800).unwrap(), 800);
        assert_eq!(validate_dpi(&RANGE, 100).unwrap(), 100);
        assert_eq!(validate_dpi(&RANGE, 18000).unwrap(), 18000);
    }

    #[test]
    fn validate_dpi_rounds_to_step() {
        assert_eq!(validate_dpi(&RANGE, 810).unwrap(), 800);
        assert_eq!(validate_dpi(&RANGE, 825).unwrap(), 850);
    }

    #[test]
    fn validate_dpi_rejects_out_of_range() {
        assert!(validate_dpi(&RANGE, 50).is_err());
        assert!(validate_dpi(&RANGE, 30000).is_err());
        assert_eq!(clamp_dpi(&RANGE, 30000), 18000);
    }

    #[test]
    fn polling_rate_must_be_supported() {
        let katar = descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap();
        assert_eq!(validate_polling_rate(katar, 1000).unwrap(), PollingRate::Hz1000);
        assert!(validate_polling_rate(katar, 2000).is_err());
        assert!(validate_polling_rate(katar, 200).is_err());
        let hub = descriptor(VENDOR_ID, pids::LINK_SYSTEM_HUB).unwrap();
        assert!(validate_polling_rate(hub, 1000).is_err());
    }

    #[test]
    fn brightness_and_lift_height_bounds() {
        assert_eq!(validate_brightness(0).unwrap(), 0);
        assert_eq!(validate_brightness(100).unwrap(), 100);
        assert!(validate_brightness(101).is_err());
        assert!(validate_brightness(-1).is_err());
        assert!(validate_lift_height(1).is_err());
        assert_eq!(validate_lift_height(6).unwrap(), 6);
        assert!(validate_sleep_minutes(0).is_err());
    }

    #[test]
    fn duty_clamps_by_channel_type() {
        assert_eq!(clamp_duty(5.0, false), 20);
        assert_eq!(clamp_duty(30.0, true), 50);
        assert_eq!(clamp_duty(150.0, false), 100);
        assert_eq!(clamp_duty(f64::NAN, false), 100);
    }

    #[test]
    fn channel_bounds() {
        let hub = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        assert!(validate_channel(hub, 5).is_ok());
        assert!(validate_channel(hub, 6).is_err());
    }
}
