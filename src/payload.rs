// payload.rs

use std::fmt::Write;

use crate::DeviceId;

pub const PAYLOAD_CAPACITY: usize = 128;

pub type Payload = heapless::String<PAYLOAD_CAPACITY>;

/// One sensor sample: temperature in hundredths of a degree, pressure in hPa.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reading {
    pub temperature: i16,
    pub pressure: u16,
}

impl Reading {
    pub fn new(temperature: i16, pressure: u16) -> Self {
        Self {
            temperature,
            pressure,
        }
    }

    /// Integer and fractional parts of the temperature.
    ///
    /// The integer part is a truncating division, so the sign of values
    /// between -0.99 and -0.01 is lost: -50 renders as `0.50`.
    pub fn temperature_parts(&self) -> (i16, u16) {
        (self.temperature / 100, (self.temperature % 100).unsigned_abs())
    }
}

/// Render a reading as the telemetry wire payload.
pub fn format_payload(reading: &Reading, device_id: &DeviceId) -> Payload {
    let (whole, frac) = reading.temperature_parts();
    let mut json = Payload::new();
    // DeviceId is length-bounded, the longest rendering stays under capacity
    let res = write!(
        json,
        "{{\"id\": \"{device_id}\", \"temperature(°C)\": \"{whole}.{frac:02}\", \"Pressure(hPa)\": \"{}\"}}",
        reading.pressure
    );
    debug_assert!(res.is_ok(), "payload overflow");
    json
}


// EOF
