// sensor.rs

use crate::{Reading, SensorReadError};

/// Pressure/temperature sensor driver, as exposed by the board support.
pub trait PressureSensor {
    /// Temperature in hundredths of a degree Celsius.
    fn read_temperature(&mut self) -> Result<i16, SensorReadError>;

    /// Pressure in hPa.
    fn read_pressure(&mut self) -> Result<u16, SensorReadError>;
}

/// Capture one [`Reading`], failing if either channel fails.
pub fn read_sensor<S: PressureSensor>(sensor: &mut S) -> Result<Reading, SensorReadError> {
    let temperature = sensor.read_temperature()?;
    let pressure = sensor.read_pressure()?;
    Ok(Reading::new(temperature, pressure))
}

/// Stand-in for the LPS barometer when running off-target.
///
/// Produces a slow triangle wave around a base reading so consecutive
/// publishes are distinguishable on the broker side.
pub struct SimulatedLps {
    base: Reading,
    step: u16,
}

const SWING: u16 = 40;

impl SimulatedLps {
    pub fn new(base: Reading) -> Self {
        Self { base, step: 0 }
    }

    fn offset(&self) -> i16 {
        let phase = self.step % (2 * SWING);
        let tri = if phase < SWING { phase } else { 2 * SWING - phase };
        tri as i16 - (SWING / 2) as i16
    }
}

impl Default for SimulatedLps {
    fn default() -> Self {
        Self::new(Reading::new(2150, 1013))
    }
}

impl PressureSensor for SimulatedLps {
    fn read_temperature(&mut self) -> Result<i16, SensorReadError> {
        self.step = self.step.wrapping_add(1);
        Ok(self.base.temperature.saturating_add(self.offset() * 5))
    }

    fn read_pressure(&mut self) -> Result<u16, SensorReadError> {
        Ok(self.base.pressure.saturating_add_signed(self.offset() / 10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl PressureSensor for Broken {
        fn read_temperature(&mut self) -> Result<i16, SensorReadError> {
            Ok(0)
        }
        fn read_pressure(&mut self) -> Result<u16, SensorReadError> {
            Err(SensorReadError::Pressure)
        }
    }

    #[test]
    fn failure_on_either_channel_fails_the_reading() {
        assert_eq!(read_sensor(&mut Broken), Err(SensorReadError::Pressure));
    }

    #[test]
    fn simulated_stays_near_base() {
        let mut lps = SimulatedLps::default();
        let mut seen = Vec::new();
        for _ in 0..200 {
            let r = read_sensor(&mut lps).unwrap();
            assert!((2050..=2250).contains(&r.temperature), "{r:?}");
            assert!((1011..=1015).contains(&r.pressure), "{r:?}");
            seen.push(r.temperature);
        }
        seen.dedup();
        assert!(seen.len() > 1);
    }
}

// EOF
