//! ==============================================================================
//! cpu.rs - host CPU temperature from sysfs
//! ==============================================================================
//!
//! the thermal zone file holds millidegrees celsius as ascii, e.g. "48312\n".
//!
//! ==============================================================================

use super::{DriverState, InitError, SensorDriver};
use crate::domain::{family, Reading, SensorFields, SensorSnapshot};
use crate::hal::BusError;
use std::path::PathBuf;

pub const DEFAULT_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// millidegrees text -> °C rounded to 0.1, None outside [0, 100]
pub fn parse_millidegrees(text: &str) -> Option<f64> {
    let milli: i64 = text.trim().parse().ok()?;
    let celsius = milli as f64 / 1000.0;
    if !(0.0..=100.0).contains(&celsius) {
        return None;
    }
    Some((celsius * 10.0).round() / 10.0)
}

pub struct CpuTemperature {
    path: PathBuf,
    state: DriverState,
}

impl CpuTemperature {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), state: DriverState::Uninitialized }
    }

    fn sample(&self) -> Option<f64> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let value = parse_millidegrees(&text);
                if value.is_none() {
                    tracing::warn!(sensor = family::CPU, raw = text.trim(), "unusable thermal reading");
                }
                value
            }
            Err(e) => {
                tracing::warn!(sensor = family::CPU, path = %self.path.display(), "read failed: {}", e);
                None
            }
        }
    }
}

impl SensorDriver for CpuTemperature {
    fn family(&self) -> &'static str {
        family::CPU
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn init(&mut self) -> Result<(), InitError> {
        if self.state == DriverState::Closed {
            return Err(InitError::Closed);
        }
        self.state = DriverState::Initializing;
        if let Err(e) = std::fs::metadata(&self.path) {
            self.state = DriverState::Uninitialized;
            return Err(BusError::Io(format!("{}: {}", self.path.display(), e)).into());
        }
        self.state = DriverState::Ready;
        Ok(())
    }

    fn read(&mut self, _ambient: &SensorSnapshot) -> SensorFields {
        let value = if self.state == DriverState::Ready {
            self.state = DriverState::Reading;
            let v = self.sample();
            self.state = DriverState::Ready;
            v
        } else {
            None
        };
        let mut fields = SensorFields::new();
        fields.insert("Temperature".into(), Reading::new(value, "°C", "CPU temperature"));
        fields
    }

    fn close(&mut self) {
        self.state = DriverState::Closed;
    }
}
