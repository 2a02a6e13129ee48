//! ==============================================================================
//! ens160.rs - ScioSense ENS160 metal-oxide air quality sensor
//! ==============================================================================
//!
//! register map used here:
//!     0x00  PART_ID     LE16, 0x0160
//!     0x10  OPMODE      0x00 deep sleep, 0x01 idle, 0x02 standard, 0xF0 reset
//!     0x11  CONFIG
//!     0x13  TEMP_IN     LE16, kelvin * 64
//!     0x15  RH_IN       LE16, %RH * 512
//!     0x20  DATA_STATUS bit 7 running, bit 6 error, bits 3:2 validity, bit 1 new data
//!     0x21  DATA_AQI    bits 2:0, UBA scale 1..5
//!     0x22  DATA_TVOC   LE16 ppb
//!     0x24  DATA_ECO2   LE16 ppm
//!
//! bring-up walks reset -> idle -> configure -> standard with a settle delay
//! after each step. every read first pushes the current ambient temperature
//! and humidity so the device can compensate.
//!
//! ==============================================================================

use super::{DriverState, InitError, SensorDriver};
use crate::domain::{family, Reading, SensorFields, SensorSnapshot};
use crate::hal::{BusError, I2cDevice};
use std::time::Duration;

pub const PART_ID: u16 = 0x0160;

pub const REG_PART_ID: u8 = 0x00;
pub const REG_OPMODE: u8 = 0x10;
pub const REG_CONFIG: u8 = 0x11;
pub const REG_TEMP_IN: u8 = 0x13;
pub const REG_RH_IN: u8 = 0x15;
pub const REG_DATA_STATUS: u8 = 0x20;

pub const MODE_DEEP_SLEEP: u8 = 0x00;
pub const MODE_IDLE: u8 = 0x01;
pub const MODE_STANDARD: u8 = 0x02;
pub const MODE_RESET: u8 = 0xF0;
const CONFIG_STANDARD: u8 = 0x02;

const STEP_SETTLE: Duration = Duration::from_millis(20);
const STANDARD_SETTLE: Duration = Duration::from_millis(50);
const COMPENSATION_SETTLE: Duration = Duration::from_millis(50);

pub const DEFAULT_TEMPERATURE: f64 = 25.0;
pub const DEFAULT_HUMIDITY: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Normal,
    WarmUp,
    InitialStartUp,
    Invalid,
}

/// the DATA_STATUS byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    pub fn new_data(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn error(self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn validity(self) -> Validity {
        match (self.0 >> 2) & 0x03 {
            0 => Validity::Normal,
            1 => Validity::WarmUp,
            2 => Validity::InitialStartUp,
            _ => Validity::Invalid,
        }
    }

    /// values are worth publishing. warm-up output is coarse but usable.
    pub fn usable(self) -> bool {
        !self.error() && self.validity() != Validity::Invalid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub status: Status,
    pub aqi: u8,
    /// ppb
    pub tvoc: u16,
    /// ppm
    pub eco2: u16,
}

/// decode the 6-byte burst starting at DATA_STATUS
pub fn decode(block: &[u8; 6]) -> Sample {
    Sample {
        status: Status(block[0]),
        aqi: block[1] & 0x07,
        tvoc: u16::from_le_bytes([block[2], block[3]]),
        eco2: u16::from_le_bytes([block[4], block[5]]),
    }
}

/// TEMP_IN / RH_IN register images for the given conditions
pub fn compensation_bytes(temperature: f64, humidity: f64) -> ([u8; 2], [u8; 2]) {
    let kelvin64 = ((temperature + 273.15) * 64.0) as u16;
    let rh512 = (humidity.clamp(0.0, 100.0) * 512.0) as u16;
    (kelvin64.to_le_bytes(), rh512.to_le_bytes())
}

/// ambient conditions for compensation: AHT20 first, BMP280 temperature as
/// a fallback, then room defaults
pub fn ambient_inputs(snapshot: &SensorSnapshot) -> (f64, f64) {
    let value = |fam: &str, field: &str| snapshot.get(fam)?.get(field)?.value;
    let temperature = value(family::AHT20, "Temperature")
        .or_else(|| value(family::BMP280, "Temperature"))
        .unwrap_or(DEFAULT_TEMPERATURE);
    let humidity = value(family::AHT20, "Humidity").unwrap_or(DEFAULT_HUMIDITY);
    (temperature, humidity)
}

pub struct Ens160 {
    bus: Option<Box<dyn I2cDevice>>,
    state: DriverState,
}

impl Ens160 {
    pub fn new(bus: Box<dyn I2cDevice>) -> Self {
        Self { bus: Some(bus), state: DriverState::Uninitialized }
    }

    fn bring_up(bus: &mut dyn I2cDevice) -> Result<(), InitError> {
        bus.write_byte(REG_OPMODE, MODE_RESET)?;
        std::thread::sleep(STEP_SETTLE);

        let mut id = [0u8; 2];
        bus.read_block(REG_PART_ID, &mut id)?;
        let found = u16::from_le_bytes(id);
        if found != PART_ID {
            return Err(InitError::Identity { expected: PART_ID, found });
        }

        bus.write_byte(REG_OPMODE, MODE_IDLE)?;
        std::thread::sleep(STEP_SETTLE);
        bus.write_byte(REG_CONFIG, CONFIG_STANDARD)?;
        std::thread::sleep(STEP_SETTLE);
        bus.write_byte(REG_OPMODE, MODE_STANDARD)?;
        std::thread::sleep(STANDARD_SETTLE);
        Ok(())
    }

    fn sample(bus: &mut dyn I2cDevice, ambient: (f64, f64)) -> Result<Sample, BusError> {
        let (temp_in, rh_in) = compensation_bytes(ambient.0, ambient.1);
        bus.write_block(REG_TEMP_IN, &temp_in)?;
        bus.write_block(REG_RH_IN, &rh_in)?;
        std::thread::sleep(COMPENSATION_SETTLE);

        let mut block = [0u8; 6];
        bus.read_block(REG_DATA_STATUS, &mut block)?;
        Ok(decode(&block))
    }

    fn fields(sample: Option<Sample>) -> SensorFields {
        let values = sample.filter(|s| s.status.usable());
        let mut fields = SensorFields::new();
        fields.insert(
            "AQI".into(),
            Reading::new(values.map(|s| f64::from(s.aqi)), "", "Air quality index (UBA)"),
        );
        fields.insert(
            "TVOC".into(),
            Reading::new(values.map(|s| f64::from(s.tvoc)), "ppb", "Total volatile organic compounds"),
        );
        fields.insert(
            "eCO2".into(),
            Reading::new(values.map(|s| f64::from(s.eco2)), "ppm", "Equivalent CO2"),
        );
        fields.insert(
            "Status".into(),
            Reading::new(sample.map(|s| f64::from(s.status.0)), "", "Raw status byte"),
        );
        fields
    }
}

impl SensorDriver for Ens160 {
    fn family(&self) -> &'static str {
        family::ENS160
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn init(&mut self) -> Result<(), InitError> {
        let bus = match (self.state, self.bus.as_mut()) {
            (DriverState::Closed, _) | (_, None) => return Err(InitError::Closed),
            (_, Some(bus)) => bus,
        };
        self.state = DriverState::Initializing;
        match Self::bring_up(bus.as_mut()) {
            Ok(()) => {
                tracing::info!(sensor = family::ENS160, "initialized in standard mode");
                self.state = DriverState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = DriverState::Uninitialized;
                Err(e)
            }
        }
    }

    fn read(&mut self, ambient: &SensorSnapshot) -> SensorFields {
        if self.state != DriverState::Ready {
            return Self::fields(None);
        }
        let Some(bus) = self.bus.as_mut() else {
            return Self::fields(None);
        };
        self.state = DriverState::Reading;
        let sample = match Self::sample(bus.as_mut(), ambient_inputs(ambient)) {
            Ok(s) => {
                if !s.status.usable() {
                    tracing::warn!(sensor = family::ENS160, status = s.status.0, "output flagged invalid");
                } else if s.status.validity() != Validity::Normal {
                    tracing::debug!(sensor = family::ENS160, validity = ?s.status.validity(), "sensor still warming up");
                }
                Some(s)
            }
            Err(e) => {
                tracing::warn!(sensor = family::ENS160, "read failed: {}", e);
                None
            }
        };
        self.state = DriverState::Ready;
        Self::fields(sample)
    }

    fn close(&mut self) {
        if let Some(mut bus) = self.bus.take() {
            if let Err(e) = bus.write_byte(REG_OPMODE, MODE_DEEP_SLEEP) {
                tracing::debug!(sensor = family::ENS160, "deep sleep on close failed: {}", e);
            }
        }
        self.state = DriverState::Closed;
    }
}
