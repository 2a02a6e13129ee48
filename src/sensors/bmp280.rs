//! ==============================================================================
//! bmp280.rs - Bosch BMP280 pressure / temperature
//! ==============================================================================
//!
//! wire format:
//!     0xD0        chip id, must read 0x58
//!     0x88..0x9F  12 calibration words, little-endian
//!                 T1, P1 unsigned; T2, T3, P2..P9 two's complement
//!     0xF4 / 0xF5 ctrl_meas / config
//!     0xF7..0xFC  press[19:0], temp[19:0], msb first, low nibble of xlsb
//!
//! compensation is the datasheet's double-precision variant. the operation
//! order below is kept exactly as published: reordering the float math moves
//! the result in the last digits.
//!
//! ==============================================================================

use super::{DriverState, InitError, SensorDriver};
use crate::domain::{family, round2, Reading, SensorFields, SensorSnapshot};
use crate::hal::I2cDevice;
use std::time::Duration;
use thiserror::Error;

pub const CHIP_ID: u8 = 0x58;

pub const REG_ID: u8 = 0xD0;
pub const REG_CALIB: u8 = 0x88;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_CONFIG: u8 = 0xF5;
pub const REG_PRESS_MSB: u8 = 0xF7;

/// temp x1, press x1, normal mode
const CTRL_MEAS_NORMAL: u8 = 0x27;
/// standby 1000 ms, filter x16
const CONFIG_STANDBY_FILTER: u8 = 0xA0;
const SETTLE: Duration = Duration::from_millis(100);

pub const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 85.0);
pub const PRESSURE_RANGE_HPA: (f64, f64) = (300.0, 1100.0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calibration {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,
    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,
}

impl Calibration {
    /// parse the 24-byte block starting at 0x88
    pub fn from_bytes(raw: &[u8; 24]) -> Self {
        let u = |i: usize| u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
        let s = |i: usize| i16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
        Self {
            dig_t1: u(0),
            dig_t2: s(1),
            dig_t3: s(2),
            dig_p1: u(3),
            dig_p2: s(4),
            dig_p3: s(5),
            dig_p4: s(6),
            dig_p5: s(7),
            dig_p6: s(8),
            dig_p7: s(9),
            dig_p8: s(10),
            dig_p9: s(11),
        }
    }

    /// returns (°C, t_fine)
    pub fn compensate_temperature(&self, adc_t: u32) -> (f64, f64) {
        let adc_t = f64::from(adc_t);
        let t1 = f64::from(self.dig_t1);
        let var1 = ((adc_t / 16384.0) - (t1 / 1024.0)) * f64::from(self.dig_t2);
        let d = (adc_t / 131072.0) - (t1 / 8192.0);
        let var2 = (d * d) * f64::from(self.dig_t3);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// hPa, or None when the calibration makes the divisor vanish
    pub fn compensate_pressure(&self, adc_p: u32, t_fine: f64) -> Option<f64> {
        let p1 = f64::from(self.dig_p1);
        let p2 = f64::from(self.dig_p2);
        let p3 = f64::from(self.dig_p3);
        let p4 = f64::from(self.dig_p4);
        let p5 = f64::from(self.dig_p5);
        let p6 = f64::from(self.dig_p6);
        let p7 = f64::from(self.dig_p7);
        let p8 = f64::from(self.dig_p8);
        let p9 = f64::from(self.dig_p9);

        let mut var1 = (t_fine / 2.0) - 64000.0;
        let mut var2 = var1 * var1 * p6 / 32768.0;
        var2 = var2 + var1 * p5 * 2.0;
        var2 = (var2 / 4.0) + (p4 * 65536.0);
        var1 = (p3 * var1 * var1 / 524288.0 + p2 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * p1;
        if var1 == 0.0 {
            return None;
        }
        let mut p = 1048576.0 - f64::from(adc_p);
        p = (p - (var2 / 4096.0)) * 6250.0 / var1;
        var1 = p9 * p * p / 2147483648.0;
        var2 = p * p8 / 32768.0;
        p = p + (var1 + var2 + p7) / 16.0;
        Some(p / 100.0)
    }
}

/// the two 20-bit adc fields of the 0xF7 burst
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSample {
    pub adc_p: u32,
    pub adc_t: u32,
}

pub fn unpack(block: &[u8; 6]) -> RawSample {
    let field = |msb: u8, lsb: u8, xlsb: u8| (u32::from(msb) << 12) | (u32::from(lsb) << 4) | (u32::from(xlsb) >> 4);
    RawSample {
        adc_p: field(block[0], block[1], block[2]),
        adc_t: field(block[3], block[4], block[5]),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    /// hPa
    pub pressure: f64,
}

/// sanity clamps against calibration corruption, not calibrated limits
#[derive(Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("adc returned zero (p={adc_p}, t={adc_t})")]
    ZeroAdc { adc_p: u32, adc_t: u32 },
    #[error("pressure divisor is zero")]
    DivisorZero,
    #[error("implausible values T={temperature:.1}°C P={pressure:.1}hPa")]
    OutOfRange { temperature: f64, pressure: f64 },
}

pub fn decode(cal: &Calibration, block: &[u8; 6]) -> Result<Measurement, Rejection> {
    let raw = unpack(block);
    if raw.adc_p == 0 || raw.adc_t == 0 {
        return Err(Rejection::ZeroAdc { adc_p: raw.adc_p, adc_t: raw.adc_t });
    }
    let (temperature, t_fine) = cal.compensate_temperature(raw.adc_t);
    let pressure = cal.compensate_pressure(raw.adc_p, t_fine).ok_or(Rejection::DivisorZero)?;

    let t_ok = (TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&temperature);
    let p_ok = (PRESSURE_RANGE_HPA.0..=PRESSURE_RANGE_HPA.1).contains(&pressure);
    if !t_ok || !p_ok {
        return Err(Rejection::OutOfRange { temperature, pressure });
    }
    Ok(Measurement { temperature, pressure })
}

// ==============================================================================
// driver
// ==============================================================================

pub struct Bmp280 {
    bus: Option<Box<dyn I2cDevice>>,
    calibration: Option<Calibration>,
    state: DriverState,
}

impl Bmp280 {
    pub fn new(bus: Box<dyn I2cDevice>) -> Self {
        Self { bus: Some(bus), calibration: None, state: DriverState::Uninitialized }
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    fn bring_up(bus: &mut dyn I2cDevice) -> Result<Calibration, InitError> {
        let id = bus.read_byte(REG_ID)?;
        if id != CHIP_ID {
            return Err(InitError::Identity { expected: CHIP_ID.into(), found: id.into() });
        }
        let mut raw = [0u8; 24];
        bus.read_block(REG_CALIB, &mut raw)?;
        bus.write_byte(REG_CTRL_MEAS, CTRL_MEAS_NORMAL)?;
        bus.write_byte(REG_CONFIG, CONFIG_STANDBY_FILTER)?;
        std::thread::sleep(SETTLE);
        Ok(Calibration::from_bytes(&raw))
    }

    fn fields(m: Option<Measurement>) -> SensorFields {
        let mut fields = SensorFields::new();
        fields.insert(
            "Temperature".into(),
            Reading::new(m.map(|m| round2(m.temperature)), "°C", "Temperature"),
        );
        fields.insert(
            "Pressure".into(),
            Reading::new(m.map(|m| round2(m.pressure)), "hPa", "Atmospheric pressure"),
        );
        fields
    }

    fn measure(&mut self) -> Option<Measurement> {
        let (bus, cal) = match (self.bus.as_mut(), self.calibration.as_ref()) {
            (Some(bus), Some(cal)) => (bus, cal),
            _ => return None,
        };
        let mut block = [0u8; 6];
        if let Err(e) = bus.read_block(REG_PRESS_MSB, &mut block) {
            tracing::warn!(sensor = family::BMP280, "read failed: {}", e);
            return None;
        }
        match decode(cal, &block) {
            Ok(m) => Some(m),
            Err(reason) => {
                tracing::warn!(sensor = family::BMP280, "sample rejected: {}", reason);
                None
            }
        }
    }
}

impl SensorDriver for Bmp280 {
    fn family(&self) -> &'static str {
        family::BMP280
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
            Ok(cal) => {
                tracing::info!(sensor = family::BMP280, "initialized");
                self.calibration = Some(cal);
                self.state = DriverState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = DriverState::Uninitialized;
                Err(e)
            }
        }
    }

    fn read(&mut self, _ambient: &SensorSnapshot) -> SensorFields {
        if self.state != DriverState::Ready {
            return Self::fields(None);
        }
        self.state = DriverState::Reading;
        let m = self.measure();
        self.state = DriverState::Ready;
        Self::fields(m)
    }

    fn close(&mut self) {
        if self.bus.take().is_some() {
            tracing::debug!(sensor = family::BMP280, "bus handle released");
        }
        self.state = DriverState::Closed;
    }
}
