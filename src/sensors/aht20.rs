//! ==============================================================================
//! aht20.rs - Aosong AHT20 humidity / temperature
//! ==============================================================================
//!
//! wire format:
//!     status byte via 0x71; bit 3 = calibrated, bit 7 = busy
//!     trigger: 0xAC 0x33 0x00, wait 80 ms, then a plain 6-byte read
//!
//!       byte 0      status
//!       byte 1..3   humidity[19:0]     (b1 << 12 | b2 << 4 | b3 >> 4)
//!       byte 3..5   temperature[19:0]  ((b3 & 0x0F) << 16 | b4 << 8 | b5)
//!
//!     H = raw / 2^20 * 100 %      T = raw / 2^20 * 200 - 50 °C
//!
//! ==============================================================================

use super::{DriverState, InitError, SensorDriver};
use crate::domain::{family, round2, Reading, SensorFields, SensorSnapshot};
use crate::hal::I2cDevice;
use std::time::Duration;

pub const REG_STATUS: u8 = 0x71;
pub const CMD_INIT: u8 = 0xBE;
pub const CMD_TRIGGER: u8 = 0xAC;

const STATUS_BUSY: u8 = 0x80;
const STATUS_CALIBRATED: u8 = 0x08;
const INIT_SETTLE: Duration = Duration::from_millis(10);
const MEASURE_WAIT: Duration = Duration::from_millis(80);

const FULL_SCALE: f64 = 1_048_576.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
}

/// decode one measurement frame; None while the device reports busy
pub fn decode(frame: &[u8; 6]) -> Option<Measurement> {
    if frame[0] & STATUS_BUSY != 0 {
        return None;
    }
    let hum_raw = (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let temp_raw = (u32::from(frame[3] & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);
    Some(Measurement {
        humidity: f64::from(hum_raw) / FULL_SCALE * 100.0,
        temperature: f64::from(temp_raw) / FULL_SCALE * 200.0 - 50.0,
    })
}

/// physically plausible for the part's operating envelope
pub fn plausible(m: &Measurement) -> bool {
    (0.0..=100.0).contains(&m.humidity) && (-40.0..=85.0).contains(&m.temperature)
}

pub struct Aht20 {
    bus: Option<Box<dyn I2cDevice>>,
    state: DriverState,
}

impl Aht20 {
    pub fn new(bus: Box<dyn I2cDevice>) -> Self {
        Self { bus: Some(bus), state: DriverState::Uninitialized }
    }

    fn bring_up(bus: &mut dyn I2cDevice) -> Result<(), InitError> {
        let status = bus.read_byte(REG_STATUS)?;
        if status & STATUS_CALIBRATED == 0 {
            tracing::debug!(sensor = family::AHT20, status, "loading calibration");
            bus.write_block(CMD_INIT, &[0x08, 0x00])?;
            std::thread::sleep(INIT_SETTLE);
        }
        Ok(())
    }

    fn measure(&mut self) -> Option<Measurement> {
        let bus = self.bus.as_mut()?;
        let mut frame = [0u8; 6];
        let sampled = bus
            .write_block(CMD_TRIGGER, &[0x33, 0x00])
            .and_then(|_| {
                std::thread::sleep(MEASURE_WAIT);
                bus.read_raw(&mut frame)
            });
        if let Err(e) = sampled {
            tracing::warn!(sensor = family::AHT20, "read failed: {}", e);
            return None;
        }
        let Some(m) = decode(&frame) else {
            tracing::debug!(sensor = family::AHT20, "measurement still in progress");
            return None;
        };
        if !plausible(&m) {
            tracing::warn!(
                sensor = family::AHT20,
                "implausible values T={:.1}°C H={:.1}%",
                m.temperature,
                m.humidity
            );
            return None;
        }
        Some(m)
    }

    fn fields(m: Option<Measurement>) -> SensorFields {
        let mut fields = SensorFields::new();
        fields.insert(
            "Temperature".into(),
            Reading::new(m.map(|m| round2(m.temperature)), "°C", "Temperature"),
        );
        fields.insert(
            "Humidity".into(),
            Reading::new(m.map(|m| round2(m.humidity)), "%", "Relative humidity"),
        );
        fields
    }
}

impl SensorDriver for Aht20 {
    fn family(&self) -> &'static str {
        family::AHT20
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
                tracing::info!(sensor = family::AHT20, "initialized");
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
        self.bus = None;
        self.state = DriverState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{BusOp, MockI2c};

    const FRAME: [u8; 6] = [0x1C, 0x80, 0x00, 0x05, 0x66, 0x66];

    #[test]
    fn test_decode_packed_fields() {
        let m = decode(&FRAME).unwrap();
        assert_eq!(m.humidity, 50.0);
        assert!((m.temperature - 17.499923706054688).abs() < 1e-12);
    }

    #[test]
    fn test_decode_extremes() {
        let m = decode(&[0x18, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(m.humidity, 0.0);
        assert_eq!(m.temperature, -50.0);
        assert!(!plausible(&m));
    }

    #[test]
    fn test_busy_frame_is_absent() {
        let mut busy = FRAME;
        busy[0] |= 0x80;
        assert_eq!(decode(&busy), None);
    }

    #[test]
    fn test_init_skips_calibration_when_already_calibrated() {
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x18]).with_raw(&FRAME);
        let probe = dev.probe();
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();
        assert!(probe.writes().is_empty());
    }

    #[test]
    fn test_init_loads_calibration_when_needed() {
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x10]);
        let probe = dev.probe();
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();
        assert_eq!(probe.writes(), vec![(CMD_INIT, vec![0x08, 0x00])]);
        assert_eq!(drv.state(), DriverState::Ready);
    }

    #[test]
    fn test_read_triggers_then_reads_raw() {
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x18]).with_raw(&FRAME);
        let probe = dev.probe();
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();

        let fields = drv.read(&SensorSnapshot::new());
        assert_eq!(fields["Humidity"].value, Some(50.0));
        assert_eq!(fields["Temperature"].value, Some(17.5));

        let ops = probe.ops();
        assert_eq!(&ops[1..], &[BusOp::Write(CMD_TRIGGER, vec![0x33, 0x00]), BusOp::RawRead(6)]);
    }

    #[test]
    fn test_missing_device_is_fatal() {
        let mut drv = Aht20::new(Box::new(MockI2c::new().failing()));
        assert!(matches!(drv.init(), Err(InitError::Unreachable(_))));
        assert_eq!(drv.state(), DriverState::Uninitialized);
    }

    #[test]
    fn test_short_frame_is_absent() {
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x18]).with_raw(&FRAME[..3]);
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();
        let fields = drv.read(&SensorSnapshot::new());
        assert!(fields.values().all(|r| !r.is_present()));
    }

    #[test]
    fn test_busy_read_recovers_next_cycle() {
        let mut busy = FRAME;
        busy[0] |= 0x80;
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x18]).with_raw(&busy);
        let chip = dev.probe();
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();
        assert!(drv.read(&SensorSnapshot::new()).values().all(|r| !r.is_present()));
        assert_eq!(drv.state(), DriverState::Ready);

        chip.set_raw(&FRAME);
        assert_eq!(drv.read(&SensorSnapshot::new())["Humidity"].value, Some(50.0));
    }

    #[test]
    fn test_close_releases_once() {
        let dev = MockI2c::new().with_registers(REG_STATUS, &[0x18]);
        let probe = dev.probe();
        let mut drv = Aht20::new(Box::new(dev));
        drv.init().unwrap();
        drv.close();
        drv.close();
        assert_eq!(probe.releases(), 1);
    }
}
