//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     gives drivers a register-level view of an I2C device and a byte-stream
//!     view of a UART. abstracts away the difference between running on a
//!     real Raspberry Pi (using `rppal`) and a development machine (using mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": without the `hardware` feature the host builds on
//!       any OS and talks to mock devices seeded with datasheet register images.
//!     - "One owner per handle": every open_* call hands out a fresh boxed
//!       handle. a driver owns it until close() drops it. there is no bus lock.
//!
//! relationships:
//!     - used by: sensors/* (drivers), main.rs (opens one handle per driver)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus i/o failed: {0}")]
    Io(String),
    #[error("short read: got {got} of {wanted} bytes")]
    ShortRead { got: usize, wanted: usize },
}

/// register-addressed access to one I2C slave
pub trait I2cDevice: Send {
    fn read_byte(&mut self, register: u8) -> Result<u8, BusError>;
    fn write_byte(&mut self, register: u8, value: u8) -> Result<(), BusError>;
    /// I2C block read starting at `register`
    fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError>;
    fn write_block(&mut self, register: u8, data: &[u8]) -> Result<(), BusError>;
    /// plain read with no register prefix
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), BusError>;
}

/// byte stream from a serial port with a read timeout
pub trait SerialLink: Send {
    /// drop whatever is sitting in the input queue
    fn clear_input(&mut self) -> Result<(), BusError>;
    /// read up to buf.len() bytes; Ok(0) means the read timed out
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError>;
}

/// read exactly `buf.len()` bytes or fail with ShortRead once the link times out
pub fn read_exact(link: &mut dyn SerialLink, buf: &mut [u8]) -> Result<(), BusError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = link.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(BusError::ShortRead { got: filled, wanted: buf.len() });
        }
        filled += n;
    }
    Ok(())
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
mod real {
    use super::{BusError, I2cDevice, SerialLink};
    use rppal::i2c::I2c;
    use rppal::uart::{Parity, Queue, Uart};
    use std::time::Duration;

    impl From<rppal::i2c::Error> for BusError {
        fn from(e: rppal::i2c::Error) -> Self {
            BusError::Io(e.to_string())
        }
    }

    impl From<rppal::uart::Error> for BusError {
        fn from(e: rppal::uart::Error) -> Self {
            BusError::Io(e.to_string())
        }
    }

    pub struct RppalI2c {
        i2c: I2c,
    }

    impl I2cDevice for RppalI2c {
        fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
            Ok(self.i2c.smbus_read_byte(register)?)
        }

        fn write_byte(&mut self, register: u8, value: u8) -> Result<(), BusError> {
            Ok(self.i2c.smbus_write_byte(register, value)?)
        }

        fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
            Ok(self.i2c.block_read(register, buf)?)
        }

        fn write_block(&mut self, register: u8, data: &[u8]) -> Result<(), BusError> {
            Ok(self.i2c.block_write(register, data)?)
        }

        fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
            let got = self.i2c.read(buf)?;
            if got < buf.len() {
                return Err(BusError::ShortRead { got, wanted: buf.len() });
            }
            Ok(())
        }
    }

    pub fn open_i2c(bus: u8, address: u8) -> Result<RppalI2c, BusError> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(u16::from(address))?;
        tracing::debug!(bus, address = format_args!("0x{:02X}", address), "opened i2c handle");
        Ok(RppalI2c { i2c })
    }

    pub struct RppalUart {
        uart: Uart,
    }

    impl SerialLink for RppalUart {
        fn clear_input(&mut self) -> Result<(), BusError> {
            Ok(self.uart.flush(Queue::Input)?)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
            Ok(self.uart.read(buf)?)
        }
    }

    pub fn open_serial(path: &str, baud: u32, timeout: Duration) -> Result<RppalUart, BusError> {
        let mut uart = Uart::with_path(path, baud, Parity::None, 8, 1)?;
        // return as soon as any byte arrives, or after `timeout` with nothing
        uart.set_read_mode(0, timeout)?;
        tracing::debug!(path, baud, "opened serial port");
        Ok(RppalUart { uart })
    }
}

#[cfg(feature = "hardware")]
pub fn open_i2c(bus: u8, address: u8) -> Result<Box<dyn I2cDevice>, BusError> {
    Ok(Box::new(real::open_i2c(bus, address)?))
}

#[cfg(feature = "hardware")]
pub fn open_serial(path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialLink>, BusError> {
    Ok(Box::new(real::open_serial(path, baud, timeout)?))
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub fn open_i2c(bus: u8, address: u8) -> Result<Box<dyn I2cDevice>, BusError> {
    tracing::info!(bus, address = format_args!("0x{:02X}", address), "Using MOCK I2C (No hardware access)");
    Ok(Box::new(mock::MockI2c::seeded(address)))
}

#[cfg(not(feature = "hardware"))]
pub fn open_serial(path: &str, baud: u32, _timeout: Duration) -> Result<Box<dyn SerialLink>, BusError> {
    tracing::info!(path, baud, "Using MOCK UART (No hardware access)");
    Ok(Box::new(mock::MockSerial::repeating(&mock::SDS011_FRAME)))
}

pub mod mock {
    //! in-memory devices. the non-hardware build runs on these, and the
    //! driver tests script them register by register.

    use super::{BusError, I2cDevice, SerialLink};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    /// one recorded bus transaction
    #[derive(Clone, Debug, PartialEq)]
    pub enum BusOp {
        Read(u8),
        Write(u8, Vec<u8>),
        RawRead(usize),
    }

    #[derive(Default)]
    struct I2cState {
        registers: HashMap<u8, u8>,
        raw: Vec<u8>,
        ops: Vec<BusOp>,
        failing: bool,
        releases: usize,
    }

    fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// register-file I2C device; reads of unset registers return 0
    pub struct MockI2c {
        state: Arc<Mutex<I2cState>>,
    }

    /// handle for inspecting a MockI2c after it was moved into a driver
    #[derive(Clone)]
    pub struct MockProbe {
        state: Arc<Mutex<I2cState>>,
    }

    impl MockI2c {
        pub fn new() -> Self {
            Self { state: Arc::new(Mutex::new(I2cState::default())) }
        }

        /// preload consecutive registers starting at `start`
        pub fn with_registers(self, start: u8, bytes: &[u8]) -> Self {
            self.probe().set_registers(start, bytes);
            self
        }

        /// bytes returned by read_raw
        pub fn with_raw(self, bytes: &[u8]) -> Self {
            locked(&self.state).raw = bytes.to_vec();
            self
        }

        pub fn failing(self) -> Self {
            self.probe().set_failing(true);
            self
        }

        pub fn probe(&self) -> MockProbe {
            MockProbe { state: Arc::clone(&self.state) }
        }

        /// datasheet register images keyed by the usual slave addresses
        pub fn seeded(address: u8) -> Self {
            match address {
                // bmp280: chip id, datasheet calibration, datasheet raw sample
                0x76 | 0x77 => Self::new()
                    .with_registers(0xD0, &[0x58])
                    .with_registers(0x88, &BMP280_CALIBRATION)
                    .with_registers(0xF7, &[0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00]),
                // aht20: calibrated status, ~17.5 °C / 50 %RH
                0x38 => Self::new()
                    .with_registers(0x71, &[0x18])
                    .with_raw(&[0x1C, 0x80, 0x00, 0x05, 0x66, 0x66]),
                // ens160: part id 0x0160, new valid data, aqi 2, 100 ppb, 400 ppm
                0x53 => Self::new()
                    .with_registers(0x00, &[0x60, 0x01])
                    .with_registers(0x20, &[0x82, 0x02, 0x64, 0x00, 0x90, 0x01]),
                _ => Self::new(),
            }
        }

        fn check(&self) -> Result<MutexGuard<'_, I2cState>, BusError> {
            let s = locked(&self.state);
            if s.failing {
                return Err(BusError::Io("mock bus failure".into()));
            }
            Ok(s)
        }
    }

    impl Default for MockI2c {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for MockI2c {
        fn drop(&mut self) {
            locked(&self.state).releases += 1;
        }
    }

    impl I2cDevice for MockI2c {
        fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
            let mut s = self.check()?;
            s.ops.push(BusOp::Read(register));
            Ok(s.registers.get(&register).copied().unwrap_or(0))
        }

        fn write_byte(&mut self, register: u8, value: u8) -> Result<(), BusError> {
            self.write_block(register, &[value])
        }

        fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
            let mut s = self.check()?;
            s.ops.push(BusOp::Read(register));
            for (i, b) in buf.iter_mut().enumerate() {
                let reg = register.wrapping_add(i as u8);
                *b = s.registers.get(&reg).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write_block(&mut self, register: u8, data: &[u8]) -> Result<(), BusError> {
            let mut s = self.check()?;
            s.ops.push(BusOp::Write(register, data.to_vec()));
            Ok(())
        }

        fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
            let mut s = self.check()?;
            s.ops.push(BusOp::RawRead(buf.len()));
            if s.raw.len() < buf.len() {
                return Err(BusError::ShortRead { got: s.raw.len(), wanted: buf.len() });
            }
            buf.copy_from_slice(&s.raw[..buf.len()]);
            Ok(())
        }
    }

    impl MockProbe {
        pub fn ops(&self) -> Vec<BusOp> {
            locked(&self.state).ops.clone()
        }

        /// registers the device was asked to read from, in order
        pub fn reads(&self) -> Vec<u8> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    BusOp::Read(r) => Some(r),
                    _ => None,
                })
                .collect()
        }

        pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    BusOp::Write(r, d) => Some((r, d)),
                    _ => None,
                })
                .collect()
        }

        /// how many times the handle has been dropped
        pub fn releases(&self) -> usize {
            locked(&self.state).releases
        }

        pub fn set_failing(&self, failing: bool) {
            locked(&self.state).failing = failing;
        }

        pub fn set_registers(&self, start: u8, bytes: &[u8]) {
            let mut s = locked(&self.state);
            for (i, b) in bytes.iter().enumerate() {
                s.registers.insert(start.wrapping_add(i as u8), *b);
            }
        }

        pub fn set_raw(&self, bytes: &[u8]) {
            locked(&self.state).raw = bytes.to_vec();
        }
    }

    /// bosch datasheet example calibration (T1..T3, P1..P9, little-endian)
    pub const BMP280_CALIBRATION: [u8; 24] = [
        0x70, 0x6B, 0x43, 0x67, 0x18, 0xFC, // T1=27504 T2=26435 T3=-1000
        0x7D, 0x8E, 0x43, 0xD6, 0xD0, 0x0B, // P1=36477 P2=-10685 P3=3024
        0x27, 0x0B, 0x8C, 0x00, 0xF9, 0xFF, // P4=2855 P5=140 P6=-7
        0x8C, 0x3C, 0xF8, 0xC6, 0x70, 0x17, // P7=15500 P8=-14600 P9=6000
    ];

    /// pm2.5 = 12.3, pm10 = 20.1
    pub const SDS011_FRAME: [u8; 10] = [0xAA, 0xC0, 0x7B, 0x00, 0xC9, 0x00, 0x01, 0x02, 0x0F, 0xAB];

    #[derive(Default)]
    struct SerialState {
        pending: VecDeque<u8>,
        repeat: Option<Vec<u8>>,
        chunk: Option<usize>,
        failing: bool,
        releases: usize,
    }

    /// scripted serial stream
    pub struct MockSerial {
        state: Arc<Mutex<SerialState>>,
    }

    #[derive(Clone)]
    pub struct SerialProbe {
        state: Arc<Mutex<SerialState>>,
    }

    impl MockSerial {
        /// a link that has nothing to say; every read times out
        pub fn silent() -> Self {
            Self { state: Arc::new(Mutex::new(SerialState::default())) }
        }

        /// a link that produces `frame` again whenever its queue runs dry
        pub fn repeating(frame: &[u8]) -> Self {
            let link = Self::silent();
            locked(&link.state).repeat = Some(frame.to_vec());
            link
        }

        /// queue bytes that will arrive once, in order
        pub fn with_bytes(self, bytes: &[u8]) -> Self {
            locked(&self.state).pending.extend(bytes.iter().copied());
            self
        }

        /// deliver at most `n` bytes per read call
        pub fn chunked(self, n: usize) -> Self {
            locked(&self.state).chunk = Some(n.max(1));
            self
        }

        pub fn probe(&self) -> SerialProbe {
            SerialProbe { state: Arc::clone(&self.state) }
        }
    }

    impl Drop for MockSerial {
        fn drop(&mut self) {
            locked(&self.state).releases += 1;
        }
    }

    impl SerialLink for MockSerial {
        fn clear_input(&mut self) -> Result<(), BusError> {
            // queued bytes model future arrivals, so there is nothing stale to drop
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
            let mut s = locked(&self.state);
            if s.failing {
                return Err(BusError::Io("mock serial failure".into()));
            }
            if s.pending.is_empty() {
                if let Some(frame) = s.repeat.clone() {
                    s.pending.extend(frame);
                }
            }
            let limit = s.chunk.unwrap_or(buf.len()).min(buf.len());
            let mut n = 0;
            while n < limit {
                match s.pending.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl SerialProbe {
        pub fn releases(&self) -> usize {
            locked(&self.state).releases
        }

        pub fn set_failing(&self, failing: bool) {
            locked(&self.state).failing = failing;
        }

        pub fn push_bytes(&self, bytes: &[u8]) {
            locked(&self.state).pending.extend(bytes.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_read_exact_spans_chunks() {
        let mut link = MockSerial::silent().with_bytes(&SDS011_FRAME).chunked(3);
        let mut buf = [0u8; 10];
        read_exact(&mut link, &mut buf).unwrap();
        assert_eq!(buf, SDS011_FRAME);
    }

    #[test]
    fn test_read_exact_reports_short_read() {
        let mut link = MockSerial::silent().with_bytes(&[0xAA, 0xC0, 0x01]);
        let mut buf = [0u8; 10];
        match read_exact(&mut link, &mut buf) {
            Err(BusError::ShortRead { got, wanted }) => {
                assert_eq!(got, 3);
                assert_eq!(wanted, 10);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_mock_i2c_block_read_walks_registers() {
        let mut dev = MockI2c::new().with_registers(0x22, &[0x64, 0x00, 0x90, 0x01]);
        let mut buf = [0u8; 4];
        dev.read_block(0x22, &mut buf).unwrap();
        assert_eq!(buf, [0x64, 0x00, 0x90, 0x01]);
        assert_eq!(dev.probe().reads(), vec![0x22]);
    }

    #[test]
    fn test_mock_i2c_counts_release_on_drop() {
        let dev = MockI2c::new();
        let probe = dev.probe();
        assert_eq!(probe.releases(), 0);
        drop(dev);
        assert_eq!(probe.releases(), 1);
    }

    #[test]
    fn test_seeded_bmp280_image_has_chip_id() {
        let mut dev = MockI2c::seeded(0x76);
        assert_eq!(dev.read_byte(0xD0).unwrap(), 0x58);
    }
}
