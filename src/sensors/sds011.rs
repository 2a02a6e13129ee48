//! ==============================================================================
//! sds011.rs - Nova SDS011 particulate matter sensor (serial)
//! ==============================================================================
//!
//! the sensor pushes one 10-byte frame per second at 9600 8N1:
//!
//!     AA C0 | pm25_lo pm25_hi | pm10_lo pm10_hi | id id | checksum | AB
//!
//! values are LE16 tenths of µg/m³. the checksum byte is not verified; the
//! head / command / tail markers are.
//!
//! a read that lands mid-frame slides forward to the next AA C0 header,
//! giving up after SYNC_WINDOW skipped bytes.
//!
//! ==============================================================================

use super::{DriverState, InitError, SensorDriver};
use crate::domain::{family, Reading, SensorFields, SensorSnapshot};
use crate::hal::{read_exact, BusError, SerialLink};
use thiserror::Error;

pub const FRAME_LEN: usize = 10;
const HEAD: u8 = 0xAA;
const COMMAND: u8 = 0xC0;
const TAIL: u8 = 0xAB;
const SYNC_WINDOW: usize = 2 * FRAME_LEN;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub pm25: f64,
    pub pm10: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is {0} bytes, expected 10")]
    Length(usize),
    #[error("bad frame markers {head:#04X} {command:#04X} .. {tail:#04X}")]
    Markers { head: u8, command: u8, tail: u8 },
}

pub fn decode(frame: &[u8]) -> Result<Measurement, FrameError> {
    if frame.len() != FRAME_LEN {
        return Err(FrameError::Length(frame.len()));
    }
    let (head, command, tail) = (frame[0], frame[1], frame[9]);
    if head != HEAD || command != COMMAND || tail != TAIL {
        return Err(FrameError::Markers { head, command, tail });
    }
    Ok(Measurement {
        pm25: f64::from(u16::from_le_bytes([frame[2], frame[3]])) / 10.0,
        pm10: f64::from(u16::from_le_bytes([frame[4], frame[5]])) / 10.0,
    })
}

pub struct Sds011 {
    link: Option<Box<dyn SerialLink>>,
    state: DriverState,
}

impl Sds011 {
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        Self { link: Some(link), state: DriverState::Uninitialized }
    }

    fn next_frame(link: &mut dyn SerialLink) -> Result<[u8; FRAME_LEN], BusError> {
        // only the frame that starts after this point is of interest
        link.clear_input()?;
        let mut frame = [0u8; FRAME_LEN];
        read_exact(link, &mut frame)?;

        let mut skipped = 0;
        while (frame[0], frame[1]) != (HEAD, COMMAND) && skipped < SYNC_WINDOW {
            let shift = frame[1..].iter().position(|&b| b == HEAD).map_or(FRAME_LEN, |i| i + 1);
            frame.copy_within(shift.., 0);
            read_exact(link, &mut frame[FRAME_LEN - shift..])?;
            skipped += shift;
        }
        if skipped > 0 {
            tracing::debug!(sensor = family::SDS011, skipped, "resynchronised on frame header");
        }
        Ok(frame)
    }

    fn measure(&mut self) -> Option<Measurement> {
        let link = self.link.as_mut()?;
        let frame = match Self::next_frame(link.as_mut()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(sensor = family::SDS011, "read failed: {}", e);
                return None;
            }
        };
        decode(&frame)
            .map_err(|e| tracing::warn!(sensor = family::SDS011, "frame rejected: {}", e))
            .ok()
    }

    fn fields(m: Option<Measurement>) -> SensorFields {
        let mut fields = SensorFields::new();
        fields.insert("pm25".into(), Reading::new(m.map(|m| m.pm25), "µg/m³", "PM2.5"));
        fields.insert("pm10".into(), Reading::new(m.map(|m| m.pm10), "µg/m³", "PM10"));
        fields
    }
}

impl SensorDriver for Sds011 {
    fn family(&self) -> &'static str {
        family::SDS011
    }

    fn state(&self) -> DriverState {
        self.state
    }

    /// a serial port has no identity to check; an open port is a ready sensor
    fn init(&mut self) -> Result<(), InitError> {
        if self.state == DriverState::Closed || self.link.is_none() {
            return Err(InitError::Closed);
        }
        self.state = DriverState::Ready;
        tracing::info!(sensor = family::SDS011, "initialized");
        Ok(())
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
        self.link = None;
        self.state = DriverState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockSerial, SDS011_FRAME};

    #[test]
    fn test_decode_reference_frame() {
        let m = decode(&SDS011_FRAME).unwrap();
        assert_eq!(m.pm25, 12.3);
        assert_eq!(m.pm10, 20.1);
    }

    #[test]
    fn test_any_marker_mismatch_is_rejected() {
        for (index, bad) in [(0, 0xAB), (1, 0xC5), (9, 0xAA)] {
            let mut frame = SDS011_FRAME;
            frame[index] = bad;
            assert!(matches!(decode(&frame), Err(FrameError::Markers { .. })), "byte {index}");
        }
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert_eq!(decode(&SDS011_FRAME[..9]), Err(FrameError::Length(9)));
        let mut long = SDS011_FRAME.to_vec();
        long.push(0xAB);
        assert_eq!(decode(&long), Err(FrameError::Length(11)));
    }

    #[test]
    fn test_driver_reads_chunked_stream() {
        let link = MockSerial::silent().with_bytes(&SDS011_FRAME).chunked(4);
        let mut drv = Sds011::new(Box::new(link));
        drv.init().unwrap();
        let fields = drv.read(&SensorSnapshot::new());
        assert_eq!(fields["pm25"].value, Some(12.3));
        assert_eq!(fields["pm10"].value, Some(20.1));
    }

    #[test]
    fn test_read_starting_mid_frame_resyncs() {
        // tail of a previous frame, then a whole one
        let mut stream = SDS011_FRAME[6..].to_vec();
        stream.extend_from_slice(&SDS011_FRAME);
        let link = MockSerial::silent().with_bytes(&stream).chunked(3);
        let mut drv = Sds011::new(Box::new(link));
        drv.init().unwrap();
        let fields = drv.read(&SensorSnapshot::new());
        assert_eq!(fields["pm25"].value, Some(12.3));
        assert_eq!(fields["pm10"].value, Some(20.1));
    }

    #[test]
    fn test_resync_gives_up_on_noise() {
        // an endless stream with no header: the read must still return
        let link = MockSerial::repeating(&[0x00, 0xAA, 0x11, 0xAB]);
        let mut drv = Sds011::new(Box::new(link));
        drv.init().unwrap();
        assert!(drv.read(&SensorSnapshot::new()).values().all(|r| !r.is_present()));
        assert_eq!(drv.state(), DriverState::Ready);
    }

    #[test]
    fn test_timeout_gives_absent_readings() {
        let link = MockSerial::silent().with_bytes(&SDS011_FRAME[..6]);
        let probe = link.probe();
        let mut drv = Sds011::new(Box::new(link));
        drv.init().unwrap();
        assert!(drv.read(&SensorSnapshot::new()).values().all(|r| !r.is_present()));

        // the next full frame is picked up on the following cycle
        probe.push_bytes(&SDS011_FRAME);
        assert!(drv.read(&SensorSnapshot::new())["pm25"].is_present());
    }

    #[test]
    fn test_serial_error_gives_absent_readings() {
        let link = MockSerial::repeating(&SDS011_FRAME);
        let probe = link.probe();
        let mut drv = Sds011::new(Box::new(link));
        drv.init().unwrap();
        probe.set_failing(true);
        assert!(drv.read(&SensorSnapshot::new()).values().all(|r| !r.is_present()));
        assert_eq!(drv.state(), DriverState::Ready);
    }

    #[test]
    fn test_close_releases_once() {
        let link = MockSerial::silent();
        let probe = link.probe();
        let mut drv = Sds011::new(Box::new(link));
        drv.close();
        drv.close();
        assert_eq!(probe.releases(), 1);
        assert!(matches!(drv.init(), Err(InitError::Closed)));
    }
}
