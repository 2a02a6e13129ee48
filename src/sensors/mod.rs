//! ==============================================================================
//! sensors - protocol decoders and device drivers
//! ==============================================================================
//!
//! purpose:
//!     one file per sensor family. each file holds the pure decoder (bytes in,
//!     physical units out) and the driver that owns the bus handle and walks
//!     the device through init -> read -> close.
//!
//! driver lifecycle:
//!
//!     Uninitialized --init()--> Initializing --ok--> Ready <--> Reading
//!                                    |                 |
//!                                    +--err (fatal)    +--close()--> Closed
//!
//!     init() errors are fatal to the owning worker: they mean wrong wiring or
//!     a wrong device. everything that goes wrong after Ready degrades to
//!     absent readings for that cycle.
//!
//! relationships:
//!     - used by: worker.rs (drives the lifecycle on a timer)
//!     - uses: hal.rs (bus traits), domain.rs (Reading / SensorFields)
//!
//! ==============================================================================

pub mod aht20;
pub mod bmp280;
pub mod cpu;
pub mod ens160;
pub mod sds011;

use crate::domain::{SensorFields, SensorSnapshot};
use crate::hal::BusError;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Initializing,
    Ready,
    Reading,
    Closed,
}

/// why a driver refused to reach Ready
#[derive(Debug, Error)]
pub enum InitError {
    #[error("identity mismatch: expected 0x{expected:04X}, device reported 0x{found:04X}")]
    Identity { expected: u16, found: u16 },
    #[error("device unreachable: {0}")]
    Unreachable(#[from] BusError),
    #[error("driver already closed")]
    Closed,
}

/// a sensor family driver
///
/// implementations are blocking; worker.rs runs them on the blocking pool.
pub trait SensorDriver: Send + 'static {
    /// family key in the "Sensor data" namespace
    fn family(&self) -> &'static str;

    fn state(&self) -> DriverState;

    /// bring the device from Uninitialized to Ready
    fn init(&mut self) -> Result<(), InitError>;

    /// take one measurement. never fails: problems show up as absent values.
    /// `ambient` is the current sensor namespace, for drivers that need
    /// other families' readings as inputs.
    fn read(&mut self, ambient: &SensorSnapshot) -> SensorFields;

    /// release the bus handle. safe to call any number of times.
    fn close(&mut self);
}
