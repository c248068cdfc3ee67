//! Our error types for the Array electronic loads.

use thiserror::Error;

use crate::address::DeviceAddress;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Custom error type for load bus communications.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Serial communication error")]
    SerialError(I),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Program validation error: {0}")]
    Validation(#[from] ValidationError),
    /// Retries and the recovery pause are exhausted. The bus or the device needs attention.
    #[error("Bus communication with load {address} failed after {attempts} attempts ({last})")]
    BusCommunication {
        address: DeviceAddress,
        attempts: u8,
        last: Fault,
    },
}

/// A value supplied by the caller can't be put on the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Address {0:#04x} is reserved")]
    ReservedAddress(u8),
    #[error("Payload of {len} bytes exceeds the {max} bytes allowed for this command")]
    PayloadTooLong { len: usize, max: usize },
    #[error("Value {value} is outside of the valid range 0-{max}")]
    OutOfRange { value: u32, max: u32 },
    #[error("Load mode is not supported by this device")]
    UnsupportedMode,
    #[error("Mode scaling of zero milli-units per raw unit")]
    ZeroScale,
}

/// A program definition was rejected before upload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Program has no steps")]
    Empty,
    #[error("Program has {count} steps, the device allows at most {max}")]
    TooManySteps { count: usize, max: usize },
    #[error("Step {index} has a zero duration")]
    ZeroDuration { index: usize },
    #[error("Step {index} lasts longer than {max_secs} seconds")]
    DurationTooLong { index: usize, max_secs: u32 },
    #[error("Step {index} setpoint is outside of the valid range 0-{max}")]
    SetpointOutOfRange { index: usize, max: u32 },
    #[error("Step {index} uses a load mode the device does not support")]
    UnsupportedMode { index: usize },
    #[error("Step {index} uses a different load mode than step 0")]
    MixedModes { index: usize },
}

/// Transient outcome of a single exchange. These are retried with backoff and
/// only reach the caller inside [`Error::BusCommunication`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("no response before timeout")]
    Timeout,
    #[error("checksum invalid")]
    ChecksumInvalid,
    #[error("malformed frame")]
    Malformed,
    #[error("too many frames for other addresses")]
    AddressMismatch,
}
