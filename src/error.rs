//! Our error types for the PZEM-6L24 client.

use thiserror::Error;

use crate::registers::{MeasurementKind, MeasurementRequest, Phase};

pub type Result<T> = core::result::Result<T, Error>;

/// Top level error returned by the client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transaction failed: {0}")]
    Transaction(#[from] TransactionError),
}

/// Problems found while validating a configuration. Always raised before any bus I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid bus address 0x{0:02X}")]
    InvalidAddress(u8),
    #[error("{kind} is not available on phase {phase}")]
    UnsupportedMeasurement { kind: MeasurementKind, phase: Phase },
    #[error("Unknown measurement type {0:?}")]
    UnknownKind(String),
    #[error("Unknown phase {0:?}")]
    UnknownPhase(String),
    #[error("Poll interval must be non-zero")]
    InvalidPollInterval,
    #[error("Retry policy needs at least one attempt and a non-zero timeout")]
    InvalidRetryPolicy,
    #[error("{0} is not part of the polled measurements")]
    NotPolled(MeasurementRequest),
}

/// A response frame that could not be accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated, expected at least {expected} bytes but got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Checksum invalid, computed 0x{computed:04X} but frame carries 0x{received:04X}")]
    ChecksumInvalid { computed: u16, received: u16 },
    #[error("Response from address 0x{actual:02X}, expected 0x{expected:02X}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("Response function 0x{actual:02X}, expected 0x{expected:02X}")]
    FunctionMismatch { expected: u8, actual: u8 },
    #[error("Device exception code 0x{code:02X}")]
    DeviceException { code: u8 },
    #[error("Byte count field says {declared} but frame carries {actual} data bytes")]
    ByteCountMismatch { declared: usize, actual: usize },
    #[error("Response holds {actual} bytes of register data, expected {expected} words")]
    WordCountMismatch { expected: u16, actual: usize },
    #[error("Invalid register quantity {0}")]
    InvalidQuantity(u16),
    #[error("Function 0x{0:02X} is not a register read")]
    UnsupportedFunction(u8),
    #[error("Modbus protocol error: {0}")]
    Modbus(rmodbus::ErrorKind),
}

impl From<rmodbus::ErrorKind> for FrameError {
    fn from(err: rmodbus::ErrorKind) -> Self {
        FrameError::Modbus(err)
    }
}

impl FrameError {
    /// Exception code sent by a slave that is busy processing a long command.
    pub const SLAVE_DEVICE_BUSY: u8 = 0x06;

    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Corrupt or mismatched frames are line noise and worth another attempt. A device exception
    /// is the device telling us the request itself is wrong, unless it is just busy.
    pub fn is_retryable(&self) -> bool {
        match self {
            FrameError::DeviceException { code } => *code == Self::SLAVE_DEVICE_BUSY,
            FrameError::InvalidQuantity(_) | FrameError::UnsupportedFunction(_) => false,
            _ => true,
        }
    }
}

/// Failure of a single request/response exchange.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    #[error("No complete response before the timeout")]
    Timeout,
    #[error("Invalid response frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Bus already has a transaction in flight")]
    BusBusy,
    #[error("Serial communication error: {0:?}")]
    Io(embedded_io::ErrorKind),
    #[error("Transaction cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_exceptions_are_retried() {
        assert!(FrameError::DeviceException { code: 0x06 }.is_retryable());
        assert!(!FrameError::DeviceException { code: 0x02 }.is_retryable());
        assert!(FrameError::ChecksumInvalid { computed: 1, received: 2 }.is_retryable());
        assert!(FrameError::Truncated { expected: 5, actual: 3 }.is_retryable());
        assert!(!FrameError::InvalidQuantity(0).is_retryable());
        assert!(!FrameError::UnsupportedFunction(0x10).is_retryable());
        assert!(FrameError::Modbus(rmodbus::ErrorKind::FrameBroken).is_retryable());
    }

    #[test]
    fn errors_convert_into_crate_error() {
        let err: Error = TransactionError::from(FrameError::DeviceException { code: 2 }).into();
        assert_eq!(
            err,
            Error::Transaction(TransactionError::Frame(FrameError::DeviceException { code: 2 }))
        );

        let err: Error = ConfigError::InvalidAddress(0).into();
        assert_eq!(err.to_string(), "Configuration error: Invalid bus address 0x00");
    }
}
