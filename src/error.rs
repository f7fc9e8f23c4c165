//! Error type shared by every layer of the crate.
//!
//! The variants fall into four groups:
//!
//! - **Usage faults** are detected locally before any bus traffic happens.
//! - **Frame faults** describe a response that arrived but cannot be trusted.
//!   The transaction engine counts them as failed attempts and retries.
//! - **Transport faults** come from the byte channel (I/O errors, timeouts).
//!   They are retried as well, after the transport had a chance to reconnect.
//! - **Fatal faults** mean the device view can no longer be trusted. Callers
//!   must stop issuing commands; the `rd60` binary exits with
//!   [`Error::exit_code`].
use crate::protocol::{ExceptionCode, FunctionCode};

/// Represents all possible errors of the RD60xx client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A register address below zero or beyond the 16-bit address space.
    #[error("Invalid register address {0}")]
    InvalidAddress(i64),

    /// A symbolic register name that is not part of the register map.
    #[error("Unknown register: '{0}'")]
    UnknownRegister(String),

    /// Preset memories are numbered 0 to 9.
    #[error("Preset index {0} out of range (0-9)")]
    PresetOutOfRange(u8),

    /// The value cannot be represented as an unsigned 16-bit register word.
    #[error("Value {0} cannot be stored in a register")]
    ValueOutOfRange(f64),

    /// The number of registers requested exceeds what a single frame can carry.
    #[error("Invalid register count {0}")]
    InvalidCount(usize),

    /// Nothing (or not enough for a frame) was received before the timeout.
    #[error("No response received")]
    NoResponse,

    /// The response CRC did not validate.
    #[error("Response checksum failed")]
    Crc,

    /// The response was sent by a different unit address.
    #[error("Response address {actual} does not match request address {expected}")]
    AddressMismatch { expected: u8, actual: u8 },

    /// The response echoes a different function code.
    #[error("Response function 0x{actual:02x} does not match request function {expected}")]
    FunctionMismatch { expected: FunctionCode, actual: u8 },

    /// The device answered with an exception frame.
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    /// The declared or total length of the response is not the expected one.
    #[error("Response length {actual} does not match expected length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// The transport did not deliver data within the configured timeout.
    #[error("Transport timeout")]
    Timeout,

    /// Wraps `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps `tokio_serial::Error`.
    #[cfg(feature = "serial")]
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),

    /// Every attempt of one exchange failed; the device state is unknown.
    #[error("Modbus failure, too many retries ({attempts})")]
    RetriesExhausted { attempts: u32 },

    /// The transport could not (re)establish its connection.
    #[error("Cannot connect to {target} after {attempts} attempts")]
    ConnectFailed { target: String, attempts: u32 },

    /// The identity register names a model whose register layout differs.
    #[error("Unsupported device {name} (type ID {id}), only RD60xx devices are supported")]
    UnsupportedModel { id: u16, name: &'static str },

    /// The identity register is outside the RD60xx family range.
    #[error("Unknown device type ID {0}")]
    UnknownModel(u16),
}

impl Error {
    /// Returns `true` if the client must not be used any further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RetriesExhausted { .. }
                | Error::ConnectFailed { .. }
                | Error::UnsupportedModel { .. }
                | Error::UnknownModel(_)
        )
    }

    /// Returns `true` if the error consumes one attempt of an exchange and the
    /// exchange may be tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NoResponse
            | Error::Crc
            | Error::AddressMismatch { .. }
            | Error::FunctionMismatch { .. }
            | Error::Exception(_)
            | Error::LengthMismatch { .. }
            | Error::Timeout
            | Error::Io(_) => true,
            #[cfg(feature = "serial")]
            Error::Serial(_) => true,
            _ => false,
        }
    }

    /// Process exit code used by the commandline tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::RetriesExhausted { .. } => 10,
            Error::ConnectFailed { .. } => 12,
            Error::UnsupportedModel { .. } | Error::UnknownModel(_) => 50,
            _ => 1,
        }
    }
}

/// The result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Crc.is_retryable());
        assert!(!Error::Crc.is_fatal());
        assert!(Error::Exception(ExceptionCode::ServerDeviceBusy).is_retryable());

        let exhausted = Error::RetriesExhausted { attempts: 10 };
        assert!(exhausted.is_fatal());
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.exit_code(), 10);

        assert_eq!(Error::UnknownModel(1234).exit_code(), 50);
        assert_eq!(Error::UnknownRegister("FOO".into()).exit_code(), 1);
        assert!(!Error::UnknownRegister("FOO".into()).is_retryable());
    }
}
