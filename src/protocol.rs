//! Modbus RTU framing for the RD60xx register protocol.
//!
//! Only the three register function codes used by the device are supported:
//! read holding registers (0x03), write single register (0x06) and write
//! multiple registers (0x10). Every frame is
//! `unit address ‖ function code ‖ payload ‖ CRC-16`, with all multi-byte
//! payload fields in big-endian order.
use crate::crc::{self, CRC_LENGTH};
use crate::{Error, Result};
use std::fmt;

/// Default Modbus unit address of the device.
pub const FACTORY_DEFAULT_UNIT: u8 = 0x01;

/// Bit set in the echoed function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Length of the acknowledgement to both write function codes.
pub const WRITE_RESPONSE_LENGTH: usize = 8;

/// Length of the `unit ‖ function ‖ byte count` header of a read response.
pub const READ_RESPONSE_HEADER_LENGTH: usize = 3;

/// Largest number of registers a single read request may ask for.
pub const MAX_READ_COUNT: usize = 125;

/// Largest number of registers a single write-multiple request may carry.
pub const MAX_WRITE_COUNT: usize = 123;

/// The register function codes spoken by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// `true` for the function codes that modify device registers.
    pub fn is_write(&self) -> bool {
        !matches!(self, FunctionCode::ReadHoldingRegisters)
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", *self as u8)
    }
}

/// Exception codes a device may report instead of a regular response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    /// The device accepted the request but is still processing it. The
    /// exchange still counts as a failed attempt.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ExceptionCode::Acknowledge | ExceptionCode::ServerDeviceBusy
        )
    }
}

impl From<u8> for ExceptionCode {
    fn from(value: u8) -> Self {
        match value {
            1 => ExceptionCode::IllegalFunction,
            2 => ExceptionCode::IllegalDataAddress,
            3 => ExceptionCode::IllegalDataValue,
            4 => ExceptionCode::ServerDeviceFailure,
            5 => ExceptionCode::Acknowledge,
            6 => ExceptionCode::ServerDeviceBusy,
            7 => ExceptionCode::NegativeAcknowledge,
            8 => ExceptionCode::MemoryParityError,
            10 => ExceptionCode::GatewayPathUnavailable,
            11 => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        match code {
            ExceptionCode::IllegalFunction => 1,
            ExceptionCode::IllegalDataAddress => 2,
            ExceptionCode::IllegalDataValue => 3,
            ExceptionCode::ServerDeviceFailure => 4,
            ExceptionCode::Acknowledge => 5,
            ExceptionCode::ServerDeviceBusy => 6,
            ExceptionCode::NegativeAcknowledge => 7,
            ExceptionCode::MemoryParityError => 8,
            ExceptionCode::GatewayPathUnavailable => 10,
            ExceptionCode::GatewayTargetFailedToRespond => 11,
            ExceptionCode::Unknown(value) => value,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => f.write_str("illegal function"),
            ExceptionCode::IllegalDataAddress => f.write_str("illegal data address"),
            ExceptionCode::IllegalDataValue => f.write_str("illegal data value"),
            ExceptionCode::ServerDeviceFailure => f.write_str("slave device failure"),
            ExceptionCode::Acknowledge => f.write_str("acknowledge (still processing)"),
            ExceptionCode::ServerDeviceBusy => f.write_str("slave device busy"),
            ExceptionCode::NegativeAcknowledge => f.write_str("negative acknowledge"),
            ExceptionCode::MemoryParityError => f.write_str("memory parity error"),
            ExceptionCode::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            ExceptionCode::GatewayTargetFailedToRespond => {
                f.write_str("gateway target device failed to respond")
            }
            ExceptionCode::Unknown(code) => write!(f, "unknown exception code 0x{code:02x}"),
        }
    }
}

/// How the length of a response is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLength {
    /// The response always has exactly this many bytes.
    Fixed(usize),
    /// The third byte announces the number of data bytes that follow,
    /// after which the two CRC bytes come.
    Variable,
}

/// One register request, not yet addressed to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    function: FunctionCode,
    payload: Vec<u8>,
}

impl Request {
    /// Reads `count` consecutive holding registers starting at `start`.
    pub fn read_holding_registers(start: u16, count: u16) -> Result<Self> {
        if count == 0 || count as usize > MAX_READ_COUNT {
            return Err(Error::InvalidCount(count as usize));
        }
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        Ok(Self {
            function: FunctionCode::ReadHoldingRegisters,
            payload,
        })
    }

    /// Writes `value` into the register at `address`.
    pub fn write_single_register(address: u16, value: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
        Self {
            function: FunctionCode::WriteSingleRegister,
            payload,
        }
    }

    /// Writes `values` into consecutive registers starting at `start`.
    pub fn write_multiple_registers(start: u16, values: &[u16]) -> Result<Self> {
        if values.is_empty() || values.len() > MAX_WRITE_COUNT {
            return Err(Error::InvalidCount(values.len()));
        }
        let mut payload = Vec::with_capacity(5 + 2 * values.len());
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
        payload.push((2 * values.len()) as u8);
        for value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Ok(Self {
            function: FunctionCode::WriteMultipleRegisters,
            payload,
        })
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The response length the device uses for this request.
    pub fn response_length(&self) -> ResponseLength {
        match self.function {
            FunctionCode::ReadHoldingRegisters => ResponseLength::Variable,
            FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
                ResponseLength::Fixed(WRITE_RESPONSE_LENGTH)
            }
        }
    }

    /// Number of data bytes a read response must announce, if any.
    pub fn expected_data_length(&self) -> Option<usize> {
        match self.function {
            FunctionCode::ReadHoldingRegisters => {
                let count = u16::from_be_bytes([self.payload[2], self.payload[3]]);
                Some(2 * count as usize)
            }
            _ => None,
        }
    }

    /// Builds the complete wire frame for `unit`, CRC included.
    pub fn frame(&self, unit: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.payload.len() + CRC_LENGTH);
        frame.push(unit);
        frame.push(self.function.into());
        frame.extend_from_slice(&self.payload);
        crc::append_crc(&frame)
    }
}

/// Validates a received `response` to `request` sent to `unit`.
///
/// The checks run in a fixed order: checksum, unit address, function code
/// (or exception), length. On success the register words of a read response
/// are returned; write acknowledgements yield an empty vector.
pub fn validate_response(
    unit: u8,
    request: &Request,
    expected_data_length: Option<usize>,
    response: &[u8],
) -> Result<Vec<u16>> {
    if response.is_empty() {
        return Err(Error::NoResponse);
    }
    if !crc::is_valid(response) || response.len() < 2 + CRC_LENGTH {
        return Err(Error::Crc);
    }
    if response[0] != unit {
        return Err(Error::AddressMismatch {
            expected: unit,
            actual: response[0],
        });
    }
    let function = u8::from(request.function());
    if response[1] != function {
        if response[1] & EXCEPTION_FLAG == EXCEPTION_FLAG && response.len() > 2 + CRC_LENGTH {
            return Err(Error::Exception(ExceptionCode::from(response[2])));
        }
        return Err(Error::FunctionMismatch {
            expected: request.function(),
            actual: response[1],
        });
    }
    match request.response_length() {
        ResponseLength::Variable => {
            let declared = response[2] as usize;
            if let Some(expected) = expected_data_length {
                if declared != expected {
                    return Err(Error::LengthMismatch {
                        expected,
                        actual: declared,
                    });
                }
            }
            let data = &response[READ_RESPONSE_HEADER_LENGTH..response.len() - CRC_LENGTH];
            if data.len() != declared || declared % 2 != 0 {
                return Err(Error::LengthMismatch {
                    expected: declared,
                    actual: data.len(),
                });
            }
            Ok(decode_words(data))
        }
        ResponseLength::Fixed(length) => {
            if response.len() != length {
                return Err(Error::LengthMismatch {
                    expected: length,
                    actual: response.len(),
                });
            }
            Ok(Vec::new())
        }
    }
}

/// Unpacks big-endian register words.
pub fn decode_words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Formats bytes as `01:06:00:08` for trace output.
pub fn hex_dump(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::from("(empty)");
    }
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Converts a numeric register address, rejecting negative and oversized ones.
pub fn register_address(address: i64) -> Result<u16> {
    u16::try_from(address).map_err(|_| Error::InvalidAddress(address))
}

/// Converts a value to a register word. Fractions are truncated, values that
/// do not fit into 16 bits are rejected.
pub fn to_register_value(value: f64) -> Result<u16> {
    let truncated = value.trunc();
    if !truncated.is_finite() || !(0.0..=u16::MAX as f64).contains(&truncated) {
        return Err(Error::ValueOutOfRange(value));
    }
    Ok(truncated as u16)
}

/// Assembles a 32-bit value from a high and a low register word.
pub fn u32_from_words(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) + low as u32
}
