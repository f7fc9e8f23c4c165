//! Request/response exchange with bounded retry.
//!
//! [`Modbus`] sends one request at a time and waits for the matching response.
//! Corrupted, mismatched or missing responses count as failed attempts. After
//! the last attempt failed the engine gives up for good: every later exchange
//! is refused with [`Error::RetriesExhausted`], because the device view of the
//! caller can no longer be trusted.
use crate::crc::CRC_LENGTH;
use crate::protocol::{self, hex_dump, Request, ResponseLength, READ_RESPONSE_HEADER_LENGTH};
use crate::transport::Transport;
use crate::{Error, Result};
use std::time::Duration;

/// Default number of attempts per exchange.
pub const DEFAULT_RETRIES: u32 = 10;
/// Number of attempts per exchange in robust mode.
pub const ROBUST_RETRIES: u32 = 60;
/// Default delay before the first write of a session.
pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_millis(20);

/// The Modbus RTU transaction engine.
pub struct Modbus<T: Transport> {
    transport: T,
    unit: u8,
    retries: u32,
    write_delay: Duration,
    written: bool,
    failed: bool,
}

impl<T: Transport> Modbus<T> {
    /// Creates an engine talking to `unit` over `transport`.
    pub fn new(transport: T, unit: u8) -> Self {
        Self {
            transport,
            unit,
            retries: DEFAULT_RETRIES,
            write_delay: DEFAULT_WRITE_DELAY,
            written: false,
            failed: false,
        }
    }

    /// Sets the number of attempts per exchange (at least one).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Sets the delay applied once, before the first write-class request.
    /// It lets a device settle that was just busy answering another client.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// `true` once an exchange exhausted its attempts.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    /// Closes the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Performs one exchange, retrying until a valid response arrives.
    ///
    /// Returns the register words of a read response and an empty vector for
    /// write acknowledgements.
    pub fn execute(&mut self, request: &Request) -> Result<Vec<u16>> {
        if self.failed {
            return Err(Error::RetriesExhausted {
                attempts: self.retries,
            });
        }
        if !self.transport.is_connected() {
            self.transport.connect()?;
        }
        if request.function().is_write() && !self.written {
            self.written = true;
            if !self.write_delay.is_zero() {
                std::thread::sleep(self.write_delay);
            }
        }

        let frame = request.frame(self.unit);
        for attempt in 1..=self.retries {
            match self.attempt(request, &frame) {
                Ok(words) => return Ok(words),
                Err(error) if error.is_retryable() => {
                    if let Error::Exception(code) = &error {
                        if code.is_busy() {
                            log::debug!("Device busy ({code}), attempt {attempt}");
                        }
                    }
                    log::warn!(
                        "Modbus exchange {} failed (attempt {attempt}/{}): {error}",
                        request.function(),
                        self.retries
                    );
                }
                Err(error) => return Err(error),
            }
        }

        log::error!("Modbus failure, too many retries ({})", self.retries);
        self.failed = true;
        Err(Error::RetriesExhausted {
            attempts: self.retries,
        })
    }

    fn attempt(&mut self, request: &Request, frame: &[u8]) -> Result<Vec<u16>> {
        let discarded = self.transport.flush_input()?;
        if discarded > 0 {
            log::warn!("Discarded {discarded} stale bytes from the input");
        }

        log::trace!("-> {}", hex_dump(frame));
        self.transport.send(frame)?;

        let response = match request.response_length() {
            ResponseLength::Fixed(length) => self.receive_exact(length)?,
            ResponseLength::Variable => {
                let mut response = self.receive_exact(READ_RESPONSE_HEADER_LENGTH)?;
                if response.len() == READ_RESPONSE_HEADER_LENGTH {
                    let remaining = response[2] as usize + CRC_LENGTH;
                    response.extend(self.receive_exact(remaining)?);
                }
                response
            }
        };
        log::trace!("<- {}", hex_dump(&response));

        protocol::validate_response(
            self.unit,
            request,
            request.expected_data_length(),
            &response,
        )
    }

    /// Collects up to `length` bytes. Stops early when a receive returns
    /// nothing, leaving the short frame to the validation.
    fn receive_exact(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(length);
        while buffer.len() < length {
            let chunk = self.transport.receive(length - buffer.len())?;
            if chunk.is_empty() {
                break;
            }
            buffer.extend(chunk);
        }
        Ok(buffer)
    }

    /// Reads `count` consecutive registers starting at `start`.
    pub fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = Request::read_holding_registers(start, count)?;
        let words = self.execute(&request)?;
        log::debug!("Read {count} registers @{start}: {words:?}");
        Ok(words)
    }

    /// Writes one register.
    pub fn write_word(&mut self, address: u16, value: u16) -> Result<()> {
        log::debug!("Write register {address} = {value}");
        self.execute(&Request::write_single_register(address, value))?;
        Ok(())
    }

    /// Writes consecutive registers starting at `start`.
    pub fn write_words(&mut self, start: u16, values: &[u16]) -> Result<()> {
        let request = Request::write_multiple_registers(start, values)?;
        log::debug!("Write {} registers @{start}: {values:?}", values.len());
        self.execute(&request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, MockDevice};
    use crate::protocol::ExceptionCode;
    use crate::registers::addr;
    use assert_matches::assert_matches;

    fn engine(device: MockDevice) -> Modbus<MockDevice> {
        Modbus::new(device, 1)
            .with_retries(3)
            .with_write_delay(Duration::ZERO)
    }

    #[test]
    fn write_single_wire_bytes() {
        let mut modbus = engine(MockDevice::new(1));
        modbus.write_word(8, 1200).unwrap();
        let sent = &modbus.transport().sent_frames()[0];
        assert_eq!(&sent[..6], &[0x01, 0x06, 0x00, 0x08, 0x04, 0xB0]);
        assert_eq!(&sent[6..], &crate::crc::crc16(&sent[..6]));
        assert_eq!(modbus.transport().register(8), 1200);
    }

    #[test]
    fn responses_split_into_single_bytes() {
        let mut device = MockDevice::rd6006();
        device.set_chunk_size(1);
        let mut modbus = engine(device);
        assert_eq!(
            modbus.read_words(addr::ID, 4).unwrap(),
            vec![60061, 0, 12345, 128]
        );
        modbus.write_word(addr::V_SET, 1200).unwrap();
        modbus.write_words(addr::V_SET, &[1300, 2000]).unwrap();
        assert_eq!(modbus.transport().transactions().len(), 3);
        assert_eq!(modbus.transport().registers(addr::V_SET, 2), vec![1300, 2000]);
    }

    #[test]
    fn responses_split_into_pairs() {
        let mut device = MockDevice::rd6006();
        device.set_chunk_size(2);
        let mut modbus = engine(device);
        assert_eq!(modbus.read_words(addr::V_SET, 3).unwrap(), vec![500, 1000, 498]);
        modbus.write_word(addr::OUTPUT, 0).unwrap();
        assert_eq!(modbus.transport().transactions().len(), 2);
    }

    #[test]
    fn truncated_responses_are_retried() {
        let mut device = MockDevice::rd6006();
        device.set_chunk_size(3);
        // Cut inside the header, inside the data and inside the write ack.
        device.inject(Fault::Truncate(2));
        device.inject(Fault::Truncate(7));
        let mut modbus = engine(device);
        assert_eq!(
            modbus.read_words(addr::ID, 4).unwrap(),
            vec![60061, 0, 12345, 128]
        );
        assert_eq!(modbus.transport().transactions().len(), 3);

        modbus.transport_mut().inject(Fault::Truncate(6));
        modbus.write_word(addr::V_SET, 1200).unwrap();
        assert_eq!(modbus.transport().transactions().len(), 5);
        assert!(!modbus.has_failed());
    }

    #[test]
    fn read_words_round_trip() {
        let mut device = MockDevice::new(1);
        device.set_registers(10, &[1, 2, 3]);
        let mut modbus = engine(device);
        assert_eq!(modbus.read_words(10, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn write_words_updates_device() {
        let mut modbus = engine(MockDevice::new(1));
        modbus.write_words(80, &[500, 100, 620]).unwrap();
        assert_eq!(modbus.transport().registers(80, 3), vec![500, 100, 620]);
    }

    #[test]
    fn recovers_from_transient_faults() {
        let mut device = MockDevice::new(1);
        device.set_registers(0, &[60061]);
        device.inject(Fault::Timeout);
        device.inject(Fault::CorruptCrc);
        device.inject(Fault::Garbage(vec![0xFF, 0x00, 0x13]));
        let mut modbus = engine(device).with_retries(4);
        assert_eq!(modbus.read_words(0, 1).unwrap(), vec![60061]);
        assert_eq!(modbus.transport().transactions().len(), 4);
    }

    #[test]
    fn exception_is_retried() {
        let mut device = MockDevice::new(1);
        device.set_registers(8, &[500]);
        device.inject(Fault::Exception(ExceptionCode::IllegalDataAddress));
        let mut modbus = engine(device);
        assert_eq!(modbus.read_words(8, 1).unwrap(), vec![500]);
    }

    #[test]
    fn exception_frame_decoding() {
        let request = Request::read_holding_registers(8, 1).unwrap();
        let response = crate::crc::append_crc(&[0x01, 0x83, 0x02]);
        let error = protocol::validate_response(1, &request, Some(2), &response).unwrap_err();
        assert_matches!(error, Error::Exception(ExceptionCode::IllegalDataAddress));
        assert_eq!(error.to_string(), "Modbus exception: illegal data address");
        assert!(error.is_retryable());
    }

    #[test]
    fn exhaustion_is_fatal_and_sticky() {
        let mut device = MockDevice::new(1);
        device.set_silent(true);
        let mut modbus = engine(device);
        let error = modbus.read_words(0, 42).unwrap_err();
        assert_matches!(error, Error::RetriesExhausted { attempts: 3 });
        assert!(error.is_fatal());
        assert!(modbus.has_failed());
        assert_eq!(modbus.transport().transactions().len(), 3);

        modbus.transport_mut().set_silent(false);
        assert_matches!(
            modbus.write_word(8, 1),
            Err(Error::RetriesExhausted { .. })
        );
        assert_eq!(modbus.transport().transactions().len(), 3);
    }

    #[test]
    fn wrong_unit_is_rejected() {
        let mut modbus = Modbus::new(MockDevice::new(2), 1)
            .with_retries(2)
            .with_write_delay(Duration::ZERO);
        assert_matches!(
            modbus.read_words(0, 1),
            Err(Error::RetriesExhausted { attempts: 2 })
        );
    }

    #[test]
    fn usage_faults_skip_the_bus() {
        let mut modbus = engine(MockDevice::new(1));
        assert_matches!(modbus.read_words(0, 0), Err(Error::InvalidCount(0)));
        assert_matches!(modbus.write_words(0, &[]), Err(Error::InvalidCount(0)));
        assert!(modbus.transport().transactions().is_empty());
    }

    #[test]
    fn stale_input_is_discarded() {
        let mut device = MockDevice::new(1);
        device.set_registers(5, &[25]);
        device.push_stale_input(&[0xAA, 0xBB, 0xCC]);
        let mut modbus = engine(device);
        assert_eq!(modbus.read_words(5, 1).unwrap(), vec![25]);
    }
}
