//! In-memory register bank speaking the device protocol, for unit tests.
use crate::crc;
use crate::protocol::{ExceptionCode, FunctionCode, EXCEPTION_FLAG};
use crate::registers::addr;
use crate::transport::Transport;
use crate::Result;
use std::collections::VecDeque;
use std::time::Duration;

/// A fault applied to the next transaction instead of the regular answer.
#[derive(Debug, Clone)]
pub enum Fault {
    /// No answer at all.
    Timeout,
    /// Regular answer with one flipped CRC bit.
    CorruptCrc,
    /// Exception answer with the given code.
    Exception(ExceptionCode),
    /// These bytes instead of the answer.
    Garbage(Vec<u8>),
    /// Only the first bytes of the regular answer.
    Truncate(usize),
}

/// One request the mock received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub function: u8,
    pub start: u16,
    pub count: u16,
}

impl Transaction {
    pub fn is_read(&self) -> bool {
        self.function == u8::from(FunctionCode::ReadHoldingRegisters)
    }

    pub fn is_single_write(&self) -> bool {
        self.function == u8::from(FunctionCode::WriteSingleRegister)
    }

    pub fn is_multi_write(&self) -> bool {
        self.function == u8::from(FunctionCode::WriteMultipleRegisters)
    }
}

pub struct MockDevice {
    unit: u8,
    registers: Vec<u16>,
    faults: VecDeque<Fault>,
    output: VecDeque<u8>,
    transactions: Vec<Transaction>,
    sent: Vec<Vec<u8>>,
    chunk: usize,
    silent: bool,
    connected: bool,
}

impl MockDevice {
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            registers: vec![0; 0x10000],
            faults: VecDeque::new(),
            output: VecDeque::new(),
            transactions: Vec::new(),
            sent: Vec::new(),
            chunk: usize::MAX,
            silent: false,
            connected: false,
        }
    }

    /// An RD6006 at unit 1 with some plausible register contents.
    pub fn rd6006() -> Self {
        let mut device = Self::new(1);
        device.set_registers(addr::ID, &[60061, 0, 12345, 128]);
        device.set_registers(addr::INT_C, &[0, 25]);
        device.set_registers(addr::V_SET, &[500, 1000, 498, 995, 0, 497, 2410]);
        device.set_registers(addr::OUTPUT, &[1]);
        device.set_registers(addr::EXT_C_S, &[0, 21, 0, 70]);
        device.set_registers(addr::M0_V, &[500, 1000, 6200, 6100]);
        device
    }

    pub fn set_registers(&mut self, start: u16, values: &[u16]) {
        let start = start as usize;
        self.registers[start..start + values.len()].copy_from_slice(values);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.registers[address as usize]
    }

    pub fn registers(&self, start: u16, count: usize) -> Vec<u16> {
        let start = start as usize;
        self.registers[start..start + count].to_vec()
    }

    /// Queues a fault for the next transaction without one.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    /// Makes the device ignore every request.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Limits every receive to at most `chunk` bytes.
    pub fn set_chunk_size(&mut self, chunk: usize) {
        self.chunk = chunk.max(1);
    }

    /// Leaves bytes in the input buffer as if a previous answer arrived late.
    pub fn push_stale_input(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn clear_transactions(&mut self) {
        self.transactions.clear();
        self.sent.clear();
    }

    pub fn reads(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .copied()
            .filter(Transaction::is_read)
            .collect()
    }

    pub fn writes(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .copied()
            .filter(|t| !t.is_read())
            .collect()
    }

    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    fn answer(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.silent || frame.len() < 8 || frame[0] != self.unit || !crc::is_valid(frame) {
            return None;
        }
        let function = frame[1];
        let start = u16::from_be_bytes([frame[2], frame[3]]);
        let word = u16::from_be_bytes([frame[4], frame[5]]);
        let count = if function == u8::from(FunctionCode::WriteSingleRegister) {
            1
        } else {
            word
        };
        self.transactions.push(Transaction {
            function,
            start,
            count,
        });

        let fault = self.faults.pop_front();
        if let Some(Fault::Timeout) = fault {
            return None;
        }
        if let Some(Fault::Garbage(bytes)) = fault {
            return Some(bytes);
        }
        if let Some(Fault::Exception(code)) = fault {
            return Some(self.exception(function, code));
        }

        let mut response = self.execute(function, start, word, frame);
        match fault {
            Some(Fault::CorruptCrc) => {
                if let Some(last) = response.last_mut() {
                    *last ^= 0x01;
                }
            }
            Some(Fault::Truncate(length)) => response.truncate(length),
            _ => {}
        }
        Some(response)
    }

    fn execute(&mut self, function: u8, start: u16, word: u16, frame: &[u8]) -> Vec<u8> {
        let begin = start as usize;
        match function {
            0x03 => {
                let end = begin + word as usize;
                if word == 0 || end > self.registers.len() {
                    return self.exception(function, ExceptionCode::IllegalDataAddress);
                }
                let mut response = vec![self.unit, function, (2 * word) as u8];
                for value in &self.registers[begin..end] {
                    response.extend_from_slice(&value.to_be_bytes());
                }
                crc::append_crc(&response)
            }
            0x06 => {
                self.registers[begin] = word;
                frame.to_vec()
            }
            0x10 => {
                let data = &frame[7..frame.len() - 2];
                for (offset, pair) in data.chunks_exact(2).enumerate() {
                    self.registers[begin + offset] = u16::from_be_bytes([pair[0], pair[1]]);
                }
                crc::append_crc(&frame[..6])
            }
            _ => self.exception(function, ExceptionCode::IllegalFunction),
        }
    }

    fn exception(&self, function: u8, code: ExceptionCode) -> Vec<u8> {
        crc::append_crc(&[self.unit, function | EXCEPTION_FLAG, code.into()])
    }
}

impl Transport for MockDevice {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.push(data.to_vec());
        if let Some(response) = self.answer(data) {
            self.output.extend(response);
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let count = max_len.min(self.chunk).min(self.output.len());
        Ok(self.output.drain(..count).collect())
    }

    fn flush_input(&mut self) -> Result<usize> {
        let pending = self.output.len();
        self.output.clear();
        Ok(pending)
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn describe(&self) -> String {
        format!("mock unit {}", self.unit)
    }
}
