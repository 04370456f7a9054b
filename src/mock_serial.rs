//! We use this mocking module in unit tests to emulate the meter's serial port.
//!
//! Replies are produced synchronously when a request is written, either from a queued script or
//! from a simulated meter with a register bank. Clones share state so a test can keep a handle
//! after moving the port into the client.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{self, READ_INPUT_REGISTERS, REQUEST_LEN};

/// One scripted answer to one written request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// These bytes become readable.
    Bytes(Vec<u8>),
    /// Nothing ever arrives.
    Silence,
}

/// Register bank that answers read input register requests like a real meter would.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMeter {
    pub address: u8,
    pub registers: BTreeMap<u16, u16>,
    /// Reads touching these registers get an "illegal data address" exception.
    pub rejected: Vec<u16>,
    /// Reads touching these registers get no answer at all.
    pub silent: Vec<u16>,
}

impl SimulatedMeter {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn set(&mut self, start: u16, words: &[u16]) {
        for (offset, word) in words.iter().enumerate() {
            self.registers.insert(start + offset as u16, *word);
        }
    }

    fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() != REQUEST_LEN
            || request[0] != self.address
            || codec::checksum(&request[..6]).to_le_bytes() != [request[6], request[7]]
        {
            return None;
        }
        if request[1] != READ_INPUT_REGISTERS {
            return Some(codec::encode_exception(self.address, request[1], 0x01).to_vec());
        }

        let start = u16::from_be_bytes([request[2], request[3]]);
        let count = u16::from_be_bytes([request[4], request[5]]);
        let range = start..start.saturating_add(count);
        if self.silent.iter().any(|reg| range.contains(reg)) {
            return None;
        }
        if self.rejected.iter().any(|reg| range.contains(reg)) {
            return Some(codec::encode_exception(self.address, request[1], 0x02).to_vec());
        }

        let words: Vec<u16> = range
            .map(|reg| self.registers.get(&reg).copied().unwrap_or(0))
            .collect();
        codec::encode_response(self.address, request[1], &words)
            .ok()
            .map(|frame| frame.to_vec())
    }
}

#[derive(Debug, Default)]
enum Responder {
    #[default]
    Nothing,
    Script(VecDeque<Reply>),
    Meter(SimulatedMeter),
}

#[derive(Debug, Default)]
struct MockState {
    /// Every write call, in order.
    written: Vec<Vec<u8>>,
    /// Bytes waiting to be read.
    read_buffer: VecDeque<u8>,
    responder: Responder,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    /// Flag to simulate read errors
    should_error_on_read: bool,
    /// Start failing reads once the next request has been written
    error_on_read_after_write: bool,
}

/// Our mock type used to emulate a serial port.
#[derive(Debug, Clone, Default)]
pub struct MockSerial {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "simulated serial error")
    }
}

impl std::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.state();
        if state.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        state.written.push(buf.to_vec());

        let reply = match &mut state.responder {
            Responder::Nothing => None,
            Responder::Script(script) => match script.pop_front() {
                Some(Reply::Bytes(bytes)) => Some(bytes),
                Some(Reply::Silence) | None => None,
            },
            Responder::Meter(meter) => meter.answer(buf),
        };
        if let Some(bytes) = reply {
            state.read_buffer.extend(bytes);
        }
        if state.error_on_read_after_write {
            state.should_error_on_read = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.state().should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.state();
        if state.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }

        let bytes_to_read = core::cmp::min(buf.len(), state.read_buffer.len());
        for slot in buf.iter_mut().take(bytes_to_read) {
            *slot = state.read_buffer.pop_front().unwrap_or_default();
        }
        Ok(bytes_to_read)
    }
}

impl embedded_io::ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let state = self.state();
        if state.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(!state.read_buffer.is_empty())
    }
}

impl MockSerial {
    /// Create a new MockSerial that never answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer each written request with the next scripted reply.
    pub fn scripted(replies: impl IntoIterator<Item = Reply>) -> Self {
        let serial = Self::new();
        serial.state().responder = Responder::Script(replies.into_iter().collect());
        serial
    }

    /// Answer requests from a simulated meter.
    pub fn with_meter(meter: SimulatedMeter) -> Self {
        let serial = Self::new();
        serial.state().responder = Responder::Meter(meter);
        serial
    }

    /// Change the simulated meter's registers or faults in place.
    pub fn update_meter(&self, update: impl FnOnce(&mut SimulatedMeter)) {
        if let Responder::Meter(meter) = &mut self.state().responder {
            update(meter);
        }
    }

    /// Make bytes readable without any request, e.g. line noise left over from an earlier exchange.
    pub fn inject(&self, bytes: &[u8]) {
        self.state().read_buffer.extend(bytes.iter().copied());
    }

    /// Every chunk written to this port so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&self, should_error: bool) {
        self.state().should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&self, should_error: bool) {
        self.state().should_error_on_read = should_error;
    }

    /// Configure whether reads should start failing after the next write
    pub fn set_read_error_after_write(&self, should_error: bool) {
        self.state().error_on_read_after_write = should_error;
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, ReadReady, Write};

    #[test]
    fn test_new_mock_serial_is_silent() {
        let mut mock = MockSerial::new();
        mock.write_all(&[0x01, 0x02]).unwrap();
        assert_eq!(mock.written(), vec![vec![0x01, 0x02]]);
        assert!(!mock.read_ready().unwrap());
    }

    #[test]
    fn test_scripted_replies_in_order() {
        let mut mock = MockSerial::scripted([Reply::Bytes(vec![0xAA]), Reply::Silence]);
        let mut buffer = [0u8; 4];

        mock.write_all(b"one").unwrap();
        assert!(mock.read_ready().unwrap());
        assert_eq!(mock.read(&mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], 0xAA);

        mock.write_all(b"two").unwrap();
        assert!(!mock.read_ready().unwrap());
        assert_eq!(mock.read(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_simulated_meter_answers_reads() {
        let mut meter = SimulatedMeter::new(0xF8);
        meter.set(0x0000, &[23280, 23380, 23224]);
        let mut mock = MockSerial::with_meter(meter);

        let request = codec::encode_request(0xF8, READ_INPUT_REGISTERS, 0x0000, 3).unwrap();
        mock.write_all(&request).unwrap();

        let mut buffer = [0u8; 32];
        let len = mock.read(&mut buffer).unwrap();
        let words = codec::decode_response(&buffer[..len], 0xF8, READ_INPUT_REGISTERS, 3).unwrap();
        assert_eq!(words.as_slice(), &[23280, 23380, 23224]);
    }

    #[test]
    fn test_simulated_meter_ignores_other_addresses() {
        let mut mock = MockSerial::with_meter(SimulatedMeter::new(0x01));
        let request = codec::encode_request(0x02, READ_INPUT_REGISTERS, 0x0000, 1).unwrap();
        mock.write_all(&request).unwrap();
        assert!(!mock.read_ready().unwrap());
    }

    #[test]
    fn test_simulated_meter_faults() {
        let mut meter = SimulatedMeter::new(0x01);
        meter.rejected.push(0x0010);
        meter.silent.push(0x0020);
        let mut mock = MockSerial::with_meter(meter);
        let mut buffer = [0u8; 32];

        let request = codec::encode_request(0x01, READ_INPUT_REGISTERS, 0x000E, 4).unwrap();
        mock.write_all(&request).unwrap();
        let len = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..len], codec::encode_exception(0x01, 0x04, 0x02).as_slice());

        let request = codec::encode_request(0x01, READ_INPUT_REGISTERS, 0x0020, 2).unwrap();
        mock.write_all(&request).unwrap();
        assert!(!mock.read_ready().unwrap());
    }

    #[test]
    fn test_error_flags_toggle() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        mock.set_write_error(false);
        assert!(mock.write(b"test").is_ok());

        mock.inject(b"data");
        mock.set_read_error(true);
        let mut buffer = [0u8; 10];
        assert!(mock.read(&mut buffer).is_err());
        assert!(mock.read_ready().is_err());
        mock.set_read_error(false);
        assert_eq!(mock.read(&mut buffer).unwrap(), 4);
    }
}
