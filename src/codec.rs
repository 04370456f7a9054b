//! Modbus RTU framing for register reads.
//!
//! Request: `[address][function][start: u16 BE][count: u16 BE][crc: u16 LE]`
//!
//! Response: `[address][function][byte count][words: u16 BE * N][crc: u16 LE]`
//!
//! Exception: `[address][function | 0x80][exception code][crc: u16 LE]`

use core::fmt;

use crc::{CRC_16_MODBUS, Crc};
use rmodbus::{ModbusProto, client::ModbusRequest};

use crate::error::FrameError;

/// "Read holding registers" function code.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// "Read input registers" function code. The PZEM meters expose measurements as input registers.
pub const READ_INPUT_REGISTERS: u8 = 0x04;

/// Largest register quantity a single read may ask for.
pub const MAX_READ_QUANTITY: u16 = 125;
/// Largest RTU frame on the wire.
pub const MAX_FRAME_LEN: usize = 256;

/// Length of a read request frame.
pub const REQUEST_LEN: usize = 8;
/// Address, function, byte count (or exception code) and the two CRC bytes.
const MIN_RESPONSE_LEN: usize = 5;
const EXCEPTION_FLAG: u8 = 0x80;

pub type Frame = heapless::Vec<u8, MAX_FRAME_LEN>;
pub type RegisterWords = heapless::Vec<u16, { MAX_READ_QUANTITY as usize }>;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `bytes`.
#[inline]
pub fn checksum(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// A register read request built by rmodbus, kept to check and parse its response.
pub struct ReadRequest {
    inner: ModbusRequest,
    address: u8,
    function: u8,
    start: u16,
    count: u16,
    frame: Frame,
}

impl ReadRequest {
    /// Build a read of `count` registers starting at `start` with a 0x03 or 0x04 function.
    pub fn new(address: u8, function: u8, start: u16, count: u16) -> Result<Self, FrameError> {
        if count == 0 || count > MAX_READ_QUANTITY {
            return Err(FrameError::InvalidQuantity(count));
        }

        let mut inner = ModbusRequest::new(address, ModbusProto::Rtu);
        let mut frame = Frame::new();
        match function {
            READ_HOLDING_REGISTERS => inner.generate_get_holdings(start, count, &mut frame)?,
            READ_INPUT_REGISTERS => inner.generate_get_inputs(start, count, &mut frame)?,
            other => return Err(FrameError::UnsupportedFunction(other)),
        }

        Ok(Self {
            inner,
            address,
            function,
            start,
            count,
            frame,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// The encoded request, CRC included.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Validate a complete response to this request and extract its register words.
    ///
    /// The frame is checked field by field first, so every rejection carries a specific
    /// [`FrameError`]. rmodbus then parses the data of a frame that passed.
    pub fn decode(&self, bytes: &[u8]) -> Result<RegisterWords, FrameError> {
        validate_response(bytes, self.address, self.function, self.count)?;
        let mut words = RegisterWords::new();
        self.inner.parse_u16(bytes, &mut words)?;
        Ok(words)
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("address", &self.address)
            .field("function", &self.function)
            .field("start", &self.start)
            .field("count", &self.count)
            .field("frame", &self.frame.as_slice())
            .finish()
    }
}

/// Build a read request for `count` registers starting at `start`.
pub fn encode_request(
    address: u8,
    function: u8,
    start: u16,
    count: u16,
) -> Result<Frame, FrameError> {
    Ok(ReadRequest::new(address, function, start, count)?.frame)
}

/// Build the response a device would send for a read of `words`.
pub fn encode_response(address: u8, function: u8, words: &[u16]) -> Result<Frame, FrameError> {
    let count = u16::try_from(words.len()).unwrap_or(u16::MAX);
    if words.is_empty() || count > MAX_READ_QUANTITY {
        return Err(FrameError::InvalidQuantity(count));
    }

    let mut frame = Frame::new();
    // At most 250 data bytes, so the byte count always fits.
    push_all(&mut frame, &[address, function, (words.len() * 2) as u8]);
    for word in words {
        push_all(&mut frame, &word.to_be_bytes());
    }
    append_crc(&mut frame);
    Ok(frame)
}

/// Build an exception response carrying `code`.
pub fn encode_exception(address: u8, function: u8, code: u8) -> Frame {
    let mut frame = Frame::new();
    push_all(&mut frame, &[address, function | EXCEPTION_FLAG, code]);
    append_crc(&mut frame);
    frame
}

/// How many bytes the response to a read of `count` registers will have,
/// given whatever prefix of it has been received so far.
///
/// Until the function byte arrives we assume a normal response; an exception is shorter.
pub fn expected_response_len(partial: &[u8], count: u16) -> usize {
    match partial.get(1) {
        Some(function) if function & EXCEPTION_FLAG != 0 => MIN_RESPONSE_LEN,
        _ => MIN_RESPONSE_LEN + 2 * count as usize,
    }
}

/// Validate a complete response frame and extract its register words.
///
/// The checksum is verified before any field is interpreted, so a corrupted byte anywhere in
/// the frame is reported as [`FrameError::ChecksumInvalid`].
pub fn decode_response(
    bytes: &[u8],
    expected_address: u8,
    expected_function: u8,
    expected_count: u16,
) -> Result<RegisterWords, FrameError> {
    // The start register plays no part in a response.
    ReadRequest::new(expected_address, expected_function, 0, expected_count)?.decode(bytes)
}

fn validate_response(
    bytes: &[u8],
    expected_address: u8,
    expected_function: u8,
    expected_count: u16,
) -> Result<(), FrameError> {
    if bytes.len() < MIN_RESPONSE_LEN {
        return Err(FrameError::Truncated {
            expected: MIN_RESPONSE_LEN,
            actual: bytes.len(),
        });
    }

    let (body, crc) = bytes.split_at(bytes.len() - 2);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let computed = checksum(body);
    if computed != received {
        return Err(FrameError::ChecksumInvalid { computed, received });
    }

    if body[0] != expected_address {
        return Err(FrameError::AddressMismatch {
            expected: expected_address,
            actual: body[0],
        });
    }

    let function = body[1];
    if function == expected_function | EXCEPTION_FLAG {
        return Err(FrameError::DeviceException { code: body[2] });
    }
    if function != expected_function {
        return Err(FrameError::FunctionMismatch {
            expected: expected_function,
            actual: function,
        });
    }

    let declared = body[2] as usize;
    let data = &body[3..];
    if declared != data.len() {
        return Err(FrameError::ByteCountMismatch {
            declared,
            actual: data.len(),
        });
    }
    if data.len() != 2 * expected_count as usize {
        return Err(FrameError::WordCountMismatch {
            expected: expected_count,
            actual: data.len(),
        });
    }
    Ok(())
}

fn append_crc(frame: &mut Frame) {
    let crc = checksum(frame);
    push_all(frame, &crc.to_le_bytes());
}

// Every response we build is bounded well below MAX_FRAME_LEN by the quantity checks above.
fn push_all(frame: &mut Frame, bytes: &[u8]) {
    for &byte in bytes {
        let _ = frame.push(byte);
    }
}
