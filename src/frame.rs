//! Frame encoder/decoder.
//!
//! Every message on the bus, in both directions, is a fixed 26 byte frame:
//!
//! ```text
//! 0xAA <addr> <cmd> <payload: 22 bytes> <checksum>
//! ```
//!
//! - `0xAA`: sync byte marking the start of a frame
//! - `addr`: address of the load the frame is for (or from)
//! - `cmd`: [`Command`] code
//! - `payload`: command specific, little-endian, zero padded
//! - `checksum`: sum of the 25 preceding bytes, modulo 256
//!
//! Decoding never fails. Anything that can't be used is reported through
//! [`Validity`] so that callers can apply one retry policy to all of it.

use crate::{
    address::DeviceAddress,
    command::Command,
    error::EncodingError,
};

/// Sync byte at the start of every frame.
pub const SYNC: u8 = 0xAA;

/// Total length of a frame on the wire.
pub const FRAME_LEN: usize = 26;

/// Length of the payload field.
pub const PAYLOAD_LEN: usize = 22;

const HEADER_LEN: usize = 3;
const CHECKSUM_OFFSET: usize = FRAME_LEN - 1;

/// A frame which passed the integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: DeviceAddress,
    pub command: Command,
    pub payload: [u8; PAYLOAD_LEN],
}

impl Frame {
    /// Read a little-endian `u16` from the payload.
    pub fn payload_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.payload[offset], self.payload[offset + 1]])
    }

    /// Read a little-endian `u32` from the payload.
    pub fn payload_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.payload[offset],
            self.payload[offset + 1],
            self.payload[offset + 2],
            self.payload[offset + 3],
        ])
    }
}

/// How a received byte sequence was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Parsed as a frame but the checksum is wrong. Usually a single corrupted frame.
    ChecksumInvalid,
    /// Not a frame of any known shape. Bus noise, truncation or desync.
    Malformed,
    /// A good frame, but for another load on the bus.
    AddressMismatch,
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    raw: heapless::Vec<u8, FRAME_LEN>,
    frame: Option<Frame>,
    validity: Validity,
}

impl Response {
    fn rejected(raw: &[u8], validity: Validity) -> Self {
        let keep = raw.len().min(FRAME_LEN);
        Self {
            raw: heapless::Vec::from_slice(&raw[..keep]).unwrap_or_default(),
            frame: None,
            validity,
        }
    }

    /// The bytes this response was decoded from (at most one frame).
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The decoded frame. Only present when the integrity check passed.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub(crate) fn mark_address_mismatch(mut self) -> Self {
        if self.validity == Validity::Valid {
            self.validity = Validity::AddressMismatch;
        }
        self
    }
}

/// Checksum over everything but the trailing checksum byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Encode a frame ready for transmission.
///
/// `payload` may be shorter than the command's payload length, the rest is zero filled.
///
/// # Example
///
/// ```
/// use array_eload::{address::DeviceAddress, command::Command, frame::encode};
///
/// let bytes = encode(DeviceAddress::new(0).unwrap(), Command::QueryStatus, &[]).unwrap();
/// assert_eq!(&bytes[..3], &[0xAA, 0x00, 0x91]);
/// assert_eq!(bytes[25], 0x3B);
/// ```
pub fn encode(
    address: DeviceAddress,
    command: Command,
    payload: &[u8],
) -> Result<[u8; FRAME_LEN], EncodingError> {
    encode_bounded(address, command, payload, command.payload_len())
}

/// Encode a frame as the load sends it in reply to `command`.
pub fn encode_reply(
    address: DeviceAddress,
    command: Command,
    payload: &[u8],
) -> Result<[u8; FRAME_LEN], EncodingError> {
    encode_bounded(address, command, payload, command.reply_payload_len())
}

fn encode_bounded(
    address: DeviceAddress,
    command: Command,
    payload: &[u8],
    max: usize,
) -> Result<[u8; FRAME_LEN], EncodingError> {
    if address.is_reserved() {
        return Err(EncodingError::ReservedAddress(address.into()));
    }
    if payload.len() > max {
        return Err(EncodingError::PayloadTooLong {
            len: payload.len(),
            max,
        });
    }

    let mut buf = [0u8; FRAME_LEN];
    buf[0] = SYNC;
    buf[1] = address.into();
    buf[2] = command.into();
    buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    buf[CHECKSUM_OFFSET] = checksum(&buf[..CHECKSUM_OFFSET]);
    Ok(buf)
}

/// Encode a [`Frame`], using its full payload field.
pub fn encode_frame(frame: &Frame) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = SYNC;
    buf[1] = frame.address.into();
    buf[2] = frame.command.into();
    buf[HEADER_LEN..CHECKSUM_OFFSET].copy_from_slice(&frame.payload);
    buf[CHECKSUM_OFFSET] = checksum(&buf[..CHECKSUM_OFFSET]);
    buf
}

/// Decode the first frame found in `bytes`.
///
/// Bytes before the first sync byte are skipped.
pub fn decode(bytes: &[u8]) -> Response {
    let Some(start) = bytes.iter().position(|&b| b == SYNC) else {
        return Response::rejected(bytes, Validity::Malformed);
    };
    let bytes = &bytes[start..];
    if bytes.len() < FRAME_LEN {
        return Response::rejected(bytes, Validity::Malformed);
    }
    let bytes = &bytes[..FRAME_LEN];

    let Ok(command) = Command::try_from(bytes[2]) else {
        return Response::rejected(bytes, Validity::Malformed);
    };
    if checksum(&bytes[..CHECKSUM_OFFSET]) != bytes[CHECKSUM_OFFSET] {
        return Response::rejected(bytes, Validity::ChecksumInvalid);
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&bytes[HEADER_LEN..CHECKSUM_OFFSET]);
    Response {
        raw: heapless::Vec::from_slice(bytes).unwrap_or_default(),
        frame: Some(Frame {
            address: DeviceAddress::from_wire(bytes[1]),
            command,
            payload,
        }),
        validity: Validity::Valid,
    }
}

/// Result of attempting to decode a frame from a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A full frame's worth of bytes was classified. The `usize` is the number
    /// of bytes consumed from the buffer.
    Frame(Response, usize),
    /// No complete frame yet, more data is needed.
    Incomplete,
    /// Bytes before the next sync byte. The `usize` is the number of bytes to discard.
    Noise(usize),
}

/// Attempt to pick one frame off the front of a continuous byte stream.
///
/// A sync byte which doesn't start a good frame is treated as noise when a
/// good frame starts at a later sync byte within its 26 bytes.
pub fn decode_stream(buf: &[u8]) -> DecodeResult {
    match buf.iter().position(|&b| b == SYNC) {
        None if buf.is_empty() => DecodeResult::Incomplete,
        None => DecodeResult::Noise(buf.len()),
        Some(0) if buf.len() < FRAME_LEN => DecodeResult::Incomplete,
        Some(0) => {
            let response = decode(&buf[..FRAME_LEN]);
            if response.is_valid() {
                return DecodeResult::Frame(response, FRAME_LEN);
            }
            match buf[1..FRAME_LEN].iter().position(|&b| b == SYNC).map(|pos| pos + 1) {
                Some(next) if buf.len() - next < FRAME_LEN => DecodeResult::Incomplete,
                Some(next) if decode(&buf[next..next + FRAME_LEN]).is_valid() => {
                    DecodeResult::Noise(next)
                }
                _ => DecodeResult::Frame(response, FRAME_LEN),
            }
        }
        Some(pos) => DecodeResult::Noise(pos),
    }
}
