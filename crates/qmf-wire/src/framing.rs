//! Legacy QMFv1 binary framing.
//!
//! A v1 frame is the 3-byte magic `'A','M','2'`, a one-byte opcode, and a
//! 32-bit big-endian sequence number, followed by an opcode-specific body.
//! Only the handful of opcodes the agent still honors are modeled; the
//! body primitives (short string, 128-bit digest) are the ones those
//! opcodes need.

use bytes::{Buf, BufMut};

/// Frame magic preceding the opcode byte.
pub const MAGIC: [u8; 3] = [b'A', b'M', b'2'];

/// Header length: magic + opcode + sequence.
pub const HEADER_LEN: usize = 8;

/// The v1 opcodes the agent emits or accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V1Opcode {
    /// Schema indication (outbound).
    SchemaIndication = b's',
    /// Package indication (outbound).
    PackageIndication = b'p',
    /// Schema request (inbound).
    SchemaRequest = b'S',
    /// Console-added indication (inbound).
    ConsoleAdded = b'x',
}

impl V1Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b's' => Some(V1Opcode::SchemaIndication),
            b'p' => Some(V1Opcode::PackageIndication),
            b'S' => Some(V1Opcode::SchemaRequest),
            b'x' => Some(V1Opcode::ConsoleAdded),
            _ => None,
        }
    }
}

/// Parsed v1 frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw opcode byte; may be an opcode this agent does not handle.
    pub opcode: u8,
    pub sequence: u32,
}

/// Write a frame header.
pub fn encode_header(buf: &mut impl BufMut, opcode: u8, sequence: u32) {
    buf.put_slice(&MAGIC);
    buf.put_u8(opcode);
    buf.put_u32(sequence);
}

/// Validate and consume a frame header.
///
/// Returns `None` for buffers shorter than [`HEADER_LEN`] or without the
/// magic; in that case the buffer contents are unspecified (callers drop
/// the message).
pub fn check_header(buf: &mut impl Buf) -> Option<FrameHeader> {
    if buf.remaining() < HEADER_LEN {
        return None;
    }
    let mut magic = [0u8; 3];
    buf.copy_to_slice(&mut magic);
    let opcode = buf.get_u8();
    let sequence = buf.get_u32();
    if magic != MAGIC {
        return None;
    }
    Some(FrameHeader { opcode, sequence })
}

/// Write a short string: one length byte followed by the bytes.
/// Strings longer than 255 bytes are truncated at the last char boundary
/// that fits.
pub fn put_short_string(buf: &mut impl BufMut, s: &str) {
    let mut end = s.len().min(255);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u8(end as u8);
    buf.put_slice(&s.as_bytes()[..end]);
}

/// Read a short string; `None` if the buffer is exhausted or the bytes
/// are not UTF-8.
pub fn get_short_string(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 1 {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return None;
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).ok()
}

/// Write a 128-bit digest.
pub fn put_bin128(buf: &mut impl BufMut, bin: &[u8; 16]) {
    buf.put_slice(bin);
}

/// Read a 128-bit digest.
pub fn get_bin128(buf: &mut impl Buf) -> Option<[u8; 16]> {
    if buf.remaining() < 16 {
        return None;
    }
    let mut bin = [0u8; 16];
    buf.copy_to_slice(&mut bin);
    Some(bin)
}
