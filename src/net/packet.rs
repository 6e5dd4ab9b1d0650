//! Raw network packets and byte-level pack/unpack helpers.
//!
//! A [`RawPacket`] is the universal unit of exchange between the transports,
//! the connections, and the server dispatcher: an immutable byte buffer whose
//! first byte is the message tag. Packets are shared by reference (cloning is
//! an `Arc` bump) and are never mutated after construction.

use std::fmt;
use std::sync::Arc;

/// Hard upper bound on a packet, tag byte included.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Errors produced while constructing or reading packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("packet too large: {0} bytes (max {MAX_PACKET_SIZE})")]
    TooLarge(usize),
    #[error("truncated packet: wanted {wanted} bytes at offset {offset}")]
    Truncated { offset: usize, wanted: usize },
    #[error("invalid utf-8 in string field")]
    InvalidString,
}

/// Immutable, shared, length-bounded byte buffer. Byte 0 is the message tag.
#[derive(Clone, PartialEq, Eq)]
pub struct RawPacket {
    data: Arc<[u8]>,
}

impl RawPacket {
    /// Wrap a byte buffer. Rejects empty and oversized input; a zero-length
    /// or >65535-byte datagram is dropped at the ingress boundary, never
    /// propagated into the dispatcher.
    pub fn new(data: Vec<u8>) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }
        Ok(Self { data: data.into() })
    }

    /// The message tag (first byte).
    pub fn tag(&self) -> u8 {
        self.data[0]
    }

    /// Total length in bytes, tag included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// A valid packet always carries at least its tag byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The full wire bytes, tag included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The payload after the tag byte.
    pub fn payload(&self) -> &[u8] {
        &self.data[1..]
    }
}

impl fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPacket")
            .field("tag", &self.tag())
            .field("len", &self.len())
            .finish()
    }
}

/// Builder for the tag-byte wire layout. Integers are little-endian.
pub struct PacketBuilder {
    buffer: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(tag: u8) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.push(tag);
        Self { buffer }
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(mut self, value: i32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32(mut self, value: f32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed string: u8 byte count, then UTF-8 bytes. Strings longer
    /// than 255 bytes are truncated at a char boundary.
    pub fn write_str(mut self, value: &str) -> Self {
        let mut end = value.len().min(u8::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buffer.push(end as u8);
        self.buffer.extend_from_slice(&value.as_bytes()[..end]);
        self
    }

    /// Trailing string: raw UTF-8 bytes out to the end of the packet. Must be
    /// the last field written.
    pub fn write_str_tail(mut self, value: &str) -> Self {
        self.buffer.extend_from_slice(value.as_bytes());
        self
    }

    pub fn build(self) -> Result<RawPacket, PacketError> {
        RawPacket::new(self.buffer)
    }
}

/// Cursor over a packet's payload (positioned after the tag byte).
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a RawPacket) -> Self {
        Self {
            data: packet.as_bytes(),
            position: 1,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.position + n > self.data.len() {
            return Err(PacketError::Truncated {
                offset: self.position,
                wanted: n,
            });
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, PacketError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, PacketError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        self.take(n)
    }

    /// Length-prefixed string (u8 count + UTF-8 bytes).
    pub fn read_str(&mut self) -> Result<String, PacketError> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidString)
    }

    /// Trailing string: everything left in the packet.
    pub fn read_str_tail(&mut self) -> Result<String, PacketError> {
        let bytes = &self.data[self.position..];
        self.position = self.data.len();
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidString)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip_is_bit_exact() {
        let bytes = vec![7u8, 1, 2, 3, 0xFF];
        let packet = RawPacket::new(bytes.clone()).unwrap();
        assert_eq!(packet.tag(), 7);
        assert_eq!(packet.as_bytes(), &bytes[..]);
        let copy = RawPacket::new(packet.as_bytes().to_vec()).unwrap();
        assert_eq!(packet, copy);
    }

    #[test]
    fn test_empty_packet_rejected() {
        assert!(matches!(RawPacket::new(vec![]), Err(PacketError::Empty)));
    }

    #[test]
    fn test_size_boundary() {
        // 65535 accepted, 65536 rejected.
        let max = vec![1u8; MAX_PACKET_SIZE];
        assert!(RawPacket::new(max).is_ok());
        let over = vec![1u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            RawPacket::new(over),
            Err(PacketError::TooLarge(n)) if n == MAX_PACKET_SIZE + 1
        ));
    }

    #[test]
    fn test_clone_is_shared() {
        let packet = RawPacket::new(vec![1, 2, 3]).unwrap();
        let copy = packet.clone();
        assert!(std::ptr::eq(packet.as_bytes(), copy.as_bytes()));
    }

    #[test]
    fn test_builder_reader_roundtrip() {
        let packet = PacketBuilder::new(42)
            .write_u8(5)
            .write_u16(1000)
            .write_u32(0xDEADBEEF)
            .write_i32(-160)
            .write_f32(0.25)
            .write_str("alice")
            .write_str_tail("hello world")
            .build()
            .unwrap();

        assert_eq!(packet.tag(), 42);
        let mut reader = PacketReader::new(&packet);
        assert_eq!(reader.read_u8().unwrap(), 5);
        assert_eq!(reader.read_u16().unwrap(), 1000);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_i32().unwrap(), -160);
        assert!((reader.read_f32().unwrap() - 0.25).abs() < f32::EPSILON);
        assert_eq!(reader.read_str().unwrap(), "alice");
        assert_eq!(reader.read_str_tail().unwrap(), "hello world");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_truncation() {
        let packet = PacketBuilder::new(1).write_u8(9).build().unwrap();
        let mut reader = PacketReader::new(&packet);
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert!(matches!(
            reader.read_u32(),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_long_string_truncated_at_char_boundary() {
        let long = "é".repeat(200); // 400 bytes of 2-byte chars
        let packet = PacketBuilder::new(1).write_str(&long).build().unwrap();
        let mut reader = PacketReader::new(&packet);
        let out = reader.read_str().unwrap();
        assert!(out.len() <= 255);
        assert!(long.starts_with(&out));
    }
}
