//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! This module only deals with the plaintext layout. Encryption, MAC and
//! sequence numbers are applied by [`crate::ssh::transport::TransportCodec`].
//!
//! # Constraints
//!
//! - `padding_length` is between 4 and 255
//! - The padded length is a multiple of the cipher block size (at least 8).
//!   AEAD modes that authenticate the length field as associated data align
//!   `packet_length` alone; other modes align `packet_length + 4`.
//! - Packets we build never exceed [`MAX_PACKET_SIZE`]; packets we accept
//!   never exceed [`MAX_INBOUND_PACKET_SIZE`].
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"payload".to_vec(), 8, false).unwrap();
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"payload");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tether_platform::{TetherError, TetherResult};

/// Largest packet this engine will build (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Largest `packet_length` accepted from the peer.
pub const MAX_INBOUND_PACKET_SIZE: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Minimum cipher block size used for alignment.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Plaintext SSH binary packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet with random padding aligned to `block_size`.
    ///
    /// When `length_is_aad` is true the four length bytes are left out of
    /// the alignment, as required by the AEAD modes.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the padded packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn new(payload: Vec<u8>, block_size: usize, length_is_aad: bool) -> TetherResult<Self> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        let aligned_prefix = if length_is_aad { 1 } else { 5 };
        let unpadded_len = aligned_prefix + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        padding_len += (block_size - (unpadded_len + padding_len) % block_size) % block_size;

        let total_size = 5 + payload.len() + padding_len;
        if total_size > MAX_PACKET_SIZE {
            return Err(TetherError::protocol(format!(
                "packet size {} exceeds maximum {}",
                total_size, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes the plaintext packet (without MAC).
    pub fn to_bytes(&self) -> BytesMut {
        let packet_length = self.packet_length();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf
    }

    /// Checks a declared `packet_length` before the body is read.
    pub fn check_length(packet_length: usize) -> TetherResult<()> {
        if packet_length > MAX_INBOUND_PACKET_SIZE {
            return Err(TetherError::protocol(format!(
                "packet too large: {} bytes (maximum {})",
                packet_length, MAX_INBOUND_PACKET_SIZE
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN as usize {
            return Err(TetherError::protocol(format!(
                "packet too small: {} bytes",
                packet_length
            )));
        }
        Ok(())
    }

    /// Parses a complete plaintext packet, length field included.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the header is short, the declared
    /// length is out of range, the padding is invalid or the data does not
    /// match the declared length.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.len() < 5 {
            return Err(TetherError::protocol(format!(
                "packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        Self::check_length(packet_length)?;

        if buf.len() != packet_length {
            return Err(TetherError::protocol(format!(
                "packet length mismatch: declared {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN as usize {
            return Err(TetherError::protocol(format!(
                "padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if packet_length < 1 + padding_length {
            return Err(TetherError::protocol(format!(
                "packet_length {} too small for padding {}",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf.to_vec();

        Ok(Self { payload, padding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_new() {
        let payload = b"Hello, SSH!".to_vec();
        let packet = Packet::new(payload.clone(), 8, false).unwrap();

        assert_eq!(packet.payload(), &payload[..]);
        assert!(packet.padding().len() >= MIN_PADDING_LEN as usize);
        assert!(packet.padding().len() <= MAX_PADDING_LEN as usize);
    }

    #[test]
    fn test_packet_alignment() {
        for len in 0..64 {
            let packet = Packet::new(vec![0x5a; len], 16, false).unwrap();
            assert_eq!((4 + packet.packet_length()) % 16, 0, "len {}", len);

            let packet = Packet::new(vec![0x5a; len], 16, true).unwrap();
            assert_eq!(packet.packet_length() % 16, 0, "aad len {}", len);
        }
    }

    #[test]
    fn test_packet_small_block_size_clamped() {
        let packet = Packet::new(b"x".to_vec(), 1, false).unwrap();
        assert_eq!(packet.to_bytes().len() % MIN_BLOCK_SIZE, 0);
    }

    #[test]
    fn test_packet_parse() {
        let packet = Packet::new(b"Test SSH packet payload".to_vec(), 8, false).unwrap();
        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();

        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_packet_invalid_too_short() {
        let err = Packet::from_bytes(&[0, 0, 0, 10]).unwrap_err();
        assert_eq!(err.code(), tether_platform::ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![
            0, 0, 0, 8, // packet_length = 8
            2, // padding_length = 2 (< MIN_PADDING_LEN)
            0x48, 0x65, 0x6c, 0x6c, 0x6f, // payload "Hello"
            0x00, 0x00, // padding
        ];
        let err = Packet::from_bytes(&data).unwrap_err();
        assert!(err.message().contains("padding too short"));
    }

    #[test]
    fn test_packet_invalid_incomplete() {
        let data = vec![0, 0, 0, 20, 4, 0x48, 0x65];
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_packet_oversized_length_rejected() {
        assert!(Packet::check_length(MAX_INBOUND_PACKET_SIZE + 1).is_err());
        assert!(Packet::check_length(4).is_err());
        assert!(Packet::check_length(32).is_ok());
    }

    #[test]
    fn test_packet_exceeds_max_size() {
        let err = Packet::new(vec![0u8; MAX_PACKET_SIZE + 1000], 8, false).unwrap_err();
        assert!(err.message().contains("exceeds maximum"));
    }
}
