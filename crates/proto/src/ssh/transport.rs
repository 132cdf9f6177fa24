//! SSH transport codec (RFC 4253 Section 6).
//!
//! [`TransportCodec`] turns payloads into protected wire packets and back.
//! Inbound bytes are appended with [`TransportCodec::feed`]; each call to
//! [`TransportCodec::decode`] yields one payload or [`Decoded::Incomplete`]
//! when more bytes are needed. A partial packet is never an error.
//!
//! # Sequence Numbers
//!
//! Each direction keeps its own 32-bit sequence number. It starts at zero,
//! increments once per packet and is never reset by key exchange. It feeds
//! the MAC and the AEAD nonces, so the codec refuses to send more than
//! 2^32 packets under one set of keys.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::transport::{Decoded, TransportCodec};
//!
//! let mut client = TransportCodec::new();
//! let mut server = TransportCodec::new();
//!
//! let wire = client.encode(b"\x05hello").unwrap();
//! server.feed(&wire[..3]);
//! assert_eq!(server.decode().unwrap(), Decoded::Incomplete);
//!
//! server.feed(&wire[3..]);
//! assert_eq!(server.decode().unwrap(), Decoded::Packet(b"\x05hello".to_vec()));
//! ```

use bytes::BytesMut;
use tether_platform::{TetherError, TetherResult};
use tracing::trace;

use super::crypto::{DirectionKeys, PacketOpener, PacketSealer};
use super::packet::Packet;

/// Hard limit on packets protected by one set of keys.
pub const MAX_PACKETS_PER_KEY: u64 = 1 << 32;

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, verified payload.
    Packet(Vec<u8>),
    /// More bytes are needed.
    Incomplete,
}

/// Re-key thresholds, checked per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyLimits {
    /// Bytes on the wire under one set of keys.
    pub bytes: u64,
    /// Packets under one set of keys.
    pub packets: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: 1 << 30,
            packets: 1 << 31,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    packets: u64,
    bytes: u64,
}

impl Usage {
    fn record(&mut self, wire_len: usize) {
        self.packets += 1;
        self.bytes += wire_len as u64;
    }
}

/// Packet codec for one SSH connection.
#[derive(Debug)]
pub struct TransportCodec {
    inbound: BytesMut,
    sealer: PacketSealer,
    opener: PacketOpener,
    send_seq: u32,
    recv_seq: u32,
    pending_length: Option<usize>,
    sent: Usage,
    received: Usage,
    limits: RekeyLimits,
}

impl Default for TransportCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCodec {
    /// Creates a codec in the unencrypted initial state.
    pub fn new() -> Self {
        Self::with_limits(RekeyLimits::default())
    }

    /// Creates a codec with custom re-key thresholds.
    pub fn with_limits(limits: RekeyLimits) -> Self {
        Self {
            inbound: BytesMut::with_capacity(8192),
            sealer: PacketSealer::plain(),
            opener: PacketOpener::plain(),
            send_seq: 0,
            recv_seq: 0,
            pending_length: None,
            sent: Usage::default(),
            received: Usage::default(),
            limits,
        }
    }

    /// Appends raw inbound bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Raw inbound buffer, used for the identification line that precedes
    /// the first binary packet.
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Number of buffered inbound bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Frames and protects one payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the payload is too large, or if the
    /// outbound keys have protected [`MAX_PACKETS_PER_KEY`] packets.
    pub fn encode(&mut self, payload: &[u8]) -> TetherResult<Vec<u8>> {
        if self.sent.packets >= MAX_PACKETS_PER_KEY {
            return Err(TetherError::protocol(
                "outbound sequence space exhausted, re-key required",
            ));
        }

        let packet = Packet::new(
            payload.to_vec(),
            self.sealer.block_size(),
            self.sealer.length_is_aad(),
        )?;
        let mut wire = packet.to_bytes().to_vec();
        self.sealer.seal(self.send_seq, &mut wire)?;

        trace!(
            seq = self.send_seq,
            msg = payload.first().copied().unwrap_or(0),
            len = wire.len(),
            "packet encoded"
        );

        self.send_seq = self.send_seq.wrapping_add(1);
        self.sent.record(wire.len());
        Ok(wire)
    }

    /// Decodes the next packet from the inbound buffer.
    ///
    /// # Errors
    ///
    /// - Integrity error if a MAC or tag does not verify
    /// - Protocol violation for an out-of-range or misaligned length, or bad
    ///   padding
    ///
    /// Both are fatal; the codec must not be used afterwards.
    pub fn decode(&mut self) -> TetherResult<Decoded> {
        let packet_length = match self.pending_length {
            Some(len) => len,
            None => {
                let header_len = self.opener.header_len();
                if self.inbound.len() < header_len {
                    return Ok(Decoded::Incomplete);
                }
                let len = self
                    .opener
                    .peek_length(self.recv_seq, &mut self.inbound[..header_len]);
                self.check_inbound_length(len)?;
                self.pending_length = Some(len);
                len
            }
        };

        let total = 4 + packet_length + self.opener.trailer_len();
        if self.inbound.len() < total {
            return Ok(Decoded::Incomplete);
        }

        let mut wire = self.inbound.split_to(total);
        self.pending_length = None;
        self.opener.open(self.recv_seq, &mut wire, packet_length)?;
        let packet = Packet::from_bytes(&wire[..4 + packet_length])?;

        trace!(
            seq = self.recv_seq,
            msg = packet.payload().first().copied().unwrap_or(0),
            len = total,
            "packet decoded"
        );

        self.recv_seq = self.recv_seq.wrapping_add(1);
        self.received.record(total);

        let payload = packet.into_payload();
        if payload.is_empty() {
            return Err(TetherError::protocol("packet with empty payload"));
        }
        Ok(Decoded::Packet(payload))
    }

    fn check_inbound_length(&self, packet_length: usize) -> TetherResult<()> {
        Packet::check_length(packet_length)?;

        let cipher = self.opener.algorithm();
        let block = cipher.block_size();
        let aligned = if cipher.is_aead() {
            packet_length % block == 0
        } else {
            (4 + packet_length) % block == 0
        };
        if !aligned {
            return Err(TetherError::protocol(format!(
                "packet length {} not aligned to block size {}",
                packet_length, block
            )));
        }
        if 4 + packet_length < self.opener.header_len() {
            return Err(TetherError::protocol(format!(
                "packet length {} shorter than cipher block",
                packet_length
            )));
        }
        Ok(())
    }

    /// Switches outbound protection to new keys (after sending NEWKEYS).
    pub fn install_outbound(&mut self, keys: &DirectionKeys) -> TetherResult<()> {
        self.sealer = PacketSealer::new(keys)?;
        self.sent = Usage::default();
        Ok(())
    }

    /// Switches inbound protection to new keys (after receiving NEWKEYS).
    pub fn install_inbound(&mut self, keys: &DirectionKeys) -> TetherResult<()> {
        self.opener = PacketOpener::new(keys)?;
        self.received = Usage::default();
        Ok(())
    }

    /// True once either direction crosses a re-key threshold.
    pub fn needs_rekey(&self) -> bool {
        let over = |usage: &Usage| {
            usage.bytes >= self.limits.bytes || usage.packets >= self.limits.packets
        };
        over(&self.sent) || over(&self.received)
    }

    /// True when packet protection is active in both directions.
    pub fn is_encrypted(&self) -> bool {
        self.sealer.algorithm() != super::crypto::CipherAlgorithm::None
            && self.opener.algorithm() != super::crypto::CipherAlgorithm::None
    }

    /// Next outbound sequence number.
    pub fn send_sequence(&self) -> u32 {
        self.send_seq
    }

    /// Next inbound sequence number.
    pub fn recv_sequence(&self) -> u32 {
        self.recv_seq
    }

    /// Sequence number of the most recently decoded packet, for
    /// SSH_MSG_UNIMPLEMENTED replies.
    pub fn last_recv_sequence(&self) -> u32 {
        self.recv_seq.wrapping_sub(1)
    }

    /// Bytes and packets sent under the current outbound keys.
    pub fn sent_since_rekey(&self) -> (u64, u64) {
        (self.sent.bytes, self.sent.packets)
    }

    /// Bytes and packets received under the current inbound keys.
    pub fn received_since_rekey(&self) -> (u64, u64) {
        (self.received.bytes, self.received.packets)
    }

    #[cfg(test)]
    fn set_sequence_numbers(&mut self, send: u32, recv: u32) {
        self.send_seq = send;
        self.recv_seq = recv;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
    use tether_platform::ErrorCode;
    use zeroize::Zeroizing;

    fn keys(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> DirectionKeys {
        DirectionKeys {
            cipher,
            mac,
            iv: Zeroizing::new(vec![0x11; 16]),
            key: Zeroizing::new(vec![0x22; 64]),
            mac_key: Zeroizing::new(vec![0x33; 64]),
        }
    }

    fn pair(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> (TransportCodec, TransportCodec) {
        let mut a = TransportCodec::new();
        let mut b = TransportCodec::new();
        let k = keys(cipher, mac);
        a.install_outbound(&k).unwrap();
        b.install_inbound(&k).unwrap();
        (a, b)
    }

    fn all_suites() -> Vec<(CipherAlgorithm, Option<MacAlgorithm>)> {
        vec![
            (CipherAlgorithm::None, None),
            (CipherAlgorithm::ChaCha20Poly1305, None),
            (CipherAlgorithm::Aes128Gcm, None),
            (CipherAlgorithm::Aes256Gcm, None),
            (CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256)),
            (CipherAlgorithm::Aes256Ctr, Some(MacAlgorithm::HmacSha512)),
        ]
    }

    #[test]
    fn test_sequence_preserved_for_every_suite() {
        for (cipher, mac) in all_suites() {
            let (mut tx, mut rx) = pair(cipher, mac);
            let payloads: Vec<Vec<u8>> = (0..20u8)
                .map(|i| {
                    let mut p = vec![94];
                    p.extend(std::iter::repeat(i).take(i as usize * 37));
                    p
                })
                .collect();

            let mut wire = Vec::new();
            for p in &payloads {
                wire.extend(tx.encode(p).unwrap());
            }

            // Deliver in uneven chunks
            let mut decoded = Vec::new();
            for chunk in wire.chunks(13) {
                rx.feed(chunk);
                while let Decoded::Packet(p) = rx.decode().unwrap() {
                    decoded.push(p);
                }
            }
            assert_eq!(decoded, payloads, "cipher {}", cipher.name());
            assert_eq!(rx.recv_sequence(), 20);
        }
    }

    #[test]
    fn test_incomplete_is_not_error() {
        let mut codec = TransportCodec::new();
        assert_eq!(codec.decode().unwrap(), Decoded::Incomplete);
        codec.feed(&[0, 0]);
        assert_eq!(codec.decode().unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn test_tampered_packet_is_integrity_error() {
        for (cipher, mac) in all_suites().into_iter().skip(1) {
            let (mut tx, mut rx) = pair(cipher, mac);
            let mut wire = tx.encode(b"\x5eabcdefgh").unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;
            rx.feed(&wire);
            let err = rx.decode().unwrap_err();
            assert_eq!(err.code(), ErrorCode::Integrity, "cipher {}", cipher.name());
        }
    }

    #[test]
    fn test_wrong_sequence_number_fails_mac() {
        let (mut tx, mut rx) = pair(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256));
        rx.set_sequence_numbers(0, 5);
        rx.feed(&tx.encode(b"\x02").unwrap());
        assert_eq!(rx.decode().unwrap_err().code(), ErrorCode::Integrity);
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut tx, mut rx) = pair(CipherAlgorithm::ChaCha20Poly1305, None);
        tx.set_sequence_numbers(u32::MAX, 0);
        rx.set_sequence_numbers(0, u32::MAX);

        for _ in 0..2 {
            rx.feed(&tx.encode(b"\x02ping").unwrap());
            assert!(matches!(rx.decode().unwrap(), Decoded::Packet(_)));
        }
        assert_eq!(tx.send_sequence(), 1);
        assert_eq!(rx.recv_sequence(), 1);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = TransportCodec::new();
        codec.feed(&[0x7f, 0xff, 0xff, 0xf8]);
        assert_eq!(codec.decode().unwrap_err().code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let mut codec = TransportCodec::new();
        // 4 + 13 is not a multiple of 8
        codec.feed(&[0, 0, 0, 13]);
        let err = codec.decode().unwrap_err();
        assert!(err.message().contains("not aligned"));
    }

    #[test]
    fn test_rekey_threshold_by_packets() {
        let mut codec = TransportCodec::with_limits(RekeyLimits {
            bytes: u64::MAX,
            packets: 3,
        });
        for _ in 0..2 {
            codec.encode(b"\x02").unwrap();
        }
        assert!(!codec.needs_rekey());
        codec.encode(b"\x02").unwrap();
        assert!(codec.needs_rekey());

        codec
            .install_outbound(&keys(CipherAlgorithm::Aes256Gcm, None))
            .unwrap();
        assert!(!codec.needs_rekey());
        // Sequence numbers continue across key changes
        assert_eq!(codec.send_sequence(), 3);
    }

    #[test]
    fn test_rekey_threshold_by_bytes() {
        let mut codec = TransportCodec::with_limits(RekeyLimits {
            bytes: 100,
            packets: u64::MAX,
        });
        codec.encode(&[94; 120]).unwrap();
        assert!(codec.needs_rekey());
    }
}
