//! Packet protection for the SSH transport.
//!
//! This module implements the negotiated ciphers and MACs:
//! - `chacha20-poly1305@openssh.com` (AEAD, encrypted length field)
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` (AEAD, RFC 5647)
//! - `aes128-ctr`, `aes256-ctr` with `hmac-sha2-256` / `hmac-sha2-512`
//! - `none`, in effect until the first NEWKEYS
//!
//! A [`PacketSealer`] protects outbound packets and a [`PacketOpener`]
//! verifies and decrypts inbound ones. Both take the packet sequence
//! number from the caller.
//!
//! # Security
//!
//! - MACs and tags are checked before any plaintext is released
//! - MAC comparison is constant time (`subtle`)
//! - Key material is zeroized on drop

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use ring::aead::chacha20_poly1305_openssh;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tether_platform::{TetherError, TetherResult};
use zeroize::{Zeroize, Zeroizing};

/// Nonce sequence for the AES-GCM modes (RFC 5647 Section 7.1).
///
/// The 12-byte IV is split into a fixed 4-byte field and an 8-byte
/// invocation counter that increments once per packet.
struct GcmCounter {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmCounter {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut invocation = [0u8; 8];
        invocation.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(invocation),
        }
    }
}

impl NonceSequence for GcmCounter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed);
        nonce_bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption (initial state only)
    None,
    /// ChaCha20-Poly1305 AEAD cipher
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::ChaCha20Poly1305 => chacha20_poly1305_openssh::KEY_LEN,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Returns the block size used for padding alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (AEAD ciphers only).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// Key material for one direction of the transport.
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC (ignored by AEAD ciphers)
    pub mac: Option<MacAlgorithm>,
    /// Initial IV
    pub iv: Zeroizing<Vec<u8>>,
    /// Encryption key
    pub key: Zeroizing<Vec<u8>>,
    /// Integrity key
    pub mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// MAC key for encrypt-and-MAC modes.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TetherResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(TetherError::protocol(format!(
                "insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `MAC(key, sequence_number || packet)`.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> TetherResult<()> {
        let computed = self.compute(sequence, packet);
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(TetherError::integrity(format!(
                "MAC mismatch on packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

enum CtrCipher {
    Aes128(Box<Ctr128BE<Aes128>>),
    Aes256(Box<Ctr128BE<Aes256>>),
}

impl CtrCipher {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TetherResult<Self> {
        let err = |_| TetherError::protocol("invalid AES-CTR key or IV length");
        match algorithm {
            CipherAlgorithm::Aes128Ctr => Ok(CtrCipher::Aes128(Box::new(
                Ctr128BE::<Aes128>::new_from_slices(&key[..16], &iv[..16]).map_err(err)?,
            ))),
            CipherAlgorithm::Aes256Ctr => Ok(CtrCipher::Aes256(Box::new(
                Ctr128BE::<Aes256>::new_from_slices(&key[..32], &iv[..16]).map_err(err)?,
            ))),
            other => Err(TetherError::protocol(format!(
                "{} is not a CTR cipher",
                other.name()
            ))),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

fn check_material(keys: &DirectionKeys) -> TetherResult<()> {
    let cipher = keys.cipher;
    if keys.key.len() < cipher.key_size() || keys.iv.len() < cipher.iv_size() {
        return Err(TetherError::protocol(format!(
            "insufficient key material for {}",
            cipher.name()
        )));
    }
    Ok(())
}

fn gcm_unbound(keys: &DirectionKeys) -> TetherResult<UnboundKey> {
    let algorithm = match keys.cipher {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        _ => &AES_256_GCM,
    };
    UnboundKey::new(algorithm, &keys.key[..keys.cipher.key_size()])
        .map_err(|_| TetherError::protocol("failed to create AES-GCM key"))
}

fn chacha_material(keys: &DirectionKeys) -> [u8; chacha20_poly1305_openssh::KEY_LEN] {
    let mut material = [0u8; chacha20_poly1305_openssh::KEY_LEN];
    material.copy_from_slice(&keys.key[..chacha20_poly1305_openssh::KEY_LEN]);
    material
}

fn mac_for(keys: &DirectionKeys) -> TetherResult<MacKey> {
    let algorithm = keys.mac.ok_or_else(|| {
        TetherError::protocol(format!("{} requires a MAC algorithm", keys.cipher.name()))
    })?;
    MacKey::new(algorithm, &keys.mac_key)
}

enum Sealer {
    Plain,
    ChaCha(chacha20_poly1305_openssh::SealingKey),
    Gcm(SealingKey<GcmCounter>),
    Ctr { cipher: CtrCipher, mac: MacKey },
}

/// Outbound packet protection.
pub struct PacketSealer {
    algorithm: CipherAlgorithm,
    inner: Sealer,
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSealer")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl PacketSealer {
    /// Sealer for the unencrypted initial state.
    pub fn plain() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            inner: Sealer::Plain,
        }
    }

    /// Builds a sealer from derived keys.
    pub fn new(keys: &DirectionKeys) -> TetherResult<Self> {
        check_material(keys)?;
        let inner = match keys.cipher {
            CipherAlgorithm::None => Sealer::Plain,
            CipherAlgorithm::ChaCha20Poly1305 => Sealer::ChaCha(
                chacha20_poly1305_openssh::SealingKey::new(&chacha_material(keys)),
            ),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => Sealer::Gcm(
                SealingKey::new(gcm_unbound(keys)?, GcmCounter::new(&keys.iv)),
            ),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => Sealer::Ctr {
                cipher: CtrCipher::new(keys.cipher, &keys.key, &keys.iv)?,
                mac: mac_for(keys)?,
            },
        };
        Ok(Self {
            algorithm: keys.cipher,
            inner,
        })
    }

    /// Negotiated cipher.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Padding alignment.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// True if the length field is excluded from padding alignment.
    pub fn length_is_aad(&self) -> bool {
        self.algorithm.is_aead()
    }

    /// Protects a plaintext packet (length field included) in place and
    /// appends the tag or MAC.
    pub fn seal(&mut self, sequence: u32, packet: &mut Vec<u8>) -> TetherResult<()> {
        match &mut self.inner {
            Sealer::Plain => Ok(()),
            Sealer::ChaCha(key) => {
                let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
                key.seal_in_place(sequence, packet, &mut tag);
                packet.extend_from_slice(&tag);
                Ok(())
            }
            Sealer::Gcm(key) => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&packet[..4]);
                let tag = key
                    .seal_in_place_separate_tag(Aad::from(length), &mut packet[4..])
                    .map_err(|_| TetherError::protocol("AES-GCM encryption failed"))?;
                packet.extend_from_slice(tag.as_ref());
                Ok(())
            }
            Sealer::Ctr { cipher, mac } => {
                let tag = mac.compute(sequence, packet);
                cipher.apply(packet);
                packet.extend_from_slice(&tag);
                Ok(())
            }
        }
    }
}

enum Opener {
    Plain,
    ChaCha(chacha20_poly1305_openssh::OpeningKey),
    Gcm(OpeningKey<GcmCounter>),
    Ctr { cipher: CtrCipher, mac: MacKey },
}

/// Inbound packet verification and decryption.
pub struct PacketOpener {
    algorithm: CipherAlgorithm,
    mac_size: usize,
    inner: Opener,
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketOpener")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl PacketOpener {
    /// Opener for the unencrypted initial state.
    pub fn plain() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            mac_size: 0,
            inner: Opener::Plain,
        }
    }

    /// Builds an opener from derived keys.
    pub fn new(keys: &DirectionKeys) -> TetherResult<Self> {
        check_material(keys)?;
        let (inner, mac_size) = match keys.cipher {
            CipherAlgorithm::None => (Opener::Plain, 0),
            CipherAlgorithm::ChaCha20Poly1305 => (
                Opener::ChaCha(chacha20_poly1305_openssh::OpeningKey::new(
                    &chacha_material(keys),
                )),
                chacha20_poly1305_openssh::TAG_LEN,
            ),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => (
                Opener::Gcm(OpeningKey::new(
                    gcm_unbound(keys)?,
                    GcmCounter::new(&keys.iv),
                )),
                keys.cipher.tag_size(),
            ),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = mac_for(keys)?;
                let size = mac.algorithm().mac_size();
                (
                    Opener::Ctr {
                        cipher: CtrCipher::new(keys.cipher, &keys.key, &keys.iv)?,
                        mac,
                    },
                    size,
                )
            }
        };
        Ok(Self {
            algorithm: keys.cipher,
            mac_size,
            inner,
        })
    }

    /// Negotiated cipher.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Bytes needed before [`PacketOpener::peek_length`] can run.
    pub fn header_len(&self) -> usize {
        match self.inner {
            Opener::Ctr { .. } => self.algorithm.block_size(),
            _ => 4,
        }
    }

    /// Size of the trailing tag or MAC.
    pub fn trailer_len(&self) -> usize {
        self.mac_size
    }

    /// Recovers `packet_length` from the first [`PacketOpener::header_len`]
    /// bytes of a packet.
    ///
    /// For CTR modes the header block is decrypted in place; `open` must
    /// then be called on the same buffer.
    pub fn peek_length(&mut self, sequence: u32, header: &mut [u8]) -> usize {
        let length = match &mut self.inner {
            Opener::Plain | Opener::Gcm(_) => [header[0], header[1], header[2], header[3]],
            Opener::ChaCha(key) => {
                key.decrypt_packet_length(sequence, [header[0], header[1], header[2], header[3]])
            }
            Opener::Ctr { cipher, .. } => {
                cipher.apply(header);
                [header[0], header[1], header[2], header[3]]
            }
        };
        u32::from_be_bytes(length) as usize
    }

    /// Verifies and decrypts a complete packet in place.
    ///
    /// `packet` holds the length field, the body and the trailer. On success
    /// the first `4 + packet_length` bytes are plaintext.
    ///
    /// # Errors
    ///
    /// Returns an integrity error if the tag or MAC does not verify.
    pub fn open(&mut self, sequence: u32, packet: &mut [u8], packet_length: usize) -> TetherResult<()> {
        let body_end = 4 + packet_length;
        match &mut self.inner {
            Opener::Plain => Ok(()),
            Opener::ChaCha(key) => {
                let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
                tag.copy_from_slice(&packet[body_end..body_end + self.mac_size]);
                key.open_in_place(sequence, &mut packet[..body_end], &tag)
                    .map_err(|_| {
                        TetherError::integrity(format!(
                            "chacha20-poly1305 tag mismatch on packet {}",
                            sequence
                        ))
                    })?;
                packet[..4].copy_from_slice(&(packet_length as u32).to_be_bytes());
                Ok(())
            }
            Opener::Gcm(key) => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&packet[..4]);
                key.open_in_place(Aad::from(length), &mut packet[4..body_end + self.mac_size])
                    .map_err(|_| {
                        TetherError::integrity(format!(
                            "AES-GCM tag mismatch on packet {}",
                            sequence
                        ))
                    })?;
                Ok(())
            }
            Opener::Ctr { cipher, mac } => {
                let header_len = self.algorithm.block_size();
                cipher.apply(&mut packet[header_len..body_end]);
                let (plaintext, received) = packet.split_at(body_end);
                mac.verify(sequence, plaintext, &received[..self.mac_size])
            }
        }
    }
}
