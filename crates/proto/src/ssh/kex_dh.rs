//! Key agreement methods and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - The exchange hash `H` (RFC 4253 Section 8)
//! - Session key derivation (RFC 4253 Section 7.2)
//!
//! Both methods share the message pair SSH_MSG_KEXDH_INIT (30) and
//! SSH_MSG_KEXDH_REPLY (31). The public value is carried as a string for
//! the curve methods and as an mpint for the MODP group; since both are
//! length-prefixed byte strings, the exact wire contents are kept and
//! hashed as received.
//!
//! # Security
//!
//! - Peer DH values are range checked (1 < f < p-1)
//! - Curve25519 rejects an all-zero shared secret
//! - Private values are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex_dh::{KeyAgreement, KexMethod};
//!
//! let client = KeyAgreement::new(KexMethod::Curve25519Sha256).unwrap();
//! let server = KeyAgreement::new(KexMethod::Curve25519Sha256).unwrap();
//!
//! let client_public = client.public_field();
//! let server_public = server.public_field();
//!
//! let k1 = client.agree(&server_public).unwrap();
//! let k2 = server.agree(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use bytes::{BufMut, BytesMut};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use tether_platform::{TetherError, TetherResult};
use zeroize::{Zeroize, Zeroizing};

use super::encoding::{put_bytes, put_mpint, Reader};
use super::message::MessageType;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
        29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
        EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
        E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
        EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
        C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
        83655D23DCA3AD961C62F356208552BB9ED529077096966D\
        670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
        E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
        DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
        15728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// 2048-bit MODP prime
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        // A compile-time constant; parsing cannot fail.
        BigUint::parse_bytes(PRIME_HEX, 16).unwrap_or_default()
    });

    /// Generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Negotiable key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (same construction, older name)
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
}

impl KexMethod {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" => Some(KexMethod::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexMethod::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexMethod::DhGroup14Sha256),
            _ => None,
        }
    }
}

/// Diffie-Hellman Group 14 ephemeral key pair.
pub struct DhGroup14Exchange {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh key pair.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Public value `g^x mod p`, big-endian.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes `K = f^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the peer value is out of range.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TetherResult<Zeroizing<Vec<u8>>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(TetherError::protocol("DH public value out of range"));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(Zeroizing::new(y_peer.modpow(&x, &dh_group14::P).to_bytes_be()))
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 ephemeral key pair.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh key pair.
    pub fn new() -> TetherResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| TetherError::transport("failed to generate Curve25519 key"))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| TetherError::transport("failed to compute Curve25519 public key"))?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Public key (32 bytes).
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the private key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> TetherResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != 32 {
            return Err(TetherError::protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| TetherError::protocol("Curve25519 key agreement failed"))
    }
}

/// Ephemeral state of the negotiated key agreement.
pub enum KeyAgreement {
    /// curve25519-sha256 (either name)
    Curve25519(Curve25519Exchange),
    /// diffie-hellman-group14-sha256
    DhGroup14(DhGroup14Exchange),
}

impl std::fmt::Debug for KeyAgreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyAgreement::Curve25519(_) => f.write_str("KeyAgreement::Curve25519"),
            KeyAgreement::DhGroup14(_) => f.write_str("KeyAgreement::DhGroup14"),
        }
    }
}

impl KeyAgreement {
    /// Generates the ephemeral key pair for `method`.
    pub fn new(method: KexMethod) -> TetherResult<Self> {
        match method {
            KexMethod::Curve25519Sha256 | KexMethod::Curve25519Sha256Libssh => {
                Ok(KeyAgreement::Curve25519(Curve25519Exchange::new()?))
            }
            KexMethod::DhGroup14Sha256 => Ok(KeyAgreement::DhGroup14(DhGroup14Exchange::new())),
        }
    }

    /// Contents of the public value field as sent on the wire.
    pub fn public_field(&self) -> Vec<u8> {
        match self {
            KeyAgreement::Curve25519(x) => x.public_key().to_vec(),
            KeyAgreement::DhGroup14(dh) => mpint_field(dh.public_key()),
        }
    }

    /// Computes the shared secret `K` (unsigned big-endian magnitude) from
    /// the peer's public value field.
    pub fn agree(self, peer_field: &[u8]) -> TetherResult<Zeroizing<Vec<u8>>> {
        match self {
            KeyAgreement::Curve25519(x) => x.compute_shared_secret(peer_field),
            KeyAgreement::DhGroup14(dh) => {
                if peer_field.first().map_or(false, |b| b & 0x80 != 0) {
                    return Err(TetherError::protocol("negative DH public value"));
                }
                dh.compute_shared_secret(peer_field)
            }
        }
    }
}

fn mpint_field(magnitude: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_mpint(&mut buf, magnitude);
    buf[4..].to_vec()
}

/// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhInit {
    /// Client public value field (`e` or `Q_C`)
    pub public: Vec<u8>,
}

impl KexDhInit {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5 + self.public.len());
        buf.put_u8(MessageType::KexdhInit as u8);
        put_bytes(&mut buf, &self.public);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::KexdhInit as u8, "SSH_MSG_KEXDH_INIT")?;
        Ok(Self {
            public: reader.read_bytes()?.to_vec(),
        })
    }
}

/// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Server host key blob `K_S`
    pub host_key: Vec<u8>,
    /// Server public value field (`f` or `Q_S`)
    pub public: Vec<u8>,
    /// Signature of `H` by the host key
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        put_bytes(&mut buf, &self.host_key);
        put_bytes(&mut buf, &self.public);
        put_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::KexdhReply as u8, "SSH_MSG_KEXDH_REPLY")?;
        Ok(Self {
            host_key: reader.read_bytes()?.to_vec(),
            public: reader.read_bytes()?.to_vec(),
            signature: reader.read_bytes()?.to_vec(),
        })
    }
}

/// Inputs of the exchange hash, in hashing order.
#[derive(Debug)]
pub struct ExchangeHashInput<'a> {
    /// Client identification line `V_C`
    pub client_version: &'a str,
    /// Server identification line `V_S`
    pub server_version: &'a str,
    /// Client KEXINIT payload `I_C`
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload `I_S`
    pub server_kexinit: &'a [u8],
    /// Server host key blob `K_S`
    pub host_key: &'a [u8],
    /// Client public value field
    pub client_public: &'a [u8],
    /// Server public value field
    pub server_public: &'a [u8],
    /// Shared secret magnitude `K`
    pub shared_secret: &'a [u8],
}

/// Computes `H = SHA256(V_C || V_S || I_C || I_S || K_S || e/Q_C || f/Q_S || K)`.
pub fn exchange_hash(input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_bytes(&mut buf, input.client_version.as_bytes());
    put_bytes(&mut buf, input.server_version.as_bytes());
    put_bytes(&mut buf, input.client_kexinit);
    put_bytes(&mut buf, input.server_kexinit);
    put_bytes(&mut buf, input.host_key);
    put_bytes(&mut buf, input.client_public);
    put_bytes(&mut buf, input.server_public);
    put_mpint(&mut buf, input.shared_secret);

    let hash = Sha256::digest(&buf).to_vec();
    buf.as_mut().zeroize();
    hash
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// Kn = HASH(K || H || K1 || ... || Kn-1)
/// ```
///
/// Letters: `A`/`B` initial IVs, `C`/`D` encryption keys, `E`/`F`
/// integrity keys (client-to-server first).
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut k_mpint = BytesMut::new();
    put_mpint(&mut k_mpint, shared_secret);

    let mut key = Zeroizing::new(Vec::with_capacity(key_length + 32));
    let mut hasher = Sha256::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize_reset());

    while key.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key[..]);
        key.extend_from_slice(&hasher.finalize_reset());
    }

    k_mpint.as_mut().zeroize();
    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_group14_agreement() {
        let client = KeyAgreement::new(KexMethod::DhGroup14Sha256).unwrap();
        let server = KeyAgreement::new(KexMethod::DhGroup14Sha256).unwrap();
        let e = client.public_field();
        let f = server.public_field();

        let k1 = client.agree(&f).unwrap();
        let k2 = server.agree(&e).unwrap();
        assert_eq!(k1, k2);
        assert!(!k1.is_empty());
    }

    #[test]
    fn test_dh_group14_rejects_out_of_range() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());

        let p = dh_group14::P.to_bytes_be();
        assert!(exchange.compute_shared_secret(&p).is_err());
    }

    #[test]
    fn test_dh_public_field_is_positive_mpint() {
        for _ in 0..4 {
            let agreement = KeyAgreement::new(KexMethod::DhGroup14Sha256).unwrap();
            let field = agreement.public_field();
            assert_eq!(field[0] & 0x80, 0);
        }
    }

    #[test]
    fn test_curve25519_agreement() {
        let client = KeyAgreement::new(KexMethod::Curve25519Sha256Libssh).unwrap();
        let server = KeyAgreement::new(KexMethod::Curve25519Sha256).unwrap();
        let q_c = client.public_field();
        let q_s = server.public_field();
        assert_eq!(q_c.len(), 32);

        assert_eq!(client.agree(&q_s).unwrap(), server.agree(&q_c).unwrap());
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let client = KeyAgreement::new(KexMethod::Curve25519Sha256).unwrap();
        assert!(client.agree(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_kex_method_names() {
        for method in [
            KexMethod::Curve25519Sha256,
            KexMethod::Curve25519Sha256Libssh,
            KexMethod::DhGroup14Sha256,
        ] {
            assert_eq!(KexMethod::from_name(method.name()), Some(method));
        }
        assert_eq!(KexMethod::from_name("diffie-hellman-group1-sha1"), None);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = KexDhReply {
            host_key: vec![1, 2, 3],
            public: vec![4; 32],
            signature: vec![5; 10],
        };
        let parsed = KexDhReply::from_bytes(&reply.to_bytes()).unwrap();
        assert_eq!(parsed, reply);
        assert!(KexDhInit::from_bytes(&reply.to_bytes()).is_err());
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let base = ExchangeHashInput {
            client_version: "SSH-2.0-a",
            server_version: "SSH-2.0-b",
            client_kexinit: b"ic",
            server_kexinit: b"is",
            host_key: b"ks",
            client_public: b"qc",
            server_public: b"qs",
            shared_secret: &[7; 32],
        };
        let h = exchange_hash(&base);
        assert_eq!(h.len(), 32);

        let changed = ExchangeHashInput {
            server_kexinit: b"is2",
            ..base
        };
        assert_ne!(exchange_hash(&changed), h);
    }

    #[test]
    fn test_derive_key_extension() {
        let k = [0x42u8; 32];
        let h = [0x01u8; 32];
        let sid = [0x02u8; 32];

        let short = derive_key(&k, &h, &sid, b'C', 32);
        let long = derive_key(&k, &h, &sid, b'C', 96);
        assert_eq!(long.len(), 96);
        assert_eq!(&long[..32], &short[..]);

        let other = derive_key(&k, &h, &sid, b'D', 32);
        assert_ne!(other, short);

        // Third block hashes K1 || K2
        let mut k_mpint = BytesMut::new();
        put_mpint(&mut k_mpint, &k);
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(h);
        hasher.update(&long[..64]);
        assert_eq!(&long[64..], &hasher.finalize()[..]);
    }
}
