//! Host keys and signatures (RFC 4253 Section 6.6, RFC 8332, RFC 8709).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - verification and signing
//! - `rsa-sha2-256`, `rsa-sha2-512` - verification of `ssh-rsa` keys
//!
//! The engine never stores host keys. Every key exchange hands a
//! [`HostKeyInfo`] to the caller's [`HostKeyVerifier`], which decides.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::hostkey::{fingerprint, Ed25519HostKey, HostKey, PublicKey};
//!
//! let key = Ed25519HostKey::generate();
//! let blob = key.public_key_bytes();
//! let signature = key.sign(b"exchange hash").unwrap();
//!
//! let public = PublicKey::from_blob(&blob).unwrap();
//! public.verify("ssh-ed25519", b"exchange hash", &signature).unwrap();
//! assert!(fingerprint(&blob).starts_with("SHA256:"));
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512};
use sha2::{Digest, Sha256};
use tether_platform::{TetherError, TetherResult};
use zeroize::Zeroizing;

use super::encoding::{put_bytes, put_str, Reader};

/// Host key signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-256 over an ssh-rsa key
    RsaSha2_256,
    /// rsa-sha2-512 over an ssh-rsa key
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }

    /// Key type carried in the key blob.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => "ssh-rsa",
        }
    }
}

/// A private key able to sign, used as a server host key or as a user key
/// for `publickey` authentication.
pub trait HostKey: Send + Sync {
    /// Signature algorithm.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Public key blob in SSH wire format.
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Signs `data`, returning an SSH signature blob.
    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>>;
}

/// Ed25519 key pair.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        let secret: [u8; SECRET_KEY_LENGTH] = rand::Rng::gen(&mut rand::thread_rng());
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Creates a key pair from a 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> TetherResult<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] = secret_bytes
            .try_into()
            .map_err(|_| TetherError::config("Ed25519 secret key must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Secret key bytes.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Public half as a [`PublicKey`].
    pub fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing_key.verifying_key().to_bytes())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key().to_blob()
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::new();
        put_str(&mut buf, "ssh-ed25519");
        put_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field(
                "public_key",
                &hex::encode(self.signing_key.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// A parsed public key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// ssh-ed25519 key
    Ed25519([u8; 32]),
    /// ssh-rsa key (exponent and modulus, big-endian magnitudes)
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
}

impl PublicKey {
    /// Parses an SSH public key blob.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation for an unknown key type or a malformed
    /// blob.
    pub fn from_blob(blob: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(blob);
        let key_type = reader.read_string()?;
        match key_type.as_str() {
            "ssh-ed25519" => {
                let key: [u8; 32] = reader
                    .read_bytes()?
                    .try_into()
                    .map_err(|_| TetherError::protocol("Ed25519 public key must be 32 bytes"))?;
                Ok(PublicKey::Ed25519(key))
            }
            "ssh-rsa" => {
                let e = reader.read_mpint()?.to_vec();
                let n = reader.read_mpint()?.to_vec();
                Ok(PublicKey::Rsa { e, n })
            }
            other => Err(TetherError::protocol(format!(
                "unsupported host key type '{}'",
                other
            ))),
        }
    }

    /// Serializes to an SSH public key blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            PublicKey::Ed25519(key) => {
                put_str(&mut buf, "ssh-ed25519");
                put_bytes(&mut buf, key);
            }
            PublicKey::Rsa { e, n } => {
                put_str(&mut buf, "ssh-rsa");
                super::encoding::put_mpint(&mut buf, e);
                super::encoding::put_mpint(&mut buf, n);
            }
        }
        buf.to_vec()
    }

    /// Key type name.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Verifies an SSH signature blob made with `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns a host-key rejection if the algorithm does not fit the key,
    /// the signature names another algorithm, or the signature is invalid.
    pub fn verify(&self, algorithm: &str, data: &[u8], signature_blob: &[u8]) -> TetherResult<()> {
        let algorithm = HostKeyAlgorithm::from_name(algorithm).ok_or_else(|| {
            TetherError::host_key_rejected(format!("unsupported signature algorithm '{}'", algorithm))
        })?;
        if algorithm.key_type() != self.key_type() {
            return Err(TetherError::host_key_rejected(format!(
                "{} key cannot verify {} signatures",
                self.key_type(),
                algorithm.name()
            )));
        }

        let mut reader = Reader::new(signature_blob);
        let sig_algorithm = reader.read_string()?;
        if sig_algorithm != algorithm.name() {
            return Err(TetherError::host_key_rejected(format!(
                "signature algorithm mismatch: expected {}, got {}",
                algorithm.name(),
                sig_algorithm
            )));
        }
        let signature = reader.read_bytes()?;

        let valid = match (self, algorithm) {
            (PublicKey::Ed25519(key), _) => {
                let verifying_key = VerifyingKey::from_bytes(key).map_err(|_| {
                    TetherError::host_key_rejected("invalid Ed25519 public key")
                })?;
                let signature = Signature::from_slice(signature).map_err(|_| {
                    TetherError::host_key_rejected("malformed Ed25519 signature")
                })?;
                verifying_key.verify(data, &signature).is_ok()
            }
            (PublicKey::Rsa { e, n }, HostKeyAlgorithm::RsaSha2_512) => RsaPublicKeyComponents { n, e }
                .verify(&RSA_PKCS1_2048_8192_SHA512, data, signature)
                .is_ok(),
            (PublicKey::Rsa { e, n }, _) => RsaPublicKeyComponents { n, e }
                .verify(&RSA_PKCS1_2048_8192_SHA256, data, signature)
                .is_ok(),
        };

        if valid {
            Ok(())
        } else {
            Err(TetherError::host_key_rejected(
                "host key signature verification failed",
            ))
        }
    }
}

/// OpenSSH-style fingerprint: `SHA256:` followed by unpadded base64.
pub fn fingerprint(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

/// Host key presented during a key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    /// Negotiated host key algorithm
    pub algorithm: String,
    /// `SHA256:` fingerprint of the key blob
    pub fingerprint: String,
    /// Raw key blob
    pub key_blob: Vec<u8>,
}

impl HostKeyInfo {
    /// Builds the info for a key blob.
    pub fn new(algorithm: &str, key_blob: &[u8]) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            fingerprint: fingerprint(key_blob),
            key_blob: key_blob.to_vec(),
        }
    }
}

/// Caller trust policy for server host keys.
///
/// Consulted once per key exchange, re-keys included. Returning `false`
/// aborts the connection with `HostKeyRejected`.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    /// Decides whether to trust the presented key.
    async fn verify(&self, info: &HostKeyInfo) -> bool;
}

#[async_trait]
impl<F> HostKeyVerifier for F
where
    F: Fn(&HostKeyInfo) -> bool + Send + Sync,
{
    async fn verify(&self, info: &HostKeyInfo) -> bool {
        self(info)
    }
}

/// Accepts only keys whose fingerprint is in a fixed list.
#[derive(Debug, Clone, Default)]
pub struct PinnedFingerprints {
    fingerprints: Vec<String>,
}

impl PinnedFingerprints {
    /// Creates a verifier trusting the given fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl HostKeyVerifier for PinnedFingerprints {
    async fn verify(&self, info: &HostKeyInfo) -> bool {
        self.fingerprints.iter().any(|f| f == &info.fingerprint)
    }
}
