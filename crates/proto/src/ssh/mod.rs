//! SSH (Secure Shell) client engine.
//!
//! # Architecture
//!
//! Every protocol layer is a synchronous engine that consumes decoded
//! messages and returns the actions to perform. Only the session
//! coordinator touches I/O.
//!
//! 1. **Packet Layer** ([`packet`], [`transport`]) - Binary packet protocol and
//!    packet protection (RFC 4253 Section 6)
//! 2. **Key Exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - Algorithm
//!    negotiation, key agreement and host key checks (RFC 4253 Sections 7-8)
//! 3. **Authentication Layer** ([`auth`]) - User authentication (RFC 4252)
//! 4. **Connection Layer** ([`connection`], [`channel`]) - Channels and
//!    requests (RFC 4254)
//! 5. **Session** ([`session`]) - The per-connection event loop and public API
//!
//! # Security Considerations
//!
//! - **Input Validation**: Inbound packets are limited to 256 KiB
//! - **Integrity**: A MAC or AEAD failure closes the session immediately
//! - **Memory Safety**: Secrets are zeroized on drop using [`zeroize`]
//! - **Modern Algorithms**: Prefers ChaCha20-Poly1305, Curve25519, Ed25519
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::{TransportCodec, Decoded};
//!
//! let mut sender = TransportCodec::new();
//! let mut receiver = TransportCodec::new();
//!
//! let wire = sender.encode(&[2, 0, 0, 0, 0]).unwrap();
//! receiver.feed(&wire);
//! assert_eq!(receiver.decode().unwrap(), Decoded::Packet(vec![2, 0, 0, 0, 0]));
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod encoding;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod packet;
pub mod session;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{AuthEngine, AuthMethod, Credential, KeyboardInteractive};
pub use channel::{
    ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, Multiplexer, X11Channel, X11Handler,
};
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm};
pub use hostkey::{
    Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyInfo, HostKeyVerifier, PinnedFingerprints,
    PublicKey,
};
pub use kex::{negotiate_algorithm, AlgorithmPreferences, Algorithms, KexEngine, KexInit};
pub use kex_dh::{derive_key, KexMethod};
pub use message::{Message, MessageType};
pub use packet::Packet;
pub use session::{
    ConnectInfo, Operation, Session, SessionConfig, SessionInfo, SessionState, Timeouts,
};
pub use transport::{Decoded, RekeyLimits, TransportCodec};
pub use version::Version;
