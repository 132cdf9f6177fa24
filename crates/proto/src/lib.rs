//! Asynchronous SSH-2 session engine for the Tether project.
//!
//! The engine is a client that runs over any byte stream:
//!
//! - **Transport codec** - binary packets, ciphers, MACs, sequence numbers
//! - **Key exchange** - curve25519 and group14 with host key verification
//! - **Authentication** - password, public key and keyboard-interactive
//! - **Channels** - multiplexed streams with window flow control
//! - **Session coordinator** - one event loop per connection with an
//!   operation-based async API
//!
//! # Features
//!
//! - `ssh` (default) - the SSH engine
//! - `serde` - serde support for error codes
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH message payload".to_vec(), 8, false).unwrap();
//! let wire_format = packet.to_bytes();
//! assert_eq!(wire_format.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`)
//! - MAC tags are compared in constant time
//! - Key material and passwords are zeroized on drop
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
