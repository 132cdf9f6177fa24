//! # Tether Platform
//!
//! Shared types for the Tether SSH session engine.
//!
//! This crate provides:
//! - The uniform error shape (`TetherError`, `TetherResult`)
//! - The fixed result-code enumeration (`ErrorCode`, `AuthFailureKind`)
//! - The `ERRMSG` message table keyed by numeric code
//!
//! # Examples
//!
//! ```
//! use tether_platform::{ErrorCode, TetherError, TetherResult};
//!
//! fn example_function() -> TetherResult<String> {
//!     Err(TetherError::timeout("login"))
//! }
//!
//! let err = example_function().unwrap_err();
//! assert_eq!(err.code(), ErrorCode::Timeout);
//! assert!(!err.is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{errmsg, AuthFailureKind, ErrorCode, TetherError, TetherResult, ERRMSG};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
