//! Error codes and the uniform error shape for Tether.
//!
//! Every failure in the engine is reported as a [`TetherError`]: a fixed
//! [`ErrorCode`] plus a human-readable detail string. Callers that only need
//! the numeric code can use [`ErrorCode::as_i32`] and look the canonical
//! message up in [`ERRMSG`].

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

/// Reason an authentication attempt (or a whole login) did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AuthFailureKind {
    /// None of the caller's credentials matches a method the server offers.
    NoSuchMethod,
    /// The server rejected the credential.
    BadCredential,
    /// The credential was accepted but the server requires another method.
    PartialSuccess,
    /// Every usable (method, credential) pair has already been tried.
    MethodsExhausted,
}

/// Result code carried by every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// Success
    None,
    /// Socket-level failure; the session is unusable.
    Transport,
    /// MAC verification or decryption failure.
    Integrity,
    /// Malformed or out-of-sequence message.
    ProtocolViolation,
    /// Algorithm negotiation found no common algorithm in some category.
    NoCommonAlgorithm,
    /// The host-key trust callback rejected the server key.
    HostKeyRejected,
    /// Authentication did not succeed.
    AuthFailure(AuthFailureKind),
    /// The operation deadline expired.
    Timeout,
    /// Failure scoped to a single channel.
    Channel,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// Invalid configuration.
    Config,
}

impl ErrorCode {
    /// All codes, in numeric order.
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::None,
        ErrorCode::Transport,
        ErrorCode::Integrity,
        ErrorCode::ProtocolViolation,
        ErrorCode::NoCommonAlgorithm,
        ErrorCode::HostKeyRejected,
        ErrorCode::AuthFailure(AuthFailureKind::NoSuchMethod),
        ErrorCode::AuthFailure(AuthFailureKind::BadCredential),
        ErrorCode::AuthFailure(AuthFailureKind::PartialSuccess),
        ErrorCode::AuthFailure(AuthFailureKind::MethodsExhausted),
        ErrorCode::Timeout,
        ErrorCode::Channel,
        ErrorCode::Cancelled,
        ErrorCode::Config,
    ];

    /// Stable numeric value of this code. Success is 0, failures are negative.
    pub fn as_i32(&self) -> i32 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::Transport => -1,
            ErrorCode::Integrity => -2,
            ErrorCode::ProtocolViolation => -3,
            ErrorCode::NoCommonAlgorithm => -4,
            ErrorCode::HostKeyRejected => -5,
            ErrorCode::AuthFailure(AuthFailureKind::NoSuchMethod) => -6,
            ErrorCode::AuthFailure(AuthFailureKind::BadCredential) => -7,
            ErrorCode::AuthFailure(AuthFailureKind::PartialSuccess) => -8,
            ErrorCode::AuthFailure(AuthFailureKind::MethodsExhausted) => -9,
            ErrorCode::Timeout => -10,
            ErrorCode::Channel => -11,
            ErrorCode::Cancelled => -12,
            ErrorCode::Config => -13,
        }
    }

    /// Parses a numeric code.
    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == code)
    }

    /// Canonical message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::None => "success",
            ErrorCode::Transport => "transport error",
            ErrorCode::Integrity => "integrity error",
            ErrorCode::ProtocolViolation => "protocol violation",
            ErrorCode::NoCommonAlgorithm => "no common algorithm",
            ErrorCode::HostKeyRejected => "host key rejected",
            ErrorCode::AuthFailure(AuthFailureKind::NoSuchMethod) => {
                "authentication failed: no such method"
            }
            ErrorCode::AuthFailure(AuthFailureKind::BadCredential) => {
                "authentication failed: bad credential"
            }
            ErrorCode::AuthFailure(AuthFailureKind::PartialSuccess) => {
                "authentication failed: partial success"
            }
            ErrorCode::AuthFailure(AuthFailureKind::MethodsExhausted) => {
                "authentication failed: methods exhausted"
            }
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::Channel => "channel error",
            ErrorCode::Cancelled => "operation cancelled",
            ErrorCode::Config => "configuration error",
        }
    }

    /// Returns true if an error with this code terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::Transport
                | ErrorCode::Integrity
                | ErrorCode::ProtocolViolation
                | ErrorCode::NoCommonAlgorithm
                | ErrorCode::HostKeyRejected
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Message table keyed by numeric result code.
///
/// ```
/// use tether_platform::{ErrorCode, ERRMSG};
///
/// assert_eq!(ERRMSG[&0], "success");
/// assert_eq!(ERRMSG[&ErrorCode::HostKeyRejected.as_i32()], "host key rejected");
/// ```
pub static ERRMSG: Lazy<BTreeMap<i32, &'static str>> = Lazy::new(|| {
    ErrorCode::ALL
        .iter()
        .map(|code| (code.as_i32(), code.message()))
        .collect()
});

/// Looks up the message for a numeric code, falling back to "unknown error".
pub fn errmsg(code: i32) -> &'static str {
    ERRMSG.get(&code).copied().unwrap_or("unknown error")
}

/// Unified error type for all Tether operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetherError {
    code: ErrorCode,
    message: String,
}

impl TetherError {
    /// Creates an error from a code and a detail message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Socket-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Transport, message)
    }

    /// MAC or decryption failure.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Integrity, message)
    }

    /// Malformed or unexpected message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    /// Negotiation failure.
    pub fn no_common_algorithm(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoCommonAlgorithm, message)
    }

    /// Host key refused by the trust policy.
    pub fn host_key_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HostKeyRejected, message)
    }

    /// Authentication failure of the given kind.
    pub fn auth(kind: AuthFailureKind, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailure(kind), message)
    }

    /// Deadline expired.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Channel-scoped failure.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Channel, message)
    }

    /// Cancelled by the caller.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "")
    }

    /// Invalid configuration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    /// Result code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Detail message (may be empty).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for TetherError {}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::transport(err.to_string())
    }
}

/// Result type for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;
