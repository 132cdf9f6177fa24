//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines first; they are skipped (up to
//! [`MAX_PREBANNER_LINES`]). The exact identification line, without CR LF,
//! feeds the exchange hash.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::version::Version;
//!
//! let version = Version::new("Tether_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Tether_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use tether_platform::{TetherError, TetherResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the
/// identification string.
pub const MAX_PREBANNER_LINES: usize = 32;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    identification: String,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut version = Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            identification: String::new(),
        };
        version.identification = version.to_string();
        version
    }

    /// Returns the default Tether identification.
    pub fn default_tether() -> Self {
        Self::new(&format!("Tether_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> TetherResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TetherError::protocol(format!(
                "version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(TetherError::protocol("version string contains null byte"));
        }
        if !line.starts_with("SSH-") {
            return Err(TetherError::protocol(format!(
                "invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(TetherError::protocol(format!(
                "invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(TetherError::protocol(format!(
                "unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match parts[2].split_once(' ') {
            Some((software, comments)) => {
                (software.to_string(), Some(comments.trim().to_string()))
            }
            None => (parts[2].to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            identification: line.to_string(),
        })
    }

    /// Pulls the peer identification out of an inbound buffer.
    ///
    /// Complete lines are consumed from `buf`; lines before the
    /// identification are counted in `skipped`. Returns `Ok(None)` until a
    /// full identification line is buffered.
    pub fn take_from(buf: &mut BytesMut, skipped: &mut usize) -> TetherResult<Option<Self>> {
        loop {
            let newline = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if buf.len() > MAX_VERSION_LENGTH + 2 {
                        return Err(TetherError::protocol(
                            "identification line exceeds maximum length",
                        ));
                    }
                    return Ok(None);
                }
            };

            let line = buf.split_to(newline + 1);
            let text = String::from_utf8_lossy(&line);

            if text.starts_with("SSH-") {
                return Self::parse(&text).map(Some);
            }

            *skipped += 1;
            if *skipped > MAX_PREBANNER_LINES {
                return Err(TetherError::protocol(
                    "too many lines before identification string",
                ));
            }
        }
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Exact identification line without CR LF, as hashed during kex.
    pub fn identification(&self) -> &str {
        &self.identification
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.identification).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}
