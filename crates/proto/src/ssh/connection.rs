//! SSH connection protocol messages (RFC 4254).
//!
//! Wire forms of the channel messages exchanged once the user is
//! authenticated:
//! - Channel open / confirmation / failure
//! - Window adjust, data, extended data
//! - EOF and close
//! - Channel requests and their replies
//!
//! Channel state and flow control live in [`crate::ssh::channel`].
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
//! let bytes = open.to_bytes();
//! assert_eq!(bytes[0], 90);
//!
//! let parsed = ChannelOpen::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed, open);
//! ```

use bytes::{BufMut, BytesMut};
use tether_platform::TetherResult;

use super::encoding::{put_bool, put_bytes, put_str, Reader};
use super::message::MessageType;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Any other channel type, kept with its type-specific data.
    Other {
        /// Channel type name
        name: String,
        /// Type-specific trailing data
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open request.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        put_str(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        if let ChannelType::Other { data, .. } = &self.channel_type {
            buf.put_slice(data);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::ChannelOpen as u8, "SSH_MSG_CHANNEL_OPEN")?;

        let type_name = reader.read_string()?;
        let sender_channel = reader.read_u32()?;
        let initial_window_size = reader.read_u32()?;
        let maximum_packet_size = reader.read_u32()?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            _ => ChannelType::Other {
                name: type_name,
                data: reader.rest().to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number (our id).
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number (the peer's id).
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size granted by the peer.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the peer's maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(
            MessageType::ChannelOpenConfirmation as u8,
            "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        )?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            sender_channel: reader.read_u32()?,
            initial_window_size: reader.read_u32()?,
            maximum_packet_size: reader.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited,
    /// Connect failed
    ConnectFailed,
    /// Unknown channel type
    UnknownChannelType,
    /// Resource shortage
    ResourceShortage,
    /// Code outside the registered range
    Other(u32),
}

impl ChannelOpenFailureReason {
    /// Maps a wire code to a reason.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ChannelOpenFailureReason::AdministrativelyProhibited,
            2 => ChannelOpenFailureReason::ConnectFailed,
            3 => ChannelOpenFailureReason::UnknownChannelType,
            4 => ChannelOpenFailureReason::ResourceShortage,
            other => ChannelOpenFailureReason::Other(other),
        }
    }

    /// Wire code of this reason.
    pub fn as_u32(&self) -> u32 {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => 1,
            ChannelOpenFailureReason::ConnectFailed => 2,
            ChannelOpenFailureReason::UnknownChannelType => 3,
            ChannelOpenFailureReason::ResourceShortage => 4,
            ChannelOpenFailureReason::Other(code) => *code,
        }
    }

    /// Returns a human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailureReason::ConnectFailed => "connect failed",
            ChannelOpenFailureReason::UnknownChannelType => "unknown channel type",
            ChannelOpenFailureReason::ResourceShortage => "resource shortage",
            ChannelOpenFailureReason::Other(_) => "unknown reason",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: ChannelOpenFailureReason,
    description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with a description.
    pub fn new(
        recipient_channel: u32,
        reason_code: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: description.into(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the reason code.
    pub fn reason_code(&self) -> ChannelOpenFailureReason {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code.as_u32());
        put_str(&mut buf, &self.description);
        put_str(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(
            MessageType::ChannelOpenFailure as u8,
            "SSH_MSG_CHANNEL_OPEN_FAILURE",
        )?;
        let recipient_channel = reader.read_u32()?;
        let reason_code = ChannelOpenFailureReason::from_u32(reader.read_u32()?);
        let description = String::from_utf8_lossy(reader.read_bytes()?).into_owned();
        // Language tag is ignored.
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the number of bytes to add to the window.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(
            MessageType::ChannelWindowAdjust as u8,
            "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        )?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            bytes_to_add: reader.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        put_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::ChannelData as u8, "SSH_MSG_CHANNEL_DATA")?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            data: reader.read_bytes()?.to_vec(),
        })
    }
}

/// Extended data type code. Only stderr (1) is defined.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code.
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        put_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(
            MessageType::ChannelExtendedData as u8,
            "SSH_MSG_CHANNEL_EXTENDED_DATA",
        )?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            data_type_code: reader.read_u32()?,
            data: reader.read_bytes()?.to_vec(),
        })
    }
}

macro_rules! channel_only_message {
    ($(#[$doc:meta])* $name:ident, $msg:expr, $label:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message for a recipient channel.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($msg as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
                let mut reader = Reader::new(data);
                reader.expect_message($msg as u8, $label)?;
                Ok(Self {
                    recipient_channel: reader.read_u32()?,
                })
            }
        }
    };
}

channel_only_message!(
    /// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof,
    "SSH_MSG_CHANNEL_EOF"
);

channel_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose,
    "SSH_MSG_CHANNEL_CLOSE"
);

channel_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS"
);

channel_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// X11 forwarding request
    X11Req {
        /// Forward only a single connection
        single_connection: bool,
        /// Authentication protocol (e.g., "MIT-MAGIC-COOKIE-1")
        auth_protocol: String,
        /// Hex-encoded authentication cookie
        auth_cookie: String,
        /// X11 screen number
        screen_number: u32,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Start interactive shell
    Shell,
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Exit status of the remote command
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Remote command terminated by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request, kept with its raw type-specific data
    Other {
        /// Request name
        name: String,
        /// Type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::X11Req { .. } => "x11-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }

    fn write_data(&self, buf: &mut BytesMut) {
        match self {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                put_str(buf, term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                put_bytes(buf, modes);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                put_bool(buf, *single_connection);
                put_str(buf, auth_protocol);
                put_str(buf, auth_cookie);
                buf.put_u32(*screen_number);
            }
            ChannelRequestType::Env { name, value } => {
                put_str(buf, name);
                put_str(buf, value);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec { command } => put_str(buf, command),
            ChannelRequestType::Subsystem { name } => put_str(buf, name),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                put_str(buf, signal_name);
                put_bool(buf, *core_dumped);
                put_str(buf, error_message);
                put_str(buf, language_tag);
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn read_data(name: String, reader: &mut Reader<'_>) -> TetherResult<Self> {
        let request = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: reader.read_string()?,
                width_chars: reader.read_u32()?,
                height_rows: reader.read_u32()?,
                width_pixels: reader.read_u32()?,
                height_pixels: reader.read_u32()?,
                modes: reader.read_bytes()?.to_vec(),
            },
            "x11-req" => ChannelRequestType::X11Req {
                single_connection: reader.read_bool()?,
                auth_protocol: reader.read_string()?,
                auth_cookie: reader.read_string()?,
                screen_number: reader.read_u32()?,
            },
            "env" => ChannelRequestType::Env {
                name: reader.read_string()?,
                value: reader.read_string()?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: reader.read_string()?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: reader.read_string()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: reader.read_u32()?,
                height_rows: reader.read_u32()?,
                width_pixels: reader.read_u32()?,
                height_pixels: reader.read_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: reader.read_u32()?,
            },
            "exit-signal" => {
                let signal_name = reader.read_string()?;
                let core_dumped = reader.read_bool()?;
                let error_message = String::from_utf8_lossy(reader.read_bytes()?).into_owned();
                let language_tag = if reader.remaining() > 0 {
                    reader.read_string()?
                } else {
                    String::new()
                };
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    language_tag,
                }
            }
            _ => ChannelRequestType::Other {
                data: reader.rest().to_vec(),
                name,
            },
        };
        Ok(request)
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Consumes the message, returning the request type.
    pub fn into_request_type(self) -> ChannelRequestType {
        self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        put_str(&mut buf, self.request_type.name());
        put_bool(&mut buf, self.want_reply);
        self.request_type.write_data(&mut buf);
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// Unknown request names parse as [`ChannelRequestType::Other`] so the
    /// caller can still answer them.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::ChannelRequest as u8, "SSH_MSG_CHANNEL_REQUEST")?;

        let recipient_channel = reader.read_u32()?;
        let name = reader.read_string()?;
        let want_reply = reader.read_bool()?;
        let request_type = ChannelRequestType::read_data(name, &mut reader)?;

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}
