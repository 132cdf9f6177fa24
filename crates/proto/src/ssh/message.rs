//! SSH protocol message types (RFC 4253 Section 12, RFC 4252, RFC 4254).
//!
//! [`MessageType`] names the message numbers; [`Message`] is the closed set
//! of decoded messages the session engine routes.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::message::{Message, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//!
//! let msg = Message::decode(&[21]).unwrap();
//! assert_eq!(msg, Message::NewKeys);
//! assert_eq!(msg.encode(), vec![21]);
//! ```

use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

use super::auth::{UserauthBanner, UserauthFailure, UserauthRequest};
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust,
};
use super::encoding::{put_bool, put_bytes, put_str, Reader};
use super::kex::KexInit;
use super::kex_dh::{KexDhInit, KexDhReply};

/// SSH message types as defined in RFC 4253 Section 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH/ECDH key exchange init (both use the same number).
    KexdhInit = 30,
    /// DH/ECDH key exchange reply.
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Method-specific: PK_OK, PASSWD_CHANGEREQ or INFO_REQUEST.
    UserauthPkOk = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data.
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the RFC name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect_reason {
    /// Host not allowed to connect
    pub const HOST_NOT_ALLOWED_TO_CONNECT: u32 = 1;
    /// Protocol error
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error
    pub const MAC_ERROR: u32 = 5;
    /// Service not available
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// Host key not verifiable
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Connection lost
    pub const CONNECTION_LOST: u32 = 10;
    /// Disconnect by application
    pub const BY_APPLICATION: u32 = 11;
    /// No more auth methods available
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// SSH_MSG_DISCONNECT message (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason_code: u32, description: impl Into<String>) -> Self {
        Self {
            reason_code,
            description: description.into(),
        }
    }
}

/// SSH_MSG_DEBUG message (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed
    pub always_display: bool,
    /// Debug text
    pub message: String,
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the sender expects a reply
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

/// A decoded SSH message.
///
/// Method-specific authentication messages (60-79) are kept raw because
/// their meaning depends on the method in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// SSH_MSG_DISCONNECT
    Disconnect(Disconnect),
    /// SSH_MSG_IGNORE with its data
    Ignore(Vec<u8>),
    /// SSH_MSG_UNIMPLEMENTED with the rejected sequence number
    Unimplemented(u32),
    /// SSH_MSG_DEBUG
    Debug(DebugMessage),
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest(String),
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept(String),
    /// SSH_MSG_KEXINIT
    KexInit(KexInit),
    /// SSH_MSG_NEWKEYS
    NewKeys,
    /// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT
    KexDhInit(KexDhInit),
    /// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY
    KexDhReply(KexDhReply),
    /// SSH_MSG_USERAUTH_REQUEST
    UserauthRequest(UserauthRequest),
    /// SSH_MSG_USERAUTH_FAILURE
    UserauthFailure(UserauthFailure),
    /// SSH_MSG_USERAUTH_SUCCESS
    UserauthSuccess,
    /// SSH_MSG_USERAUTH_BANNER
    UserauthBanner(UserauthBanner),
    /// Messages 60-79, full payload including the message number
    UserauthMethodSpecific(Vec<u8>),
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest(GlobalRequest),
    /// SSH_MSG_REQUEST_SUCCESS with response data
    RequestSuccess(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust(ChannelWindowAdjust),
    /// SSH_MSG_CHANNEL_DATA
    ChannelData(ChannelData),
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ChannelExtendedData(ChannelExtendedData),
    /// SSH_MSG_CHANNEL_EOF
    ChannelEof(ChannelEof),
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose(ChannelClose),
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess(ChannelSuccess),
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure(ChannelFailure),
    /// Any message number this engine does not implement
    Unknown(u8),
}

impl Message {
    /// Decodes a packet payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation for an empty payload or a malformed body.
    /// Unrecognized message numbers decode as [`Message::Unknown`].
    pub fn decode(payload: &[u8]) -> TetherResult<Self> {
        let number = *payload
            .first()
            .ok_or_else(|| TetherError::protocol("empty message payload"))?;

        let msg = match MessageType::from_u8(number) {
            Some(MessageType::Disconnect) => {
                let mut reader = Reader::new(&payload[1..]);
                let reason_code = reader.read_u32()?;
                let description = String::from_utf8_lossy(reader.read_bytes()?).into_owned();
                Message::Disconnect(Disconnect {
                    reason_code,
                    description,
                })
            }
            Some(MessageType::Ignore) => {
                let mut reader = Reader::new(&payload[1..]);
                let data = if reader.remaining() > 0 {
                    reader.read_bytes()?.to_vec()
                } else {
                    Vec::new()
                };
                Message::Ignore(data)
            }
            Some(MessageType::Unimplemented) => {
                Message::Unimplemented(Reader::new(&payload[1..]).read_u32()?)
            }
            Some(MessageType::Debug) => {
                let mut reader = Reader::new(&payload[1..]);
                let always_display = reader.read_bool()?;
                let message = String::from_utf8_lossy(reader.read_bytes()?).into_owned();
                Message::Debug(DebugMessage {
                    always_display,
                    message,
                })
            }
            Some(MessageType::ServiceRequest) => {
                Message::ServiceRequest(Reader::new(&payload[1..]).read_string()?)
            }
            Some(MessageType::ServiceAccept) => {
                Message::ServiceAccept(Reader::new(&payload[1..]).read_string()?)
            }
            Some(MessageType::KexInit) => Message::KexInit(KexInit::from_bytes(payload)?),
            Some(MessageType::NewKeys) => Message::NewKeys,
            Some(MessageType::KexdhInit) => Message::KexDhInit(KexDhInit::from_bytes(payload)?),
            Some(MessageType::KexdhReply) => Message::KexDhReply(KexDhReply::from_bytes(payload)?),
            Some(MessageType::UserauthRequest) => {
                Message::UserauthRequest(UserauthRequest::from_bytes(payload)?)
            }
            Some(MessageType::UserauthFailure) => {
                Message::UserauthFailure(UserauthFailure::from_bytes(payload)?)
            }
            Some(MessageType::UserauthSuccess) => Message::UserauthSuccess,
            Some(MessageType::UserauthBanner) => {
                Message::UserauthBanner(UserauthBanner::from_bytes(payload)?)
            }
            Some(MessageType::GlobalRequest) => {
                let mut reader = Reader::new(&payload[1..]);
                let name = reader.read_string()?;
                let want_reply = reader.read_bool()?;
                Message::GlobalRequest(GlobalRequest {
                    name,
                    want_reply,
                    data: reader.rest().to_vec(),
                })
            }
            Some(MessageType::RequestSuccess) => Message::RequestSuccess(payload[1..].to_vec()),
            Some(MessageType::RequestFailure) => Message::RequestFailure,
            Some(MessageType::ChannelOpen) => Message::ChannelOpen(ChannelOpen::from_bytes(payload)?),
            Some(MessageType::ChannelOpenConfirmation) => {
                Message::ChannelOpenConfirmation(ChannelOpenConfirmation::from_bytes(payload)?)
            }
            Some(MessageType::ChannelOpenFailure) => {
                Message::ChannelOpenFailure(ChannelOpenFailure::from_bytes(payload)?)
            }
            Some(MessageType::ChannelWindowAdjust) => {
                Message::ChannelWindowAdjust(ChannelWindowAdjust::from_bytes(payload)?)
            }
            Some(MessageType::ChannelData) => Message::ChannelData(ChannelData::from_bytes(payload)?),
            Some(MessageType::ChannelExtendedData) => {
                Message::ChannelExtendedData(ChannelExtendedData::from_bytes(payload)?)
            }
            Some(MessageType::ChannelEof) => Message::ChannelEof(ChannelEof::from_bytes(payload)?),
            Some(MessageType::ChannelClose) => {
                Message::ChannelClose(ChannelClose::from_bytes(payload)?)
            }
            Some(MessageType::ChannelRequest) => {
                Message::ChannelRequest(ChannelRequest::from_bytes(payload)?)
            }
            Some(MessageType::ChannelSuccess) => {
                Message::ChannelSuccess(ChannelSuccess::from_bytes(payload)?)
            }
            Some(MessageType::ChannelFailure) => {
                Message::ChannelFailure(ChannelFailure::from_bytes(payload)?)
            }
            Some(MessageType::UserauthPkOk) | Some(MessageType::UserauthInfoResponse) => {
                Message::UserauthMethodSpecific(payload.to_vec())
            }
            None if (60..=79).contains(&number) => {
                Message::UserauthMethodSpecific(payload.to_vec())
            }
            None => Message::Unknown(number),
        };

        Ok(msg)
    }

    /// Encodes the message as a packet payload.
    ///
    /// [`Message::Unknown`] encodes to its bare message number.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Message::Disconnect(d) => {
                buf.put_u8(MessageType::Disconnect as u8);
                buf.put_u32(d.reason_code);
                put_str(&mut buf, &d.description);
                put_str(&mut buf, "");
            }
            Message::Ignore(data) => {
                buf.put_u8(MessageType::Ignore as u8);
                put_bytes(&mut buf, data);
            }
            Message::Unimplemented(seq) => {
                buf.put_u8(MessageType::Unimplemented as u8);
                buf.put_u32(*seq);
            }
            Message::Debug(d) => {
                buf.put_u8(MessageType::Debug as u8);
                put_bool(&mut buf, d.always_display);
                put_str(&mut buf, &d.message);
                put_str(&mut buf, "");
            }
            Message::ServiceRequest(name) => {
                buf.put_u8(MessageType::ServiceRequest as u8);
                put_str(&mut buf, name);
            }
            Message::ServiceAccept(name) => {
                buf.put_u8(MessageType::ServiceAccept as u8);
                put_str(&mut buf, name);
            }
            Message::KexInit(k) => return k.to_bytes(),
            Message::NewKeys => buf.put_u8(MessageType::NewKeys as u8),
            Message::KexDhInit(m) => return m.to_bytes(),
            Message::KexDhReply(m) => return m.to_bytes(),
            Message::UserauthRequest(m) => return m.to_bytes(),
            Message::UserauthFailure(m) => return m.to_bytes(),
            Message::UserauthSuccess => buf.put_u8(MessageType::UserauthSuccess as u8),
            Message::UserauthBanner(m) => return m.to_bytes(),
            Message::UserauthMethodSpecific(raw) => return raw.clone(),
            Message::GlobalRequest(g) => {
                buf.put_u8(MessageType::GlobalRequest as u8);
                put_str(&mut buf, &g.name);
                put_bool(&mut buf, g.want_reply);
                buf.put_slice(&g.data);
            }
            Message::RequestSuccess(data) => {
                buf.put_u8(MessageType::RequestSuccess as u8);
                buf.put_slice(data);
            }
            Message::RequestFailure => buf.put_u8(MessageType::RequestFailure as u8),
            Message::ChannelOpen(m) => return m.to_bytes(),
            Message::ChannelOpenConfirmation(m) => return m.to_bytes(),
            Message::ChannelOpenFailure(m) => return m.to_bytes(),
            Message::ChannelWindowAdjust(m) => return m.to_bytes(),
            Message::ChannelData(m) => return m.to_bytes(),
            Message::ChannelExtendedData(m) => return m.to_bytes(),
            Message::ChannelEof(m) => return m.to_bytes(),
            Message::ChannelClose(m) => return m.to_bytes(),
            Message::ChannelRequest(m) => return m.to_bytes(),
            Message::ChannelSuccess(m) => return m.to_bytes(),
            Message::ChannelFailure(m) => return m.to_bytes(),
            Message::Unknown(number) => buf.put_u8(*number),
        }
        buf.to_vec()
    }

    /// Returns true for messages allowed while a key exchange is running
    /// (RFC 4253 Section 7.1).
    pub fn allowed_during_kex(number: u8) -> bool {
        matches!(number, 1..=4 | 7..=19 | 20..=49)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_platform::ErrorCode;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_decode_disconnect() {
        let msg = Message::Disconnect(Disconnect::new(
            disconnect_reason::BY_APPLICATION,
            "bye",
        ));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_unknown_number() {
        assert_eq!(Message::decode(&[200, 1, 2]).unwrap(), Message::Unknown(200));
    }

    #[test]
    fn test_decode_method_specific_kept_raw() {
        let payload = vec![60, 0, 0, 0, 1, b'x'];
        assert_eq!(
            Message::decode(&payload).unwrap(),
            Message::UserauthMethodSpecific(payload.clone())
        );
    }

    #[test]
    fn test_decode_empty_payload() {
        let err = Message::decode(&[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_decode_global_request() {
        let msg = Message::GlobalRequest(GlobalRequest {
            name: "hostkeys-00@openssh.com".to_string(),
            want_reply: false,
            data: vec![0, 0, 0, 0],
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_allowed_during_kex() {
        assert!(Message::allowed_during_kex(2));
        assert!(Message::allowed_during_kex(31));
        assert!(!Message::allowed_during_kex(5));
        assert!(!Message::allowed_during_kex(50));
        assert!(!Message::allowed_during_kex(94));
    }
}
