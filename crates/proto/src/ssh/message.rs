//! SSH protocol message types (RFC 4253 Section 12).
//!
//! This module defines the numeric message-type registry, the transport-layer
//! housekeeping messages, and the typed [`Message`] union produced by the
//! single [`decode`] dispatch used by the connection loop.
//!
//! # Message Categories
//!
//! - **Transport layer generic** (1-19): disconnect, ignore, debug
//! - **Algorithm negotiation** (20-29): key exchange initialization
//! - **Key exchange method** (30-49): method-specific messages
//! - **User authentication** (50-79): authentication protocol
//! - **Connection protocol** (80-127): channels and global requests

use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::connection::{
    ChannelClose, ChannelEof, ChannelFailure, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelRequest, ChannelSuccess, ChannelWindowAdjust, GlobalRequest,
    RequestFailure, RequestSuccess,
};
use crate::ssh::kex::KexInit;
use crate::ssh::wire;

/// SSH message types as defined in RFC 4253 Section 12 and related RFCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive filler.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message type.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,

    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - switch to the freshly derived key material.
    NewKeys = 21,

    /// Diffie-Hellman/ECDH key exchange init (both use message number 30).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use message number 31).
    KexdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key accepted for authentication.
    UserauthPkOk = 60,

    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
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
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request success.
    ChannelSuccess = 99,
    /// Channel request failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a message-type byte to a `MessageType`, or `None` for bytes
    /// outside the registry.
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

    /// Returns the protocol name of the message type.
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

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Machine-readable reason code.
    pub reason_code: u32,
    /// Human-readable description.
    pub description: String,
    /// RFC 3066 language tag, usually empty.
    pub language_tag: String,
}

impl Disconnect {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Disconnect as u8);
        wire::write_u32(&mut buf, self.reason_code);
        wire::write_string(&mut buf, self.description.as_bytes());
        wire::write_string(&mut buf, self.language_tag.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Disconnect)?;
        Ok(Self {
            reason_code: wire::read_u32(data, &mut offset)?,
            description: wire::read_string_utf8(data, &mut offset)?,
            language_tag: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_IGNORE (RFC 4253 Section 11.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ignore {
    /// Arbitrary payload, discarded by the receiver.
    pub data: Vec<u8>,
}

impl Ignore {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Ignore as u8);
        wire::write_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Ignore)?;
        Ok(Self {
            data: wire::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debug {
    /// Whether the receiver should display the message.
    pub always_display: bool,
    /// Debug text. Sanitize with [`wire::safe_string`] before display.
    pub message: String,
    /// RFC 3066 language tag.
    pub language_tag: String,
}

impl Debug {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Debug as u8);
        wire::write_bool(&mut buf, self.always_display);
        wire::write_string(&mut buf, self.message.as_bytes());
        wire::write_string(&mut buf, self.language_tag.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Debug)?;
        Ok(Self {
            always_display: wire::read_bool(data, &mut offset)?,
            message: wire::read_string_utf8(data, &mut offset)?,
            language_tag: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED (RFC 4253 Section 11.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet.
    pub sequence: u32,
}

impl Unimplemented {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Unimplemented as u8);
        wire::write_u32(&mut buf, self.sequence);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Unimplemented)?;
        Ok(Self {
            sequence: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_REQUEST (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name, e.g. "ssh-userauth".
    pub service: String,
}

impl ServiceRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ServiceRequest as u8);
        wire::write_string(&mut buf, self.service.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ServiceRequest)?;
        Ok(Self {
            service: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name.
    pub service: String,
}

impl ServiceAccept {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ServiceAccept as u8);
        wire::write_string(&mut buf, self.service.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ServiceAccept)?;
        Ok(Self {
            service: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// Checks the leading message-type byte of a packet.
pub(crate) fn expect_type(
    data: &[u8],
    offset: &mut usize,
    expected: MessageType,
) -> SkiffResult<()> {
    let got = wire::read_u8(data, offset)?;
    if got != expected as u8 {
        return Err(SkiffError::UnexpectedMessage {
            expected: expected as u8,
            got,
        });
    }
    Ok(())
}

/// A decoded SSH message.
///
/// Channel data and extended data (types 94 and 95) are parsed on the hot
/// path by the connection loop and do not appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// SSH_MSG_DISCONNECT
    Disconnect(Disconnect),
    /// SSH_MSG_IGNORE
    Ignore(Ignore),
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented(Unimplemented),
    /// SSH_MSG_DEBUG
    Debug(Debug),
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest(ServiceRequest),
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept(ServiceAccept),
    /// SSH_MSG_KEXINIT
    KexInit(KexInit),
    /// SSH_MSG_NEWKEYS
    NewKeys,
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest(GlobalRequest),
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess(RequestSuccess),
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure(RequestFailure),
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust(ChannelWindowAdjust),
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
}

/// Decodes a packet payload into a typed [`Message`] by dispatching on the
/// leading message-type byte.
///
/// # Errors
///
/// - [`SkiffError::MalformedMessage`] when the payload is empty or the body
///   fails to parse
/// - [`SkiffError::UnexpectedMessage`] when the leading byte is not a type
///   this decoder handles
pub fn decode(packet: &[u8]) -> SkiffResult<Message> {
    let Some(&first) = packet.first() else {
        return Err(SkiffError::MalformedMessage("empty packet".to_string()));
    };

    match MessageType::from_u8(first) {
        Some(MessageType::Disconnect) => Ok(Message::Disconnect(Disconnect::from_bytes(packet)?)),
        Some(MessageType::Ignore) => Ok(Message::Ignore(Ignore::from_bytes(packet)?)),
        Some(MessageType::Unimplemented) => {
            Ok(Message::Unimplemented(Unimplemented::from_bytes(packet)?))
        }
        Some(MessageType::Debug) => Ok(Message::Debug(Debug::from_bytes(packet)?)),
        Some(MessageType::ServiceRequest) => {
            Ok(Message::ServiceRequest(ServiceRequest::from_bytes(packet)?))
        }
        Some(MessageType::ServiceAccept) => {
            Ok(Message::ServiceAccept(ServiceAccept::from_bytes(packet)?))
        }
        Some(MessageType::KexInit) => Ok(Message::KexInit(KexInit::from_bytes(packet)?)),
        Some(MessageType::NewKeys) => Ok(Message::NewKeys),
        Some(MessageType::GlobalRequest) => {
            Ok(Message::GlobalRequest(GlobalRequest::from_bytes(packet)?))
        }
        Some(MessageType::RequestSuccess) => {
            Ok(Message::RequestSuccess(RequestSuccess::from_bytes(packet)?))
        }
        Some(MessageType::RequestFailure) => {
            Ok(Message::RequestFailure(RequestFailure::from_bytes(packet)?))
        }
        Some(MessageType::ChannelOpen) => Ok(Message::ChannelOpen(ChannelOpen::from_bytes(packet)?)),
        Some(MessageType::ChannelOpenConfirmation) => Ok(Message::ChannelOpenConfirmation(
            ChannelOpenConfirmation::from_bytes(packet)?,
        )),
        Some(MessageType::ChannelOpenFailure) => Ok(Message::ChannelOpenFailure(
            ChannelOpenFailure::from_bytes(packet)?,
        )),
        Some(MessageType::ChannelWindowAdjust) => Ok(Message::ChannelWindowAdjust(
            ChannelWindowAdjust::from_bytes(packet)?,
        )),
        Some(MessageType::ChannelEof) => Ok(Message::ChannelEof(ChannelEof::from_bytes(packet)?)),
        Some(MessageType::ChannelClose) => {
            Ok(Message::ChannelClose(ChannelClose::from_bytes(packet)?))
        }
        Some(MessageType::ChannelRequest) => {
            Ok(Message::ChannelRequest(ChannelRequest::from_bytes(packet)?))
        }
        Some(MessageType::ChannelSuccess) => {
            Ok(Message::ChannelSuccess(ChannelSuccess::from_bytes(packet)?))
        }
        Some(MessageType::ChannelFailure) => {
            Ok(Message::ChannelFailure(ChannelFailure::from_bytes(packet)?))
        }
        _ => Err(SkiffError::UnexpectedMessage {
            expected: 0,
            got: first,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::ChannelData as u8, 94);
        assert_eq!(MessageType::ChannelFailure as u8, 100);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = Disconnect {
            reason_code: 11,
            description: "bye".to_string(),
            language_tag: String::new(),
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(Disconnect::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_debug_round_trip() {
        let msg = Debug {
            always_display: true,
            message: "trace on".to_string(),
            language_tag: "en".to_string(),
        };
        let parsed = Debug::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_service_request_round_trip() {
        let msg = ServiceRequest {
            service: "ssh-userauth".to_string(),
        };
        assert_eq!(ServiceRequest::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_decode_dispatch() {
        let msg = Ignore { data: vec![1, 2, 3] };
        match decode(&msg.to_bytes()).unwrap() {
            Message::Ignore(parsed) => assert_eq!(parsed, msg),
            other => panic!("expected Ignore, got {:?}", other),
        }

        assert!(matches!(decode(&[21]), Ok(Message::NewKeys)));
    }

    #[test]
    fn test_decode_unknown_type() {
        let result = decode(&[200, 0, 0]);
        assert!(matches!(
            result,
            Err(SkiffError::UnexpectedMessage { got: 200, .. })
        ));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(
            decode(&[]),
            Err(SkiffError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_truncated_body() {
        // DISCONNECT with a truncated description string.
        let data = [1, 0, 0, 0, 11, 0, 0, 0, 99];
        assert!(decode(&data).is_err());
    }
}
