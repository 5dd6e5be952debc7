//! SSH connection-protocol messages (RFC 4254).
//!
//! Typed channel and global-request messages. Channel data and extended
//! data also have types here for the write path; the connection loop parses
//! inbound data packets by hand to keep the hot path allocation-lean.
//!
//! Type-specific trailing payloads (channel-open data, channel-request
//! data, global-request data) are kept as raw bytes and interpreted by the
//! caller, since their layout depends on the request name.

use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};
use std::net::IpAddr;

use crate::ssh::message::{expect_type, MessageType};
use crate::ssh::wire;

/// Window this client advertises when confirming or opening a channel.
pub const CHANNEL_WINDOW: u32 = 1 << 14;

/// Maximum packet size this client advertises (RFC 4253 Section 6.1 also
/// makes 32 KiB the minimum a peer must accept).
pub const CHANNEL_MAX_PACKET: u32 = 1 << 15;

/// Smallest max-packet-size an inbound open may legally carry.
pub const MIN_CHANNEL_PACKET: u32 = 9;

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name, e.g. "session" or "forwarded-tcpip".
    pub chan_type: String,
    /// Sender's channel id.
    pub peers_id: u32,
    /// Window the sender grants us.
    pub peers_window: u32,
    /// Largest packet the sender accepts.
    pub max_packet_size: u32,
    /// Raw type-specific trailing data.
    pub type_specific_data: Vec<u8>,
}

impl ChannelOpen {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelOpen as u8);
        wire::write_string(&mut buf, self.chan_type.as_bytes());
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_u32(&mut buf, self.peers_window);
        wire::write_u32(&mut buf, self.max_packet_size);
        buf.extend_from_slice(&self.type_specific_data);
        buf.to_vec()
    }

    /// Parses from bytes; trailing bytes become the type-specific data.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpen)?;
        Ok(Self {
            chan_type: wire::read_string_utf8(data, &mut offset)?,
            peers_id: wire::read_u32(data, &mut offset)?,
            peers_window: wire::read_u32(data, &mut offset)?,
            max_packet_size: wire::read_u32(data, &mut offset)?,
            type_specific_data: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient's channel id (their numbering).
    pub peers_id: u32,
    /// Sender's channel id (our numbering).
    pub my_id: u32,
    /// Window we grant the peer.
    pub my_window: u32,
    /// Largest packet we accept.
    pub max_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelOpenConfirmation as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_u32(&mut buf, self.my_id);
        wire::write_u32(&mut buf, self.my_window);
        wire::write_u32(&mut buf, self.max_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
            my_id: wire::read_u32(data, &mut offset)?,
            my_window: wire::read_u32(data, &mut offset)?,
            max_packet_size: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// Channel-open rejection codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited.
    Prohibited = 1,
    /// The connection the channel represents could not be established.
    ConnectionFailed = 2,
    /// The channel type is not recognized.
    UnknownChannelType = 3,
    /// Resources exhausted.
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Maps a wire code to a reason.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Prohibited),
            2 => Some(Self::ConnectionFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Recipient's channel id.
    pub peers_id: u32,
    /// Rejection code.
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description.
    pub message: String,
    /// RFC 3066 language tag.
    pub language: String,
}

impl ChannelOpenFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelOpenFailure as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_u32(&mut buf, self.reason as u32);
        wire::write_string(&mut buf, self.message.as_bytes());
        wire::write_string(&mut buf, self.language.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpenFailure)?;
        let peers_id = wire::read_u32(data, &mut offset)?;
        let code = wire::read_u32(data, &mut offset)?;
        let reason = ChannelOpenFailureReason::from_u32(code).ok_or_else(|| {
            SkiffError::MalformedMessage(format!("unknown open-failure reason {}", code))
        })?;
        Ok(Self {
            peers_id,
            reason,
            message: wire::read_string_utf8(data, &mut offset)?,
            language: wire::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient's channel id.
    pub peers_id: u32,
    /// Bytes added to the recipient's send window.
    pub additional_bytes: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelWindowAdjust as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_u32(&mut buf, self.additional_bytes);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
            additional_bytes: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2). Write-path only; the
/// connection loop parses inbound data by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient's channel id.
    pub peers_id: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelData as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_string(&mut buf, &self.data);
        buf.to_vec()
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2). Data type 1 is
/// stderr; all other types are discarded on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient's channel id.
    pub peers_id: u32,
    /// Extended-data type code.
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelExtendedData as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_u32(&mut buf, self.data_type);
        wire::write_string(&mut buf, &self.data);
        buf.to_vec()
    }
}

/// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// Recipient's channel id.
    pub peers_id: u32,
}

impl ChannelEof {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelEof as u8);
        wire::write_u32(&mut buf, self.peers_id);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelEof)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// Recipient's channel id.
    pub peers_id: u32,
}

impl ChannelClose {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelClose as u8);
        wire::write_u32(&mut buf, self.peers_id);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelClose)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6). The request-specific
/// payload stays raw; its layout depends on the request name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient's channel id.
    pub peers_id: u32,
    /// Request name, e.g. "exit-status".
    pub request: String,
    /// Whether the sender wants a success/failure reply.
    pub want_reply: bool,
    /// Raw request-specific payload.
    pub payload: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelRequest as u8);
        wire::write_u32(&mut buf, self.peers_id);
        wire::write_string(&mut buf, self.request.as_bytes());
        wire::write_bool(&mut buf, self.want_reply);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes; trailing bytes become the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelRequest)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
            request: wire::read_string_utf8(data, &mut offset)?,
            want_reply: wire::read_bool(data, &mut offset)?,
            payload: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    /// Recipient's channel id.
    pub peers_id: u32,
}

impl ChannelSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelSuccess as u8);
        wire::write_u32(&mut buf, self.peers_id);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelSuccess)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    /// Recipient's channel id.
    pub peers_id: u32,
}

impl ChannelFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelFailure as u8);
        wire::write_u32(&mut buf, self.peers_id);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelFailure)?;
        Ok(Self {
            peers_id: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name, e.g. "tcpip-forward".
    pub request: String,
    /// Whether the sender wants a success/failure reply.
    pub want_reply: bool,
    /// Raw request-specific payload.
    pub payload: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::GlobalRequest as u8);
        wire::write_string(&mut buf, self.request.as_bytes());
        wire::write_bool(&mut buf, self.want_reply);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes; trailing bytes become the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::GlobalRequest)?;
        Ok(Self {
            request: wire::read_string_utf8(data, &mut offset)?,
            want_reply: wire::read_bool(data, &mut offset)?,
            payload: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSuccess {
    /// Request-specific response payload.
    pub payload: Vec<u8>,
}

impl RequestSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::RequestSuccess as u8);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::RequestSuccess)?;
        Ok(Self {
            payload: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_REQUEST_FAILURE (RFC 4254 Section 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFailure;

impl RequestFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::RequestFailure as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::RequestFailure)?;
        Ok(Self)
    }
}

/// Parses an (address, port) pair from channel-open type-specific data. The
/// address must be a literal IP; RFC 4254 Section 7.2 is silent on
/// unparseable addresses, but the forward table is keyed by IP, so anything
/// else is rejected here.
pub fn parse_tcp_addr(data: &[u8], offset: &mut usize) -> SkiffResult<(IpAddr, u32)> {
    let addr = wire::read_string_utf8(data, offset)?;
    let port = wire::read_u32(data, offset)?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| SkiffError::MalformedMessage(format!("'{}' is not an IP address", addr)))?;
    Ok((ip, port))
}

/// Encodes an (address, port) pair as channel-open or global-request
/// type-specific data.
pub fn write_tcp_addr(buf: &mut BytesMut, addr: &IpAddr, port: u32) {
    wire::write_string(buf, addr.to_string().as_bytes());
    wire::write_u32(buf, port);
}
