//! # SOME/IP Wire Format
//!
//! Encoding and decoding of SOME/IP message headers, including the
//! transport-protocol (TP) extension used to carry messages larger than one
//! datagram.
//!
//! ## Header layout (16 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────────────
//!   0      2    Service ID
//!   2      2    Method ID (or Event ID if bit 15 set)
//!   4      4    Length (covers everything from byte 8)
//!   8      2    Client ID
//!  10      2    Session ID
//!  12      1    Protocol Version (always 0x01)
//!  13      1    Interface Version
//!  14      1    Message Type
//!  15      1    Return Code
//! ──────────────────────────────────────────────────────
//! ```
//!
//! ## Message types
//!
//! | Value | Name | Description |
//! |-------|------|-------------|
//! | 0x00 | REQUEST | RPC request expecting a response |
//! | 0x01 | REQUEST_NO_RETURN | Fire-and-forget request |
//! | 0x02 | NOTIFICATION | Event notification |
//! | 0x80 | RESPONSE | RPC response |
//! | 0x81 | ERROR | RPC error response |
//!
//! Bit 5 (0x20) of the message type is the TP flag. When set, the header is
//! followed by a 4-byte `offset_and_more` word: the upper 28 bits are the
//! segment's byte offset in units of 16, bit 0 is the "more segments" flag.

use bytes::{Buf, BufMut, BytesMut};

use crate::{ClientId, MethodId, ServiceId, SessionId};

/// SOME/IP protocol version, the only accepted value.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the plain SOME/IP header.
pub const HEADER_SIZE: usize = 16;

/// Size of the TP extension word following a TP-flagged header.
pub const TP_HEADER_SIZE: usize = 4;

/// Offset of the length field within the header.
pub const LENGTH_POS: usize = 4;

/// Offset of the client id within the header.
pub const CLIENT_POS: usize = 8;

/// Offset of the session id within the header.
pub const SESSION_POS: usize = 10;

/// Offset of the protocol version byte within the header.
pub const PROTOCOL_VERSION_POS: usize = 12;

/// Offset of the message type byte within the header.
pub const MESSAGE_TYPE_POS: usize = 14;

/// Offset of the return code byte within the header.
pub const RETURN_CODE_POS: usize = 15;

/// TP flag bit within the message type byte.
pub const TP_FLAG: u8 = 0x20;

/// Service id used by service discovery.
pub const SD_SERVICE: u16 = 0xFFFF;

/// Method id used by service discovery.
pub const SD_METHOD: u16 = 0x8100;

/// Largest return code value considered valid.
pub const MAX_RETURN_CODE: u8 = 0x5E;

/// TP segment offsets are expressed in units of this many bytes.
pub const TP_OFFSET_UNIT: usize = 16;

// ============================================================================
// Message type
// ============================================================================

/// SOME/IP message type with the TP flag stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    RequestNoReturn,
    Notification,
    Response,
    Error,
}

impl MessageType {
    /// Decode a message type byte, ignoring the TP flag.
    ///
    /// Returns `None` for values that are not valid SOME/IP message types.
    pub fn parse(byte: u8) -> Option<Self> {
        match byte & !TP_FLAG {
            0x00 => Some(MessageType::Request),
            0x01 => Some(MessageType::RequestNoReturn),
            0x02 => Some(MessageType::Notification),
            0x80 => Some(MessageType::Response),
            0x81 => Some(MessageType::Error),
            _ => None,
        }
    }

    /// Wire value without the TP flag.
    pub fn value(self) -> u8 {
        match self {
            MessageType::Request => 0x00,
            MessageType::RequestNoReturn => 0x01,
            MessageType::Notification => 0x02,
            MessageType::Response => 0x80,
            MessageType::Error => 0x81,
        }
    }

    /// True for `Request` and `RequestNoReturn`.
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::Request | MessageType::RequestNoReturn)
    }

    /// True for `Notification`.
    pub fn is_notification(self) -> bool {
        matches!(self, MessageType::Notification)
    }
}

/// Whether the TP flag is set in a raw message type byte.
pub fn tp_flag_is_set(message_type_byte: u8) -> bool {
    message_type_byte & TP_FLAG != 0
}

/// Clear the TP flag in a raw message type byte.
pub fn tp_flag_unset(message_type_byte: u8) -> u8 {
    message_type_byte & !TP_FLAG
}

/// Whether a return code byte is within the valid range.
pub fn is_valid_return_code(return_code: u8) -> bool {
    return_code <= MAX_RETURN_CODE
}

// ============================================================================
// Header
// ============================================================================

/// Parsed SOME/IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub service: ServiceId,
    pub method: MethodId,
    /// Length field: bytes following the length field itself (8 + payload).
    pub length: u32,
    pub client: ClientId,
    pub session: SessionId,
    pub protocol_version: u8,
    pub interface_version: u8,
    /// Raw message type byte, TP flag included.
    pub message_type_raw: u8,
    pub return_code: u8,
}

impl Header {
    /// Parse a header from the front of `data`. Does not validate field
    /// values beyond the buffer being long enough.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let mut buf = data;
        Some(Header {
            service: buf.get_u16(),
            method: buf.get_u16(),
            length: buf.get_u32(),
            client: buf.get_u16(),
            session: buf.get_u16(),
            protocol_version: buf.get_u8(),
            interface_version: buf.get_u8(),
            message_type_raw: buf.get_u8(),
            return_code: buf.get_u8(),
        })
    }

    /// Serialize into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.service);
        buf.put_u16(self.method);
        buf.put_u32(self.length);
        buf.put_u16(self.client);
        buf.put_u16(self.session);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.interface_version);
        buf.put_u8(self.message_type_raw);
        buf.put_u8(self.return_code);
    }

    /// Message type with the TP flag stripped, if valid.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(self.message_type_raw)
    }

    /// Whether the TP flag is set.
    pub fn is_tp(&self) -> bool {
        tp_flag_is_set(self.message_type_raw)
    }

    /// Total message size on the wire: 8 bytes + length field.
    pub fn message_size(&self) -> usize {
        8 + self.length as usize
    }
}

/// Read the total message size declared by the buffer's length field,
/// without parsing the full header. Returns `None` when fewer than 8 bytes
/// are available.
pub fn declared_message_size(data: &[u8]) -> Option<usize> {
    if data.len() < 8 {
        return None;
    }
    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Some(8 + length as usize)
}

/// Extract service and method from a serialized message, if long enough.
pub fn peek_service_method(data: &[u8]) -> Option<(ServiceId, MethodId)> {
    if data.len() < 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    ))
}

/// Extract client and session from a serialized message, if long enough.
pub fn peek_client_session(data: &[u8]) -> Option<(ClientId, SessionId)> {
    if data.len() < SESSION_POS + 2 {
        return None;
    }
    Some((
        u16::from_be_bytes([data[CLIENT_POS], data[CLIENT_POS + 1]]),
        u16::from_be_bytes([data[SESSION_POS], data[SESSION_POS + 1]]),
    ))
}

// ============================================================================
// TP header
// ============================================================================

/// Decoded TP extension word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpHeader {
    /// Byte offset of this segment within the original payload.
    pub offset: u32,
    /// Whether further segments follow.
    pub more: bool,
}

impl TpHeader {
    /// Decode from the raw `offset_and_more` word.
    pub fn from_word(word: u32) -> Self {
        TpHeader {
            offset: word & 0xFFFF_FFF0,
            more: word & 0x1 != 0,
        }
    }

    /// Encode into the raw `offset_and_more` word.
    pub fn to_word(self) -> u32 {
        debug_assert_eq!(self.offset % TP_OFFSET_UNIT as u32, 0);
        (self.offset & 0xFFFF_FFF0) | u32::from(self.more)
    }

    /// Parse the word following a TP-flagged header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE + TP_HEADER_SIZE {
            return None;
        }
        let word = u32::from_be_bytes([
            data[HEADER_SIZE],
            data[HEADER_SIZE + 1],
            data[HEADER_SIZE + 2],
            data[HEADER_SIZE + 3],
        ]);
        Some(Self::from_word(word))
    }
}

// ============================================================================
// Tests
// ============================================================================
