//! STUN message header and encoding
//!
//! A message is a 20-byte header (type, length, magic cookie, transaction ID)
//! followed by an ordered list of TLV attributes, each padded to 4 bytes.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::attributes::{attr_type, Attribute};
use crate::error::{DecodeError, DecodeResult};
use crate::error_code::ErrorCode;
use crate::integrity::{fingerprint, hmac_sha1, FINGERPRINT_XOR};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// STUN magic cookie (RFC 5389 Section 6)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// Whether this class is a response (success or error)
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        )
    }
}

/// Message method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    /// Any other 12-bit method
    Other(u16),
}

impl Method {
    /// 12-bit method code
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Other(code) => code & 0x0FFF,
        }
    }

    /// Method from its 12-bit code
    pub fn from_code(code: u16) -> Self {
        match code & 0x0FFF {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            other => Method::Other(other),
        }
    }
}

/// Message type: method and class interleaved into 14 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub const BINDING_REQUEST: MessageType = MessageType::new(Method::Binding, MessageClass::Request);
    pub const BINDING_SUCCESS: MessageType =
        MessageType::new(Method::Binding, MessageClass::SuccessResponse);
    pub const BINDING_ERROR: MessageType =
        MessageType::new(Method::Binding, MessageClass::ErrorResponse);

    pub const fn new(method: Method, class: MessageClass) -> Self {
        MessageType { method, class }
    }

    /// Encode to the on-wire 16-bit value (RFC 5389 Section 6)
    pub fn to_u16(self) -> u16 {
        let m = self.method.code();
        let c = self.class.bits();
        (m & 0x000F)
            | ((c & 0b01) << 4)
            | ((m & 0x0070) << 1)
            | ((c & 0b10) << 7)
            | ((m & 0x0F80) << 2)
    }

    /// Decode from the on-wire 16-bit value
    pub fn from_u16(value: u16) -> Self {
        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        let class = ((value & 0x0010) >> 4) | ((value & 0x0100) >> 7);
        MessageType {
            method: Method::from_code(method),
            class: MessageClass::from_bits(class),
        }
    }
}

/// 96-bit transaction ID
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Random transaction ID
    pub fn new() -> Self {
        TransactionId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Method and class
    pub message_type: MessageType,
    /// Transaction ID, echoed unchanged in responses
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create an empty message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Message {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Request with a fresh random transaction ID
    pub fn request(method: Method) -> Self {
        Self::new(
            MessageType::new(method, MessageClass::Request),
            TransactionId::new(),
        )
    }

    /// Indication with a fresh random transaction ID
    pub fn indication(method: Method) -> Self {
        Self::new(
            MessageType::new(method, MessageClass::Indication),
            TransactionId::new(),
        )
    }

    /// Empty success response to this message
    pub fn success_response(&self) -> Self {
        Self::new(
            MessageType::new(self.method(), MessageClass::SuccessResponse),
            self.transaction_id,
        )
    }

    /// Error response to this message carrying ERROR-CODE
    pub fn error_response(&self, error: ErrorCode) -> Self {
        Self::new(
            MessageType::new(self.method(), MessageClass::ErrorResponse),
            self.transaction_id,
        )
        .with(Attribute::ErrorCode(error))
    }

    /// Builder-style attribute append
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Append an attribute
    pub fn add(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn method(&self) -> Method {
        self.message_type.method
    }

    pub fn class(&self) -> MessageClass {
        self.message_type.class
    }

    /// Check method and class at once
    pub fn is(&self, method: Method, class: MessageClass) -> bool {
        self.message_type == MessageType::new(method, class)
    }

    /// First attribute with the given type code
    pub fn get(&self, code: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == code)
    }

    pub fn contains(&self, code: u16) -> bool {
        self.get(code).is_some()
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode(v) => Some(v),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(v) => Some(*v),
            _ => None,
        })
    }

    /// XOR-MAPPED-ADDRESS, falling back to the legacy MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address().or_else(|| {
            self.attributes.iter().find_map(|a| match a {
                Attribute::MappedAddress(v) => Some(*v),
                _ => None,
            })
        })
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(v) => Some(*v),
            _ => None,
        })
    }

    /// All XOR-PEER-ADDRESS attributes (CreatePermission may carry several)
    pub fn xor_peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::XorPeerAddress(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.xor_peer_addresses().into_iter().next()
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(v) => Some(*v),
            _ => None,
        })
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::RequestedTransport(v) => Some(*v),
            _ => None,
        })
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ChannelNumber(v) => Some(*v),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(v) => Some(v),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Priority(v) => Some(*v),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.contains(attr_type::USE_CANDIDATE)
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlling(v) => Some(*v),
            _ => None,
        })
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlled(v) => Some(*v),
            _ => None,
        })
    }

    pub fn has_integrity(&self) -> bool {
        self.contains(attr_type::MESSAGE_INTEGRITY)
    }

    pub fn has_fingerprint(&self) -> bool {
        self.contains(attr_type::FINGERPRINT)
    }

    /// Encode the message exactly as it is, attribute values included
    pub fn encode(&self) -> Bytes {
        let mut buf = self.encode_header();
        for attribute in &self.attributes {
            attribute.encode(&self.transaction_id, &mut buf);
        }
        set_length(&mut buf);
        buf.freeze()
    }

    /// Encode with freshly computed MESSAGE-INTEGRITY and/or FINGERPRINT.
    ///
    /// Any MESSAGE-INTEGRITY or FINGERPRINT already present in `attributes`
    /// is dropped; the new ones are appended in the mandated order.
    pub fn encode_with(&self, integrity_key: Option<&[u8]>, with_fingerprint: bool) -> Bytes {
        let mut buf = self.encode_header();
        for attribute in &self.attributes {
            match attribute {
                Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_) => continue,
                other => other.encode(&self.transaction_id, &mut buf),
            }
        }

        if let Some(key) = integrity_key {
            // Length covers everything up to and including MESSAGE-INTEGRITY
            let length = (buf.len() - HEADER_SIZE + 24) as u16;
            buf[2..4].copy_from_slice(&length.to_be_bytes());
            let mac = hmac_sha1(key, &buf);
            buf.put_u16(attr_type::MESSAGE_INTEGRITY);
            buf.put_u16(20);
            buf.put_slice(&mac);
        }

        if with_fingerprint {
            let length = (buf.len() - HEADER_SIZE + 8) as u16;
            buf[2..4].copy_from_slice(&length.to_be_bytes());
            let crc = fingerprint(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(attr_type::FINGERPRINT);
            buf.put_u16(4);
            buf.put_u32(crc);
        }

        set_length(&mut buf);
        buf.freeze()
    }

    fn encode_header(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_u16(self.message_type.to_u16());
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());
        buf
    }

    /// Decode a datagram into a message.
    ///
    /// Verifies FINGERPRINT when present. MESSAGE-INTEGRITY is kept as an
    /// attribute; check it separately with [`crate::verify_integrity`] once
    /// the key is known.
    pub fn decode(buf: &[u8]) -> DecodeResult<Message> {
        let (message_type, transaction_id, length) = parse_header(buf)?;
        if HEADER_SIZE + length != buf.len() {
            return Err(DecodeError::MalformedHeader(format!(
                "length field {} does not match datagram size {}",
                length,
                buf.len()
            )));
        }

        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();
        let mut after_integrity = false;
        let mut after_fingerprint = false;

        for tlv in Tlvs::new(buf) {
            let (offset, code, value) = tlv?;
            if after_fingerprint {
                return Err(DecodeError::attribute(code, "attribute after FINGERPRINT"));
            }
            if code == attr_type::FINGERPRINT {
                after_fingerprint = true;
                let attribute = Attribute::decode(code, value, &transaction_id)?;
                if let Some(Attribute::Fingerprint(received)) = attribute {
                    if fingerprint(&buf[..offset]) ^ FINGERPRINT_XOR != received {
                        return Err(DecodeError::FingerprintMismatch);
                    }
                    attributes.push(Attribute::Fingerprint(received));
                }
                continue;
            }
            // Only FINGERPRINT may follow MESSAGE-INTEGRITY; anything else is ignored
            if after_integrity {
                continue;
            }
            if code == attr_type::MESSAGE_INTEGRITY {
                after_integrity = true;
            }
            match Attribute::decode(code, value, &transaction_id)? {
                Some(attribute) => attributes.push(attribute),
                None => unknown_required.push(code),
            }
        }

        if !unknown_required.is_empty() {
            return Err(DecodeError::UnknownAttributes {
                transaction_id,
                attributes: unknown_required,
            });
        }

        Ok(Message {
            message_type,
            transaction_id,
            attributes,
        })
    }
}

fn set_length(buf: &mut BytesMut) {
    let length = (buf.len() - HEADER_SIZE) as u16;
    buf[2..4].copy_from_slice(&length.to_be_bytes());
}

/// Validate the fixed header and return type, transaction ID and body length
fn parse_header(buf: &[u8]) -> DecodeResult<(MessageType, TransactionId, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::MalformedHeader(format!(
            "{} bytes is shorter than a STUN header",
            buf.len()
        )));
    }
    if buf[0] & 0xC0 != 0 {
        return Err(DecodeError::MalformedHeader(
            "leading bits are not zero".to_string(),
        ));
    }
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(DecodeError::MalformedHeader(format!(
            "bad magic cookie 0x{:08x}",
            cookie
        )));
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length % 4 != 0 {
        return Err(DecodeError::MalformedHeader(format!(
            "length {} is not a multiple of 4",
            length
        )));
    }
    let message_type = MessageType::from_u16(u16::from_be_bytes([buf[0], buf[1]]));
    let mut id = [0u8; 12];
    id.copy_from_slice(&buf[8..20]);
    Ok((message_type, TransactionId::from_bytes(id), length))
}

/// Type and transaction ID of a datagram whose header is well formed.
///
/// Lets a server answer 400 to a request whose body fails to decode.
pub fn peek_header(buf: &[u8]) -> Option<(MessageType, TransactionId)> {
    parse_header(buf)
        .ok()
        .filter(|(_, _, length)| HEADER_SIZE + length <= buf.len())
        .map(|(message_type, transaction_id, _)| (message_type, transaction_id))
}

/// Cheap check used to demultiplex STUN from other traffic on one socket
pub fn looks_like_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// Iterator over raw attribute TLVs: (offset of TLV header, type, value)
pub(crate) struct Tlvs<'a> {
    buf: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> Tlvs<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        let length = if buf.len() >= HEADER_SIZE {
            u16::from_be_bytes([buf[2], buf[3]]) as usize
        } else {
            0
        };
        Tlvs {
            buf,
            offset: HEADER_SIZE,
            end: (HEADER_SIZE + length).min(buf.len()),
        }
    }
}

impl<'a> Iterator for Tlvs<'a> {
    type Item = DecodeResult<(usize, u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let start = self.offset;
        if self.end - start < 4 {
            self.offset = self.end;
            return Some(Err(DecodeError::attribute(0, "truncated attribute header")));
        }
        let code = u16::from_be_bytes([self.buf[start], self.buf[start + 1]]);
        let length = u16::from_be_bytes([self.buf[start + 2], self.buf[start + 3]]) as usize;
        let value_start = start + 4;
        let padded_end = value_start + ((length + 3) & !3);
        if padded_end > self.end {
            self.offset = self.end;
            return Some(Err(DecodeError::attribute(
                code,
                format!("value of {} bytes overruns the message", length),
            )));
        }
        self.offset = padded_end;
        Some(Ok((start, code, &self.buf[value_start..value_start + length])))
    }
}
