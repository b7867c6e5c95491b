//! STUN, TURN and ICE attributes
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


use crate::error::{DecodeError, DecodeResult};
use crate::error_code::ErrorCode;
use crate::message::{TransactionId, MAGIC_COOKIE};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Attribute type codes
pub mod attr_type {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Decoded attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    ErrorCode(ErrorCode),
    UnknownAttributes(Vec<u16>),
    ChannelNumber(u16),
    /// Allocation lifetime in seconds
    Lifetime(u32),
    Data(Bytes),
    /// IANA protocol number
    RequestedTransport(u8),
    Priority(u32),
    UseCandidate,
    IceControlled(u64),
    IceControlling(u64),
    /// Comprehension-optional attribute this codec does not interpret
    Unknown { attr_type: u16, value: Bytes },
}

impl Attribute {
    /// Wire type code
    pub fn attr_type(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => attr_type::MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => attr_type::XOR_MAPPED_ADDRESS,
            Attribute::XorPeerAddress(_) => attr_type::XOR_PEER_ADDRESS,
            Attribute::XorRelayedAddress(_) => attr_type::XOR_RELAYED_ADDRESS,
            Attribute::Username(_) => attr_type::USERNAME,
            Attribute::Realm(_) => attr_type::REALM,
            Attribute::Nonce(_) => attr_type::NONCE,
            Attribute::Software(_) => attr_type::SOFTWARE,
            Attribute::MessageIntegrity(_) => attr_type::MESSAGE_INTEGRITY,
            Attribute::Fingerprint(_) => attr_type::FINGERPRINT,
            Attribute::ErrorCode(_) => attr_type::ERROR_CODE,
            Attribute::UnknownAttributes(_) => attr_type::UNKNOWN_ATTRIBUTES,
            Attribute::ChannelNumber(_) => attr_type::CHANNEL_NUMBER,
            Attribute::Lifetime(_) => attr_type::LIFETIME,
            Attribute::Data(_) => attr_type::DATA,
            Attribute::RequestedTransport(_) => attr_type::REQUESTED_TRANSPORT,
            Attribute::Priority(_) => attr_type::PRIORITY,
            Attribute::UseCandidate => attr_type::USE_CANDIDATE,
            Attribute::IceControlled(_) => attr_type::ICE_CONTROLLED,
            Attribute::IceControlling(_) => attr_type::ICE_CONTROLLING,
            Attribute::Unknown { attr_type, .. } => *attr_type,
        }
    }

    /// Append the TLV (header, value, zero padding) to `buf`
    pub(crate) fn encode(&self, transaction_id: &TransactionId, buf: &mut BytesMut) {
        let header_at = buf.len();
        buf.put_u16(self.attr_type());
        buf.put_u16(0);
        let value_at = buf.len();

        match self {
            Attribute::MappedAddress(addr) => encode_address(*addr, buf),
            Attribute::XorMappedAddress(addr)
            | Attribute::XorPeerAddress(addr)
            | Attribute::XorRelayedAddress(addr) => {
                encode_address(xor_address(*addr, transaction_id), buf)
            }
            Attribute::Username(v)
            | Attribute::Realm(v)
            | Attribute::Nonce(v)
            | Attribute::Software(v) => buf.put_slice(v.as_bytes()),
            Attribute::MessageIntegrity(mac) => buf.put_slice(mac),
            Attribute::Fingerprint(crc) => buf.put_u32(*crc),
            Attribute::ErrorCode(error) => {
                buf.put_u16(0);
                buf.put_u8(error.class());
                buf.put_u8(error.number());
                buf.put_slice(error.reason.as_bytes());
            }
            Attribute::UnknownAttributes(types) => {
                for t in types {
                    buf.put_u16(*t);
                }
            }
            Attribute::ChannelNumber(number) => {
                buf.put_u16(*number);
                buf.put_u16(0);
            }
            Attribute::Lifetime(secs) => buf.put_u32(*secs),
            Attribute::Data(data) => buf.put_slice(data),
            Attribute::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0, 0, 0]);
            }
            Attribute::Priority(priority) => buf.put_u32(*priority),
            Attribute::UseCandidate => {}
            Attribute::IceControlled(tie_breaker) | Attribute::IceControlling(tie_breaker) => {
                buf.put_u64(*tie_breaker)
            }
            Attribute::Unknown { value, .. } => buf.put_slice(value),
        }

        let length = buf.len() - value_at;
        buf[header_at + 2..header_at + 4].copy_from_slice(&(length as u16).to_be_bytes());
        let padding = (4 - length % 4) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode one attribute value.
    ///
    /// Returns `Ok(None)` for an unknown comprehension-required type so the
    /// caller can collect them for a 420 response.
    pub(crate) fn decode(
        code: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> DecodeResult<Option<Attribute>> {
        let attribute = match code {
            attr_type::MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(code, value)?),
            attr_type::XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(xor_address(
                decode_address(code, value)?,
                transaction_id,
            )),
            attr_type::XOR_PEER_ADDRESS => Attribute::XorPeerAddress(xor_address(
                decode_address(code, value)?,
                transaction_id,
            )),
            attr_type::XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(xor_address(
                decode_address(code, value)?,
                transaction_id,
            )),
            attr_type::USERNAME => Attribute::Username(decode_text(code, value)?),
            attr_type::REALM => Attribute::Realm(decode_text(code, value)?),
            attr_type::NONCE => Attribute::Nonce(decode_text(code, value)?),
            attr_type::SOFTWARE => Attribute::Software(decode_text(code, value)?),
            attr_type::MESSAGE_INTEGRITY => {
                let mac: [u8; 20] = value
                    .try_into()
                    .map_err(|_| DecodeError::attribute(code, "expected 20 bytes"))?;
                Attribute::MessageIntegrity(mac)
            }
            attr_type::FINGERPRINT => Attribute::Fingerprint(decode_u32(code, value)?),
            attr_type::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(DecodeError::attribute(code, "shorter than 4 bytes"));
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(DecodeError::attribute(code, "invalid error class or number"));
                }
                let reason = decode_text(code, &value[4..])?;
                Attribute::ErrorCode(ErrorCode::with_reason(class * 100 + number, reason))
            }
            attr_type::UNKNOWN_ATTRIBUTES => {
                if value.len() % 2 != 0 {
                    return Err(DecodeError::attribute(code, "odd length"));
                }
                Attribute::UnknownAttributes(
                    value
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            attr_type::CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(DecodeError::attribute(code, "expected 4 bytes"));
                }
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            attr_type::LIFETIME => Attribute::Lifetime(decode_u32(code, value)?),
            attr_type::DATA => Attribute::Data(Bytes::copy_from_slice(value)),
            attr_type::REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(DecodeError::attribute(code, "expected 4 bytes"));
                }
                Attribute::RequestedTransport(value[0])
            }
            attr_type::PRIORITY => Attribute::Priority(decode_u32(code, value)?),
            attr_type::USE_CANDIDATE => {
                if !value.is_empty() {
                    return Err(DecodeError::attribute(code, "expected empty value"));
                }
                Attribute::UseCandidate
            }
            attr_type::ICE_CONTROLLED => Attribute::IceControlled(decode_u64(code, value)?),
            attr_type::ICE_CONTROLLING => Attribute::IceControlling(decode_u64(code, value)?),
            // 0x0000-0x7FFF are comprehension-required
            unknown if unknown < 0x8000 => return Ok(None),
            unknown => Attribute::Unknown {
                attr_type: unknown,
                value: Bytes::copy_from_slice(value),
            },
        };
        Ok(Some(attribute))
    }
}

/// Apply the XOR mapping; it is its own inverse.
///
/// Port is XORed with the top half of the magic cookie. IPv4 addresses are
/// XORed with the magic cookie, IPv6 with the cookie followed by the
/// transaction ID.
pub fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            for (o, k) in octets.iter_mut().zip(cookie.iter()) {
                *o ^= k;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(transaction_id.as_bytes());
            let mut octets = v6.octets();
            for (o, k) in octets.iter_mut().zip(key.iter()) {
                *o ^= k;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

fn encode_address(addr: SocketAddr, buf: &mut BytesMut) {
    buf.put_u8(0);
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(addr.port());
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(addr.port());
            buf.put_slice(&v6.octets());
        }
    }
}

fn decode_address(code: u16, value: &[u8]) -> DecodeResult<SocketAddr> {
    if value.len() < 4 {
        return Err(DecodeError::attribute(code, "address shorter than 4 bytes"));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match (value[1], value.len()) {
        (FAMILY_IPV4, 8) => {
            let octets: [u8; 4] = [value[4], value[5], value[6], value[7]];
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        (family, len) => Err(DecodeError::attribute(
            code,
            format!("family 0x{:02x} with {} bytes", family, len),
        )),
    }
}

fn decode_text(code: u16, value: &[u8]) -> DecodeResult<String> {
    String::from_utf8(value.to_vec()).map_err(|_| DecodeError::attribute(code, "invalid UTF-8"))
}

fn decode_u32(code: u16, value: &[u8]) -> DecodeResult<u32> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| DecodeError::attribute(code, "expected 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

fn decode_u64(code: u16, value: &[u8]) -> DecodeResult<u64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| DecodeError::attribute(code, "expected 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}
