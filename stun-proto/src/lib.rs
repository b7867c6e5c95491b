//! STUN message codec
//!
//! Wire encoding and decoding for the STUN family of protocols:
//! - STUN message header, classes and methods (RFC 5389)
//! - TURN methods, attributes and ChannelData framing (RFC 5766)
//! - ICE connectivity-check attributes (RFC 8445)
//! - MESSAGE-INTEGRITY (HMAC-SHA1) and FINGERPRINT (CRC-32)
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


pub mod attributes;
pub mod channel_data;
pub mod error;
pub mod error_code;
pub mod integrity;
pub mod message;

pub use attributes::{attr_type, xor_address, Attribute};
pub use channel_data::{is_channel_data, is_valid_channel_number, ChannelData};
pub use error::{DecodeError, DecodeResult};
pub use error_code::ErrorCode;
pub use integrity::{long_term_key, short_term_key, verify_integrity};
pub use message::{
    looks_like_stun, peek_header, Message, MessageClass, MessageType, Method, TransactionId,
    HEADER_SIZE, MAGIC_COOKIE,
};

/// IANA protocol number for UDP, carried in REQUESTED-TRANSPORT.
pub const TRANSPORT_UDP: u8 = 17;

/// Value advertised in the SOFTWARE attribute.
pub const SOFTWARE: &str = concat!("natkit ", env!("CARGO_PKG_VERSION"));
