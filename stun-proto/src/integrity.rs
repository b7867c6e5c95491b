//! MESSAGE-INTEGRITY, FINGERPRINT and credential keys
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


use crate::attributes::attr_type;
use crate::error::{DecodeError, DecodeResult};
use crate::message::{Tlvs, HEADER_SIZE};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// CRC-32 used by FINGERPRINT
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// FINGERPRINT is the CRC-32 XORed with this constant ("STUN")
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Long-term credential key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    hasher.finalize().to_vec()
}

/// Short-term credential key (ICE): the password itself
pub fn short_term_key(password: &str) -> Vec<u8> {
    password.as_bytes().to_vec()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn fingerprint(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Verify MESSAGE-INTEGRITY of a raw datagram against `key`.
///
/// The HMAC covers everything before the MESSAGE-INTEGRITY attribute with the
/// header length rewritten to end right after it, so a trailing FINGERPRINT
/// does not affect the result. A missing attribute is a mismatch.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> DecodeResult<()> {
    if raw.len() < HEADER_SIZE {
        return Err(DecodeError::MalformedHeader("short message".to_string()));
    }

    let mut found = None;
    for tlv in Tlvs::new(raw) {
        let (offset, code, value) = tlv?;
        if code == attr_type::MESSAGE_INTEGRITY {
            found = Some((offset, value));
            break;
        }
    }
    let (offset, received) = found.ok_or(DecodeError::IntegrityMismatch)?;
    if received.len() != 20 {
        return Err(DecodeError::IntegrityMismatch);
    }

    let mut covered = raw[..offset].to_vec();
    let length = (offset + 24 - HEADER_SIZE) as u16;
    covered[2..4].copy_from_slice(&length.to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| DecodeError::IntegrityMismatch)?;
    mac.update(&covered);
    mac.verify_slice(received)
        .map_err(|_| DecodeError::IntegrityMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(fingerprint(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_long_term_key() {
        // MD5("user:realm:pass")
        let key = long_term_key("user", "realm", "pass");
        assert_eq!(hex::encode(&key), "8493fbc53ba582fb4c044c456bdc40eb");
        assert_eq!(key.len(), 16);
    }

    #[test]
    fn test_missing_integrity_is_mismatch() {
        let message = crate::Message::request(crate::Method::Binding);
        assert_eq!(
            verify_integrity(&message.encode(), b"key"),
            Err(DecodeError::IntegrityMismatch)
        );
    }
}
