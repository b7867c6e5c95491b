//! TURN ChannelData framing (RFC 5766 Section 11.4)
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
use bytes::{BufMut, Bytes, BytesMut};

const CHANNEL_HEADER_SIZE: usize = 4;

/// Valid channel numbers are 0x4000 through 0x7FFF
pub fn is_valid_channel_number(number: u16) -> bool {
    (0x4000..=0x7FFF).contains(&number)
}

/// First two bits 0b01 distinguish ChannelData from STUN (0b00)
pub fn is_channel_data(buf: &[u8]) -> bool {
    buf.len() >= CHANNEL_HEADER_SIZE && buf[0] & 0xC0 == 0x40
}

/// ChannelData message: channel number, length, application data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: u16,
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(number: u16, data: Bytes) -> Self {
        ChannelData { number, data }
    }

    /// Encode with the payload padded to a multiple of 4 bytes
    pub fn encode(&self) -> Bytes {
        let padding = (4 - self.data.len() % 4) % 4;
        let mut buf = BytesMut::with_capacity(CHANNEL_HEADER_SIZE + self.data.len() + padding);
        buf.put_u16(self.number);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.put_bytes(0, padding);
        buf.freeze()
    }

    /// Decode, accepting datagrams with or without trailing padding
    pub fn decode(buf: &[u8]) -> DecodeResult<ChannelData> {
        if buf.len() < CHANNEL_HEADER_SIZE {
            return Err(DecodeError::MalformedHeader(
                "ChannelData shorter than 4 bytes".to_string(),
            ));
        }
        let number = u16::from_be_bytes([buf[0], buf[1]]);
        if !is_valid_channel_number(number) {
            return Err(DecodeError::MalformedHeader(format!(
                "channel number 0x{:04x} out of range",
                number
            )));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if CHANNEL_HEADER_SIZE + length > buf.len() {
            return Err(DecodeError::MalformedHeader(format!(
                "ChannelData length {} exceeds datagram",
                length
            )));
        }
        Ok(ChannelData {
            number,
            data: Bytes::copy_from_slice(&buf[CHANNEL_HEADER_SIZE..CHANNEL_HEADER_SIZE + length]),
        })
    }
}
