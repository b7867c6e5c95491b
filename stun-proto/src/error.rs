//! Error types for the STUN codec
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


use crate::message::TransactionId;
use thiserror::Error;

/// STUN decode error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Header is too short, has the wrong magic cookie or an inconsistent length
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Attribute TLV overruns the message or carries an invalid value
    #[error("Malformed attribute 0x{attr_type:04x}: {reason}")]
    MalformedAttribute { attr_type: u16, reason: String },

    /// Comprehension-required attributes the codec does not understand
    #[error("Unknown comprehension-required attributes: {attributes:04x?}")]
    UnknownAttributes {
        transaction_id: TransactionId,
        attributes: Vec<u16>,
    },

    /// MESSAGE-INTEGRITY missing or not matching the supplied key
    #[error("MESSAGE-INTEGRITY mismatch")]
    IntegrityMismatch,

    /// FINGERPRINT does not match the message contents
    #[error("FINGERPRINT mismatch")]
    FingerprintMismatch,
}

impl DecodeError {
    pub(crate) fn attribute(attr_type: u16, reason: impl Into<String>) -> Self {
        DecodeError::MalformedAttribute {
            attr_type,
            reason: reason.into(),
        }
    }
}

/// Result type for decode operations
pub type DecodeResult<T> = Result<T, DecodeError>;
