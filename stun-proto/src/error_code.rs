//! ERROR-CODE values
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


use std::fmt;

/// ERROR-CODE attribute value (RFC 5389 Section 15.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    /// Numeric code, 300..=699
    pub code: u16,
    /// Reason phrase
    pub reason: String,
}

impl ErrorCode {
    pub const TRY_ALTERNATE: u16 = 300;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const UNKNOWN_ATTRIBUTE: u16 = 420;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    pub const STALE_NONCE: u16 = 438;
    pub const WRONG_CREDENTIALS: u16 = 441;
    pub const UNSUPPORTED_TRANSPORT: u16 = 442;
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const SERVER_ERROR: u16 = 500;
    pub const INSUFFICIENT_CAPACITY: u16 = 508;

    /// Error code with the standard reason phrase
    pub fn new(code: u16) -> Self {
        ErrorCode {
            code,
            reason: default_reason(code).to_string(),
        }
    }

    /// Error code with a custom reason phrase
    pub fn with_reason(code: u16, reason: impl Into<String>) -> Self {
        ErrorCode {
            code,
            reason: reason.into(),
        }
    }

    /// Hundreds digit as carried on the wire
    pub fn class(&self) -> u8 {
        (self.code / 100) as u8
    }

    /// Code modulo 100 as carried on the wire
    pub fn number(&self) -> u8 {
        (self.code % 100) as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

fn default_reason(code: u16) -> &'static str {
    match code {
        ErrorCode::TRY_ALTERNATE => "Try Alternate",
        ErrorCode::BAD_REQUEST => "Bad Request",
        ErrorCode::UNAUTHORIZED => "Unauthorized",
        ErrorCode::FORBIDDEN => "Forbidden",
        ErrorCode::UNKNOWN_ATTRIBUTE => "Unknown Attribute",
        ErrorCode::ALLOCATION_MISMATCH => "Allocation Mismatch",
        ErrorCode::STALE_NONCE => "Stale Nonce",
        ErrorCode::WRONG_CREDENTIALS => "Wrong Credentials",
        ErrorCode::UNSUPPORTED_TRANSPORT => "Unsupported Transport Protocol",
        ErrorCode::ALLOCATION_QUOTA_REACHED => "Allocation Quota Reached",
        ErrorCode::ROLE_CONFLICT => "Role Conflict",
        ErrorCode::SERVER_ERROR => "Server Error",
        ErrorCode::INSUFFICIENT_CAPACITY => "Insufficient Capacity",
        _ => "Unknown Error",
    }
}
