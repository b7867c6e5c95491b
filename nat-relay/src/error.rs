//! Error types for the STUN/TURN servers
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


use stun_proto::{DecodeError, ErrorCode};
use thiserror::Error;

/// Relay error
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Datagram failed to decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Missing or failing credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Nonce unknown or expired
    #[error("Stale nonce")]
    StaleNonce,

    /// Username does not own the allocation
    #[error("Wrong credentials for allocation of {0}")]
    WrongCredentials(String),

    /// No allocation (or a conflicting one) for the client 5-tuple
    #[error("Allocation mismatch: {0}")]
    AllocationMismatch(String),

    /// Operation on an allocation handle that has already expired
    #[error("Allocation expired: {0}")]
    AllocationExpired(String),

    /// Peer has no permission on the allocation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Allocation limit or relay port range exhausted
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// REQUESTED-TRANSPORT other than UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// Socket error
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

impl RelayError {
    /// STUN error code sent back to the client for this error
    pub fn error_code(&self) -> ErrorCode {
        let code = match self {
            RelayError::InvalidRequest(_) => ErrorCode::BAD_REQUEST,
            RelayError::Decode(DecodeError::UnknownAttributes { .. }) => ErrorCode::UNKNOWN_ATTRIBUTE,
            RelayError::Decode(_) => ErrorCode::BAD_REQUEST,
            RelayError::Unauthorized(_) => ErrorCode::UNAUTHORIZED,
            RelayError::StaleNonce => ErrorCode::STALE_NONCE,
            RelayError::WrongCredentials(_) => ErrorCode::WRONG_CREDENTIALS,
            RelayError::AllocationMismatch(_) | RelayError::AllocationExpired(_) => {
                ErrorCode::ALLOCATION_MISMATCH
            }
            RelayError::PermissionDenied(_) => ErrorCode::FORBIDDEN,
            RelayError::InsufficientCapacity(_) => ErrorCode::INSUFFICIENT_CAPACITY,
            RelayError::UnsupportedTransport(_) => ErrorCode::UNSUPPORTED_TRANSPORT,
            RelayError::Network(_) | RelayError::Server(_) => ErrorCode::SERVER_ERROR,
        };
        ErrorCode::new(code)
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
