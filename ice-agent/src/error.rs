//! Error types for the ICE agent
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

/// ICE agent error
#[derive(Debug, Error)]
pub enum IceError {
    /// Operation not allowed in the current agent state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// STUN decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Response failed MESSAGE-INTEGRITY or credentials were rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transaction or connection attempt timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer answered 487; the role must be switched
    #[error("Role conflict")]
    RoleConflict,

    /// TURN server answered with an error response
    #[error("TURN request rejected: {0}")]
    TurnRejected(ErrorCode),

    /// Response missing a mandatory attribute or otherwise unusable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No host candidate could be created
    #[error("Gathering failed: {0}")]
    Gather(String),

    /// Every candidate pair failed
    #[error("Connectivity checks failed")]
    ConnectionFailed,

    /// Signaling token could not be decoded
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Agent closed while the operation was pending
    #[error("Agent closed")]
    Closed,

    /// Socket error
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Result type for ICE operations
pub type IceResult<T> = Result<T, IceError>;
