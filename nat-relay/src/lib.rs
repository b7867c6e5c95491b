//! STUN and TURN servers for NAT traversal
//!
//! A stateless STUN binding responder, and a TURN relay with long-term
//! credential authentication for peers that cannot reach each other
//! directly.
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


pub mod allocation;
pub mod auth;
pub mod error;
pub mod stun_server;
pub mod turn_server;

pub use allocation::{Allocation, AllocationConfig, AllocationManager, RelayStats};
pub use auth::{AuthHandler, NonceManager, StaticCredentials};
pub use error::{RelayError, RelayResult};
pub use stun_server::{StunServer, StunServerConfig};
pub use turn_server::{TurnServer, TurnServerConfig};
