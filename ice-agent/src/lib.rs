//! ICE agent for NAT traversal
//!
//! Candidate gathering (host, server reflexive via STUN, relayed via TURN),
//! connectivity checks with role-conflict resolution, pair selection,
//! consent freshness and an out-of-band signaling token.
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


pub mod agent;
pub mod candidate;
pub mod checklist;
pub mod error;
pub mod gather;
pub mod signaling;
pub mod transaction;
mod transport;
pub mod turn_client;

pub use agent::{IceAgent, IceAgentConfig, IceConnectionState, IceRole};
pub use candidate::{calculate_priority, Candidate, CandidateType, DEFAULT_LOCAL_PREFERENCE};
pub use checklist::{pair_priority, CandidatePair, CheckList, PairId, PairState};
pub use error::{IceError, IceResult};
pub use gather::interface_addresses;
pub use signaling::SessionDescription;
pub use transaction::{RetransmitConfig, StunResponse, TransactionMap};
pub use turn_client::{TurnClient, TurnServerAddr};
