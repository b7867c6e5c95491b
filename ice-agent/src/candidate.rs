//! ICE candidates (RFC 8445 Section 5.1)
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


use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Local preference of the first interface; later interfaces count down
pub const DEFAULT_LOCAL_PREFERENCE: u16 = 65_535;

/// ICE candidate type (RFC 8445 Section 5.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Host candidate (directly connected interface)
    #[serde(rename = "host")]
    Host,
    /// Server reflexive candidate (via STUN server)
    #[serde(rename = "srflx")]
    ServerReflexive,
    /// Peer reflexive candidate (discovered during connectivity checks)
    #[serde(rename = "prflx")]
    PeerReflexive,
    /// Relayed candidate (via TURN server)
    #[serde(rename = "relay")]
    Relayed,
}

impl CandidateType {
    /// Type preference (RFC 8445 Section 5.1.2.2)
    pub fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        }
    }
}

/// Calculate candidate priority per RFC 8445 Section 5.1.2.1.
///
/// Component IDs outside 1..=256 are clamped so the component term stays
/// within the low byte.
pub fn calculate_priority(candidate_type: CandidateType, local_preference: u16, component: u16) -> u32 {
    (candidate_type.preference() << 24)
        + (u32::from(local_preference) << 8)
        + (256 - u32::from(component.clamp(1, 256)))
}

/// ICE candidate; immutable once gathered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Foundation (equal for candidates of the same type, base IP and server)
    pub foundation: String,
    /// Component ID (1 for RTP)
    pub component: u16,
    /// Priority
    pub priority: u32,
    /// Transport address
    pub address: SocketAddr,
    /// Address the candidate sends from
    pub base: SocketAddr,
    /// Related address (for srflx/relay candidates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<SocketAddr>,
    /// Candidate type
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
}

impl Candidate {
    /// Create a host candidate
    pub fn new_host(component: u16, address: SocketAddr, local_preference: u16) -> Self {
        Candidate {
            foundation: format!("host-{}", address.ip()),
            component,
            priority: calculate_priority(CandidateType::Host, local_preference, component),
            address,
            base: address,
            related_address: None,
            candidate_type: CandidateType::Host,
        }
    }

    /// Create a server reflexive candidate (from STUN)
    pub fn new_server_reflexive(
        component: u16,
        address: SocketAddr,
        base: SocketAddr,
        local_preference: u16,
    ) -> Self {
        Candidate {
            foundation: format!("srflx-{}", base.ip()),
            component,
            priority: calculate_priority(CandidateType::ServerReflexive, local_preference, component),
            address,
            base,
            related_address: Some(base),
            candidate_type: CandidateType::ServerReflexive,
        }
    }

    /// Create a relayed candidate (from TURN)
    pub fn new_relayed(
        component: u16,
        address: SocketAddr,
        related_address: SocketAddr,
        local_preference: u16,
    ) -> Self {
        Candidate {
            foundation: format!("relay-{}", address.ip()),
            component,
            priority: calculate_priority(CandidateType::Relayed, local_preference, component),
            address,
            base: address,
            related_address: Some(related_address),
            candidate_type: CandidateType::Relayed,
        }
    }

    /// Remote candidate learned from the source of a connectivity check
    pub fn new_peer_reflexive(component: u16, address: SocketAddr, priority: u32) -> Self {
        Candidate {
            foundation: format!("prflx-{}", address.ip()),
            component,
            priority,
            address,
            base: address,
            related_address: None,
            candidate_type: CandidateType::PeerReflexive,
        }
    }

    /// Local preference encoded in the priority
    pub fn local_preference(&self) -> u16 {
        ((self.priority >> 8) & 0xFFFF) as u16
    }

    /// PRIORITY carried in checks sent from this candidate
    pub fn peer_reflexive_priority(&self) -> u32 {
        calculate_priority(
            CandidateType::PeerReflexive,
            self.local_preference(),
            self.component,
        )
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} prio={}",
            self.candidate_type.label(),
            self.address,
            self.foundation,
            self.priority
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), port)
    }

    #[test]
    fn test_ice_candidate_priority() {
        let host = Candidate::new_host(1, addr(5000), DEFAULT_LOCAL_PREFERENCE);
        assert_eq!(host.priority, (126 << 24) + (65_535 << 8) + 255);
        assert_eq!(host.candidate_type, CandidateType::Host);
        assert_eq!(host.base, host.address);

        let srflx = Candidate::new_server_reflexive(
            1,
            "203.0.113.4:6000".parse().unwrap(),
            host.address,
            DEFAULT_LOCAL_PREFERENCE,
        );
        let relay = Candidate::new_relayed(
            1,
            "198.51.100.1:49152".parse().unwrap(),
            srflx.address,
            DEFAULT_LOCAL_PREFERENCE,
        );
        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
        assert_eq!(relay.priority, (65_535 << 8) + 255);
    }

    #[test]
    fn test_peer_reflexive_priority_keeps_local_preference() {
        let host = Candidate::new_host(1, addr(5000), 65_000);
        assert_eq!(host.local_preference(), 65_000);
        assert_eq!(
            host.peer_reflexive_priority(),
            calculate_priority(CandidateType::PeerReflexive, 65_000, 1)
        );
    }

    #[test]
    fn test_out_of_range_component_stays_in_low_byte() {
        let zero = calculate_priority(CandidateType::Host, 65_535, 0);
        assert_eq!(zero, calculate_priority(CandidateType::Host, 65_535, 1));
        assert_eq!((zero >> 8) & 0xFFFF, 65_535);
        assert_eq!(zero >> 24, 126);
        assert_eq!(calculate_priority(CandidateType::Relayed, 0, 300), 0);
    }

    #[test]
    fn test_foundations() {
        let a = Candidate::new_host(1, addr(5000), DEFAULT_LOCAL_PREFERENCE);
        let b = Candidate::new_host(1, addr(5001), DEFAULT_LOCAL_PREFERENCE);
        let srflx = Candidate::new_server_reflexive(1, addr(7000), a.address, 1);
        assert_eq!(a.foundation, b.foundation);
        assert_ne!(a.foundation, srflx.foundation);
    }

    #[test]
    fn test_candidate_json() {
        let host = Candidate::new_host(1, addr(5000), DEFAULT_LOCAL_PREFERENCE);
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["type"], "host");
        assert!(json.get("related_address").is_none());
        let back: Candidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, host);
    }
}
