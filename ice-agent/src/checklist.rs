//! Candidate pairs and the check list (RFC 8445 Section 6.1.2)
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


use crate::candidate::{Candidate, CandidateType};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Stable identifier of a pair within one check list
pub type PairId = u64;

/// Candidate pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Waiting to be checked
    Waiting,
    /// Check in progress
    InProgress,
    /// Check succeeded
    Succeeded,
    /// Check failed
    Failed,
    /// Frozen (waiting for another pair of the same foundation)
    Frozen,
}

/// Pair priority per RFC 8445 Section 6.1.2.3
pub fn pair_priority(controlling_priority: u32, controlled_priority: u32) -> u64 {
    let g = u64::from(controlling_priority);
    let d = u64::from(controlled_priority);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// ICE candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub id: PairId,
    /// Local candidate
    pub local: Candidate,
    /// Remote candidate
    pub remote: Candidate,
    /// Pair priority for the current role
    pub priority: u64,
    /// Pair state
    pub state: PairState,
    /// Nominated for use
    pub nominated: bool,
}

impl CandidatePair {
    fn new(id: PairId, local: Candidate, remote: Candidate, controlling: bool) -> Self {
        let mut pair = CandidatePair {
            id,
            local,
            remote,
            priority: 0,
            state: PairState::Frozen,
            nominated: false,
        };
        pair.update_priority(controlling);
        pair
    }

    fn update_priority(&mut self, controlling: bool) {
        self.priority = if controlling {
            pair_priority(self.local.priority, self.remote.priority)
        } else {
            pair_priority(self.remote.priority, self.local.priority)
        };
    }

    /// Pair foundation: local and remote foundations joined
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation, self.remote.foundation)
    }
}

/// Ordered set of candidate pairs, highest priority first
#[derive(Debug)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    controlling: bool,
    next_id: PairId,
}

impl CheckList {
    pub fn new(controlling: bool) -> Self {
        CheckList {
            pairs: Vec::new(),
            controlling,
            next_id: 0,
        }
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pair `local` with `remote`.
    ///
    /// Candidates must share component and address family. A server
    /// reflexive local candidate is replaced by its host base, and a pair
    /// whose addresses are already listed is not added twice. Returns the
    /// id of the new or existing pair; new pairs start Frozen.
    pub fn add_pair(
        &mut self,
        local: &Candidate,
        remote: &Candidate,
        local_candidates: &[Candidate],
    ) -> Option<PairId> {
        if local.component != remote.component
            || local.address.is_ipv4() != remote.address.is_ipv4()
        {
            return None;
        }

        let local = if local.candidate_type == CandidateType::ServerReflexive {
            local_candidates
                .iter()
                .find(|c| c.candidate_type == CandidateType::Host && c.address == local.base)?
        } else {
            local
        };

        if let Some(existing) = self.find(local.address, remote.address) {
            return Some(existing);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pairs.push(CandidatePair::new(
            id,
            local.clone(),
            remote.clone(),
            self.controlling,
        ));
        self.sort();
        Some(id)
    }

    /// Pair every local candidate with every remote candidate
    pub fn form_pairs(&mut self, locals: &[Candidate], remotes: &[Candidate]) {
        for remote in remotes {
            for local in locals {
                self.add_pair(local, remote, locals);
            }
        }
    }

    /// Recompute priorities after a role change
    pub fn set_role(&mut self, controlling: bool) {
        self.controlling = controlling;
        for pair in &mut self.pairs {
            pair.update_priority(controlling);
        }
        self.sort();
    }

    pub fn get(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    pub fn set_state(&mut self, id: PairId, state: PairState) {
        if let Some(pair) = self.get_mut(id) {
            pair.state = state;
        }
    }

    /// Pair with the given local and remote transport addresses
    pub fn find(&self, local: SocketAddr, remote: SocketAddr) -> Option<PairId> {
        self.pairs
            .iter()
            .find(|p| p.local.address == local && p.remote.address == remote)
            .map(|p| p.id)
    }

    /// For every foundation without an active pair, move its highest
    /// priority Frozen pair to Waiting.
    pub fn initialize_states(&mut self) {
        let active: HashSet<String> = self
            .pairs
            .iter()
            .filter(|p| p.state != PairState::Frozen)
            .map(CandidatePair::foundation)
            .collect();
        let mut seen = HashSet::new();
        for pair in &mut self.pairs {
            if pair.state != PairState::Frozen {
                continue;
            }
            let foundation = pair.foundation();
            if active.contains(&foundation) {
                continue;
            }
            if seen.insert(foundation) {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// Highest priority Waiting pair
    pub fn next_waiting(&self) -> Option<PairId> {
        self.pairs
            .iter()
            .find(|p| p.state == PairState::Waiting)
            .map(|p| p.id)
    }

    /// Move the highest priority Frozen pair to Waiting
    pub fn unfreeze_highest(&mut self) -> Option<PairId> {
        let pair = self.pairs.iter_mut().find(|p| p.state == PairState::Frozen)?;
        pair.state = PairState::Waiting;
        Some(pair.id)
    }

    /// Unfreeze the pairs sharing a foundation with `id`
    pub fn unfreeze_foundation(&mut self, id: PairId) {
        let Some(foundation) = self.get(id).map(CandidatePair::foundation) else {
            return;
        };
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// True once the list is non-empty and every pair has failed
    pub fn all_failed(&self) -> bool {
        !self.pairs.is_empty() && self.pairs.iter().all(|p| p.state == PairState::Failed)
    }

    fn sort(&mut self) {
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::DEFAULT_LOCAL_PREFERENCE;

    fn host(addr: &str) -> Candidate {
        Candidate::new_host(1, addr.parse().unwrap(), DEFAULT_LOCAL_PREFERENCE)
    }

    #[test]
    fn test_ice_candidate_pair_priority() {
        let local = host("192.168.1.10:5000");
        let remote = Candidate::new_relayed(
            1,
            "198.51.100.1:49152".parse().unwrap(),
            "203.0.113.1:7000".parse().unwrap(),
            DEFAULT_LOCAL_PREFERENCE,
        );

        let controlling = CandidatePair::new(0, local.clone(), remote.clone(), true);
        let controlled = CandidatePair::new(0, remote.clone(), local.clone(), false);
        assert_eq!(controlling.priority, controlled.priority);

        let g = u64::from(local.priority);
        let d = u64::from(remote.priority);
        assert_eq!(controlling.priority, (1u64 << 32) * d + 2 * g + 1);
    }

    #[test]
    fn test_pairs_sorted_and_deduplicated() {
        let locals = vec![host("10.0.0.1:5000"), host("10.0.0.2:5000")];
        let remotes = vec![
            host("10.0.0.9:6000"),
            Candidate::new_relayed(
                1,
                "10.0.0.50:49152".parse().unwrap(),
                "10.0.0.9:6000".parse().unwrap(),
                DEFAULT_LOCAL_PREFERENCE,
            ),
        ];
        let mut list = CheckList::new(true);
        list.form_pairs(&locals, &remotes);
        list.form_pairs(&locals, &remotes);

        assert_eq!(list.pairs().len(), 4);
        assert!(list
            .pairs()
            .windows(2)
            .all(|w| w[0].priority >= w[1].priority));
    }

    #[test]
    fn test_server_reflexive_replaced_by_base() {
        let base = host("10.0.0.1:5000");
        let srflx = Candidate::new_server_reflexive(
            1,
            "203.0.113.7:40000".parse().unwrap(),
            base.address,
            DEFAULT_LOCAL_PREFERENCE,
        );
        let locals = vec![base.clone(), srflx];
        let remote = host("10.0.0.9:6000");

        let mut list = CheckList::new(false);
        list.form_pairs(&locals, std::slice::from_ref(&remote));
        assert_eq!(list.pairs().len(), 1);
        assert_eq!(list.pairs()[0].local, base);
    }

    #[test]
    fn test_family_and_component_must_match() {
        let v4 = host("10.0.0.1:5000");
        let v6 = host("[::1]:5000");
        let mut other_component = host("10.0.0.9:6000");
        other_component.component = 2;

        let mut list = CheckList::new(true);
        assert!(list.add_pair(&v4, &v6, &[]).is_none());
        assert!(list.add_pair(&v4, &other_component, &[]).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_initial_states_by_foundation() {
        let locals = vec![host("10.0.0.1:5000"), host("10.0.0.1:5002")];
        let remotes = vec![host("10.0.0.9:6000")];
        let mut list = CheckList::new(true);
        list.form_pairs(&locals, &remotes);
        list.initialize_states();

        let waiting = list
            .pairs()
            .iter()
            .filter(|p| p.state == PairState::Waiting)
            .count();
        assert_eq!(waiting, 1);
        assert_eq!(list.next_waiting(), Some(list.pairs()[0].id));

        let first = list.pairs()[0].id;
        list.set_state(first, PairState::Succeeded);
        list.unfreeze_foundation(first);
        assert!(list.next_waiting().is_some());
        assert!(list.pairs().iter().all(|p| p.state != PairState::Frozen));
    }

    #[test]
    fn test_role_change_recomputes_priority() {
        let local = Candidate::new_host(1, "10.0.0.1:5000".parse().unwrap(), 100);
        let remote = host("10.0.0.9:6000");
        let mut list = CheckList::new(true);
        let id = list.add_pair(&local, &remote, &[]).unwrap();
        let before = list.get(id).unwrap().priority;

        list.set_role(false);
        let after = list.get(id).unwrap().priority;
        assert_ne!(before, after);
        assert_eq!(after, pair_priority(remote.priority, local.priority));
    }

    #[test]
    fn test_all_failed() {
        let mut list = CheckList::new(true);
        assert!(!list.all_failed());
        let id = list
            .add_pair(&host("10.0.0.1:5000"), &host("10.0.0.9:6000"), &[])
            .unwrap();
        assert!(!list.all_failed());
        list.set_state(id, PairState::Failed);
        assert!(list.all_failed());
        assert_eq!(list.unfreeze_highest(), None);
    }
}
