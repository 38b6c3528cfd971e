//! Transport candidates
//!
//! Address/port pairs that might reach the peer, with the priority scheme
//! of RFC 8445 Section 5.1.2.1 and a liveness state driven by
//! connectivity checks.
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


use crate::error::{CallEngineError, CallEngineResult};
use callcore_types::{CandidateDescriptor, CandidateKind};
use std::net::SocketAddr;

/// Liveness of a candidate as seen by connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Untested,
    /// Pings in flight
    Checking,
    /// Answered an authenticated ping
    Valid,
    Failed,
}

/// A candidate address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCandidate {
    pub address: SocketAddr,
    pub kind: CandidateKind,
    pub priority: u32,
    pub liveness: Liveness,
}

/// Candidate priority per RFC 8445 Section 5.1.2.1 (single component)
pub fn calculate_priority(kind: CandidateKind, local_preference: u16) -> u32 {
    let type_preference: u32 = match kind {
        CandidateKind::Host => 126,
        CandidateKind::PeerReflexive => 110,
        CandidateKind::ServerReflexive => 100,
        CandidateKind::Relayed => 0,
    };
    let component_preference: u32 = 255;

    type_preference << 24 | (local_preference as u32) << 8 | component_preference
}

impl TransportCandidate {
    pub fn new(address: SocketAddr, kind: CandidateKind) -> Self {
        // Prefer IPv4 slightly; dual-stack hosts tend to have working v4 paths
        let local_preference = if address.is_ipv4() { 65535 } else { 65000 };
        TransportCandidate {
            address,
            kind,
            priority: calculate_priority(kind, local_preference),
            liveness: Liveness::Untested,
        }
    }

    /// Create a host candidate
    pub fn host(address: SocketAddr) -> Self {
        Self::new(address, CandidateKind::Host)
    }

    /// Create a server reflexive candidate (from STUN)
    pub fn server_reflexive(address: SocketAddr) -> Self {
        Self::new(address, CandidateKind::ServerReflexive)
    }

    /// Candidate learned from an authenticated ping
    pub fn peer_reflexive(address: SocketAddr) -> Self {
        Self::new(address, CandidateKind::PeerReflexive)
    }

    /// Create a relayed candidate
    pub fn relayed(address: SocketAddr) -> Self {
        Self::new(address, CandidateKind::Relayed)
    }

    pub fn is_direct(&self) -> bool {
        self.kind.is_direct()
    }

    pub fn to_descriptor(&self) -> CandidateDescriptor {
        CandidateDescriptor {
            address: self.address,
            kind: self.kind,
            priority: self.priority,
        }
    }

    pub fn from_descriptor(descriptor: &CandidateDescriptor) -> Self {
        TransportCandidate {
            address: descriptor.address,
            kind: descriptor.kind,
            priority: descriptor.priority,
            liveness: Liveness::Untested,
        }
    }
}

/// Candidates ordered by priority, with at most one active
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<TransportCandidate>,
    active: Option<SocketAddr>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate; returns false when the address is already known
    pub fn add(&mut self, candidate: TransportCandidate) -> bool {
        if self.get(candidate.address).is_some() {
            return false;
        }
        let position = self
            .candidates
            .iter()
            .position(|c| c.priority < candidate.priority)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(position, candidate);
        true
    }

    pub fn get(&self, address: SocketAddr) -> Option<&TransportCandidate> {
        self.candidates.iter().find(|c| c.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransportCandidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn set_liveness(&mut self, address: SocketAddr, liveness: Liveness) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.address == address) {
            candidate.liveness = liveness;
        }
    }

    /// Make a validated candidate the active one, replacing any other
    pub fn activate(&mut self, address: SocketAddr) -> CallEngineResult<()> {
        match self.get(address) {
            Some(candidate) if candidate.liveness == Liveness::Valid => {
                self.active = Some(address);
                Ok(())
            }
            Some(_) => Err(CallEngineError::ConnectivityFailed(format!(
                "candidate {} has not been validated",
                address
            ))),
            None => Err(CallEngineError::ConnectivityFailed(format!(
                "unknown candidate {}",
                address
            ))),
        }
    }

    pub fn active(&self) -> Option<&TransportCandidate> {
        self.active.and_then(|addr| self.get(addr))
    }

    /// Drop the active candidate and mark it failed
    pub fn deactivate(&mut self) -> Option<SocketAddr> {
        let previous = self.active.take();
        if let Some(address) = previous {
            self.set_liveness(address, Liveness::Failed);
        }
        previous
    }

    /// Return every candidate to `Untested` for a fresh round of checks
    pub fn reset_liveness(&mut self) {
        for candidate in &mut self.candidates {
            candidate.liveness = Liveness::Untested;
        }
    }

    pub fn to_descriptors(&self) -> Vec<CandidateDescriptor> {
        self.candidates.iter().map(|c| c.to_descriptor()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_candidate_priority_order() {
        let host = TransportCandidate::host(addr(1));
        let prflx = TransportCandidate::peer_reflexive(addr(2));
        let srflx = TransportCandidate::server_reflexive(addr(3));
        let relay = TransportCandidate::relayed(addr(4));
        assert!(host.priority > prflx.priority);
        assert!(prflx.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
        assert_eq!(host.priority, 126 << 24 | 65535 << 8 | 255);
    }

    #[test]
    fn test_set_orders_and_dedupes() {
        let mut set = CandidateSet::new();
        assert!(set.add(TransportCandidate::relayed(addr(4))));
        assert!(set.add(TransportCandidate::host(addr(1))));
        assert!(set.add(TransportCandidate::server_reflexive(addr(3))));
        assert!(!set.add(TransportCandidate::host(addr(4))));

        let kinds: Vec<CandidateKind> = set.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CandidateKind::Host,
                CandidateKind::ServerReflexive,
                CandidateKind::Relayed
            ]
        );
    }

    #[test]
    fn test_at_most_one_active() {
        let mut set = CandidateSet::new();
        set.add(TransportCandidate::host(addr(1)));
        set.add(TransportCandidate::relayed(addr(2)));

        assert!(set.activate(addr(1)).is_err());
        set.set_liveness(addr(1), Liveness::Valid);
        set.set_liveness(addr(2), Liveness::Valid);
        set.activate(addr(1)).unwrap();
        set.activate(addr(2)).unwrap();
        assert_eq!(set.active().map(|c| c.address), Some(addr(2)));

        assert_eq!(set.deactivate(), Some(addr(2)));
        assert!(set.active().is_none());
        assert_eq!(set.get(addr(2)).unwrap().liveness, Liveness::Failed);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let candidate = TransportCandidate::server_reflexive(addr(9));
        let back = TransportCandidate::from_descriptor(&candidate.to_descriptor());
        assert_eq!(back, candidate);
    }
}
