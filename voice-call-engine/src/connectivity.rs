//! Connectivity checks
//!
//! Sans-IO driver that checks the peer's candidates with authenticated
//! pings and picks the path media should use. A direct path wins as soon as
//! it answers. A relayed path is taken only if no direct path answered
//! within the relay preference window, or if it answered fast enough that
//! waiting buys nothing.
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


use crate::candidates::{CandidateSet, Liveness, TransportCandidate};
use crate::error::{CallEngineError, CallEngineResult};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Ping/pong payload: an 8-byte transaction id
pub const PING_PAYLOAD_LEN: usize = 8;

pub fn encode_ping(txn: u64) -> [u8; PING_PAYLOAD_LEN] {
    txn.to_be_bytes()
}

pub fn decode_ping(payload: &[u8]) -> CallEngineResult<u64> {
    let bytes: [u8; PING_PAYLOAD_LEN] = payload
        .try_into()
        .map_err(|_| CallEngineError::MalformedPacket("ping payload must be 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Connectivity check configuration
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Minimum spacing between pings to different candidates
    pub pacing_ms: u64,
    /// Delay before re-pinging an unanswered candidate, grows linearly
    pub retransmit_ms: u64,
    /// Pings per candidate before it is marked failed
    pub max_attempts: u32,
    /// How long a validated relay waits for a direct path to answer
    pub relay_preference_ms: u64,
    /// A relay answering faster than this is taken immediately
    pub relay_rtt_threshold_ms: u64,
    /// Ping interval on an established path
    pub keepalive_interval_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        ConnectivityConfig {
            pacing_ms: 20,
            retransmit_ms: 200,
            max_attempts: 10,
            relay_preference_ms: 500,
            relay_rtt_threshold_ms: 30,
            keepalive_interval_ms: 1000,
        }
    }
}

impl ConnectivityConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// A ping to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub txn: u64,
}

/// Final verdict of a round of checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Selected { address: SocketAddr, rtt: Duration },
    Failed,
}

#[derive(Debug)]
struct Target {
    address: SocketAddr,
    priority: u32,
    direct: bool,
    attempts: u32,
    next_at: Instant,
    validated: Option<(Duration, Instant)>,
}

/// One round of connectivity checks over the remote candidates
#[derive(Debug)]
pub struct ConnectivityChecks {
    config: ConnectivityConfig,
    targets: Vec<Target>,
    in_flight: HashMap<u64, (SocketAddr, Instant)>,
    next_txn: u64,
    last_sent: Option<Instant>,
    deadline: Instant,
    outcome: Option<CheckOutcome>,
}

impl ConnectivityChecks {
    /// Start checking every candidate in `remote`, highest priority first
    pub fn new(config: ConnectivityConfig, remote: &CandidateSet, now: Instant, timeout: Duration) -> Self {
        let mut checks = ConnectivityChecks {
            config,
            targets: Vec::new(),
            in_flight: HashMap::new(),
            next_txn: rand::thread_rng().gen(),
            last_sent: None,
            deadline: now + timeout,
            outcome: None,
        };
        for candidate in remote.iter() {
            checks.add_candidate(candidate, now);
        }
        checks
    }

    /// Add a candidate learned after checks started
    pub fn add_candidate(&mut self, candidate: &TransportCandidate, now: Instant) {
        if self.targets.iter().any(|p| p.address == candidate.address) {
            return;
        }
        // Keep priority order; later arrivals of equal priority go last
        let position = self
            .targets
            .iter()
            .position(|p| p.priority < candidate.priority)
            .unwrap_or(self.targets.len());
        self.targets.insert(
            position,
            Target {
                address: candidate.address,
                priority: candidate.priority,
                direct: candidate.is_direct(),
                attempts: 0,
                next_at: now,
                validated: None,
            },
        );
    }

    /// Next ping to send, if one is due
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if self.outcome.is_some() {
            return None;
        }
        if let Some(last) = self.last_sent {
            if now < last + Duration::from_millis(self.config.pacing_ms) {
                return None;
            }
        }

        let max_attempts = self.config.max_attempts;
        let retransmit = Duration::from_millis(self.config.retransmit_ms);
        let target = self
            .targets
            .iter_mut()
            .find(|p| p.validated.is_none() && p.attempts < max_attempts && p.next_at <= now)?;

        target.attempts += 1;
        target.next_at = now + retransmit * target.attempts;
        let to = target.address;

        let txn = self.next_txn;
        self.next_txn = self.next_txn.wrapping_add(1);
        self.in_flight.insert(txn, (to, now));
        self.last_sent = Some(now);
        trace!(to = %to, txn, "Connectivity ping");
        Some(Transmit { to, txn })
    }

    /// Authenticated pong received. Returns the candidate it validated.
    pub fn on_pong(&mut self, txn: u64, now: Instant) -> Option<SocketAddr> {
        let (address, sent_at) = self.in_flight.remove(&txn)?;
        let rtt = now.saturating_duration_since(sent_at);
        let target = self.targets.iter_mut().find(|p| p.address == address)?;
        if target.validated.is_none() {
            target.validated = Some((rtt, now));
            debug!(address = %address, rtt_ms = rtt.as_millis() as u64, direct = target.direct, "Candidate validated");
        }
        Some(address)
    }

    /// Decide, if possible. Once decided, the outcome does not change.
    pub fn poll_outcome(&mut self, now: Instant) -> Option<CheckOutcome> {
        if self.outcome.is_none() {
            self.outcome = self.decide(now);
        }
        self.outcome.clone()
    }

    fn decide(&self, now: Instant) -> Option<CheckOutcome> {
        let best = |direct: bool| {
            self.targets
                .iter()
                .filter(|p| p.direct == direct)
                .filter_map(|p| p.validated.map(|(rtt, at)| (p.address, rtt, at)))
                .min_by_key(|(_, _, at)| *at)
        };

        if let Some((address, rtt, _)) = best(true) {
            return Some(CheckOutcome::Selected { address, rtt });
        }

        if let Some((address, rtt, validated_at)) = best(false) {
            let window = Duration::from_millis(self.config.relay_preference_ms);
            let fast = rtt < Duration::from_millis(self.config.relay_rtt_threshold_ms);
            let direct_pending = self.targets.iter().any(|p| p.direct && !self.exhausted(p, now));
            if fast || !direct_pending || now >= validated_at + window {
                return Some(CheckOutcome::Selected { address, rtt });
            }
        }

        let all_exhausted =
            !self.targets.is_empty() && self.targets.iter().all(|p| self.exhausted(p, now));
        if now >= self.deadline || all_exhausted {
            return Some(CheckOutcome::Failed);
        }
        None
    }

    /// Out of attempts and past the last retransmit wait
    fn exhausted(&self, target: &Target, now: Instant) -> bool {
        target.validated.is_none() && target.attempts >= self.config.max_attempts && now >= target.next_at
    }

    /// Earliest instant at which polling could make progress
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        let pacing = self
            .last_sent
            .map(|t| t + Duration::from_millis(self.config.pacing_ms))
            .unwrap_or(now);
        let window = Duration::from_millis(self.config.relay_preference_ms);
        let mut wake = self.deadline;
        for target in &self.targets {
            match target.validated {
                None if target.attempts < self.config.max_attempts => {
                    wake = wake.min(target.next_at.max(pacing));
                }
                // Exhausted: only the end of its last wait matters
                None if target.next_at > now => wake = wake.min(target.next_at),
                None => {}
                Some((_, at)) if at + window > now => wake = wake.min(at + window),
                Some(_) => {}
            }
        }
        wake.max(now)
    }

    /// Copy validation results into the candidate set
    pub fn apply_liveness(&self, set: &mut CandidateSet, now: Instant) {
        for target in &self.targets {
            let liveness = if target.validated.is_some() {
                Liveness::Valid
            } else if self.exhausted(target, now) {
                Liveness::Failed
            } else if target.attempts > 0 {
                Liveness::Checking
            } else {
                Liveness::Untested
            };
            set.set_liveness(target.address, liveness);
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn set(candidates: Vec<TransportCandidate>) -> CandidateSet {
        let mut set = CandidateSet::new();
        for c in candidates {
            set.add(c);
        }
        set
    }

    fn checks(remote: &CandidateSet, now: Instant) -> ConnectivityChecks {
        ConnectivityChecks::new(ConnectivityConfig::default(), remote, now, Duration::from_secs(5))
    }

    #[test]
    fn test_ping_payload() {
        assert_eq!(decode_ping(&encode_ping(0xDEAD_BEEF)).unwrap(), 0xDEAD_BEEF);
        assert!(decode_ping(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_pings_are_paced_in_priority_order() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::relayed(addr(3)),
            TransportCandidate::host(addr(1)),
        ]);
        let mut checks = checks(&remote, now);

        let first = checks.poll_transmit(now).unwrap();
        assert_eq!(first.to, addr(1));
        assert!(checks.poll_transmit(now).is_none());
        let second = checks.poll_transmit(now + Duration::from_millis(20)).unwrap();
        assert_eq!(second.to, addr(3));
        assert_ne!(first.txn, second.txn);
    }

    #[test]
    fn test_late_candidate_is_checked_by_priority() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        checks.add_candidate(&TransportCandidate::peer_reflexive(addr(2)), now);
        checks.add_candidate(&TransportCandidate::relayed(addr(4)), now);

        let order: Vec<SocketAddr> = (0..4)
            .map(|i| {
                let at = now + Duration::from_millis(20 * i);
                checks.poll_transmit(at).unwrap().to
            })
            .collect();
        assert_eq!(order, vec![addr(1), addr(2), addr(3), addr(4)]);
    }

    #[test]
    fn test_direct_wins_immediately() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        let direct = checks.poll_transmit(now).unwrap();
        let t1 = now + Duration::from_millis(20);
        checks.poll_transmit(t1).unwrap();

        assert_eq!(checks.on_pong(direct.txn, t1), Some(addr(1)));
        assert_eq!(
            checks.poll_outcome(t1),
            Some(CheckOutcome::Selected {
                address: addr(1),
                rtt: Duration::from_millis(20)
            })
        );
    }

    #[test]
    fn test_slow_relay_waits_for_direct() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        let direct = checks.poll_transmit(now).unwrap();
        let t1 = now + Duration::from_millis(20);
        let relay = checks.poll_transmit(t1).unwrap();

        // Relay answers slowly; direct still pending
        let t2 = now + Duration::from_millis(120);
        checks.on_pong(relay.txn, t2);
        assert_eq!(checks.poll_outcome(t2), None);

        // Direct answers inside the window and wins
        let t3 = now + Duration::from_millis(300);
        checks.on_pong(direct.txn, t3);
        match checks.poll_outcome(t3) {
            Some(CheckOutcome::Selected { address, .. }) => assert_eq!(address, addr(1)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_relay_selected_after_window() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        checks.poll_transmit(now).unwrap();
        let t1 = now + Duration::from_millis(20);
        let relay = checks.poll_transmit(t1).unwrap();
        let t2 = now + Duration::from_millis(100);
        checks.on_pong(relay.txn, t2);

        assert_eq!(checks.poll_outcome(t2 + Duration::from_millis(499)), None);
        match checks.poll_outcome(t2 + Duration::from_millis(500)) {
            Some(CheckOutcome::Selected { address, .. }) => assert_eq!(address, addr(3)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_fast_relay_taken_at_once() {
        let now = Instant::now();
        let remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        checks.poll_transmit(now).unwrap();
        let t1 = now + Duration::from_millis(20);
        let relay = checks.poll_transmit(t1).unwrap();
        let t2 = t1 + Duration::from_millis(5);
        checks.on_pong(relay.txn, t2);
        assert!(matches!(
            checks.poll_outcome(t2),
            Some(CheckOutcome::Selected { .. })
        ));
    }

    #[test]
    fn test_timeout_fails() {
        let now = Instant::now();
        let remote = set(vec![TransportCandidate::host(addr(1))]);
        let mut checks = checks(&remote, now);
        assert_eq!(checks.poll_outcome(now), None);
        assert_eq!(
            checks.poll_outcome(now + Duration::from_secs(5)),
            Some(CheckOutcome::Failed)
        );
    }

    #[test]
    fn test_unknown_pong_ignored_and_retransmits_back_off() {
        let now = Instant::now();
        let remote = set(vec![TransportCandidate::host(addr(1))]);
        let mut checks = checks(&remote, now);
        let first = checks.poll_transmit(now).unwrap();
        assert_eq!(checks.on_pong(first.txn.wrapping_add(99), now), None);

        assert!(checks.poll_transmit(now + Duration::from_millis(100)).is_none());
        let again = checks.poll_transmit(now + Duration::from_millis(200)).unwrap();
        assert_eq!(again.to, addr(1));
        // Second retransmit waits twice as long
        assert!(checks.poll_transmit(now + Duration::from_millis(500)).is_none());
        assert!(checks.poll_transmit(now + Duration::from_millis(600)).is_some());
    }

    #[test]
    fn test_liveness_written_back() {
        let now = Instant::now();
        let mut remote = set(vec![
            TransportCandidate::host(addr(1)),
            TransportCandidate::relayed(addr(3)),
        ]);
        let mut checks = checks(&remote, now);
        let ping = checks.poll_transmit(now).unwrap();
        checks.on_pong(ping.txn, now);
        checks.apply_liveness(&mut remote, now);
        assert_eq!(remote.get(addr(1)).unwrap().liveness, Liveness::Valid);
        assert_eq!(remote.get(addr(3)).unwrap().liveness, Liveness::Untested);
        remote.activate(addr(1)).unwrap();
    }

    #[test]
    fn test_late_candidate_is_checked() {
        let now = Instant::now();
        let mut checks = checks(&CandidateSet::new(), now);
        assert!(checks.poll_transmit(now).is_none());
        checks.add_candidate(&TransportCandidate::peer_reflexive(addr(7)), now);
        assert_eq!(checks.poll_transmit(now).unwrap().to, addr(7));
    }
}
