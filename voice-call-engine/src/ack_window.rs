//! Sequence tracking for acknowledgements
//!
//! `ReceiveWindow` remembers the last 32 packet sequence numbers seen from
//! the peer and produces the `(base, bitmask)` pair piggybacked on every
//! outgoing header. `SendHistory` turns the peer's reports back into
//! delivered/lost verdicts and round-trip samples.
//!
//! Only authenticated packets are recorded, so a forged header cannot
//! move the window.
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


use crate::packet_codec::AckInfo;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Number of sequence numbers covered by one ack report
pub const ACK_WINDOW: u32 = 32;

/// Send history entries kept before the oldest are written off
const MAX_HISTORY: usize = 512;

/// Result of recording an incoming sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First sighting. `lost` counts sequences that left the window unseen.
    New { lost: u32 },
    /// Already seen; drop silently
    Duplicate,
    /// Older than the window can describe
    TooOld,
}

/// Sliding receive window
#[derive(Debug, Clone, Default)]
pub struct ReceiveWindow {
    start: Option<u32>,
    highest: u32,
    mask: u32,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seq` lies at or after the first sequence we ever saw
    fn expected(&self, seq: u32) -> bool {
        match self.start {
            Some(start) => seq.wrapping_sub(start) <= self.highest.wrapping_sub(start),
            None => false,
        }
    }

    /// Record an incoming sequence number
    pub fn record(&mut self, seq: u32) -> RecordOutcome {
        if self.start.is_none() {
            self.start = Some(seq);
            self.highest = seq;
            self.mask = 1;
            return RecordOutcome::New { lost: 0 };
        }

        let ahead = seq.wrapping_sub(self.highest);
        if ahead == 0 {
            return RecordOutcome::Duplicate;
        }

        if ahead < 0x8000_0000 {
            let mut lost = 0;

            // Slots already in the window that shift out unseen
            for i in 0..ACK_WINDOW {
                let slot = self.highest.wrapping_sub(i);
                if i + ahead.min(ACK_WINDOW) >= ACK_WINDOW
                    && self.mask & (1 << i) == 0
                    && self.expected(slot)
                {
                    lost += 1;
                }
            }

            // Sequences skipped entirely by a jump wider than the window
            if ahead > ACK_WINDOW {
                lost += ahead - ACK_WINDOW;
            }

            self.mask = if ahead >= ACK_WINDOW { 0 } else { self.mask << ahead };
            self.mask |= 1;
            self.highest = seq;
            return RecordOutcome::New { lost };
        }

        let behind = self.highest.wrapping_sub(seq);
        if behind >= ACK_WINDOW || !self.expected(seq) {
            return RecordOutcome::TooOld;
        }
        let bit = 1u32 << behind;
        if self.mask & bit != 0 {
            return RecordOutcome::Duplicate;
        }
        self.mask |= bit;
        RecordOutcome::New { lost: 0 }
    }

    /// Ack report for the next outgoing header
    pub fn ack(&self) -> AckInfo {
        AckInfo {
            base: self.highest,
            mask: self.mask,
        }
    }

    /// Sequences inside the window not yet received, oldest first
    pub fn missing_in_window(&self) -> Vec<u32> {
        if self.start.is_none() {
            return Vec::new();
        }
        (0..ACK_WINDOW)
            .rev()
            .filter(|i| self.mask & (1 << i) == 0)
            .map(|i| self.highest.wrapping_sub(i))
            .filter(|seq| self.expected(*seq))
            .collect()
    }

    pub fn highest(&self) -> Option<u32> {
        self.start.map(|_| self.highest)
    }
}

/// What a peer ack report told us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckVerdict {
    pub delivered: Vec<u32>,
    pub lost: Vec<u32>,
    pub rtt: Option<Duration>,
}

/// Outstanding packets awaiting acknowledgement
#[derive(Debug, Default)]
pub struct SendHistory {
    outstanding: BTreeMap<u32, Instant>,
    delivered_total: u64,
    lost_total: u64,
}

impl SendHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a packet we just sent
    pub fn on_sent(&mut self, seq: u32, sent_at: Instant) {
        self.outstanding.insert(seq, sent_at);
        while self.outstanding.len() > MAX_HISTORY {
            if self.outstanding.pop_first().is_some() {
                self.lost_total += 1;
            }
        }
    }

    /// Apply an ack report received at `now`
    pub fn on_ack(&mut self, ack: AckInfo, now: Instant) -> AckVerdict {
        let mut verdict = AckVerdict::default();

        // An empty mask means the peer has received nothing yet
        if ack.acknowledges(ack.base) {
            if let Some(sent_at) = self.outstanding.get(&ack.base) {
                verdict.rtt = Some(now.saturating_duration_since(*sent_at));
            }
        }

        let mut settled = Vec::new();
        for seq in self.outstanding.keys() {
            let behind = ack.base.wrapping_sub(*seq);
            if behind >= 0x8000_0000 {
                // Newer than anything the peer has reported
                continue;
            }
            if ack.acknowledges(*seq) {
                verdict.delivered.push(*seq);
                settled.push(*seq);
            } else if behind >= ACK_WINDOW {
                verdict.lost.push(*seq);
                settled.push(*seq);
            }
        }
        for seq in settled {
            self.outstanding.remove(&seq);
        }

        self.delivered_total += verdict.delivered.len() as u64;
        self.lost_total += verdict.lost.len() as u64;
        verdict
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total
    }

    pub fn lost_total(&self) -> u64 {
        self.lost_total
    }
}
