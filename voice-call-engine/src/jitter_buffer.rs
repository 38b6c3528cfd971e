//! Adaptive jitter buffer for incoming audio frames
//!
//! Frames are held by frame sequence number and released on a fixed
//! playout cadence. A slot whose frame has not arrived in time is reported
//! missing so the caller can conceal it; playout never waits.
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


use crate::media_frame::MediaFrame;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Jitter buffer configuration
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Minimum latency in milliseconds
    pub min_latency_ms: u32,
    /// Maximum latency in milliseconds
    pub max_latency_ms: u32,
    /// Initial latency in milliseconds
    pub initial_latency_ms: u32,
    /// Playout frame duration in milliseconds
    pub frame_duration_ms: u32,
    /// Enable adaptive buffering
    pub adaptive: bool,
    /// Clean pulls required before the target shrinks by one frame
    pub stable_pulls_before_decay: u32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        JitterBufferConfig {
            min_latency_ms: 20,
            max_latency_ms: 300,
            initial_latency_ms: 40,
            frame_duration_ms: 20,
            adaptive: true,
            stable_pulls_before_decay: 50,
        }
    }
}

/// Result of inserting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    /// Frame seq already buffered
    Duplicate,
    /// Its playout slot already passed
    Late,
}

/// Result of one playout pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playout {
    Frame(MediaFrame),
    /// Slot for this frame seq passed without the frame
    Missing(u32),
    /// Delay inserted after the target grew; nothing released
    Hold,
    /// Still filling to the target depth
    Buffering,
}

/// Buffer counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterStats {
    pub depth: usize,
    pub target_depth: usize,
    pub jitter_ms: f64,
    pub late: u64,
    pub duplicates: u64,
    pub missing: u64,
    pub overflow_dropped: u64,
}

/// Adaptive jitter buffer
pub struct JitterBuffer {
    config: JitterBufferConfig,
    frames: BTreeMap<u32, MediaFrame>,
    /// Next frame seq due for playout, set once prefill completes
    next_seq: Option<u32>,
    /// Last frame seq released or declared missing
    last_played: Option<u32>,
    target_depth: usize,
    min_depth: usize,
    max_depth: usize,
    /// RFC 3550 interarrival jitter, milliseconds
    jitter_ms: f64,
    reference: Option<(Instant, u32)>,
    last_transit_ms: Option<f64>,
    stable_pulls: u32,
    consecutive_missing: usize,
    pending_holds: usize,
    shrink_pending: bool,
    stats: JitterStats,
}

impl JitterBuffer {
    /// Create a new jitter buffer
    pub fn new(config: JitterBufferConfig) -> Self {
        let frame_ms = config.frame_duration_ms.max(1);
        let frames_for = |ms: u32| ((ms + frame_ms - 1) / frame_ms).max(1) as usize;
        let min_depth = frames_for(config.min_latency_ms);
        let max_depth = frames_for(config.max_latency_ms).max(min_depth);
        let target_depth = frames_for(config.initial_latency_ms).clamp(min_depth, max_depth);

        JitterBuffer {
            config,
            frames: BTreeMap::new(),
            next_seq: None,
            last_played: None,
            target_depth,
            min_depth,
            max_depth,
            jitter_ms: 0.0,
            reference: None,
            last_transit_ms: None,
            stable_pulls: 0,
            consecutive_missing: 0,
            pending_holds: 0,
            shrink_pending: false,
            stats: JitterStats::default(),
        }
    }

    fn is_before(a: u32, b: u32) -> bool {
        let diff = b.wrapping_sub(a);
        diff != 0 && diff < 0x8000_0000
    }

    /// Insert a received frame that arrived at `arrived_at`
    pub fn insert(&mut self, frame: MediaFrame, arrived_at: Instant) -> InsertOutcome {
        let seq = frame.seq;

        let late = match self.last_played {
            Some(played) => !Self::is_before(played, seq),
            None => false,
        };
        if late {
            self.stats.late += 1;
            if self.config.adaptive {
                self.grow_target(self.target_depth + 1);
            }
            trace!(seq, target_depth = self.target_depth, "Late frame dropped");
            return InsertOutcome::Late;
        }
        if self.frames.contains_key(&seq) {
            self.stats.duplicates += 1;
            return InsertOutcome::Duplicate;
        }

        self.update_jitter(seq, arrived_at);
        if self.config.adaptive {
            let wanted = self.depth_for_jitter();
            self.grow_target(wanted);
        }

        self.frames.insert(seq, frame);
        InsertOutcome::Accepted
    }

    fn update_jitter(&mut self, seq: u32, arrived_at: Instant) {
        let (ref_instant, ref_seq) = *self.reference.get_or_insert((arrived_at, seq));
        let arrival_ms = if arrived_at >= ref_instant {
            arrived_at.duration_since(ref_instant).as_secs_f64() * 1000.0
        } else {
            -(ref_instant.duration_since(arrived_at).as_secs_f64() * 1000.0)
        };
        let send_ms =
            seq.wrapping_sub(ref_seq) as i32 as f64 * self.config.frame_duration_ms as f64;
        let transit = arrival_ms - send_ms;

        if let Some(last) = self.last_transit_ms {
            let d = (transit - last).abs();
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.last_transit_ms = Some(transit);
    }

    /// Depth that covers the current jitter estimate
    fn depth_for_jitter(&self) -> usize {
        let frame_ms = self.config.frame_duration_ms.max(1) as f64;
        let frames = 1 + (3.0 * self.jitter_ms / frame_ms).round() as usize;
        frames.clamp(self.min_depth, self.max_depth)
    }

    fn grow_target(&mut self, wanted: usize) {
        let wanted = wanted.min(self.max_depth);
        if wanted > self.target_depth {
            trace!(from = self.target_depth, to = wanted, "Jitter target raised");
            if self.next_seq.is_some() {
                self.pending_holds += wanted - self.target_depth;
            }
            self.target_depth = wanted;
            self.stable_pulls = 0;
        }
    }

    /// Release the next frame for playout. Never blocks.
    pub fn pull(&mut self) -> Playout {
        let mut next = match self.next_seq {
            Some(_) if self.pending_holds > 0 => {
                self.pending_holds -= 1;
                self.stable_pulls = 0;
                return Playout::Hold;
            }
            Some(next) => next,
            None => {
                if self.frames.len() < self.target_depth {
                    return Playout::Buffering;
                }
                match self.frames.keys().next() {
                    Some(first) => *first,
                    None => return Playout::Buffering,
                }
            }
        };

        // Keep latency bounded when frames pile up or the target shrank
        let slack = if self.shrink_pending { 1 } else { 2 };
        self.shrink_pending = false;
        while self.frames.len() > self.target_depth + slack {
            match self.frames.pop_first() {
                Some((seq, _)) => {
                    self.stats.overflow_dropped += 1;
                    next = self
                        .frames
                        .keys()
                        .next()
                        .copied()
                        .unwrap_or_else(|| seq.wrapping_add(1));
                }
                None => break,
            }
        }

        self.next_seq = Some(next.wrapping_add(1));
        self.last_played = Some(next);

        match self.frames.remove(&next) {
            Some(frame) => {
                self.consecutive_missing = 0;
                self.on_clean_pull();
                Playout::Frame(frame)
            }
            None => {
                self.stats.missing += 1;
                self.stable_pulls = 0;
                self.consecutive_missing += 1;
                if self.frames.is_empty() && self.consecutive_missing > self.max_depth {
                    // Sender went quiet; prefill again when it resumes
                    self.resync();
                }
                Playout::Missing(next)
            }
        }
    }

    fn resync(&mut self) {
        self.next_seq = None;
        self.last_played = None;
        self.reference = None;
        self.last_transit_ms = None;
        self.pending_holds = 0;
        self.consecutive_missing = 0;
    }

    fn on_clean_pull(&mut self) {
        if !self.config.adaptive {
            return;
        }
        self.stable_pulls += 1;
        if self.stable_pulls >= self.config.stable_pulls_before_decay {
            self.stable_pulls = 0;
            let floor = self.depth_for_jitter();
            if self.target_depth > floor {
                self.target_depth -= 1;
                self.shrink_pending = true;
                trace!(target_depth = self.target_depth, "Jitter target decayed");
            }
        }
    }

    /// Frames currently buffered
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn target_depth(&self) -> usize {
        self.target_depth
    }

    /// Target latency
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_depth as u64 * self.config.frame_duration_ms as u64)
    }

    /// Get jitter estimate
    pub fn jitter_estimate(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_ms.max(0.0) / 1000.0)
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            depth: self.frames.len(),
            target_depth: self.target_depth,
            jitter_ms: self.jitter_ms,
            ..self.stats.clone()
        }
    }

    /// Drop everything, e.g. after the peer changes path
    pub fn reset(&mut self) {
        self.frames.clear();
        self.resync();
        self.stable_pulls = 0;
    }
}
