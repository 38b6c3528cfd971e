//! Call session records
//!
//! The session manager owns one `CallSession` per call. Call tasks and
//! other subordinates refer to it only through a `CallRef`, so a report
//! from a call that has since been replaced is recognised and dropped.
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


use crate::audio_codec::QualityTier;
use crate::call_state::{CallState, TerminationReason};
use crate::key_exchange::KeyFingerprint;
use callcore_types::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Responder,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallRole::Initiator => f.write_str("initiator"),
            CallRole::Responder => f.write_str("responder"),
        }
    }
}

/// Handle held by subordinates instead of the session itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallRef {
    pub id: Uuid,
    pub generation: u64,
}

/// Host-visible snapshot of a call. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: Uuid,
    pub peer: PeerId,
    pub role: CallRole,
    pub state: CallState,
    pub protocol_version: Option<u32>,
    pub codec: Option<String>,
    pub fingerprint: Option<KeyFingerprint>,
    pub created_at: DateTime<Utc>,
    pub termination: Option<TerminationReason>,
}

/// Diagnostic counters for one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Our packets the peer never acknowledged
    pub packets_lost: u64,
    pub malformed_dropped: u64,
    pub duplicates_dropped: u64,
    /// Outgoing datagrams dropped because the send queue was full
    pub send_queue_drops: u64,
    pub smoothed_rtt_ms: f64,
    pub loss_rate: f32,
    pub reconnects: u32,
    pub quality_tier: QualityTier,
    pub jitter_target_frames: usize,
    pub frames_concealed: u64,
    pub signal_bars: u8,
}

impl Default for CallStats {
    fn default() -> Self {
        CallStats {
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packets_lost: 0,
            malformed_dropped: 0,
            duplicates_dropped: 0,
            send_queue_drops: 0,
            smoothed_rtt_ms: 0.0,
            loss_rate: 0.0,
            reconnects: 0,
            quality_tier: QualityTier::Medium,
            jitter_target_frames: 0,
            frames_concealed: 0,
            signal_bars: 0,
        }
    }
}

/// What a call task reports back to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUpdate {
    State {
        state: CallState,
        reason: Option<TerminationReason>,
    },
    Negotiated {
        protocol_version: u32,
        codec: String,
    },
    KeyDerived(KeyFingerprint),
}

/// Manager-owned record of one call
#[derive(Debug, Clone)]
pub struct CallSession {
    generation: u64,
    info: CallInfo,
}

impl CallSession {
    pub fn new(call_id: Uuid, peer: PeerId, role: CallRole, generation: u64) -> Self {
        CallSession {
            generation,
            info: CallInfo {
                call_id,
                peer,
                role,
                state: CallState::Pending,
                protocol_version: None,
                codec: None,
                fingerprint: None,
                created_at: Utc::now(),
                termination: None,
            },
        }
    }

    pub fn call_ref(&self) -> CallRef {
        CallRef {
            id: self.info.call_id,
            generation: self.generation,
        }
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn peer(&self) -> &PeerId {
        &self.info.peer
    }

    pub fn state(&self) -> CallState {
        self.info.state
    }

    pub fn is_terminated(&self) -> bool {
        self.info.state.is_terminal()
    }

    /// Record negotiated parameters before the task starts
    pub fn set_negotiated(&mut self, protocol_version: u32, codec: String) {
        self.info.protocol_version = Some(protocol_version);
        self.info.codec = Some(codec);
    }

    /// Apply a report. Returns true when the state changed.
    ///
    /// Reports from another generation, and anything after a terminal
    /// state, are ignored.
    pub fn apply(&mut self, call: CallRef, update: CallUpdate) -> bool {
        if call != self.call_ref() || self.is_terminated() {
            return false;
        }
        match update {
            CallUpdate::State { state, reason } => {
                if state == self.info.state {
                    return false;
                }
                self.info.state = state;
                if state.is_terminal() {
                    self.info.termination = reason;
                }
                true
            }
            CallUpdate::Negotiated {
                protocol_version,
                codec,
            } => {
                self.set_negotiated(protocol_version, codec);
                false
            }
            CallUpdate::KeyDerived(fingerprint) => {
                self.info.fingerprint = Some(fingerprint);
                false
            }
        }
    }

    /// Mark terminated without a task report (task gone or never started)
    pub fn terminate(&mut self, reason: TerminationReason) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.info.state = CallState::Ended;
        self.info.termination = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(Uuid::new_v4(), PeerId::from("@bob"), CallRole::Initiator, 7)
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut session = session();
        let stale = CallRef {
            id: session.info().call_id,
            generation: 6,
        };
        let changed = session.apply(
            stale,
            CallUpdate::State {
                state: CallState::Established,
                reason: None,
            },
        );
        assert!(!changed);
        assert_eq!(session.state(), CallState::Pending);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut session = session();
        let call = session.call_ref();
        assert!(session.apply(
            call,
            CallUpdate::State {
                state: CallState::Failed,
                reason: Some(TerminationReason::ConnectivityFailed),
            },
        ));
        assert!(!session.apply(
            call,
            CallUpdate::State {
                state: CallState::Established,
                reason: None,
            },
        ));
        assert!(!session.terminate(TerminationReason::LocalHangup));
        assert_eq!(
            session.info().termination,
            Some(TerminationReason::ConnectivityFailed)
        );
    }

    #[test]
    fn test_negotiation_recorded() {
        let mut session = session();
        let call = session.call_ref();
        session.apply(
            call,
            CallUpdate::Negotiated {
                protocol_version: 2,
                codec: "pcm".to_string(),
            },
        );
        assert_eq!(session.info().protocol_version, Some(2));
        assert_eq!(session.info().codec.as_deref(), Some("pcm"));
    }
}
