//! Call lifecycle state machine
//!
//! ```text
//! Pending -> ExchangingKeys -> WaitingForConnectivity -> Established <-> Reconnecting
//!                |                     |                                   |
//!                +------> Failed <-----+-----------------------------------+
//! any non-terminal state --hangup/decline/missed--> Ended
//! ```
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


use callcore_types::EndReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Created, not yet initiated or accepted
    Pending,
    /// Agreeing the session key
    ExchangingKeys,
    /// Key agreed, racing transport candidates
    WaitingForConnectivity,
    /// Media flowing over an active candidate
    Established,
    /// Active candidate lost, revalidating
    Reconnecting,
    /// Closed by either party
    Ended,
    /// Closed by an unrecoverable error
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Whether media should be flowing
    pub fn carries_media(&self) -> bool {
        matches!(self, CallState::Established | CallState::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Pending => "pending",
            CallState::ExchangingKeys => "exchanging_keys",
            CallState::WaitingForConnectivity => "waiting_for_connectivity",
            CallState::Established => "established",
            CallState::Reconnecting => "reconnecting",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Busy,
    Missed,
    Incompatible,
    InvalidKeyMaterial,
    KeyExchangeTimeout,
    ConnectivityFailed,
    ReconnectionFailed,
    /// Peer reported its media path failed
    RemoteFailure,
    /// Signaling could not be delivered to the peer
    SignalingFailed,
    /// Engine shut down under the call
    Shutdown,
}

impl TerminationReason {
    /// Reason to put on the wire when telling the peer
    pub fn to_end_reason(&self) -> EndReason {
        match self {
            TerminationReason::LocalHangup
            | TerminationReason::RemoteHangup
            | TerminationReason::Shutdown => EndReason::Hangup,
            TerminationReason::Declined => EndReason::Declined,
            TerminationReason::Busy => EndReason::Busy,
            TerminationReason::Missed => EndReason::Missed,
            TerminationReason::Incompatible => EndReason::Incompatible,
            TerminationReason::InvalidKeyMaterial
            | TerminationReason::KeyExchangeTimeout
            | TerminationReason::ConnectivityFailed
            | TerminationReason::ReconnectionFailed
            | TerminationReason::RemoteFailure
            | TerminationReason::SignalingFailed => EndReason::Disconnected,
        }
    }

    /// Local reason for a hangup or decline received from the peer
    pub fn from_remote(reason: EndReason) -> Self {
        match reason {
            EndReason::Hangup => TerminationReason::RemoteHangup,
            EndReason::Declined => TerminationReason::Declined,
            EndReason::Busy => TerminationReason::Busy,
            EndReason::Missed => TerminationReason::Missed,
            EndReason::Incompatible => TerminationReason::Incompatible,
            EndReason::Disconnected => TerminationReason::RemoteFailure,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStateEvent {
    /// Outgoing call placed
    Initiate,
    /// Incoming call accepted by the host
    Accepted,
    KeyDerived,
    /// Peer key material rejected
    KeyExchangeFailed,
    KeyExchangeTimeout,
    CandidateValidated,
    ConnectivityTimeout,
    CandidateLost,
    CandidateRevalidated,
    /// Reconnection deadline passed or attempts exhausted
    ReconnectionTimeout,
    Hangup(TerminationReason),
}

impl CallStateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallStateEvent::Initiate => "initiate",
            CallStateEvent::Accepted => "accepted",
            CallStateEvent::KeyDerived => "key_derived",
            CallStateEvent::KeyExchangeFailed => "key_exchange_failed",
            CallStateEvent::KeyExchangeTimeout => "key_exchange_timeout",
            CallStateEvent::CandidateValidated => "candidate_validated",
            CallStateEvent::ConnectivityTimeout => "connectivity_timeout",
            CallStateEvent::CandidateLost => "candidate_lost",
            CallStateEvent::CandidateRevalidated => "candidate_revalidated",
            CallStateEvent::ReconnectionTimeout => "reconnection_timeout",
            CallStateEvent::Hangup(_) => "hangup",
        }
    }

    /// Reason recorded when this event ends the call
    fn termination_reason(&self) -> Option<TerminationReason> {
        match self {
            CallStateEvent::KeyExchangeFailed => Some(TerminationReason::InvalidKeyMaterial),
            CallStateEvent::KeyExchangeTimeout => Some(TerminationReason::KeyExchangeTimeout),
            CallStateEvent::ConnectivityTimeout => Some(TerminationReason::ConnectivityFailed),
            CallStateEvent::ReconnectionTimeout => Some(TerminationReason::ReconnectionFailed),
            CallStateEvent::Hangup(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Event not valid in the current state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition: {event} in state {from}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub event: &'static str,
}

/// Pure transition table
pub fn next_state(from: CallState, event: CallStateEvent) -> Result<CallState, InvalidTransition> {
    use CallState::*;
    use CallStateEvent as E;

    let to = match (from, event) {
        (Ended | Failed, _) => None,
        (_, E::Hangup(_)) => Some(Ended),
        // Bad key material is fatal wherever it shows up
        (_, E::KeyExchangeFailed) => Some(Failed),
        (Pending, E::Initiate | E::Accepted) => Some(ExchangingKeys),
        (ExchangingKeys, E::KeyDerived) => Some(WaitingForConnectivity),
        (ExchangingKeys, E::KeyExchangeTimeout) => Some(Failed),
        (WaitingForConnectivity, E::CandidateValidated) => Some(Established),
        (WaitingForConnectivity, E::ConnectivityTimeout) => Some(Failed),
        (Established, E::CandidateLost) => Some(Reconnecting),
        (Reconnecting, E::CandidateRevalidated) => Some(Established),
        (Reconnecting, E::ReconnectionTimeout) => Some(Failed),
        _ => None,
    };

    to.ok_or(InvalidTransition {
        from,
        event: event.name(),
    })
}

/// State plus the reason it terminated
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    termination: Option<TerminationReason>,
}

impl CallStateMachine {
    pub fn new() -> Self {
        CallStateMachine {
            state: CallState::Pending,
            termination: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Apply an event. The state is unchanged on error.
    pub fn apply(&mut self, event: CallStateEvent) -> Result<CallState, InvalidTransition> {
        let to = next_state(self.state, event)?;
        if to.is_terminal() {
            self.termination = event.termination_reason();
        }
        self.state = to;
        Ok(to)
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_reconnect() {
        let mut machine = CallStateMachine::new();
        let script = [
            (CallStateEvent::Initiate, CallState::ExchangingKeys),
            (CallStateEvent::KeyDerived, CallState::WaitingForConnectivity),
            (CallStateEvent::CandidateValidated, CallState::Established),
            (CallStateEvent::CandidateLost, CallState::Reconnecting),
            (CallStateEvent::CandidateRevalidated, CallState::Established),
            (
                CallStateEvent::Hangup(TerminationReason::LocalHangup),
                CallState::Ended,
            ),
        ];
        for (event, expected) in script {
            assert_eq!(machine.apply(event).unwrap(), expected);
        }
        assert_eq!(machine.termination(), Some(TerminationReason::LocalHangup));
    }

    #[test]
    fn test_failures_record_reason() {
        let mut machine = CallStateMachine::new();
        machine.apply(CallStateEvent::Accepted).unwrap();
        assert_eq!(
            machine.apply(CallStateEvent::KeyExchangeFailed).unwrap(),
            CallState::Failed
        );
        assert_eq!(
            machine.termination(),
            Some(TerminationReason::InvalidKeyMaterial)
        );

        let mut machine = CallStateMachine::new();
        machine.apply(CallStateEvent::Initiate).unwrap();
        machine.apply(CallStateEvent::KeyDerived).unwrap();
        machine.apply(CallStateEvent::ConnectivityTimeout).unwrap();
        assert_eq!(
            machine.termination(),
            Some(TerminationReason::ConnectivityFailed)
        );
    }

    #[test]
    fn test_invalid_key_material_fails_from_any_live_state() {
        let paths: [&[CallStateEvent]; 4] = [
            &[],
            &[CallStateEvent::Accepted],
            &[CallStateEvent::Initiate, CallStateEvent::KeyDerived],
            &[
                CallStateEvent::Initiate,
                CallStateEvent::KeyDerived,
                CallStateEvent::CandidateValidated,
            ],
        ];
        for path in paths {
            let mut machine = CallStateMachine::new();
            for event in path {
                machine.apply(*event).unwrap();
            }
            assert_eq!(
                machine.apply(CallStateEvent::KeyExchangeFailed).unwrap(),
                CallState::Failed
            );
            assert_eq!(
                machine.termination(),
                Some(TerminationReason::InvalidKeyMaterial)
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut machine = CallStateMachine::new();
        machine
            .apply(CallStateEvent::Hangup(TerminationReason::Missed))
            .unwrap();
        let err = machine
            .apply(CallStateEvent::Hangup(TerminationReason::LocalHangup))
            .unwrap_err();
        assert_eq!(err.from, CallState::Ended);
        assert_eq!(machine.termination(), Some(TerminationReason::Missed));
    }

    #[test]
    fn test_out_of_order_event_rejected() {
        let mut machine = CallStateMachine::new();
        assert!(machine.apply(CallStateEvent::CandidateValidated).is_err());
        assert_eq!(machine.state(), CallState::Pending);
    }

    #[test]
    fn test_remote_reason_mapping() {
        assert_eq!(
            TerminationReason::from_remote(EndReason::Hangup),
            TerminationReason::RemoteHangup
        );
        assert_eq!(
            TerminationReason::ConnectivityFailed.to_end_reason(),
            EndReason::Disconnected
        );
    }
}
