//! Error types for the voice call engine
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


use crate::call_state::InvalidTransition;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type CallEngineResult<T> = Result<T, CallEngineError>;

/// Errors that can occur in the call engine
#[derive(Error, Debug)]
pub enum CallEngineError {
    /// Peer key material is degenerate, out of range or inconsistent.
    /// Always fatal to the call.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A datagram could not be decoded or authenticated. Dropped and counted.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// No candidate validated within the connectivity timeout
    #[error("Connectivity failed: {0}")]
    ConnectivityFailed(String),

    /// The active candidate stopped responding
    #[error("Candidate lost: {0}")]
    CandidateLost(String),

    /// The peer already has an active call
    #[error("Peer is busy: {peer}")]
    Busy { peer: String },

    /// Audio codec failure; concealed rather than fatal
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Unknown or already finished call
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: Uuid },

    /// State machine rejected an event
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Socket level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Proxy negotiation failure
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Encryption/decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signaling message could not be produced or delivered
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The engine or call task has shut down
    #[error("Engine closed")]
    Closed,
}

impl CallEngineError {
    /// Errors absorbed locally (drop, conceal, retry) rather than ending the call
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallEngineError::MalformedPacket(_)
                | CallEngineError::CodecError(_)
                | CallEngineError::CandidateLost(_)
                | CallEngineError::Network(_)
        )
    }
}

impl From<std::io::Error> for CallEngineError {
    fn from(err: std::io::Error) -> Self {
        CallEngineError::Network(err.to_string())
    }
}

impl From<callcore_types::TypesError> for CallEngineError {
    fn from(err: callcore_types::TypesError) -> Self {
        CallEngineError::Signaling(err.to_string())
    }
}

impl From<callcore_config::ConfigError> for CallEngineError {
    fn from(err: callcore_config::ConfigError) -> Self {
        CallEngineError::Config(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CallEngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CallEngineError::Closed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CallEngineError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        CallEngineError::Closed
    }
}
