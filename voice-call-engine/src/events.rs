//! Host events
//!
//! The engine never calls into the host from a call or media task. Events
//! go onto an mpsc channel and a dedicated dispatch task invokes the
//! registered `CallEventHandler`.
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


use crate::call_session::CallInfo;
use callcore_types::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Something the host should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    IncomingCall(CallInfo),
    StateChanged(CallInfo),
    SignalingError {
        peer: PeerId,
        call_id: Option<Uuid>,
        error: String,
    },
}

/// Typed callbacks, one per event. All have empty defaults.
pub trait CallEventHandler: Send + Sync {
    /// A call is ringing; answer with `accept_call` or `decline_call`
    fn on_incoming_call(&self, _call: &CallInfo) {}

    fn on_state_changed(&self, _call: &CallInfo) {}

    /// A signaling message could not be processed or delivered
    fn on_signaling_error(&self, _peer: &PeerId, _call_id: Option<Uuid>, _error: &str) {}
}

/// Handler that ignores everything
pub struct NoopEventHandler;

impl CallEventHandler for NoopEventHandler {}

/// Handler that forwards every event into a channel
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelEventHandler { tx }, rx)
    }
}

impl CallEventHandler for ChannelEventHandler {
    fn on_incoming_call(&self, call: &CallInfo) {
        let _ = self.tx.send(EngineEvent::IncomingCall(call.clone()));
    }

    fn on_state_changed(&self, call: &CallInfo) {
        let _ = self.tx.send(EngineEvent::StateChanged(call.clone()));
    }

    fn on_signaling_error(&self, peer: &PeerId, call_id: Option<Uuid>, error: &str) {
        let _ = self.tx.send(EngineEvent::SignalingError {
            peer: peer.clone(),
            call_id,
            error: error.to_string(),
        });
    }
}

/// Spawn the dispatch task. It ends when every sender is dropped.
pub fn spawn_dispatcher(
    handler: Arc<dyn CallEventHandler>,
    mut events: mpsc::Receiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                EngineEvent::IncomingCall(call) => handler.on_incoming_call(call),
                EngineEvent::StateChanged(call) => {
                    debug!(call_id = %call.call_id, state = %call.state, "Dispatching state change");
                    handler.on_state_changed(call)
                }
                EngineEvent::SignalingError {
                    peer,
                    call_id,
                    error,
                } => {
                    warn!(peer = %peer, error = %error, "Signaling error");
                    handler.on_signaling_error(peer, *call_id, error)
                }
            }
        }
        debug!("Event dispatcher stopped");
    })
}
