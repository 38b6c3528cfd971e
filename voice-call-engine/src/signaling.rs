//! Outbound signaling
//!
//! The host application owns the messaging platform connection. The engine
//! hands it envelopes through `SignalingTransport`; inbound messages come
//! back through `SessionManager::on_incoming_signal`.
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
use async_trait::async_trait;
use callcore_types::{PeerId, SignalingEnvelope, SignalingMessage};
use tokio::sync::mpsc;
use tracing::debug;

/// Delivers signaling messages to the remote peer
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send an envelope addressed to `envelope.peer`
    async fn send(&self, envelope: SignalingEnvelope) -> CallEngineResult<()>;
}

/// Address and send a message
pub(crate) async fn send_to_peer(
    transport: &dyn SignalingTransport,
    peer: &PeerId,
    message: SignalingMessage,
) -> CallEngineResult<()> {
    debug!(peer = %peer, call_id = %message.call_id(), kind = message.kind(), "Sending signaling");
    transport
        .send(SignalingEnvelope::new(peer.clone(), message))
        .await
}

/// Signaling transport backed by an mpsc channel.
///
/// The receiving half is drained by the host (or a test harness) and
/// forwarded to the peer's engine.
pub struct ChannelSignaling {
    outgoing: mpsc::Sender<SignalingEnvelope>,
}

impl ChannelSignaling {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SignalingEnvelope>) {
        let (outgoing, rx) = mpsc::channel(capacity.max(1));
        (ChannelSignaling { outgoing }, rx)
    }
}

#[async_trait]
impl SignalingTransport for ChannelSignaling {
    async fn send(&self, envelope: SignalingEnvelope) -> CallEngineResult<()> {
        self.outgoing
            .send(envelope)
            .await
            .map_err(|_| CallEngineError::Signaling("signaling channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore_types::EndReason;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channel_signaling_addresses_peer() {
        let (signaling, mut rx) = ChannelSignaling::new(4);
        let call_id = Uuid::new_v4();
        send_to_peer(
            &signaling,
            &PeerId::from("@carol"),
            SignalingMessage::Hangup {
                call_id,
                reason: EndReason::Hangup,
            },
        )
        .await
        .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.peer.as_str(), "@carol");
        assert_eq!(envelope.message.call_id(), call_id);
    }

    #[test]
    fn test_full_queue_applies_back_pressure() {
        let (signaling, mut rx) = ChannelSignaling::new(1);
        let envelope = SignalingEnvelope::new(
            PeerId::from("@carol"),
            SignalingMessage::Hangup {
                call_id: Uuid::new_v4(),
                reason: EndReason::Hangup,
            },
        );
        tokio_test::block_on(signaling.send(envelope.clone())).unwrap();

        let mut second = tokio_test::task::spawn(signaling.send(envelope));
        tokio_test::assert_pending!(second.poll());
        assert!(rx.try_recv().is_ok());
        assert!(second.is_woken());
        tokio_test::assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_closed_channel_is_signaling_error() {
        let (signaling, rx) = ChannelSignaling::new(1);
        drop(rx);
        let result = send_to_peer(
            &signaling,
            &PeerId::from("@carol"),
            SignalingMessage::CallDecline {
                call_id: Uuid::new_v4(),
                reason: EndReason::Busy,
            },
        )
        .await;
        assert!(matches!(result, Err(CallEngineError::Signaling(_))));
    }
}
