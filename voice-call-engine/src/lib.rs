//! Encrypted point-to-point voice call engine
//!
//! This crate provides everything below the host's messaging layer:
//! - Commit-then-reveal X25519 key agreement and AES-256-GCM packet sealing
//! - A compact packet framing with selective acknowledgement
//! - Candidate gathering (host, STUN, relays, SOCKS5) and connectivity checks
//! - Adaptive jitter buffer, loss concealment and congestion control
//! - A per-call state machine driven by one task per call
//!
//! Hosts interact through [`SessionManager`], register a
//! [`CallEventHandler`] for lifecycle events and supply a
//! [`SignalingTransport`] that carries signaling to the remote peer.
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


pub mod error;
pub mod config;
pub mod key_exchange;
pub mod packet_codec;
pub mod packet_crypto;
pub mod ack_window;
pub mod candidates;
pub mod stun;
pub mod proxy;
pub mod transport;
pub mod connectivity;
pub mod connection_health;
pub mod congestion_control;
pub mod audio_codec;
pub mod media_frame;
pub mod jitter_buffer;
pub mod packet_loss_concealment;
pub mod audio_pipeline;
pub mod audio_io;
pub mod call_state;
pub mod call_session;
pub mod signaling;
pub mod events;
pub mod session_manager;
mod call;

// Re-export main types
pub use error::{CallEngineError, CallEngineResult};
pub use config::{CallTimeouts, EngineConfig};
pub use key_exchange::{ExchangeOutcome, KeyExchange, KeyFingerprint, SessionKeys};
pub use packet_codec::{AckInfo, Packet, PacketHeader, PacketKind};
pub use packet_crypto::PacketCipher;
pub use ack_window::{AckVerdict, ReceiveWindow, RecordOutcome, SendHistory};
pub use candidates::{CandidateSet, Liveness, TransportCandidate};
pub use transport::{CallTransport, DatagramTransport, UdpTransport};
pub use proxy::Socks5UdpTransport;
pub use connectivity::{CheckOutcome, ConnectivityChecks, ConnectivityConfig};
pub use connection_health::{ConnectionHealthMonitor, ConnectionQuality, NetworkMetrics};
pub use congestion_control::{CongestionControlConfig, CongestionController};
pub use audio_codec::{AudioCodec, QualityTier};
pub use media_frame::MediaFrame;
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterStats};
pub use packet_loss_concealment::{AudioPlc, AudioPlcConfig};
pub use audio_pipeline::{AudioConfig, MediaPipeline, MediaStats, PlayoutFrame};
pub use audio_io::{
    AudioSink, AudioSource, ChannelSink, ChannelSource, NullSink, PcmQueueSource,
    SilenceSource, ToneSource,
};
pub use call_state::{CallState, CallStateEvent, CallStateMachine, TerminationReason};
pub use call_session::{CallInfo, CallRole, CallStats};
pub use signaling::{ChannelSignaling, SignalingTransport};
pub use events::{CallEventHandler, ChannelEventHandler, EngineEvent, NoopEventHandler};
pub use session_manager::SessionManager;
