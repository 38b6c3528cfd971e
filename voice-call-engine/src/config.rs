//! Engine configuration
//!
//! `EngineConfig` gathers the per-module configs. Build it from the
//! application's environment-driven `AppConfig`, or start from `Default`
//! and override fields in code.
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


use crate::audio_pipeline::AudioConfig;
use crate::congestion_control::CongestionControlConfig;
use crate::connectivity::ConnectivityConfig;
use crate::error::{CallEngineError, CallEngineResult};
use crate::jitter_buffer::JitterBufferConfig;
use crate::packet_loss_concealment::AudioPlcConfig;
use callcore_config::{AppConfig, ProxyConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

/// Call lifecycle deadlines
#[derive(Debug, Clone)]
pub struct CallTimeouts {
    /// Unanswered calls end as missed after this
    pub ring: Duration,
    pub key_exchange: Duration,
    /// No candidate validated within this fails the call
    pub connectivity: Duration,
    /// Silence on the active candidate before it counts as lost
    pub candidate_grace: Duration,
    /// Per reconnection attempt
    pub reconnect: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        CallTimeouts {
            ring: Duration::from_secs(45),
            key_exchange: Duration::from_secs(10),
            connectivity: Duration::from_secs(15),
            candidate_grace: Duration::from_millis(3000),
            reconnect: Duration::from_secs(10),
            max_reconnect_attempts: 3,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local UDP bind address
    pub bind_address: SocketAddr,
    /// STUN server (`host:port`) for reflexive candidates
    pub stun_server: Option<String>,
    /// Forwarding relays advertised as relayed candidates. The engine does
    /// not allocate on them; each must already forward to this endpoint.
    pub relay_servers: Vec<SocketAddr>,
    /// SOCKS5 proxy; `None` means direct connectivity
    pub proxy: Option<ProxyConfig>,
    /// Surface incoming calls to the host, or auto-decline them
    pub accept_incoming: bool,
    pub audio: AudioConfig,
    pub jitter_buffer: JitterBufferConfig,
    pub plc: AudioPlcConfig,
    pub congestion: CongestionControlConfig,
    pub connectivity: ConnectivityConfig,
    pub timeouts: CallTimeouts,
    /// Outgoing datagram queue per call
    pub send_queue_capacity: usize,
    /// Buffered host events before senders wait
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            stun_server: None,
            relay_servers: Vec::new(),
            proxy: None,
            accept_incoming: true,
            audio: AudioConfig::default(),
            jitter_buffer: JitterBufferConfig::default(),
            plc: AudioPlcConfig::default(),
            congestion: CongestionControlConfig::default(),
            connectivity: ConnectivityConfig::default(),
            timeouts: CallTimeouts::default(),
            send_queue_capacity: 256,
            event_queue_capacity: 128,
        }
    }
}

impl EngineConfig {
    /// Loopback-only configuration for tests and the demo binary
    pub fn loopback() -> Self {
        EngineConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    /// Build from application config, reporting unparsable addresses
    pub fn from_app_config(app: &AppConfig) -> CallEngineResult<Self> {
        let bind_address = app.bind_address.parse().map_err(|e| {
            CallEngineError::Config(format!("invalid bind address {}: {}", app.bind_address, e))
        })?;
        let relay_servers = app
            .relay_servers
            .iter()
            .map(|relay| {
                relay.parse().map_err(|e| {
                    CallEngineError::Config(format!("invalid relay address {}: {}", relay, e))
                })
            })
            .collect::<CallEngineResult<Vec<SocketAddr>>>()?;

        let mut config = EngineConfig::from(app);
        config.bind_address = bind_address;
        config.relay_servers = relay_servers;
        Ok(config)
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(app: &AppConfig) -> Self {
        let defaults = EngineConfig::default();

        let bind_address = app.bind_address.parse().unwrap_or_else(|_| {
            warn!(bind_address = %app.bind_address, "Unparsable bind address, using default");
            defaults.bind_address
        });
        let relay_servers = app
            .relay_servers
            .iter()
            .filter_map(|relay| match relay.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(relay = %relay, "Skipping unparsable relay address");
                    None
                }
            })
            .collect();

        let timeouts = &app.timeouts;
        EngineConfig {
            bind_address,
            stun_server: app.stun_server.clone(),
            relay_servers,
            proxy: app.proxy.clone(),
            accept_incoming: app.accept_incoming,
            audio: AudioConfig {
                sample_rate: app.audio.sample_rate,
                frame_duration_ms: app.audio.frame_ms,
                codec: app.audio.codec.clone(),
            },
            jitter_buffer: JitterBufferConfig {
                min_latency_ms: app.jitter.min_latency_ms,
                max_latency_ms: app.jitter.max_latency_ms,
                initial_latency_ms: app.jitter.initial_latency_ms,
                frame_duration_ms: app.audio.frame_ms,
                ..defaults.jitter_buffer
            },
            plc: AudioPlcConfig {
                max_conceal_frames: app.jitter.max_conceal_frames,
                ..defaults.plc
            },
            timeouts: CallTimeouts {
                ring: Duration::from_secs(timeouts.ring_timeout_secs),
                key_exchange: Duration::from_secs(timeouts.key_exchange_timeout_secs),
                connectivity: Duration::from_secs(timeouts.connectivity_timeout_secs),
                candidate_grace: Duration::from_millis(timeouts.candidate_grace_ms),
                reconnect: Duration::from_secs(timeouts.reconnect_timeout_secs),
                max_reconnect_attempts: timeouts.max_reconnect_attempts,
            },
            ..defaults
        }
    }
}
