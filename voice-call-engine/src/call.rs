//! Call task
//!
//! One actor per call owns the state machine, the key exchange, the packet
//! cipher and the ack windows. It reacts to host commands, signaling,
//! datagrams from the receive loop, output of the media task and its own
//! deadlines, all from a single `select!` loop. Only this task ever holds
//! the call's key material.
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


use crate::audio_codec::supported_codecs;
use crate::audio_io::{AudioSink, AudioSource};
use crate::audio_pipeline::MediaPipeline;
use crate::call_session::{CallRef, CallRole, CallStats, CallUpdate};
use crate::call_state::{CallState, CallStateEvent, CallStateMachine, TerminationReason};
use crate::candidates::{CandidateSet, TransportCandidate};
use crate::config::EngineConfig;
use crate::connection_health::{ConnectionHealthMonitor, NetworkMetrics};
use crate::connectivity::{decode_ping, encode_ping, CheckOutcome, ConnectivityChecks};
use crate::error::{CallEngineError, CallEngineResult};
use crate::key_exchange::{ExchangeOutcome, KeyExchange, KeyFingerprint, SessionKeys};
use crate::ack_window::{ReceiveWindow, RecordOutcome, SendHistory};
use crate::media_frame::MediaFrame;
use crate::packet_codec::PacketKind;
use crate::packet_crypto::PacketCipher;
use crate::signaling::{send_to_peer, SignalingTransport};
use crate::transport::{gather_candidates, open_transport, CallTransport, Inbound};
use callcore_types::{ExchangeMaterial, PeerId, ProtocolRange, SignalingMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const COMMAND_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 256;
const MEDIA_QUEUE: usize = 64;

/// Link health and stats publication cadence
const HEALTH_INTERVAL: Duration = Duration::from_millis(250);

/// Ack-only packets while the microphone is muted
const MUTED_ACK_INTERVAL: Duration = Duration::from_millis(100);

/// Keepalive pings older than this are forgotten
const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(10);

/// Media task stats cadence, in frames
const MEDIA_STATS_EVERY: u64 = 25;

/// Host and manager requests to a call
pub(crate) enum CallCommand {
    /// Host answered an incoming call
    Accept,
    Signal(SignalingMessage),
    Hangup(TerminationReason),
    SetMicMuted(bool),
    SetAudioSource(Box<dyn AudioSource>),
    SetAudioSink(Box<dyn AudioSink>),
}

/// Update sent from a call task to the manager
#[derive(Debug, Clone)]
pub(crate) struct CallReport {
    pub call: CallRef,
    pub update: CallUpdate,
}

/// How a call comes into being
pub(crate) enum CallStart {
    Outgoing,
    /// Negotiation already done by the manager
    Incoming {
        protocol_version: u32,
        codec: String,
        commitment: ExchangeMaterial,
    },
}

pub(crate) struct CallParams {
    pub call: CallRef,
    pub peer: PeerId,
    pub config: Arc<EngineConfig>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub reports: mpsc::UnboundedSender<CallReport>,
    pub start: CallStart,
    pub source: Box<dyn AudioSource>,
    pub sink: Box<dyn AudioSink>,
}

/// Manager-side handle to a running call task
pub(crate) struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    stats: watch::Receiver<CallStats>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub async fn send(&self, command: CallCommand) -> CallEngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallEngineError::Closed)
    }

    pub fn stats(&self) -> watch::Receiver<CallStats> {
        self.stats.clone()
    }

    /// Wait up to `limit` for the call task to exit
    pub async fn join(&mut self, limit: Duration) -> bool {
        if self.task.is_finished() {
            return true;
        }
        tokio::time::timeout(limit, &mut self.task).await.is_ok()
    }
}

/// Codec list for a call request, preferred codec first
pub(crate) fn offered_codecs(preferred: &str) -> Vec<String> {
    let mut codecs = supported_codecs();
    if let Some(position) = codecs.iter().position(|c| c.eq_ignore_ascii_case(preferred)) {
        let codec = codecs.remove(position);
        codecs.insert(0, codec);
    }
    codecs
}

/// Spawn the task for one call
pub(crate) fn spawn_call(params: CallParams) -> CallHandle {
    let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (stats_tx, stats) = watch::channel(CallStats::default());
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
    let (media_tx, media_out) = mpsc::channel(MEDIA_QUEUE);
    let (shutdown, _) = watch::channel(false);

    let role = match params.start {
        CallStart::Outgoing => CallRole::Initiator,
        CallStart::Incoming { .. } => CallRole::Responder,
    };
    let now = Instant::now();

    let actor = CallActor {
        call: params.call,
        peer: params.peer,
        role,
        config: params.config,
        signaling: params.signaling,
        reports: params.reports,
        machine: CallStateMachine::new(),
        protocol_version: None,
        codec: None,
        exchange: None,
        pending_material: None,
        fingerprint: None,
        cipher: None,
        transport: None,
        inbound_tx,
        remote: CandidateSet::new(),
        checks: None,
        reconnect_attempts: 0,
        next_seq: 0,
        rx_window: ReceiveWindow::new(),
        history: SendHistory::new(),
        keepalives: HashMap::new(),
        next_keepalive_txn: 1,
        confirmation_sent: false,
        health: None,
        media: None,
        media_tx,
        source: Some(params.source),
        sink: Some(params.sink),
        mic_muted: false,
        ring_deadline: None,
        key_deadline: None,
        connectivity_deadline: None,
        next_keepalive: now,
        next_health: now,
        next_muted_ack: now,
        stats: CallStats::default(),
        stats_tx,
        shutdown,
    };

    let task = tokio::spawn(actor.run(params.start, commands, inbound, media_out));
    CallHandle {
        commands: commands_tx,
        stats,
        task,
    }
}

enum MediaControl {
    Frame(MediaFrame, Instant),
    Metrics(NetworkMetrics),
    SetMuted(bool),
    SetSource(Box<dyn AudioSource>),
    SetSink(Box<dyn AudioSink>),
}

enum MediaOutput {
    Frame(MediaFrame),
    Stats {
        tier: crate::audio_codec::QualityTier,
        jitter_target: usize,
        concealed: u64,
    },
}

struct CallActor {
    call: CallRef,
    peer: PeerId,
    role: CallRole,
    config: Arc<EngineConfig>,
    signaling: Arc<dyn SignalingTransport>,
    reports: mpsc::UnboundedSender<CallReport>,
    machine: CallStateMachine,

    protocol_version: Option<u32>,
    codec: Option<String>,
    exchange: Option<KeyExchange>,
    /// Responder's public value, sent once the host accepts
    pending_material: Option<ExchangeMaterial>,
    fingerprint: Option<KeyFingerprint>,
    cipher: Option<PacketCipher>,

    transport: Option<CallTransport>,
    inbound_tx: mpsc::Sender<Inbound>,
    remote: CandidateSet,
    checks: Option<ConnectivityChecks>,
    reconnect_attempts: u32,

    next_seq: u32,
    rx_window: ReceiveWindow,
    history: SendHistory,
    keepalives: HashMap<u64, Instant>,
    next_keepalive_txn: u64,
    confirmation_sent: bool,
    health: Option<ConnectionHealthMonitor>,

    media: Option<mpsc::Sender<MediaControl>>,
    media_tx: mpsc::Sender<MediaOutput>,
    source: Option<Box<dyn AudioSource>>,
    sink: Option<Box<dyn AudioSink>>,
    mic_muted: bool,

    ring_deadline: Option<Instant>,
    key_deadline: Option<Instant>,
    connectivity_deadline: Option<Instant>,
    next_keepalive: Instant,
    next_health: Instant,
    next_muted_ack: Instant,

    stats: CallStats,
    stats_tx: watch::Sender<CallStats>,
    shutdown: watch::Sender<bool>,
}

impl CallActor {
    async fn run(
        mut self,
        start: CallStart,
        mut commands: mpsc::Receiver<CallCommand>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut media_out: mpsc::Receiver<MediaOutput>,
    ) {
        info!(call_id = %self.call.id, peer = %self.peer, role = %self.role, "Call task started");
        self.begin(start).await;

        while !self.machine.state().is_terminal() {
            let now = Instant::now();
            let wake = self.next_wakeup(now).max(now + Duration::from_millis(1));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // Manager is gone
                    None => self.hang_up(TerminationReason::Shutdown, true).await,
                },
                Some(datagram) = inbound.recv() => self.on_datagram(datagram).await,
                Some(output) = media_out.recv() => self.on_media_output(output).await,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    self.on_timer(Instant::now()).await
                }
            }
        }

        self.publish_stats();
        info!(
            call_id = %self.call.id,
            state = %self.machine.state(),
            reason = ?self.machine.termination(),
            "Call task finished"
        );
    }

    async fn begin(&mut self, start: CallStart) {
        let now = Instant::now();
        self.ring_deadline = Some(now + self.config.timeouts.ring);

        match start {
            CallStart::Outgoing => {
                let (exchange, material) = KeyExchange::begin(CallRole::Initiator, self.call.id);
                self.exchange = Some(exchange);
                self.transition(CallStateEvent::Initiate);

                let request = SignalingMessage::CallRequest {
                    call_id: self.call.id,
                    protocol: ProtocolRange::current(),
                    codecs: offered_codecs(&self.config.audio.codec),
                    material,
                };
                if let Err(e) = self.signal(request).await {
                    warn!(call_id = %self.call.id, error = %e, "Could not send call request");
                    self.transition(CallStateEvent::Hangup(TerminationReason::SignalingFailed));
                }
            }
            CallStart::Incoming {
                protocol_version,
                codec,
                commitment,
            } => {
                self.set_negotiated(protocol_version, codec);
                let (mut exchange, material) = KeyExchange::begin(CallRole::Responder, self.call.id);
                match exchange.on_material(commitment) {
                    Ok(ExchangeOutcome::NeedMore) => {
                        self.exchange = Some(exchange);
                        self.pending_material = Some(material);
                    }
                    Ok(ExchangeOutcome::Complete { .. }) | Err(_) => {
                        warn!(call_id = %self.call.id, "Call request carried unusable key material");
                        exchange.abort();
                        self.notify_failure().await;
                        self.transition(CallStateEvent::KeyExchangeFailed);
                    }
                }
            }
        }
    }

    fn set_negotiated(&mut self, protocol_version: u32, codec: String) {
        self.protocol_version = Some(protocol_version);
        self.codec = Some(codec.clone());
        self.report(CallUpdate::Negotiated {
            protocol_version,
            codec,
        });
    }

    async fn on_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Accept => self.on_accept().await,
            CallCommand::Signal(message) => self.on_signal(message).await,
            CallCommand::Hangup(reason) => self.hang_up(reason, true).await,
            CallCommand::SetMicMuted(muted) => {
                self.mic_muted = muted;
                self.next_muted_ack = Instant::now();
                self.to_media(MediaControl::SetMuted(muted));
                debug!(call_id = %self.call.id, muted, "Microphone mute changed");
            }
            CallCommand::SetAudioSource(source) => match &self.media {
                Some(_) => self.to_media(MediaControl::SetSource(source)),
                None => self.source = Some(source),
            },
            CallCommand::SetAudioSink(sink) => match &self.media {
                Some(_) => self.to_media(MediaControl::SetSink(sink)),
                None => self.sink = Some(sink),
            },
        }
    }

    async fn on_accept(&mut self) {
        if self.role != CallRole::Responder || self.machine.state() != CallState::Pending {
            debug!(call_id = %self.call.id, state = %self.machine.state(), "Ignoring accept");
            return;
        }
        let (Some(material), Some(protocol_version), Some(codec)) = (
            self.pending_material.take(),
            self.protocol_version,
            self.codec.clone(),
        ) else {
            return;
        };

        self.ring_deadline = None;
        self.key_deadline = Some(Instant::now() + self.config.timeouts.key_exchange);
        self.transition(CallStateEvent::Accepted);

        let accept = SignalingMessage::CallAccept {
            call_id: self.call.id,
            protocol_version,
            codec,
            material,
        };
        if let Err(e) = self.signal(accept).await {
            warn!(call_id = %self.call.id, error = %e, "Could not send call accept");
            self.transition(CallStateEvent::Hangup(TerminationReason::SignalingFailed));
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::CallAccept {
                protocol_version,
                codec,
                material,
                ..
            } => {
                if self.role != CallRole::Initiator
                    || self.machine.state() != CallState::ExchangingKeys
                    || self.protocol_version.is_some()
                {
                    debug!(call_id = %self.call.id, "Ignoring unexpected call accept");
                    return;
                }
                let range = ProtocolRange::current();
                let version_ok = (range.min..=range.max).contains(&protocol_version);
                let codec_ok = supported_codecs().iter().any(|c| c == &codec);
                if !version_ok || !codec_ok {
                    warn!(call_id = %self.call.id, protocol_version, codec = %codec, "Peer accepted with unsupported parameters");
                    self.hang_up(TerminationReason::Incompatible, true).await;
                    return;
                }

                self.set_negotiated(protocol_version, codec);
                self.ring_deadline = None;
                self.key_deadline = Some(Instant::now() + self.config.timeouts.key_exchange);
                self.on_material(material).await;
            }
            SignalingMessage::KeyExchangeMaterial { material, .. } => {
                if self.machine.state() == CallState::ExchangingKeys {
                    self.on_material(material).await;
                } else {
                    debug!(call_id = %self.call.id, state = %self.machine.state(), "Ignoring key material");
                }
            }
            SignalingMessage::Candidates { candidates, .. } => {
                let now = Instant::now();
                for descriptor in &candidates {
                    let candidate = TransportCandidate::from_descriptor(descriptor);
                    if let Some(checks) = self.checks.as_mut() {
                        checks.add_candidate(&candidate, now);
                    }
                    self.remote.add(candidate);
                }
                debug!(call_id = %self.call.id, count = candidates.len(), "Remote candidates received");
                self.maybe_start_checks(now);
            }
            SignalingMessage::CallDecline { reason, .. } | SignalingMessage::Hangup { reason, .. } => {
                self.hang_up(TerminationReason::from_remote(reason), false).await;
            }
            SignalingMessage::CallRequest { .. } => {
                debug!(call_id = %self.call.id, "Ignoring repeated call request");
            }
        }
    }

    async fn on_material(&mut self, material: ExchangeMaterial) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        match exchange.on_material(material) {
            Ok(ExchangeOutcome::NeedMore) => {}
            Ok(ExchangeOutcome::Complete { keys, reply }) => {
                self.exchange = None;
                if let Some(reply) = reply {
                    let reveal = SignalingMessage::KeyExchangeMaterial {
                        call_id: self.call.id,
                        material: reply,
                    };
                    if let Err(e) = self.signal(reveal).await {
                        warn!(call_id = %self.call.id, error = %e, "Could not send key material");
                        self.transition(CallStateEvent::Hangup(TerminationReason::SignalingFailed));
                        return;
                    }
                }
                self.on_keys(keys).await;
            }
            Err(e) => {
                error!(call_id = %self.call.id, error = %e, "Key exchange failed");
                if let Some(mut exchange) = self.exchange.take() {
                    exchange.abort();
                }
                self.notify_failure().await;
                self.transition(CallStateEvent::KeyExchangeFailed);
            }
        }
    }

    async fn on_keys(&mut self, keys: SessionKeys) {
        let cipher = match PacketCipher::new(&keys) {
            Ok(cipher) => cipher,
            Err(e) => {
                error!(call_id = %self.call.id, error = %e, "Cipher setup failed");
                self.notify_failure().await;
                self.transition(CallStateEvent::KeyExchangeFailed);
                return;
            }
        };
        let fingerprint = keys.fingerprint();
        drop(keys);

        self.cipher = Some(cipher);
        self.fingerprint = Some(fingerprint);
        self.key_deadline = None;
        self.report(CallUpdate::KeyDerived(fingerprint));
        info!(call_id = %self.call.id, fingerprint = %fingerprint, "Session key derived");
        self.transition(CallStateEvent::KeyDerived);

        let now = Instant::now();
        self.connectivity_deadline = Some(now + self.config.timeouts.connectivity);
        if let Err(e) = self.open_path().await {
            error!(call_id = %self.call.id, error = %e, "Could not open media transport");
            self.notify_failure().await;
            self.transition(CallStateEvent::ConnectivityTimeout);
            return;
        }
        self.maybe_start_checks(Instant::now());
    }

    /// Bind the socket, gather and advertise candidates, start the loops
    async fn open_path(&mut self) -> CallEngineResult<()> {
        let socket = open_transport(&self.config).await?;
        let local = gather_candidates(socket.as_ref(), &self.config).await?;

        let transport = CallTransport::start(
            self.call.id,
            socket,
            self.inbound_tx.clone(),
            self.config.send_queue_capacity,
            self.shutdown.subscribe(),
        )?;
        debug!(call_id = %self.call.id, local = %transport.local_addr(), "Media transport open");
        self.transport = Some(transport);
        self.health = Some(ConnectionHealthMonitor::new(
            self.call.id,
            self.config.timeouts.candidate_grace,
            Instant::now(),
        ));

        let candidates = SignalingMessage::Candidates {
            call_id: self.call.id,
            candidates: local.iter().map(|c| c.to_descriptor()).collect(),
        };
        self.signal(candidates).await
    }

    fn maybe_start_checks(&mut self, now: Instant) {
        if self.machine.state() == CallState::WaitingForConnectivity
            && self.checks.is_none()
            && self.transport.is_some()
            && !self.remote.is_empty()
        {
            let remaining = self
                .connectivity_deadline
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(self.config.timeouts.connectivity);
            self.checks = Some(ConnectivityChecks::new(
                self.config.connectivity.clone(),
                &self.remote,
                now,
                remaining,
            ));
        }
    }

    async fn on_datagram(&mut self, datagram: Inbound) {
        let Some(cipher) = self.cipher.as_ref() else {
            self.stats.malformed_dropped += 1;
            return;
        };
        let packet = match cipher.open(&datagram.data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(call_id = %self.call.id, from = %datagram.from, error = %e, "Dropping packet");
                self.stats.malformed_dropped += 1;
                return;
            }
        };

        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.data.len() as u64;
        match self.rx_window.record(packet.header.seq) {
            RecordOutcome::New { lost } => {
                if lost > 0 {
                    trace!(call_id = %self.call.id, lost, "Inbound sequences left the window unseen");
                }
            }
            RecordOutcome::Duplicate | RecordOutcome::TooOld => {
                self.stats.duplicates_dropped += 1;
                return;
            }
        }

        let now = datagram.received_at;
        let verdict = self.history.on_ack(packet.header.ack, now);
        if let Some(health) = self.health.as_mut() {
            health.record_packet_received(now);
            health.record_delivery(verdict.delivered.len(), verdict.lost.len());
            if let Some(rtt) = verdict.rtt {
                health.record_rtt(rtt);
            }
        }
        self.stats.packets_lost = self.history.lost_total();

        match packet.header.kind {
            PacketKind::Ping => {
                let Ok(txn) = decode_ping(&packet.payload) else {
                    self.stats.malformed_dropped += 1;
                    return;
                };
                if self.remote.get(datagram.from).is_none() {
                    let candidate = TransportCandidate::peer_reflexive(datagram.from);
                    debug!(call_id = %self.call.id, address = %datagram.from, "Learned peer-reflexive candidate");
                    if let Some(checks) = self.checks.as_mut() {
                        checks.add_candidate(&candidate, now);
                    }
                    self.remote.add(candidate);
                }
                self.send_packet(PacketKind::Pong, &encode_ping(txn), datagram.from, false)
                    .await;
            }
            PacketKind::Pong => {
                let Ok(txn) = decode_ping(&packet.payload) else {
                    self.stats.malformed_dropped += 1;
                    return;
                };
                if let Some(sent_at) = self.keepalives.remove(&txn) {
                    if let Some(health) = self.health.as_mut() {
                        health.record_rtt(now.saturating_duration_since(sent_at));
                    }
                } else if let Some(checks) = self.checks.as_mut() {
                    checks.on_pong(txn, now);
                    self.drive_checks(Instant::now()).await;
                }
            }
            PacketKind::Media => match MediaFrame::parse(&packet.payload) {
                Ok(frame) => self.to_media(MediaControl::Frame(frame, now)),
                Err(_) => self.stats.malformed_dropped += 1,
            },
            PacketKind::KeyExchange => {
                let matches = self
                    .fingerprint
                    .map(|f| f.as_bytes().as_slice() == packet.payload.as_ref())
                    .unwrap_or(false);
                if !matches {
                    error!(call_id = %self.call.id, "Peer key confirmation does not match");
                    self.notify_failure().await;
                    self.transition(CallStateEvent::KeyExchangeFailed);
                }
            }
            PacketKind::SignalingAck => {}
        }
    }

    async fn on_media_output(&mut self, output: MediaOutput) {
        match output {
            MediaOutput::Frame(frame) => {
                if let Some(active) = self.active_address() {
                    self.send_packet(PacketKind::Media, &frame.to_bytes(), active, true)
                        .await;
                }
            }
            MediaOutput::Stats {
                tier,
                jitter_target,
                concealed,
            } => {
                self.stats.quality_tier = tier;
                self.stats.jitter_target_frames = jitter_target;
                self.stats.frames_concealed = concealed;
            }
        }
    }

    async fn on_timer(&mut self, now: Instant) {
        if self.ring_deadline.is_some_and(|d| now >= d) {
            info!(call_id = %self.call.id, "Call not answered in time");
            self.ring_deadline = None;
            self.hang_up(TerminationReason::Missed, true).await;
            return;
        }

        if self.key_deadline.is_some_and(|d| now >= d) {
            warn!(call_id = %self.call.id, "Key exchange timed out");
            self.key_deadline = None;
            if let Some(mut exchange) = self.exchange.take() {
                exchange.abort();
            }
            self.notify_failure().await;
            self.transition(CallStateEvent::KeyExchangeTimeout);
            return;
        }

        if self.machine.state() == CallState::WaitingForConnectivity
            && self.checks.is_none()
            && self.connectivity_deadline.is_some_and(|d| now >= d)
        {
            warn!(call_id = %self.call.id, "No remote candidates before the deadline");
            self.notify_failure().await;
            self.transition(CallStateEvent::ConnectivityTimeout);
            return;
        }

        self.drive_checks(now).await;

        if !self.machine.state().carries_media() {
            return;
        }

        if now >= self.next_health {
            self.next_health = now + HEALTH_INTERVAL;
            self.check_health(now).await;
            if !self.machine.state().carries_media() {
                return;
            }
        }

        if now >= self.next_keepalive {
            self.next_keepalive = now + self.config.connectivity.keepalive_interval();
            if let Some(active) = self.active_address() {
                let txn = self.next_keepalive_txn;
                self.next_keepalive_txn = self.next_keepalive_txn.wrapping_add(1);
                self.keepalives.retain(|_, sent| now.saturating_duration_since(*sent) < KEEPALIVE_EXPIRY);
                self.keepalives.insert(txn, now);
                self.send_packet(PacketKind::Ping, &encode_ping(txn), active, false)
                    .await;
            }
        }

        if self.mic_muted && now >= self.next_muted_ack {
            self.next_muted_ack = now + MUTED_ACK_INTERVAL;
            if let Some(active) = self.active_address() {
                self.send_packet(PacketKind::SignalingAck, &[], active, true).await;
            }
        }
    }

    /// Send due pings and act on a decided outcome
    async fn drive_checks(&mut self, now: Instant) {
        let mut due = Vec::new();
        let outcome = match self.checks.as_mut() {
            Some(checks) => {
                while let Some(transmit) = checks.poll_transmit(now) {
                    due.push(transmit);
                }
                checks.poll_outcome(now)
            }
            None => return,
        };

        for transmit in due {
            self.send_packet(PacketKind::Ping, &encode_ping(transmit.txn), transmit.to, false)
                .await;
        }

        match outcome {
            Some(CheckOutcome::Selected { address, rtt }) => self.on_path_selected(address, rtt, now).await,
            Some(CheckOutcome::Failed) => self.on_checks_failed(now).await,
            None => {}
        }
    }

    async fn on_path_selected(&mut self, address: std::net::SocketAddr, rtt: Duration, now: Instant) {
        if let Some(checks) = self.checks.take() {
            checks.apply_liveness(&mut self.remote, now);
        }
        if let Err(e) = self.remote.activate(address) {
            warn!(call_id = %self.call.id, error = %e, "Selected candidate could not be activated");
            return;
        }
        if let Some(health) = self.health.as_mut() {
            health.reset(now);
            health.record_rtt(rtt);
        }
        self.connectivity_deadline = None;
        self.reconnect_attempts = 0;
        self.next_keepalive = now + self.config.connectivity.keepalive_interval();
        self.next_health = now + HEALTH_INTERVAL;

        let kind = self.remote.active().map(|c| c.kind);
        info!(call_id = %self.call.id, address = %address, kind = ?kind, rtt_ms = rtt.as_millis() as u64, "Media path selected");

        let event = match self.machine.state() {
            CallState::Reconnecting => CallStateEvent::CandidateRevalidated,
            _ => CallStateEvent::CandidateValidated,
        };
        if !self.transition(event) {
            return;
        }

        if !self.confirmation_sent {
            if let Some(fingerprint) = self.fingerprint {
                self.send_packet(PacketKind::KeyExchange, fingerprint.as_bytes(), address, false)
                    .await;
                self.confirmation_sent = true;
            }
        }
        if self.media.is_none() {
            self.start_media().await;
        }
    }

    async fn on_checks_failed(&mut self, now: Instant) {
        self.checks = None;
        match self.machine.state() {
            CallState::WaitingForConnectivity => {
                warn!(call_id = %self.call.id, "No candidate answered");
                self.notify_failure().await;
                self.transition(CallStateEvent::ConnectivityTimeout);
            }
            CallState::Reconnecting => {
                if self.reconnect_attempts < self.config.timeouts.max_reconnect_attempts {
                    self.start_reconnect_round(now);
                } else {
                    warn!(call_id = %self.call.id, attempts = self.reconnect_attempts, "Reconnection failed");
                    self.notify_failure().await;
                    self.transition(CallStateEvent::ReconnectionTimeout);
                }
            }
            _ => {}
        }
    }

    fn start_reconnect_round(&mut self, now: Instant) {
        self.reconnect_attempts += 1;
        self.stats.reconnects += 1;
        self.remote.reset_liveness();
        self.checks = Some(ConnectivityChecks::new(
            self.config.connectivity.clone(),
            &self.remote,
            now,
            self.config.timeouts.reconnect,
        ));
        info!(call_id = %self.call.id, attempt = self.reconnect_attempts, "Revalidating candidates");
    }

    async fn check_health(&mut self, now: Instant) {
        let Some(health) = self.health.as_mut() else {
            return;
        };
        let quality = health.update_health(now);
        let metrics = health.metrics();
        let silent = health.is_silent(now);

        self.stats.smoothed_rtt_ms = health.smoothed_rtt();
        self.stats.loss_rate = metrics.packet_loss_rate;
        self.stats.signal_bars = quality.signal_bars();
        self.to_media(MediaControl::Metrics(metrics));

        if silent && self.machine.state() == CallState::Established {
            let lost = self.remote.deactivate();
            warn!(call_id = %self.call.id, candidate = ?lost, "Active candidate went silent");
            if self.transition(CallStateEvent::CandidateLost) {
                self.start_reconnect_round(now);
                if let Some(health) = self.health.as_mut() {
                    health.mark_alive(now);
                }
            }
        }
        self.publish_stats();
    }

    async fn start_media(&mut self) {
        let codec = self
            .codec
            .clone()
            .unwrap_or_else(|| self.config.audio.codec.clone());
        let pipeline = match MediaPipeline::new(&self.config, &codec) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(call_id = %self.call.id, codec = %codec, error = %e, "Media pipeline unavailable");
                self.hang_up(TerminationReason::Incompatible, true).await;
                return;
            }
        };
        let (Some(source), Some(sink)) = (self.source.take(), self.sink.take()) else {
            return;
        };

        let (control_tx, control) = mpsc::channel(MEDIA_QUEUE);
        let frame = Duration::from_millis(self.config.audio.frame_duration_ms as u64);
        tokio::spawn(run_media(
            self.call.id,
            pipeline,
            source,
            sink,
            self.mic_muted,
            frame,
            control,
            self.media_tx.clone(),
            self.shutdown.subscribe(),
        ));
        self.media = Some(control_tx);
        debug!(call_id = %self.call.id, codec = %codec, "Media task started");
    }

    fn to_media(&self, control: MediaControl) {
        if let Some(media) = &self.media {
            if media.try_send(control).is_err() {
                trace!(call_id = %self.call.id, "Media task busy, control dropped");
            }
        }
    }

    fn active_address(&self) -> Option<std::net::SocketAddr> {
        self.remote.active().map(|c| c.address)
    }

    /// Seal and queue a packet. Droppable packets never wait on a full queue.
    async fn send_packet(&mut self, kind: PacketKind, payload: &[u8], to: std::net::SocketAddr, droppable: bool) {
        let (Some(cipher), Some(transport)) = (self.cipher.as_ref(), self.transport.as_ref()) else {
            return;
        };
        let seq = self.next_seq;
        let sealed = match cipher.seal(kind, seq, self.rx_window.ack(), payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(call_id = %self.call.id, error = %e, "Could not seal packet");
                return;
            }
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        let len = sealed.len() as u64;

        let queued = if droppable {
            transport.try_send(sealed, to)
        } else {
            transport.send(sealed, to).await.is_ok()
        };
        if !queued {
            self.stats.send_queue_drops += 1;
            return;
        }

        self.history.on_sent(seq, Instant::now());
        if let Some(health) = self.health.as_mut() {
            health.record_packet_sent();
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len;
    }

    async fn signal(&mut self, message: SignalingMessage) -> CallEngineResult<()> {
        send_to_peer(self.signaling.as_ref(), &self.peer, message).await
    }

    /// End the call, telling the peer unless it told us
    async fn hang_up(&mut self, reason: TerminationReason, notify_peer: bool) {
        if self.machine.state().is_terminal() {
            return;
        }
        if notify_peer {
            let end_reason = reason.to_end_reason();
            let message = if self.role == CallRole::Responder && self.machine.state() == CallState::Pending {
                SignalingMessage::CallDecline {
                    call_id: self.call.id,
                    reason: end_reason,
                }
            } else {
                SignalingMessage::Hangup {
                    call_id: self.call.id,
                    reason: end_reason,
                }
            };
            if let Err(e) = self.signal(message).await {
                debug!(call_id = %self.call.id, error = %e, "Could not notify peer of hangup");
            }
        }
        self.transition(CallStateEvent::Hangup(reason));
    }

    /// Tell the peer the call failed on our side
    async fn notify_failure(&mut self) {
        let message = SignalingMessage::Hangup {
            call_id: self.call.id,
            reason: callcore_types::EndReason::Disconnected,
        };
        if let Err(e) = self.signal(message).await {
            debug!(call_id = %self.call.id, error = %e, "Could not notify peer of failure");
        }
    }

    /// Apply an event; on a terminal state release everything the call holds
    fn transition(&mut self, event: CallStateEvent) -> bool {
        let from = self.machine.state();
        match self.machine.apply(event) {
            Ok(state) => {
                info!(
                    call_id = %self.call.id,
                    peer = %self.peer,
                    from = %from,
                    state = %state,
                    event = event.name(),
                    "Call state changed"
                );
                if state.is_terminal() {
                    self.release();
                }
                self.report(CallUpdate::State {
                    state,
                    reason: self.machine.termination(),
                });
                self.publish_stats();
                true
            }
            Err(e) => {
                debug!(call_id = %self.call.id, error = %e, "Ignoring event");
                false
            }
        }
    }

    /// Stop tasks and drop key material and sockets
    fn release(&mut self) {
        let _ = self.shutdown.send(true);
        self.media = None;
        self.transport = None;
        self.cipher = None;
        self.checks = None;
        if let Some(mut exchange) = self.exchange.take() {
            exchange.abort();
        }
        self.pending_material = None;
        self.ring_deadline = None;
        self.key_deadline = None;
        self.connectivity_deadline = None;
    }

    fn report(&self, update: CallUpdate) {
        let _ = self.reports.send(CallReport {
            call: self.call,
            update,
        });
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }

    fn next_wakeup(&self, now: Instant) -> Instant {
        let mut wake = now + Duration::from_secs(1);
        for deadline in [self.ring_deadline, self.key_deadline, self.connectivity_deadline]
            .into_iter()
            .flatten()
        {
            wake = wake.min(deadline);
        }
        if let Some(checks) = &self.checks {
            wake = wake.min(checks.next_wakeup(now));
        }
        if self.machine.state().carries_media() {
            wake = wake.min(self.next_health).min(self.next_keepalive);
            if self.mic_muted {
                wake = wake.min(self.next_muted_ack);
            }
        }
        wake
    }
}

/// Media task: one playout pull and one capture read per frame tick
#[allow(clippy::too_many_arguments)]
async fn run_media(
    call_id: uuid::Uuid,
    mut pipeline: MediaPipeline,
    mut source: Box<dyn AudioSource>,
    mut sink: Box<dyn AudioSink>,
    mut muted: bool,
    frame: Duration,
    mut control: mpsc::Receiver<MediaControl>,
    output: mpsc::Sender<MediaOutput>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = control.recv() => match next {
                Some(MediaControl::Frame(frame, arrival)) => {
                    pipeline.on_frame_received(frame, arrival);
                }
                Some(MediaControl::Metrics(metrics)) => {
                    pipeline.on_network_metrics(&metrics);
                }
                Some(MediaControl::SetMuted(value)) => muted = value,
                Some(MediaControl::SetSource(new_source)) => source = new_source,
                Some(MediaControl::SetSink(new_sink)) => sink = new_sink,
                None => break,
            },
            _ = ticker.tick() => {
                sink.write_frame(pipeline.pull_for_playout());

                if !muted {
                    if let Some(pcm) = source.read_frame(pipeline.frame_samples()) {
                        match pipeline.encode_frame(&pcm) {
                            Ok(encoded) => {
                                if output.try_send(MediaOutput::Frame(encoded)).is_err() {
                                    trace!(call_id = %call_id, "Call task busy, frame dropped");
                                }
                            }
                            Err(e) => debug!(call_id = %call_id, error = %e, "Encode failed"),
                        }
                    }
                }

                ticks += 1;
                if ticks % MEDIA_STATS_EVERY == 0 {
                    let _ = output.try_send(MediaOutput::Stats {
                        tier: pipeline.tier(),
                        jitter_target: pipeline.jitter_stats().target_depth,
                        concealed: pipeline.stats().frames_concealed,
                    });
                }
            }
        }
    }
    debug!(call_id = %call_id, "Media task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_io::{NullSink, SilenceSource};
    use crate::packet_codec::AckInfo;
    use crate::signaling::ChannelSignaling;
    use callcore_types::{EndReason, SignalingEnvelope};
    use tokio::net::UdpSocket;
    use uuid::Uuid;

    const STEP: Duration = Duration::from_secs(5);

    fn spawn_test_call(
        call_id: Uuid,
        start: CallStart,
    ) -> (
        CallHandle,
        mpsc::Receiver<SignalingEnvelope>,
        mpsc::UnboundedReceiver<CallReport>,
    ) {
        let (signaling, outbound) = ChannelSignaling::new(16);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let handle = spawn_call(CallParams {
            call: CallRef {
                id: call_id,
                generation: 1,
            },
            peer: PeerId::from("@peer"),
            config: Arc::new(EngineConfig::loopback()),
            signaling: Arc::new(signaling),
            reports: reports_tx,
            start,
            source: Box::new(SilenceSource),
            sink: Box::new(NullSink),
        });
        (handle, outbound, reports)
    }

    async fn next_message(outbound: &mut mpsc::Receiver<SignalingEnvelope>) -> SignalingMessage {
        tokio::time::timeout(STEP, outbound.recv())
            .await
            .expect("timed out waiting for signaling")
            .expect("signaling closed")
            .message
    }

    /// Skip reports until the call reaches `wanted`; returns its termination reason
    async fn wait_for_state(
        reports: &mut mpsc::UnboundedReceiver<CallReport>,
        wanted: CallState,
    ) -> Option<TerminationReason> {
        loop {
            let report = tokio::time::timeout(STEP, reports.recv())
                .await
                .expect("timed out waiting for a report")
                .expect("call task gone");
            if let CallUpdate::State { state, reason } = report.update {
                if state == wanted {
                    return reason;
                }
                assert!(!state.is_terminal(), "call ended in {} ({:?})", state, reason);
            }
        }
    }

    #[tokio::test]
    async fn test_unusable_request_material_fails_call() {
        let call_id = Uuid::new_v4();
        let (mut handle, mut outbound, mut reports) = spawn_test_call(
            call_id,
            CallStart::Incoming {
                protocol_version: ProtocolRange::current().max,
                codec: "pcm".to_string(),
                // A public value where the commitment belongs
                commitment: ExchangeMaterial::PublicValue([7; 32]),
            },
        );

        assert_eq!(
            wait_for_state(&mut reports, CallState::Failed).await,
            Some(TerminationReason::InvalidKeyMaterial)
        );
        assert_eq!(
            next_message(&mut outbound).await,
            SignalingMessage::Hangup {
                call_id,
                reason: EndReason::Disconnected
            }
        );
        assert!(handle.join(STEP).await);
    }

    #[tokio::test]
    async fn test_mismatched_key_confirmation_fails_call() {
        let call_id = Uuid::new_v4();
        let (mut handle, mut outbound, mut reports) = spawn_test_call(call_id, CallStart::Outgoing);

        // Play the callee by hand
        let commitment = match next_message(&mut outbound).await {
            SignalingMessage::CallRequest { material, .. } => material,
            other => panic!("expected call request, got {:?}", other),
        };
        let (mut callee, public) = KeyExchange::begin(CallRole::Responder, call_id);
        assert!(matches!(
            callee.on_material(commitment).unwrap(),
            ExchangeOutcome::NeedMore
        ));
        handle
            .send(CallCommand::Signal(SignalingMessage::CallAccept {
                call_id,
                protocol_version: ProtocolRange::current().max,
                codec: "pcm".to_string(),
                material: public,
            }))
            .await
            .unwrap();

        let reveal = match next_message(&mut outbound).await {
            SignalingMessage::KeyExchangeMaterial { material, .. } => material,
            other => panic!("expected reveal, got {:?}", other),
        };
        let keys = match callee.on_material(reveal).unwrap() {
            ExchangeOutcome::Complete { keys, .. } => keys,
            ExchangeOutcome::NeedMore => panic!("exchange incomplete"),
        };
        let cipher = PacketCipher::new(&keys).unwrap();
        assert!(matches!(
            next_message(&mut outbound).await,
            SignalingMessage::Candidates { .. }
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        handle
            .send(CallCommand::Signal(SignalingMessage::Candidates {
                call_id,
                candidates: vec![TransportCandidate::host(socket.local_addr().unwrap()).to_descriptor()],
            }))
            .await
            .unwrap();

        // Answer pings until the caller settles on our address
        let mut seq = 0;
        let mut caller_addr = None;
        let mut buf = vec![0u8; 2048];
        tokio::time::timeout(STEP, async {
            loop {
                tokio::select! {
                    report = reports.recv() => {
                        let report = report.expect("call task gone");
                        if matches!(report.update, CallUpdate::State { state: CallState::Established, .. }) {
                            break;
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = received.unwrap();
                        caller_addr = Some(from);
                        let packet = cipher.open(&buf[..len]).unwrap();
                        if packet.header.kind == PacketKind::Ping {
                            let pong = cipher
                                .seal(PacketKind::Pong, seq, AckInfo::default(), &packet.payload)
                                .unwrap();
                            seq += 1;
                            socket.send_to(&pong, from).await.unwrap();
                        }
                    }
                }
            }
        })
        .await
        .expect("call never established");

        let wrong = cipher
            .seal(PacketKind::KeyExchange, seq, AckInfo::default(), &[0xA5; 8])
            .unwrap();
        socket.send_to(&wrong, caller_addr.unwrap()).await.unwrap();

        assert_eq!(
            wait_for_state(&mut reports, CallState::Failed).await,
            Some(TerminationReason::InvalidKeyMaterial)
        );
        assert_eq!(
            next_message(&mut outbound).await,
            SignalingMessage::Hangup {
                call_id,
                reason: EndReason::Disconnected
            }
        );
        assert!(handle.join(STEP).await);
    }

    #[test]
    fn test_offered_codecs_put_preference_first() {
        let codecs = offered_codecs("PCM");
        assert_eq!(codecs.first().map(String::as_str), Some("pcm"));
        assert_eq!(codecs.len(), supported_codecs().len());

        // Unknown preference leaves the default order
        assert_eq!(offered_codecs("speex"), supported_codecs());
    }
}
