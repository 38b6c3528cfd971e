//! Session Manager
//!
//! Owns every call session and the peer index. Commands from the host and
//! reports from call tasks are processed sequentially by one actor task,
//! which is therefore the only writer of the session map. `SessionManager`
//! is a cheap cloneable handle to that actor.
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
use crate::audio_io::{AudioSink, AudioSource, NullSink, SilenceSource};
use crate::call::{spawn_call, CallCommand, CallHandle, CallParams, CallReport, CallStart};
use crate::call_session::{CallInfo, CallRole, CallSession, CallStats};
use crate::call_state::TerminationReason;
use crate::config::EngineConfig;
use crate::error::{CallEngineError, CallEngineResult};
use crate::events::{spawn_dispatcher, CallEventHandler, EngineEvent};
use crate::signaling::{send_to_peer, SignalingTransport};
use callcore_types::{
    EndReason, ExchangeMaterial, PeerId, ProtocolRange, SignalingEnvelope, SignalingMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 64;

/// Finished sessions kept for `call_info` lookups
const RETAINED_FINISHED_CALLS: usize = 64;

/// How long shutdown waits for each call task to exit
const CALL_EXIT_GRACE: Duration = Duration::from_secs(2);

enum ManagerCommand {
    StartCall {
        peer: PeerId,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        reply: oneshot::Sender<CallEngineResult<CallInfo>>,
    },
    IncomingSignal {
        envelope: SignalingEnvelope,
        reply: oneshot::Sender<CallEngineResult<()>>,
    },
    Accept {
        call_id: Uuid,
        source: Option<Box<dyn AudioSource>>,
        sink: Option<Box<dyn AudioSink>>,
        reply: oneshot::Sender<CallEngineResult<()>>,
    },
    End {
        call_id: Uuid,
        reason: TerminationReason,
        reply: oneshot::Sender<CallEngineResult<()>>,
    },
    ToCall {
        call_id: Uuid,
        command: CallCommand,
        reply: oneshot::Sender<CallEngineResult<()>>,
    },
    CallInfo {
        call_id: Uuid,
        reply: oneshot::Sender<Option<CallInfo>>,
    },
    ActiveCalls {
        reply: oneshot::Sender<Vec<CallInfo>>,
    },
    CallStats {
        call_id: Uuid,
        reply: oneshot::Sender<CallEngineResult<watch::Receiver<CallStats>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the engine. Clone freely; all clones drive the same actor.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<ManagerCommand>,
}

impl SessionManager {
    /// Start the manager actor and the event dispatch task
    pub fn start(
        config: EngineConfig,
        signaling: Arc<dyn SignalingTransport>,
        handler: Arc<dyn CallEventHandler>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (reports_tx, reports) = mpsc::unbounded_channel();
        spawn_dispatcher(handler, events_rx);

        info!(
            bind_address = %config.bind_address,
            proxy = config.proxy.is_some(),
            codecs = ?supported_codecs(),
            "Session manager started"
        );

        let actor = ManagerActor {
            config: Arc::new(config),
            signaling,
            events,
            reports_tx,
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            finished: Vec::new(),
            next_generation: 1,
        };
        tokio::spawn(actor.run(commands, reports));

        SessionManager {
            commands: commands_tx,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> CallEngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CallEngineError::Closed)?;
        rx.await.map_err(|_| CallEngineError::Closed)
    }

    /// Place a call with silent capture and discarded playback
    pub async fn start_call(&self, peer: PeerId) -> CallEngineResult<CallInfo> {
        self.start_call_with_audio(peer, Box::new(SilenceSource), Box::new(NullSink))
            .await
    }

    /// Place a call. Fails with `Busy` if the peer already has an active call.
    pub async fn start_call_with_audio(
        &self,
        peer: PeerId,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> CallEngineResult<CallInfo> {
        self.request(|reply| ManagerCommand::StartCall {
            peer,
            source,
            sink,
            reply,
        })
        .await?
    }

    /// Feed a signaling message received from `envelope.peer`
    pub async fn on_incoming_signal(&self, envelope: SignalingEnvelope) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::IncomingSignal { envelope, reply })
            .await?
    }

    pub async fn accept_call(&self, call_id: Uuid) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::Accept {
            call_id,
            source: None,
            sink: None,
            reply,
        })
        .await?
    }

    /// Accept and attach audio in one step
    pub async fn accept_call_with_audio(
        &self,
        call_id: Uuid,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::Accept {
            call_id,
            source: Some(source),
            sink: Some(sink),
            reply,
        })
        .await?
    }

    pub async fn decline_call(&self, call_id: Uuid) -> CallEngineResult<()> {
        self.end_call(call_id, TerminationReason::Declined).await
    }

    pub async fn end_call(&self, call_id: Uuid, reason: TerminationReason) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::End {
            call_id,
            reason,
            reply,
        })
        .await?
    }

    /// Current snapshot; finished calls stay visible for a while
    pub async fn call_info(&self, call_id: Uuid) -> CallEngineResult<Option<CallInfo>> {
        self.request(|reply| ManagerCommand::CallInfo { call_id, reply })
            .await
    }

    /// Calls not yet ended or failed
    pub async fn active_calls(&self) -> CallEngineResult<Vec<CallInfo>> {
        self.request(|reply| ManagerCommand::ActiveCalls { reply })
            .await
    }

    /// Live diagnostic counters, refreshed a few times per second
    pub async fn call_stats(&self, call_id: Uuid) -> CallEngineResult<watch::Receiver<CallStats>> {
        self.request(|reply| ManagerCommand::CallStats { call_id, reply })
            .await?
    }

    pub async fn set_mic_muted(&self, call_id: Uuid, muted: bool) -> CallEngineResult<()> {
        self.to_call(call_id, CallCommand::SetMicMuted(muted)).await
    }

    pub async fn set_audio_source(
        &self,
        call_id: Uuid,
        source: Box<dyn AudioSource>,
    ) -> CallEngineResult<()> {
        self.to_call(call_id, CallCommand::SetAudioSource(source))
            .await
    }

    pub async fn set_audio_sink(&self, call_id: Uuid, sink: Box<dyn AudioSink>) -> CallEngineResult<()> {
        self.to_call(call_id, CallCommand::SetAudioSink(sink)).await
    }

    /// Hang up every call and stop the actor
    pub async fn shutdown(&self) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::Shutdown { reply })
            .await
    }

    async fn to_call(&self, call_id: Uuid, command: CallCommand) -> CallEngineResult<()> {
        self.request(|reply| ManagerCommand::ToCall {
            call_id,
            command,
            reply,
        })
        .await?
    }
}

struct CallEntry {
    session: CallSession,
    handle: CallHandle,
}

struct ManagerActor {
    config: Arc<EngineConfig>,
    signaling: Arc<dyn SignalingTransport>,
    events: mpsc::Sender<EngineEvent>,
    reports_tx: mpsc::UnboundedSender<CallReport>,
    /// All sessions by call id
    sessions: HashMap<Uuid, CallEntry>,
    /// Peer to its active call
    by_peer: HashMap<PeerId, Uuid>,
    /// Finished call ids, oldest first
    finished: Vec<Uuid>,
    next_generation: u64,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ManagerCommand>,
        mut reports: mpsc::UnboundedReceiver<CallReport>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.on_report(report).await,
            }
        }
        info!("Session manager stopped");
    }

    async fn on_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::StartCall {
                peer,
                source,
                sink,
                reply,
            } => {
                let _ = reply.send(self.start_call(peer, source, sink).await);
            }
            ManagerCommand::IncomingSignal { envelope, reply } => {
                let _ = reply.send(self.on_signal(envelope).await);
            }
            ManagerCommand::Accept {
                call_id,
                source,
                sink,
                reply,
            } => {
                let _ = reply.send(self.accept(call_id, source, sink).await);
            }
            ManagerCommand::End {
                call_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.forward(call_id, CallCommand::Hangup(reason)).await);
            }
            ManagerCommand::ToCall {
                call_id,
                command,
                reply,
            } => {
                let _ = reply.send(self.forward(call_id, command).await);
            }
            ManagerCommand::CallInfo { call_id, reply } => {
                let info = self.sessions.get(&call_id).map(|e| e.session.info().clone());
                let _ = reply.send(info);
            }
            ManagerCommand::ActiveCalls { reply } => {
                let active = self
                    .sessions
                    .values()
                    .filter(|e| !e.session.is_terminated())
                    .map(|e| e.session.info().clone())
                    .collect();
                let _ = reply.send(active);
            }
            ManagerCommand::CallStats { call_id, reply } => {
                let stats = self
                    .sessions
                    .get(&call_id)
                    .map(|e| e.handle.stats())
                    .ok_or(CallEngineError::CallNotFound { call_id });
                let _ = reply.send(stats);
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    fn active_call_for(&self, peer: &PeerId) -> Option<Uuid> {
        self.by_peer
            .get(peer)
            .copied()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .map(|e| !e.session.is_terminated())
                    .unwrap_or(false)
            })
    }

    async fn start_call(
        &mut self,
        peer: PeerId,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> CallEngineResult<CallInfo> {
        if let Some(existing) = self.active_call_for(&peer) {
            warn!(peer = %peer, existing = %existing, "Peer already in a call");
            return Err(CallEngineError::Busy {
                peer: peer.to_string(),
            });
        }

        let call_id = Uuid::new_v4();
        let session = self.new_session(call_id, peer.clone(), CallRole::Initiator);
        let handle = spawn_call(CallParams {
            call: session.call_ref(),
            peer: peer.clone(),
            config: Arc::clone(&self.config),
            signaling: Arc::clone(&self.signaling),
            reports: self.reports_tx.clone(),
            start: CallStart::Outgoing,
            source,
            sink,
        });

        let info = session.info().clone();
        self.insert(session, handle);
        info!(call_id = %call_id, peer = %peer, "Outgoing call started");
        Ok(info)
    }

    async fn on_signal(&mut self, envelope: SignalingEnvelope) -> CallEngineResult<()> {
        let SignalingEnvelope { peer, message, .. } = envelope;
        let call_id = message.call_id();

        if let Err(e) = message.validate() {
            let error = format!("invalid {}: {}", message.kind(), e);
            self.emit_signaling_error(&peer, Some(call_id), &error).await;
            return Err(CallEngineError::Signaling(error));
        }
        debug!(peer = %peer, call_id = %call_id, kind = message.kind(), "Signaling received");

        match message {
            SignalingMessage::CallRequest {
                call_id,
                protocol,
                codecs,
                material,
            } => {
                self.on_call_request(peer, call_id, protocol, codecs, material)
                    .await
            }
            message => {
                let Some(entry) = self.sessions.get(&call_id) else {
                    // Ends of calls we already forgot are harmless
                    if matches!(
                        message,
                        SignalingMessage::Hangup { .. } | SignalingMessage::CallDecline { .. }
                    ) {
                        return Ok(());
                    }
                    let error = format!("{} for unknown call", message.kind());
                    self.emit_signaling_error(&peer, Some(call_id), &error).await;
                    return Err(CallEngineError::CallNotFound { call_id });
                };
                if entry.session.peer() != &peer {
                    let error = format!("{} from a peer not in this call", message.kind());
                    self.emit_signaling_error(&peer, Some(call_id), &error).await;
                    return Err(CallEngineError::Signaling(error));
                }
                if entry.session.is_terminated() {
                    return Ok(());
                }
                // Task may have just finished; its final report is on the way
                let _ = entry.handle.send(CallCommand::Signal(message)).await;
                Ok(())
            }
        }
    }

    async fn on_call_request(
        &mut self,
        peer: PeerId,
        call_id: Uuid,
        protocol: ProtocolRange,
        codecs: Vec<String>,
        commitment: ExchangeMaterial,
    ) -> CallEngineResult<()> {
        if self.sessions.contains_key(&call_id) {
            debug!(call_id = %call_id, "Duplicate call request ignored");
            return Ok(());
        }

        if let Some(existing) = self.active_call_for(&peer) {
            info!(peer = %peer, call_id = %call_id, existing = %existing, "Declining call from busy peer");
            return self.decline(&peer, call_id, EndReason::Busy).await;
        }
        if !self.config.accept_incoming {
            info!(peer = %peer, call_id = %call_id, "Incoming calls disabled, declining");
            return self.decline(&peer, call_id, EndReason::Declined).await;
        }

        let ours = supported_codecs();
        let version = ProtocolRange::current().negotiate(&protocol);
        let codec = codecs
            .iter()
            .find(|offered| ours.iter().any(|c| c.eq_ignore_ascii_case(offered)))
            .map(|c| c.to_ascii_lowercase());
        let (Some(protocol_version), Some(codec)) = (version, codec) else {
            warn!(peer = %peer, call_id = %call_id, offered = ?codecs, "No common protocol version or codec");
            return self.decline(&peer, call_id, EndReason::Incompatible).await;
        };

        let mut session = self.new_session(call_id, peer.clone(), CallRole::Responder);
        session.set_negotiated(protocol_version, codec.clone());
        let handle = spawn_call(CallParams {
            call: session.call_ref(),
            peer: peer.clone(),
            config: Arc::clone(&self.config),
            signaling: Arc::clone(&self.signaling),
            reports: self.reports_tx.clone(),
            start: CallStart::Incoming {
                protocol_version,
                codec,
                commitment,
            },
            source: Box::new(SilenceSource),
            sink: Box::new(NullSink),
        });

        let info = session.info().clone();
        self.insert(session, handle);
        info!(call_id = %call_id, peer = %peer, protocol_version, "Incoming call ringing");
        self.emit(EngineEvent::IncomingCall(info)).await;
        Ok(())
    }

    async fn decline(&self, peer: &PeerId, call_id: Uuid, reason: EndReason) -> CallEngineResult<()> {
        let decline = SignalingMessage::CallDecline { call_id, reason };
        if let Err(e) = send_to_peer(self.signaling.as_ref(), peer, decline).await {
            self.emit_signaling_error(peer, Some(call_id), &e.to_string())
                .await;
        }
        Ok(())
    }

    async fn accept(
        &mut self,
        call_id: Uuid,
        source: Option<Box<dyn AudioSource>>,
        sink: Option<Box<dyn AudioSink>>,
    ) -> CallEngineResult<()> {
        let entry = self.live_entry(call_id)?;
        if entry.session.info().role != CallRole::Responder {
            return Err(CallEngineError::Signaling(
                "only incoming calls can be accepted".to_string(),
            ));
        }
        if let Some(source) = source {
            entry.handle.send(CallCommand::SetAudioSource(source)).await?;
        }
        if let Some(sink) = sink {
            entry.handle.send(CallCommand::SetAudioSink(sink)).await?;
        }
        entry.handle.send(CallCommand::Accept).await
    }

    async fn forward(&mut self, call_id: Uuid, command: CallCommand) -> CallEngineResult<()> {
        let entry = self.live_entry(call_id)?;
        entry.handle.send(command).await
    }

    fn live_entry(&self, call_id: Uuid) -> CallEngineResult<&CallEntry> {
        self.sessions
            .get(&call_id)
            .filter(|e| !e.session.is_terminated())
            .ok_or(CallEngineError::CallNotFound { call_id })
    }

    async fn on_report(&mut self, report: CallReport) {
        let call_id = report.call.id;
        let Some(entry) = self.sessions.get_mut(&call_id) else {
            return;
        };
        if !entry.session.apply(report.call, report.update) {
            return;
        }

        let info = entry.session.info().clone();
        if info.state.is_terminal() {
            if self.by_peer.get(&info.peer) == Some(&call_id) {
                self.by_peer.remove(&info.peer);
            }
            self.retire(call_id);
        }
        self.emit(EngineEvent::StateChanged(info)).await;
    }

    fn new_session(&mut self, call_id: Uuid, peer: PeerId, role: CallRole) -> CallSession {
        let generation = self.next_generation;
        self.next_generation += 1;
        CallSession::new(call_id, peer, role, generation)
    }

    fn insert(&mut self, session: CallSession, handle: CallHandle) {
        let call_id = session.info().call_id;
        self.by_peer.insert(session.peer().clone(), call_id);
        self.sessions.insert(call_id, CallEntry { session, handle });
    }

    /// Remember a finished call, forgetting the oldest beyond the limit
    fn retire(&mut self, call_id: Uuid) {
        self.finished.push(call_id);
        while self.finished.len() > RETAINED_FINISHED_CALLS {
            let oldest = self.finished.remove(0);
            self.sessions.remove(&oldest);
        }
    }

    async fn emit(&self, event: EngineEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event dispatcher gone");
        }
    }

    async fn emit_signaling_error(&self, peer: &PeerId, call_id: Option<Uuid>, error: &str) {
        self.emit(EngineEvent::SignalingError {
            peer: peer.clone(),
            call_id,
            error: error.to_string(),
        })
        .await;
    }

    async fn shutdown(&mut self) {
        let active: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, e)| !e.session.is_terminated())
            .map(|(id, _)| *id)
            .collect();
        info!(active = active.len(), "Shutting down session manager");

        for call_id in active {
            if let Some(entry) = self.sessions.get_mut(&call_id) {
                let _ = entry
                    .handle
                    .send(CallCommand::Hangup(TerminationReason::Shutdown))
                    .await;
                if entry.session.terminate(TerminationReason::Shutdown) {
                    let info = entry.session.info().clone();
                    self.emit(EngineEvent::StateChanged(info)).await;
                }
            }
        }
        for (call_id, entry) in self.sessions.iter_mut() {
            if !entry.handle.join(CALL_EXIT_GRACE).await {
                warn!(call_id = %call_id, "Call task did not stop in time");
            }
        }
        self.by_peer.clear();
    }
}
