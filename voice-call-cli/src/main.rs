//! Loopback voice call demo
//!
//! Starts two engines in one process, wires their signaling together and
//! places an encrypted call between them over loopback UDP. The call runs
//! through talking, muted and on-hold phases before hanging up, logging
//! what the callee hears and the link statistics along the way.
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


use anyhow::{anyhow, Result};
use callcore_config::AppConfig;
use callcore_logging::{init_with_format, LogFormat};
use callcore_types::{PeerId, SignalingEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use voice_call_engine::{
    AudioSource, CallState, ChannelEventHandler, ChannelSignaling, ChannelSink, EngineConfig,
    EngineEvent, PcmQueueSource, PlayoutFrame, SessionManager, TerminationReason, ToneSource,
};

/// Length of each demo phase unless given as the first argument (seconds)
const DEFAULT_PHASE: Duration = Duration::from_secs(3);

/// Deadline for call setup steps
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
struct Heard {
    voice: u32,
    concealed: u32,
    silence: u32,
}

/// Deliver everything one engine sends to the other, stamped with the sender
fn forward_signaling(
    from: PeerId,
    mut outbound: mpsc::Receiver<SignalingEnvelope>,
    to: SessionManager,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let kind = envelope.message.kind();
            let delivered = SignalingEnvelope::new(from.clone(), envelope.message);
            if let Err(e) = to.on_incoming_signal(delivered).await {
                warn!(from = %from, kind, error = %e, "Signal rejected");
            }
        }
    })
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    mut wanted: impl FnMut(&EngineEvent) -> bool,
) -> Result<EngineEvent> {
    let deadline = tokio::time::Instant::now() + SETUP_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for call event"))?
            .ok_or_else(|| anyhow!("engine stopped"))?;
        if wanted(&event) {
            return Ok(event);
        }
        if let EngineEvent::StateChanged(info) = &event {
            if info.state.is_terminal() {
                return Err(anyhow!(
                    "call {} ended early: {:?}",
                    info.call_id,
                    info.termination
                ));
            }
        }
    }
}

async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    call_id: Uuid,
    state: CallState,
) -> Result<()> {
    wait_for_event(events, |event| {
        matches!(event, EngineEvent::StateChanged(info) if info.call_id == call_id && info.state == state)
    })
    .await
    .map(|_| ())
}

/// Drain the callee's playout for one phase
async fn listen(playout: &mut mpsc::Receiver<PlayoutFrame>, duration: Duration) -> Heard {
    let deadline = tokio::time::Instant::now() + duration;
    let mut heard = Heard::default();
    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, playout.recv()).await {
        match frame {
            PlayoutFrame::Voice(_) => heard.voice += 1,
            PlayoutFrame::Concealed(_) => heard.concealed += 1,
            PlayoutFrame::Silence(_) => heard.silence += 1,
        }
    }
    heard
}

async fn log_stats(manager: &SessionManager, call_id: Uuid, phase: &str) -> Result<()> {
    let stats = manager.call_stats(call_id).await?.borrow().clone();
    info!(
        phase,
        packets_sent = stats.packets_sent,
        packets_received = stats.packets_received,
        packets_lost = stats.packets_lost,
        rtt_ms = stats.smoothed_rtt_ms,
        tier = ?stats.quality_tier,
        bars = stats.signal_bars,
        "Caller link statistics"
    );
    Ok(())
}

async fn run_demo(config: EngineConfig, phase: Duration) -> Result<()> {
    let alice_id = PeerId::from("@alice");
    let bob_id = PeerId::from("@bob");
    let sample_rate = config.audio.sample_rate;

    let (alice_signaling, alice_outbound) = ChannelSignaling::new(64);
    let (bob_signaling, bob_outbound) = ChannelSignaling::new(64);
    let (alice_handler, mut alice_events) = ChannelEventHandler::new();
    let (bob_handler, mut bob_events) = ChannelEventHandler::new();

    let alice = SessionManager::start(
        config.clone(),
        Arc::new(alice_signaling),
        Arc::new(alice_handler),
    );
    let bob = SessionManager::start(config, Arc::new(bob_signaling), Arc::new(bob_handler));
    forward_signaling(alice_id.clone(), alice_outbound, bob.clone());
    forward_signaling(bob_id.clone(), bob_outbound, alice.clone());

    let (alice_sink, _alice_playout) = ChannelSink::new(64);
    let call = alice
        .start_call_with_audio(
            bob_id.clone(),
            Box::new(ToneSource::new(440.0, sample_rate)),
            Box::new(alice_sink),
        )
        .await?;
    let call_id = call.call_id;
    info!(call_id = %call_id, callee = %bob_id, "Calling");

    wait_for_event(&mut bob_events, |event| {
        matches!(event, EngineEvent::IncomingCall(info) if info.call_id == call_id)
    })
    .await?;
    info!(call_id = %call_id, caller = %alice_id, "Ringing, answering");

    let (bob_sink, mut bob_playout) = ChannelSink::new(64);
    bob.accept_call_with_audio(
        call_id,
        Box::new(ToneSource::new(660.0, sample_rate)),
        Box::new(bob_sink),
    )
    .await?;

    wait_for_state(&mut alice_events, call_id, CallState::Established).await?;
    let caller = alice
        .call_info(call_id)
        .await?
        .ok_or_else(|| anyhow!("caller lost the call"))?;
    let callee = bob
        .call_info(call_id)
        .await?
        .ok_or_else(|| anyhow!("callee lost the call"))?;
    match (caller.fingerprint, callee.fingerprint) {
        (Some(a), Some(b)) if a == b => {
            info!(fingerprint = %a, emoji = ?a.emoji(), codec = ?caller.codec, "Call established, fingerprints match")
        }
        (a, b) => return Err(anyhow!("fingerprint mismatch: {:?} vs {:?}", a, b)),
    }

    let heard = listen(&mut bob_playout, phase).await;
    info!(?heard, "Talking");
    log_stats(&alice, call_id, "talking").await?;

    alice.set_mic_muted(call_id, true).await?;
    let heard = listen(&mut bob_playout, phase).await;
    info!(?heard, "Caller muted");
    alice.set_mic_muted(call_id, false).await?;

    let mut hold = PcmQueueSource::new();
    let mut jingle = ToneSource::new(330.0, sample_rate).with_amplitude(0.1);
    if let Some(clip) = jingle.read_frame(sample_rate as usize / 2) {
        hold.set_hold_clip(clip);
    }
    hold.set_on_hold(true);
    alice.set_audio_source(call_id, Box::new(hold)).await?;
    let heard = listen(&mut bob_playout, phase).await;
    info!(?heard, "Caller on hold");
    log_stats(&alice, call_id, "hold").await?;

    alice
        .end_call(call_id, TerminationReason::LocalHangup)
        .await?;
    wait_for_event(&mut bob_events, |event| {
        matches!(event, EngineEvent::StateChanged(info) if info.call_id == call_id && info.state == CallState::Ended)
    })
    .await?;
    info!(call_id = %call_id, "Call ended");

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = AppConfig::from_env().map_err(|e| anyhow!("Failed to load configuration: {}", e))?;
    init_with_format(
        LogFormat::from_name(&app.log_format),
        "voice-call-demo",
        app.log_level(),
    );

    let mut config = EngineConfig::from_app_config(&app)?;
    // Both engines live in this process
    config.bind_address = "127.0.0.1:0".parse()?;
    config.stun_server = None;
    config.relay_servers.clear();
    config.proxy = None;

    let phase = match std::env::args().nth(1) {
        Some(secs) => Duration::from_secs(
            secs.parse()
                .map_err(|e| anyhow!("phase length must be whole seconds: {}", e))?,
        ),
        None => DEFAULT_PHASE,
    };

    info!(phase_secs = phase.as_secs(), "Starting loopback call demo. Press Ctrl+C to stop.");
    tokio::select! {
        result = run_demo(config, phase) => {
            if let Err(e) = &result {
                error!(error = %e, "Demo failed");
            }
            result
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
