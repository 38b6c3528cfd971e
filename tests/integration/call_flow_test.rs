//! Integration tests for complete calls over loopback UDP

mod common;

use common::{connect, Switchboard};
use std::time::Duration;
use voice_call_engine::{
    CallRole, CallState, ChannelSink, EngineConfig, PlayoutFrame, TerminationReason, ToneSource,
};

#[tokio::test]
async fn test_call_establishes_and_carries_audio() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");

    let call = alice
        .manager
        .start_call_with_audio(
            bob.id.clone(),
            Box::new(ToneSource::new(440.0, 48_000)),
            Box::new(voice_call_engine::NullSink),
        )
        .await
        .unwrap();
    assert_eq!(call.role, CallRole::Initiator);

    let incoming = bob.wait_incoming().await;
    assert_eq!(incoming.call_id, call.call_id);
    assert_eq!(incoming.role, CallRole::Responder);
    assert_eq!(incoming.state, CallState::Pending);

    let (sink, mut playout) = ChannelSink::new(256);
    bob.manager
        .accept_call_with_audio(
            call.call_id,
            Box::new(voice_call_engine::SilenceSource),
            Box::new(sink),
        )
        .await
        .unwrap();

    let caller = alice.wait_state(call.call_id, CallState::Established).await;
    let callee = bob.wait_state(call.call_id, CallState::Established).await;
    assert!(caller.fingerprint.is_some());
    assert_eq!(caller.fingerprint, callee.fingerprint);
    assert_eq!(caller.codec, callee.codec);

    // The tone reaches the callee's sink
    let heard_voice = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = playout.recv().await {
            if matches!(frame, PlayoutFrame::Voice(ref pcm) if pcm.iter().any(|s| *s != 0)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(heard_voice);

    let stats = alice.manager.call_stats(call.call_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = stats.borrow().clone();
    assert!(stats.packets_sent > 0);
    assert!(stats.packets_received > 0);
    assert_eq!(stats.malformed_dropped, 0);

    alice
        .manager
        .end_call(call.call_id, TerminationReason::LocalHangup)
        .await
        .unwrap();
    let ended = alice.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::LocalHangup));
    let ended = bob.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::RemoteHangup));

    assert!(alice.manager.active_calls().await.unwrap().is_empty());
    assert!(bob.manager.active_calls().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_declined_call_ends_for_caller() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");

    let call = alice.manager.start_call(bob.id.clone()).await.unwrap();
    let incoming = bob.wait_incoming().await;
    bob.manager.decline_call(incoming.call_id).await.unwrap();

    let ended = alice.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::Declined));
    let ended = bob.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::Declined));
}

#[tokio::test]
async fn test_unanswered_call_is_missed() {
    let mut config = EngineConfig::loopback();
    config.timeouts.ring = Duration::from_millis(400);

    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone_with("@alice", config.clone());
    let mut bob = switchboard.phone_with("@bob", config);

    let call = alice.manager.start_call(bob.id.clone()).await.unwrap();
    bob.wait_incoming().await;

    let ended = bob.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::Missed));
    let ended = alice.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::Missed));
}

#[tokio::test]
async fn test_muted_caller_sends_no_audio_but_keeps_acking() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");
    let call_id = connect(&mut alice, &mut bob).await;

    let (sink, mut playout) = ChannelSink::new(256);
    bob.manager.set_audio_sink(call_id, Box::new(sink)).await.unwrap();
    alice
        .manager
        .set_audio_source(call_id, Box::new(ToneSource::new(440.0, 48_000)))
        .await
        .unwrap();
    alice.manager.set_mic_muted(call_id, true).await.unwrap();

    // Let buffered audio play out
    tokio::time::sleep(Duration::from_millis(600)).await;
    while playout.try_recv().is_ok() {}

    let bob_stats = bob.manager.call_stats(call_id).await.unwrap();
    let received_before = bob_stats.borrow().packets_received;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut voice = 0;
    while let Ok(frame) = playout.try_recv() {
        if matches!(frame, PlayoutFrame::Voice(_)) {
            voice += 1;
        }
    }
    assert_eq!(voice, 0);
    assert!(bob_stats.borrow().packets_received > received_before);

    let info = alice.manager.call_info(call_id).await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Established);
}
