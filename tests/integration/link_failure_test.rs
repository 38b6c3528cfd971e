//! Integration tests for calls whose signaling or media path breaks

mod common;

use callcore_types::SignalingMessage;
use common::{connect, Switchboard, UdpPipe};
use std::time::Duration;
use voice_call_engine::{CallInfo, CallState, EngineConfig, TerminationReason};

fn states(seen: &[CallInfo]) -> Vec<CallState> {
    seen.iter().map(|info| info.state).collect()
}

fn termination(seen: &[CallInfo]) -> Option<TerminationReason> {
    seen.last().and_then(|info| info.termination)
}

/// Short silence grace so a cut link is noticed quickly
fn flaky_link_config(reconnect: Duration, attempts: u32) -> EngineConfig {
    let mut config = EngineConfig::loopback();
    config.timeouts.candidate_grace = Duration::from_millis(600);
    config.timeouts.reconnect = reconnect;
    config.timeouts.max_reconnect_attempts = attempts;
    config
}

#[tokio::test]
async fn test_no_candidates_fails_connectivity() {
    let switchboard = Switchboard::with_tap(|_, message| match message {
        SignalingMessage::Candidates { .. } => None,
        other => Some(other),
    });
    let mut impatient = EngineConfig::loopback();
    impatient.timeouts.connectivity = Duration::from_millis(500);
    let mut alice = switchboard.phone_with("@alice", impatient);
    let mut bob = switchboard.phone("@bob");

    let call = alice.manager.start_call(bob.id.clone()).await.unwrap();
    bob.wait_incoming().await;
    bob.manager.accept_call(call.call_id).await.unwrap();

    let seen = alice.states_until(call.call_id, CallState::Failed).await;
    assert_eq!(
        states(&seen),
        vec![
            CallState::ExchangingKeys,
            CallState::WaitingForConnectivity,
            CallState::Failed
        ]
    );
    assert_eq!(termination(&seen), Some(TerminationReason::ConnectivityFailed));

    // Bob hears about it over signaling long before his own deadline
    let ended = bob.wait_state(call.call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::RemoteFailure));
}

#[tokio::test]
async fn test_missing_reveal_times_out_key_exchange() {
    let switchboard = Switchboard::with_tap(|from, message| match message {
        SignalingMessage::KeyExchangeMaterial { .. } if from.as_str() == "@alice" => None,
        other => Some(other),
    });
    let mut impatient = EngineConfig::loopback();
    impatient.timeouts.key_exchange = Duration::from_millis(500);
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone_with("@bob", impatient);

    let call = alice.manager.start_call(bob.id.clone()).await.unwrap();
    bob.wait_incoming().await;
    bob.manager.accept_call(call.call_id).await.unwrap();

    let seen = bob.states_until(call.call_id, CallState::Failed).await;
    assert_eq!(
        states(&seen),
        vec![CallState::ExchangingKeys, CallState::Failed]
    );
    assert_eq!(termination(&seen), Some(TerminationReason::KeyExchangeTimeout));
    assert!(seen.iter().all(|info| info.fingerprint.is_none()));

    // Alice derived her key but never got connectivity; Bob's failure ends it
    let seen = alice.states_until(call.call_id, CallState::Ended).await;
    assert_eq!(
        states(&seen),
        vec![
            CallState::ExchangingKeys,
            CallState::WaitingForConnectivity,
            CallState::Ended
        ]
    );
    assert_eq!(termination(&seen), Some(TerminationReason::RemoteFailure));
}

#[tokio::test]
async fn test_cut_link_reconnects_when_restored() {
    let pipe = UdpPipe::start().await;
    let switchboard = Switchboard::with_tap(pipe.splice("@alice".into()));
    let config = flaky_link_config(Duration::from_secs(2), 5);
    let mut alice = switchboard.phone_with("@alice", config.clone());
    let mut bob = switchboard.phone_with("@bob", config);
    let call_id = connect(&mut alice, &mut bob).await;

    pipe.set_cut(true);
    for phone in [&mut alice, &mut bob] {
        let seen = phone.states_until(call_id, CallState::Reconnecting).await;
        assert_eq!(states(&seen), vec![CallState::Reconnecting]);
    }

    pipe.set_cut(false);
    for phone in [&mut alice, &mut bob] {
        let seen = phone.states_until(call_id, CallState::Established).await;
        assert_eq!(states(&seen), vec![CallState::Established]);
    }

    let stats = alice.manager.call_stats(call_id).await.unwrap();
    assert!(stats.borrow().reconnects >= 1);

    // Media flows again after revalidation
    let received = stats.borrow().packets_received;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(stats.borrow().packets_received > received);

    alice
        .manager
        .end_call(call_id, TerminationReason::LocalHangup)
        .await
        .unwrap();
    let ended = bob.wait_state(call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::RemoteHangup));
}

#[tokio::test]
async fn test_cut_link_fails_after_last_attempt() {
    let pipe = UdpPipe::start().await;
    let switchboard = Switchboard::with_tap(pipe.splice("@alice".into()));
    // Alice gives up after a single round, well before Bob would
    let mut alice =
        switchboard.phone_with("@alice", flaky_link_config(Duration::from_secs(1), 1));
    let mut bob = switchboard.phone_with("@bob", flaky_link_config(Duration::from_secs(5), 3));
    let call_id = connect(&mut alice, &mut bob).await;

    pipe.set_cut(true);
    let seen = alice.states_until(call_id, CallState::Failed).await;
    assert_eq!(
        states(&seen),
        vec![CallState::Reconnecting, CallState::Failed]
    );
    assert_eq!(termination(&seen), Some(TerminationReason::ReconnectionFailed));

    let seen = bob.states_until(call_id, CallState::Ended).await;
    assert_eq!(seen.last().map(|info| info.state), Some(CallState::Ended));
    assert_eq!(termination(&seen), Some(TerminationReason::RemoteFailure));
    assert!(alice.manager.active_calls().await.unwrap().is_empty());
}
