//! Integration tests for calls running side by side

mod common;

use common::{connect, Switchboard};
use voice_call_engine::{CallEngineError, CallState, TerminationReason};

#[tokio::test]
async fn test_two_peers_proceed_independently() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");
    let mut carol = switchboard.phone("@carol");

    let with_bob = connect(&mut alice, &mut bob).await;
    let with_carol = connect(&mut alice, &mut carol).await;
    assert_ne!(with_bob, with_carol);
    assert_eq!(alice.manager.active_calls().await.unwrap().len(), 2);

    alice
        .manager
        .end_call(with_bob, TerminationReason::LocalHangup)
        .await
        .unwrap();
    alice.wait_state(with_bob, CallState::Ended).await;
    bob.wait_state(with_bob, CallState::Ended).await;

    let info = carol.manager.call_info(with_carol).await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Established);
    let info = alice.manager.call_info(with_carol).await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Established);
    assert_eq!(alice.manager.active_calls().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_call_to_established_peer_is_busy() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");
    let call_id = connect(&mut alice, &mut bob).await;

    let again = alice.manager.start_call(bob.id.clone()).await;
    assert!(matches!(again, Err(CallEngineError::Busy { .. })));
    let back = bob.manager.start_call(alice.id.clone()).await;
    assert!(matches!(back, Err(CallEngineError::Busy { .. })));

    for phone in [&alice, &bob] {
        let info = phone.manager.call_info(call_id).await.unwrap().unwrap();
        assert_eq!(info.state, CallState::Established);
        assert_eq!(phone.manager.active_calls().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_peer_can_call_again_after_hangup() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");

    let first = connect(&mut alice, &mut bob).await;
    bob.manager
        .end_call(first, TerminationReason::LocalHangup)
        .await
        .unwrap();
    bob.wait_state(first, CallState::Ended).await;
    alice.wait_state(first, CallState::Ended).await;

    let second = connect(&mut bob, &mut alice).await;
    assert_ne!(first, second);
    let info = alice.manager.call_info(first).await.unwrap().unwrap();
    assert_eq!(info.termination, Some(TerminationReason::RemoteHangup));
}

#[tokio::test]
async fn test_shutdown_hangs_up_active_calls() {
    let switchboard = Switchboard::new();
    let mut alice = switchboard.phone("@alice");
    let mut bob = switchboard.phone("@bob");
    let call_id = connect(&mut alice, &mut bob).await;

    alice.manager.shutdown().await.unwrap();
    let ended = bob.wait_state(call_id, CallState::Ended).await;
    assert_eq!(ended.termination, Some(TerminationReason::RemoteHangup));
    assert!(matches!(
        alice.manager.active_calls().await,
        Err(CallEngineError::Closed)
    ));
}
