//! Load Tests for the call engine
//!
//! Many callers ring one hub at once; every call must establish.
//!
//! Run with: cargo test --test load_test --release -- --ignored

#[path = "../integration/common/mod.rs"]
mod common;

use common::Switchboard;
use futures::future::join_all;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use voice_call_engine::{CallState, EngineEvent, TerminationReason};

const CALLERS: usize = 24;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Opens many sockets; run manually
async fn test_concurrent_calls_to_one_hub() {
    let switchboard = Switchboard::new();
    let mut hub = switchboard.phone("@hub");
    let mut callers: Vec<_> = (0..CALLERS)
        .map(|i| switchboard.phone(&format!("@caller{}", i)))
        .collect();

    let start = Instant::now();
    let calls = join_all(
        callers
            .iter()
            .map(|caller| caller.manager.start_call(hub.id.clone())),
    )
    .await;
    let call_ids: Vec<_> = calls
        .into_iter()
        .map(|call| call.expect("start call").call_id)
        .collect();

    // Answer everything that rings
    let mut answered = 0;
    while answered < CALLERS {
        if let EngineEvent::IncomingCall(info) = hub.next_event().await {
            hub.manager.accept_call(info.call_id).await.expect("accept");
            answered += 1;
        }
    }

    for (caller, call_id) in callers.iter_mut().zip(&call_ids) {
        caller.wait_state(*call_id, CallState::Established).await;
    }
    let elapsed = start.elapsed();
    println!("{} calls established in {:?}", CALLERS, elapsed);
    assert!(elapsed < Duration::from_secs(30));
    assert_eq!(hub.manager.active_calls().await.unwrap().len(), CALLERS);

    for (caller, call_id) in callers.iter().zip(&call_ids) {
        caller
            .manager
            .end_call(*call_id, TerminationReason::LocalHangup)
            .await
            .expect("hang up");
    }
    let mut ended = HashSet::new();
    while ended.len() < CALLERS {
        if let EngineEvent::StateChanged(info) = hub.next_event().await {
            if info.state == CallState::Ended {
                ended.insert(info.call_id);
            }
        }
    }
    assert!(hub.manager.active_calls().await.unwrap().is_empty());
}
