//! Shared harness: in-process engines whose signaling is routed by peer id

#![allow(dead_code)]

use callcore_types::{PeerId, SignalingEnvelope, SignalingMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;
use voice_call_engine::{
    CallInfo, CallState, ChannelEventHandler, ChannelSignaling, EngineConfig, EngineEvent,
    SessionManager,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Rewrites a message in flight from the given sender; `None` drops it
pub type Tap = Arc<dyn Fn(&PeerId, SignalingMessage) -> Option<SignalingMessage> + Send + Sync>;

/// Routes signaling between every phone it created
#[derive(Clone, Default)]
pub struct Switchboard {
    lines: Arc<RwLock<HashMap<PeerId, SessionManager>>>,
    tap: Option<Tap>,
}

pub struct Phone {
    pub id: PeerId,
    pub manager: SessionManager,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switchboard passing every message through `tap` first
    pub fn with_tap<F>(tap: F) -> Self
    where
        F: Fn(&PeerId, SignalingMessage) -> Option<SignalingMessage> + Send + Sync + 'static,
    {
        Switchboard {
            lines: Arc::default(),
            tap: Some(Arc::new(tap)),
        }
    }

    pub fn phone(&self, id: &str) -> Phone {
        self.phone_with(id, EngineConfig::loopback())
    }

    pub fn phone_with(&self, id: &str, config: EngineConfig) -> Phone {
        let id = PeerId::from(id);
        let (signaling, mut outbound) = ChannelSignaling::new(128);
        let (handler, events) = ChannelEventHandler::new();
        let manager = SessionManager::start(config, Arc::new(signaling), Arc::new(handler));
        self.lines
            .write()
            .unwrap()
            .insert(id.clone(), manager.clone());

        let lines = Arc::clone(&self.lines);
        let tap = self.tap.clone();
        let from = id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let message = match &tap {
                    Some(tap) => match tap(&from, envelope.message) {
                        Some(message) => message,
                        None => continue,
                    },
                    None => envelope.message,
                };
                let target = lines.read().unwrap().get(&envelope.peer).cloned();
                if let Some(target) = target {
                    let _ = target
                        .on_incoming_signal(SignalingEnvelope::new(from.clone(), message))
                        .await;
                }
            }
        });

        Phone {
            id,
            manager,
            events,
        }
    }
}

impl Phone {
    pub async fn next_event(&mut self) -> EngineEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("engine stopped")
    }

    /// Wait for the next incoming call, skipping other events
    pub async fn wait_incoming(&mut self) -> CallInfo {
        loop {
            if let EngineEvent::IncomingCall(info) = self.next_event().await {
                return info;
            }
        }
    }

    /// Wait until `call_id` reaches `state`. Panics if it terminates otherwise.
    pub async fn wait_state(&mut self, call_id: Uuid, state: CallState) -> CallInfo {
        loop {
            if let EngineEvent::StateChanged(info) = self.next_event().await {
                if info.call_id != call_id {
                    continue;
                }
                if info.state == state {
                    return info;
                }
                assert!(
                    !info.state.is_terminal(),
                    "call {} ended in {} ({:?}) while waiting for {}",
                    call_id,
                    info.state,
                    info.termination,
                    state
                );
            }
        }
    }

    /// Every state `call_id` passes through until it reaches `until` or terminates
    pub async fn states_until(&mut self, call_id: Uuid, until: CallState) -> Vec<CallInfo> {
        let mut seen = Vec::new();
        loop {
            if let EngineEvent::StateChanged(info) = self.next_event().await {
                if info.call_id != call_id {
                    continue;
                }
                let done = info.state == until || info.state.is_terminal();
                seen.push(info);
                if done {
                    return seen;
                }
            }
        }
    }
}

/// UDP forwarder placed between a caller and a callee. Each side is told the
/// forwarder is the other party; `cut` makes it drop everything.
pub struct UdpPipe {
    /// Stands in for the caller towards the callee
    caller_side: SocketAddr,
    /// Stands in for the callee towards the caller
    callee_side: SocketAddr,
    caller_real: Arc<Mutex<Option<SocketAddr>>>,
    callee_real: Arc<Mutex<Option<SocketAddr>>>,
    cut: Arc<AtomicBool>,
}

impl UdpPipe {
    pub async fn start() -> Arc<Self> {
        let caller_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let callee_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pipe = Arc::new(UdpPipe {
            caller_side: caller_socket.local_addr().unwrap(),
            callee_side: callee_socket.local_addr().unwrap(),
            caller_real: Arc::default(),
            callee_real: Arc::default(),
            cut: Arc::default(),
        });

        // Callee traffic arrives on the caller's stand-in and leaves from the callee's
        forward(
            Arc::clone(&caller_socket),
            Arc::clone(&callee_socket),
            Arc::clone(&pipe.caller_real),
            Arc::clone(&pipe.cut),
        );
        forward(
            callee_socket,
            caller_socket,
            Arc::clone(&pipe.callee_real),
            Arc::clone(&pipe.cut),
        );
        pipe
    }

    pub fn set_cut(&self, cut: bool) {
        self.cut.store(cut, Ordering::SeqCst);
    }

    /// Signaling tap that swaps advertised candidates for the pipe's ends
    pub fn splice(
        self: &Arc<Self>,
        caller: PeerId,
    ) -> impl Fn(&PeerId, SignalingMessage) -> Option<SignalingMessage> + Send + Sync + 'static {
        let pipe = Arc::clone(self);
        move |from: &PeerId, message: SignalingMessage| match message {
            SignalingMessage::Candidates {
                call_id,
                mut candidates,
            } if !candidates.is_empty() => {
                let (real, stand_in) = if *from == caller {
                    (&pipe.caller_real, pipe.caller_side)
                } else {
                    (&pipe.callee_real, pipe.callee_side)
                };
                *real.lock().unwrap() = Some(candidates[0].address);
                candidates.truncate(1);
                candidates[0].address = stand_in;
                Some(SignalingMessage::Candidates {
                    call_id,
                    candidates,
                })
            }
            other => Some(other),
        }
    }
}

fn forward(
    from: Arc<UdpSocket>,
    to: Arc<UdpSocket>,
    target: Arc<Mutex<Option<SocketAddr>>>,
    cut: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, _)) = from.recv_from(&mut buf).await {
            if cut.load(Ordering::SeqCst) {
                continue;
            }
            let target = *target.lock().unwrap();
            if let Some(target) = target {
                let _ = to.send_to(&buf[..len], target).await;
            }
        }
    });
}

/// Place a call from `caller` to `callee` and accept it; returns the call id
/// once both sides are established
pub async fn connect(caller: &mut Phone, callee: &mut Phone) -> Uuid {
    let call = caller
        .manager
        .start_call(callee.id.clone())
        .await
        .expect("start call");
    let incoming = callee.wait_incoming().await;
    assert_eq!(incoming.call_id, call.call_id);
    assert_eq!(incoming.peer, caller.id);

    callee
        .manager
        .accept_call(call.call_id)
        .await
        .expect("accept call");
    caller.wait_state(call.call_id, CallState::Established).await;
    callee.wait_state(call.call_id, CallState::Established).await;
    call.call_id
}
