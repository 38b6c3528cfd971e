//! Datagram transport
//!
//! `DatagramTransport` abstracts the socket a call sends through: plain UDP
//! or a SOCKS5 relay. `CallTransport` owns the per-call receive loop and a
//! bounded send queue so a slow socket only ever stalls the sender.
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


use crate::candidates::TransportCandidate;
use crate::config::EngineConfig;
use crate::error::{CallEngineError, CallEngineResult};
use crate::proxy::Socks5UdpTransport;
use crate::stun;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Largest datagram we accept
pub const MAX_DATAGRAM: usize = 65_535;

/// How long gathering waits for the STUN server
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

/// A socket that moves whole datagrams
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> CallEngineResult<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> CallEngineResult<(usize, SocketAddr)>;

    fn local_addr(&self) -> CallEngineResult<SocketAddr>;

    /// Public relay address when every datagram goes through a proxy
    fn relayed_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Plain UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> CallEngineResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CallEngineError::Network(format!("Failed to bind UDP {}: {}", addr, e)))?;
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> CallEngineResult<usize> {
        Ok(self.socket.send_to(data, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> CallEngineResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> CallEngineResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Open the transport a new call should use
pub async fn open_transport(config: &EngineConfig) -> CallEngineResult<Arc<dyn DatagramTransport>> {
    match &config.proxy {
        Some(proxy) => Ok(Arc::new(
            Socks5UdpTransport::connect(proxy, config.bind_address).await?,
        )),
        None => Ok(Arc::new(UdpTransport::bind(config.bind_address).await?)),
    }
}

/// Address of the interface that routes toward the internet.
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn outbound_interface_ip() -> Option<IpAddr> {
    let route = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    route.connect("8.8.8.8:80").await.ok()?;
    route.local_addr().ok().map(|a| a.ip())
}

/// Collect our candidates for one call.
///
/// Behind a proxy the only usable candidate is the relay address; otherwise
/// host, server-reflexive (when a STUN server is configured) and configured
/// relays. Gathering failures only shrink the list.
///
/// No allocation is made on a configured relay. It is advertised as-is and
/// must already forward datagrams for this endpoint, as arranged by whoever
/// operates it.
pub async fn gather_candidates(
    transport: &dyn DatagramTransport,
    config: &EngineConfig,
) -> CallEngineResult<Vec<TransportCandidate>> {
    if let Some(relay) = transport.relayed_addr() {
        debug!(relay = %relay, "Proxy configured, advertising relayed candidate only");
        return Ok(vec![TransportCandidate::relayed(relay)]);
    }

    let local = transport.local_addr()?;
    let mut candidates = Vec::new();

    let host_ip = if local.ip().is_unspecified() {
        outbound_interface_ip()
            .await
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        local.ip()
    };
    let host = SocketAddr::new(host_ip, local.port());
    candidates.push(TransportCandidate::host(host));

    if let Some(server) = &config.stun_server {
        match tokio::net::lookup_host(server.as_str()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(server_addr) => {
                    match stun::query_reflexive_address(transport, server_addr, STUN_TIMEOUT).await {
                        Ok(reflexive) if reflexive != host => {
                            candidates.push(TransportCandidate::server_reflexive(reflexive));
                        }
                        Ok(_) => trace!("Reflexive address equals host address"),
                        Err(e) => warn!(server = %server, error = %e, "STUN query failed"),
                    }
                }
                None => warn!(server = %server, "STUN server resolved to no addresses"),
            },
            Err(e) => warn!(server = %server, error = %e, "Cannot resolve STUN server"),
        }
    }

    for relay in &config.relay_servers {
        candidates.push(TransportCandidate::relayed(*relay));
    }

    info!(count = candidates.len(), "Gathered transport candidates");
    Ok(candidates)
}

/// Datagram received for a call
#[derive(Debug, Clone)]
pub struct Inbound {
    pub data: Bytes,
    pub from: SocketAddr,
    pub received_at: Instant,
}

struct Outbound {
    data: Bytes,
    to: SocketAddr,
}

/// Socket tasks for one call
pub struct CallTransport {
    outgoing: mpsc::Sender<Outbound>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl CallTransport {
    /// Spawn the receive loop and the send queue.
    ///
    /// Both tasks stop when `shutdown` flips to true or the transport is dropped.
    pub fn start(
        call_id: Uuid,
        transport: Arc<dyn DatagramTransport>,
        inbound: mpsc::Sender<Inbound>,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> CallEngineResult<Self> {
        let local_addr = transport.local_addr()?;
        let (outgoing, mut queue) = mpsc::channel::<Outbound>(queue_capacity.max(1));

        let recv_transport = Arc::clone(&transport);
        let mut recv_shutdown = shutdown.clone();
        let receiver = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = recv_shutdown.changed() => break,
                    result = recv_transport.recv_from(&mut buf) => match result {
                        Ok((len, from)) => {
                            let datagram = Inbound {
                                data: Bytes::copy_from_slice(&buf[..len]),
                                from,
                                received_at: Instant::now(),
                            };
                            if inbound.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // ICMP errors surface here on some platforms; keep reading
                            debug!(call_id = %call_id, error = %e, "Receive error");
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    }
                }
            }
            trace!(call_id = %call_id, "Receive loop stopped");
        });

        let mut send_shutdown = shutdown;
        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_shutdown.changed() => break,
                    next = queue.recv() => match next {
                        Some(out) => {
                            if let Err(e) = transport.send_to(&out.data, out.to).await {
                                debug!(call_id = %call_id, to = %out.to, error = %e, "Send failed");
                            }
                        }
                        None => break,
                    }
                }
            }
            trace!(call_id = %call_id, "Send queue stopped");
        });

        Ok(CallTransport {
            outgoing,
            local_addr,
            tasks: vec![receiver, sender],
        })
    }

    /// Queue a datagram, waiting while the queue is full
    pub async fn send(&self, data: Bytes, to: SocketAddr) -> CallEngineResult<()> {
        self.outgoing
            .send(Outbound { data, to })
            .await
            .map_err(|_| CallEngineError::Closed)
    }

    /// Queue a datagram unless the queue is full. Returns false if dropped.
    pub fn try_send(&self, data: Bytes, to: SocketAddr) -> bool {
        self.outgoing.try_send(Outbound { data, to }).is_ok()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for CallTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
