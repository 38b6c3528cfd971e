//! SOCKS5 UDP relay
//!
//! Tunnels call datagrams through a SOCKS5 proxy using UDP ASSOCIATE
//! (RFC 1928) with optional username/password authentication (RFC 1929).
//! The TCP control connection stays open for the life of the association.
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


use crate::error::{CallEngineError, CallEngineResult};
use crate::transport::DatagramTransport;
use async_trait::async_trait;
use callcore_config::ProxyConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Write a SOCKS address (ATYP, address, port)
fn put_address(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Read a SOCKS address from `data`, returning it and the bytes consumed
fn parse_address(data: &[u8]) -> CallEngineResult<(SocketAddr, usize)> {
    let short = || CallEngineError::Proxy("truncated SOCKS address".to_string());
    let atyp = *data.first().ok_or_else(short)?;
    let (ip, ip_len) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = data.get(1..5).ok_or_else(short)?.try_into().map_err(|_| short())?;
            (IpAddr::V4(Ipv4Addr::from(octets)), 4)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = data.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
            (IpAddr::V6(Ipv6Addr::from(octets)), 16)
        }
        ATYP_DOMAIN => {
            return Err(CallEngineError::Proxy(
                "domain-name addresses are not supported".to_string(),
            ))
        }
        other => {
            return Err(CallEngineError::Proxy(format!(
                "unknown address type {:#04x}",
                other
            )))
        }
    };
    let port_at = 1 + ip_len;
    let port_bytes = data.get(port_at..port_at + 2).ok_or_else(short)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok((SocketAddr::new(ip, port), port_at + 2))
}

/// Prefix `payload` with the SOCKS5 UDP request header for `target`
pub fn wrap_datagram(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    // RSV(2) FRAG(1)
    let mut buf = Vec::with_capacity(22 + payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    put_address(&mut buf, target);
    buf.extend_from_slice(payload);
    buf
}

/// Strip the SOCKS5 UDP header, returning the source and payload
pub fn unwrap_datagram(data: &[u8]) -> CallEngineResult<(SocketAddr, &[u8])> {
    if data.len() < 4 {
        return Err(CallEngineError::Proxy("truncated relay datagram".to_string()));
    }
    if data[2] != 0 {
        return Err(CallEngineError::Proxy("fragmented relay datagrams are not supported".to_string()));
    }
    let (source, consumed) = parse_address(&data[3..])?;
    Ok((source, &data[3 + consumed..]))
}

/// UDP transport relayed through a SOCKS5 proxy
pub struct Socks5UdpTransport {
    // Closing this ends the association
    _control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl Socks5UdpTransport {
    /// Negotiate a UDP association and bind the local datagram socket
    pub async fn connect(proxy: &ProxyConfig, bind: SocketAddr) -> CallEngineResult<Self> {
        let mut control = TcpStream::connect(proxy.endpoint()).await.map_err(|e| {
            CallEngineError::Proxy(format!("cannot reach proxy {}: {}", proxy.endpoint(), e))
        })?;
        let proxy_addr = control.peer_addr()?;

        negotiate_auth(&mut control, proxy).await?;

        let socket = UdpSocket::bind(SocketAddr::new(bind.ip(), 0)).await?;
        let local = socket.local_addr()?;

        let mut request = vec![SOCKS_VERSION, CMD_UDP_ASSOCIATE, 0x00];
        put_address(&mut request, local);
        control.write_all(&request).await?;

        let mut head = [0u8; 4];
        control.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(CallEngineError::Proxy(format!(
                "unexpected SOCKS version {}",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(CallEngineError::Proxy(format!(
                "UDP associate refused with code {}",
                head[1]
            )));
        }
        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            other => {
                return Err(CallEngineError::Proxy(format!(
                    "unsupported bound address type {:#04x}",
                    other
                )))
            }
        };
        let mut rest = vec![0u8; addr_len + 2];
        control.read_exact(&mut rest).await?;
        let mut encoded = vec![head[3]];
        encoded.extend_from_slice(&rest);
        let (mut relay, _) = parse_address(&encoded)?;

        // Servers commonly answer 0.0.0.0 meaning "same host as the control connection"
        if relay.ip().is_unspecified() {
            relay.set_ip(proxy_addr.ip());
        }

        info!(proxy = %proxy.endpoint(), relay = %relay, local = %local, "SOCKS5 UDP association established");
        Ok(Socks5UdpTransport {
            _control: control,
            socket,
            relay,
        })
    }

    /// Proxy-side relay address
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }
}

async fn negotiate_auth(control: &mut TcpStream, proxy: &ProxyConfig) -> CallEngineResult<()> {
    let credentials = proxy.credentials();
    let greeting: Vec<u8> = if credentials.is_some() {
        vec![SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        vec![SOCKS_VERSION, 1, METHOD_NO_AUTH]
    };
    control.write_all(&greeting).await?;

    let mut choice = [0u8; 2];
    control.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(CallEngineError::Proxy(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(CallEngineError::Config(
                    "proxy credentials longer than 255 bytes".to_string(),
                ));
            }
            let mut auth = vec![AUTH_VERSION, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            control.write_all(&auth).await?;

            let mut status = [0u8; 2];
            control.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(CallEngineError::Proxy("proxy rejected credentials".to_string()));
            }
            debug!("SOCKS5 authentication accepted");
            Ok(())
        }
        (METHOD_UNACCEPTABLE, _) => Err(CallEngineError::Proxy(
            "proxy accepted none of our authentication methods".to_string(),
        )),
        (method, _) => Err(CallEngineError::Proxy(format!(
            "proxy selected unsupported method {:#04x}",
            method
        ))),
    }
}

#[async_trait]
impl DatagramTransport for Socks5UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> CallEngineResult<usize> {
        let wrapped = wrap_datagram(target, data);
        self.socket.send_to(&wrapped, self.relay).await?;
        Ok(data.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> CallEngineResult<(usize, SocketAddr)> {
        let mut raw = vec![0u8; buf.len() + 22];
        loop {
            let (len, from) = self.socket.recv_from(&mut raw).await?;
            if from != self.relay {
                trace!(from = %from, "Dropping datagram that bypassed the proxy");
                continue;
            }
            match unwrap_datagram(&raw[..len]) {
                Ok((source, payload)) => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok((n, source));
                }
                Err(e) => {
                    debug!(error = %e, "Dropping malformed relay datagram");
                }
            }
        }
    }

    fn local_addr(&self) -> CallEngineResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn relayed_addr(&self) -> Option<SocketAddr> {
        Some(self.relay)
    }
}
