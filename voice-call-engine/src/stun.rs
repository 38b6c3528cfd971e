//! STUN Binding client
//!
//! Just enough of RFC 5389 to learn our server-reflexive address: build a
//! Binding request and read MAPPED-ADDRESS / XOR-MAPPED-ADDRESS from the
//! success response.
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
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingSuccess,
    BindingError,
}

impl StunMessageType {
    fn code(self) -> u16 {
        match self {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingSuccess => 0x0101,
            StunMessageType::BindingError => 0x0111,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(StunMessageType::BindingRequest),
            0x0101 => Some(StunMessageType::BindingSuccess),
            0x0111 => Some(StunMessageType::BindingError),
            _ => None,
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    pub attribute_type: u16,
    pub value: Bytes,
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub message_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Binding request with a fresh transaction id
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        StunMessage {
            message_type: StunMessageType::BindingRequest,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Success response carrying XOR-MAPPED-ADDRESS
    pub fn binding_success(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        StunMessage {
            message_type: StunMessageType::BindingSuccess,
            transaction_id,
            attributes: vec![StunAttribute {
                attribute_type: ATTR_XOR_MAPPED_ADDRESS,
                value: Bytes::from(encode_xor_address(mapped, &transaction_id)),
            }],
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + padded_len(a.value.len()))
            .sum();

        let mut buf = BytesMut::with_capacity(STUN_HEADER_LEN + body_len);
        buf.put_u16(self.message_type.code());
        buf.put_u16(body_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        for attribute in &self.attributes {
            buf.put_u16(attribute.attribute_type);
            buf.put_u16(attribute.value.len() as u16);
            buf.put_slice(&attribute.value);
            buf.put_bytes(0, padded_len(attribute.value.len()) - attribute.value.len());
        }
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> CallEngineResult<Self> {
        if data.len() < STUN_HEADER_LEN {
            return Err(CallEngineError::MalformedPacket("STUN message too short".to_string()));
        }
        // Top two bits are zero for STUN
        if data[0] & 0xC0 != 0 {
            return Err(CallEngineError::MalformedPacket("not a STUN message".to_string()));
        }
        let code = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(CallEngineError::MalformedPacket("bad STUN magic cookie".to_string()));
        }
        if data.len() != STUN_HEADER_LEN + length {
            return Err(CallEngineError::MalformedPacket("STUN length mismatch".to_string()));
        }
        let message_type = StunMessageType::from_code(code).ok_or_else(|| {
            CallEngineError::MalformedPacket(format!("unsupported STUN type {:#06x}", code))
        })?;

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut offset = STUN_HEADER_LEN;
        while offset + 4 <= data.len() {
            let attribute_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let value_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + 4;
            if start + value_len > data.len() {
                return Err(CallEngineError::MalformedPacket(
                    "STUN attribute overruns message".to_string(),
                ));
            }
            attributes.push(StunAttribute {
                attribute_type,
                value: Bytes::copy_from_slice(&data[start..start + value_len]),
            });
            offset = start + padded_len(value_len);
        }

        Ok(StunMessage {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Reflexive address, preferring XOR-MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let find = |kind: u16| self.attributes.iter().find(|a| a.attribute_type == kind);

        if let Some(attribute) = find(ATTR_XOR_MAPPED_ADDRESS) {
            return decode_xor_address(&attribute.value, &self.transaction_id);
        }
        find(ATTR_MAPPED_ADDRESS).and_then(|a| decode_address(&a.value))
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn decode_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = match value[1] {
        FAMILY_IPV4 if value.len() >= 8 => {
            IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7]))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// XOR mask: the cookie, then the transaction id for IPv6
fn xor_mask(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    let plain = decode_address(value)?;
    let mask = xor_mask(transaction_id);
    let port = plain.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match plain.ip() {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            for (o, m) in octets.iter_mut().zip(mask.iter()) {
                *o ^= m;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            for (o, m) in octets.iter_mut().zip(mask.iter()) {
                *o ^= m;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    Some(SocketAddr::new(ip, port))
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mask = xor_mask(transaction_id);
    let mut out = vec![0u8];
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(v4.octets().iter().zip(mask.iter()).map(|(o, m)| o ^ m));
        }
        IpAddr::V6(v6) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(v6.octets().iter().zip(mask.iter()).map(|(o, m)| o ^ m));
        }
    }
    out
}

/// Ask `server` for our reflexive address over `transport`.
///
/// Must run before the call's receive loop owns the transport. Datagrams
/// that are not the matching response are discarded.
pub async fn query_reflexive_address(
    transport: &dyn DatagramTransport,
    server: SocketAddr,
    wait: Duration,
) -> CallEngineResult<SocketAddr> {
    let request = StunMessage::binding_request();
    transport.send_to(&request.to_bytes(), server).await?;

    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = timeout_at(deadline, transport.recv_from(&mut buf))
            .await
            .map_err(|_| CallEngineError::Network(format!("STUN server {} did not answer", server)))??;

        let response = match StunMessage::parse(&buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(from = %from, error = %e, "Ignoring non-STUN datagram during gathering");
                continue;
            }
        };
        if response.transaction_id != request.transaction_id {
            continue;
        }
        if response.message_type != StunMessageType::BindingSuccess {
            warn!(server = %server, "STUN binding rejected");
            return Err(CallEngineError::Network("STUN binding error response".to_string()));
        }
        return response.mapped_address().ok_or_else(|| {
            CallEngineError::MalformedPacket("STUN response without mapped address".to_string())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UdpTransport;
    use tokio::net::UdpSocket;

    #[test]
    fn test_request_layout() {
        let request = StunMessage::binding_request();
        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), STUN_HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[4..8], &MAGIC_COOKIE.to_be_bytes());
    }

    #[test]
    fn test_xor_mapped_address_v4() {
        let mapped: SocketAddr = "203.0.113.7:40001".parse().unwrap();
        let response = StunMessage::binding_success([7; 12], mapped);
        let bytes = response.to_bytes();

        // RFC 5389: port XOR top half of the cookie
        let port = u16::from_be_bytes([bytes[26], bytes[27]]);
        assert_eq!(port, 40001 ^ 0x2112);

        let parsed = StunMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.message_type, StunMessageType::BindingSuccess);
        assert_eq!(parsed.mapped_address(), Some(mapped));
    }

    #[test]
    fn test_xor_mapped_address_v6() {
        let mapped: SocketAddr = "[2001:db8::5]:3478".parse().unwrap();
        let response = StunMessage::binding_success([3; 12], mapped);
        let parsed = StunMessage::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed.mapped_address(), Some(mapped));
    }

    #[test]
    fn test_plain_mapped_address() {
        let message = StunMessage {
            message_type: StunMessageType::BindingSuccess,
            transaction_id: [0; 12],
            attributes: vec![StunAttribute {
                attribute_type: ATTR_MAPPED_ADDRESS,
                value: Bytes::from_static(&[0, 1, 0x0d, 0x96, 192, 0, 2, 1]),
            }],
        };
        let parsed = StunMessage::parse(&message.to_bytes()).unwrap();
        assert_eq!(parsed.mapped_address(), Some("192.0.2.1:3478".parse().unwrap()));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(StunMessage::parse(&[0u8; 8]).is_err());
        let mut bytes = StunMessage::binding_request().to_bytes().to_vec();
        bytes[4] ^= 0xFF;
        assert!(StunMessage::parse(&bytes).is_err());
        // Our own packet magic has the top bits set
        assert!(StunMessage::parse(&[0xC7; 20]).is_err());
    }

    #[tokio::test]
    async fn test_query_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::parse(&buf[..len]).unwrap();
            // Noise first, then the real answer
            server.send_to(b"noise", from).await.unwrap();
            let response = StunMessage::binding_success(request.transaction_id, from);
            server.send_to(&response.to_bytes(), from).await.unwrap();
        });

        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let local = transport.local_addr().unwrap();
        let reflexive = query_reflexive_address(&transport, server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reflexive, local);
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = query_reflexive_address(
            &transport,
            silent.local_addr().unwrap(),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(CallEngineError::Network(_))));
    }
}
