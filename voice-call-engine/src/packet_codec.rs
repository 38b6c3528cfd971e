//! Wire packet framing
//!
//! Every datagram exchanged between the two endpoints starts with a fixed
//! 16-byte big-endian header:
//!
//! ```text
//!  0      1      2             6             10            14      16
//! +------+------+-------------+-------------+-------------+-------+-----------
//! | 0xC7 | type | sequence    | ack base    | ack bitmask | len   | payload...
//! +------+------+-------------+-------------+-------------+-------+-----------
//! ```
//!
//! The payload is AEAD ciphertext (see `packet_crypto`). Decoding validates
//! structure only and never panics on hostile input.
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
use bytes::{BufMut, Bytes, BytesMut};

/// Magic/version byte
pub const PACKET_MAGIC: u8 = 0xC7;

/// Fixed header size
pub const HEADER_LEN: usize = 16;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Carries acknowledgements only (sent while the microphone is muted)
    SignalingAck = 1,
    Media = 2,
    Ping = 3,
    Pong = 4,
    /// In-band key confirmation
    KeyExchange = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = CallEngineError;

    fn try_from(tag: u8) -> CallEngineResult<Self> {
        match tag {
            1 => Ok(PacketKind::SignalingAck),
            2 => Ok(PacketKind::Media),
            3 => Ok(PacketKind::Ping),
            4 => Ok(PacketKind::Pong),
            5 => Ok(PacketKind::KeyExchange),
            other => Err(CallEngineError::MalformedPacket(format!(
                "unknown packet type {}",
                other
            ))),
        }
    }
}

/// Piggybacked acknowledgement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckInfo {
    /// Highest sequence received from the peer
    pub base: u32,
    /// Bit i set means `base - i` was received
    pub mask: u32,
}

impl AckInfo {
    /// Whether `seq` is acknowledged by this report
    pub fn acknowledges(&self, seq: u32) -> bool {
        let distance = self.base.wrapping_sub(seq);
        distance < 32 && self.mask & (1 << distance) != 0
    }
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub seq: u32,
    pub ack: AckInfo,
    pub payload_len: u16,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, seq: u32, ack: AckInfo, payload_len: usize) -> CallEngineResult<Self> {
        let payload_len = u16::try_from(payload_len).map_err(|_| {
            CallEngineError::MalformedPacket(format!("payload too large: {} bytes", payload_len))
        })?;
        Ok(PacketHeader {
            kind,
            seq,
            ack,
            payload_len,
        })
    }

    /// Serialize the 16 header bytes
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = PACKET_MAGIC;
        out[1] = self.kind as u8;
        out[2..6].copy_from_slice(&self.seq.to_be_bytes());
        out[6..10].copy_from_slice(&self.ack.base.to_be_bytes());
        out[10..14].copy_from_slice(&self.ack.mask.to_be_bytes());
        out[14..16].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    /// Parse a header from the start of `data`
    pub fn parse(data: &[u8]) -> CallEngineResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CallEngineError::MalformedPacket(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != PACKET_MAGIC {
            return Err(CallEngineError::MalformedPacket(format!(
                "bad magic 0x{:02x}",
                data[0]
            )));
        }
        let kind = PacketKind::try_from(data[1])?;
        let seq = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let base = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let mask = u32::from_be_bytes([data[10], data[11], data[12], data[13]]);
        let payload_len = u16::from_be_bytes([data[14], data[15]]);

        Ok(PacketHeader {
            kind,
            seq,
            ack: AckInfo { base, mask },
            payload_len,
        })
    }
}

/// A framed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Frame `payload` behind a header
pub fn encode(kind: PacketKind, payload: &[u8], seq: u32, ack: AckInfo) -> CallEngineResult<Bytes> {
    let header = PacketHeader::new(kind, seq, ack, payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a datagram. The length field must match the remaining bytes exactly.
pub fn decode(data: &[u8]) -> CallEngineResult<Packet> {
    let header = PacketHeader::parse(data)?;
    let body = &data[HEADER_LEN..];
    if body.len() != header.payload_len as usize {
        return Err(CallEngineError::MalformedPacket(format!(
            "length mismatch: header says {}, got {}",
            header.payload_len,
            body.len()
        )));
    }
    Ok(Packet {
        header,
        payload: Bytes::copy_from_slice(body),
    })
}
