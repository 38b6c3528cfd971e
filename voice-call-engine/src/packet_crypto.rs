//! Per-packet authenticated encryption
//!
//! AES-256-GCM keyed from the agreed session key. The nonce is the
//! derived salt XORed with a direction byte and the packet sequence number,
//! so the two directions never share a nonce and a packet reflected back
//! at its sender fails to open. The 16-byte packet header is bound as
//! associated data.
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


use crate::call_session::CallRole;
use crate::error::{CallEngineError, CallEngineResult};
use crate::key_exchange::{SessionKeys, NONCE_SALT_LEN};
use crate::packet_codec::{self, AckInfo, Packet, PacketHeader, PacketKind, HEADER_LEN};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use zeroize::Zeroizing;

/// AEAD tag appended to every ciphertext
pub const AEAD_TAG_LEN: usize = 16;

/// Direction byte for initiator-to-responder packets
const DIRECTION_FROM_INITIATOR: u8 = 0x01;

/// Direction byte for responder-to-initiator packets
const DIRECTION_FROM_RESPONDER: u8 = 0x02;

fn direction_of(role: CallRole) -> u8 {
    match role {
        CallRole::Initiator => DIRECTION_FROM_INITIATOR,
        CallRole::Responder => DIRECTION_FROM_RESPONDER,
    }
}

/// Seals outgoing and opens incoming packets for one call
pub struct PacketCipher {
    cipher: Aes256Gcm,
    nonce_salt: Zeroizing<[u8; NONCE_SALT_LEN]>,
    send_direction: u8,
    recv_direction: u8,
}

impl PacketCipher {
    pub fn new(keys: &SessionKeys) -> CallEngineResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(keys.key_bytes())
            .map_err(|e| CallEngineError::Crypto(format!("Cipher init error: {}", e)))?;
        let send_direction = direction_of(keys.role());
        let recv_direction = match keys.role() {
            CallRole::Initiator => DIRECTION_FROM_RESPONDER,
            CallRole::Responder => DIRECTION_FROM_INITIATOR,
        };

        Ok(PacketCipher {
            cipher,
            nonce_salt: Zeroizing::new(*keys.nonce_salt()),
            send_direction,
            recv_direction,
        })
    }

    fn nonce(&self, direction: u8, seq: u32) -> [u8; NONCE_SALT_LEN] {
        let mut nonce = *self.nonce_salt;
        nonce[0] ^= direction;
        for (byte, seq_byte) in nonce[8..].iter_mut().zip(seq.to_be_bytes()) {
            *byte ^= seq_byte;
        }
        nonce
    }

    /// Encrypt `plaintext` and frame it as a packet
    pub fn seal(
        &self,
        kind: PacketKind,
        seq: u32,
        ack: AckInfo,
        plaintext: &[u8],
    ) -> CallEngineResult<Bytes> {
        let header = PacketHeader::new(kind, seq, ack, plaintext.len() + AEAD_TAG_LEN)?;
        let aad = header.to_bytes();
        let nonce = self.nonce(self.send_direction, seq);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CallEngineError::Crypto(format!("Encryption error: {}", e)))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + ciphertext.len());
        buf.put_slice(&aad);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Parse and authenticate a datagram from the peer.
    ///
    /// Any failure is reported as `MalformedPacket`; callers drop and count.
    pub fn open(&self, datagram: &[u8]) -> CallEngineResult<Packet> {
        let packet = packet_codec::decode(datagram)?;
        if packet.payload.len() < AEAD_TAG_LEN {
            return Err(CallEngineError::MalformedPacket(
                "payload shorter than tag".to_string(),
            ));
        }

        let aad = packet.header.to_bytes();
        let nonce = self.nonce(self.recv_direction, packet.header.seq);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: packet.payload.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|_| CallEngineError::MalformedPacket("authentication failed".to_string()))?;

        Ok(Packet {
            header: packet.header,
            payload: Bytes::from(plaintext),
        })
    }
}
