//! Call key agreement
//!
//! X25519 Diffie-Hellman with a commit/reveal ordering: the initiator
//! commits to its public value before seeing the responder's, so neither
//! side can grind its value against the other's to steer the fingerprint.
//!
//! ```text
//! Initiator                                   Responder
//!   | --- CallRequest(Commitment(H(g_a))) ----> |
//!   | <-- CallAccept(PublicValue(g_b)) -------- |
//!   |  derive                                   |
//!   | --- KeyExchangeMaterial(PublicValue(g_a)) >|
//!   |                                 check H, derive
//! ```
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
use callcore_types::{ExchangeMaterial, EXCHANGE_VALUE_LEN};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Domain separator mixed into every transcript
const TRANSCRIPT_LABEL: &[u8] = b"callcore/v1";

/// AEAD key length (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce salt length (AES-GCM nonce size)
pub const NONCE_SALT_LEN: usize = 12;

/// Fingerprint length in bytes
pub const FINGERPRINT_LEN: usize = 8;

const FINGERPRINT_EMOJI: [&str; 64] = [
    "😀", "😎", "🤖", "👻", "🐶", "🐱", "🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐮", "🐷", "🐸", "🐵",
    "🐔", "🐧", "🐦", "🦆", "🦉", "🐺", "🐴", "🦄", "🐝", "🐛", "🦋", "🐌", "🐢", "🐍", "🐙", "🦀",
    "🐬", "🐳", "🌵", "🌲", "🌻", "🍀", "🍁", "🍄", "🌙", "⭐", "🔥", "🌈", "❄", "🍎", "🍋", "🍉",
    "🍇", "🍓", "🍒", "🥕", "🌽", "🍞", "🧀", "🍕", "🎈", "🎁", "🎸", "🚀", "⚓", "🔑", "🔔", "⚽",
];

/// Short digest of the session key for out-of-band verification
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint([u8; FINGERPRINT_LEN]);

impl KeyFingerprint {
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Hex digits in groups of four, e.g. `3f2a 9c01 77be 0d41`
    pub fn to_hex(&self) -> String {
        let digits = hex::encode(self.0);
        digits
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Four emoji derived from the fingerprint, for reading aloud
    pub fn emoji(&self) -> [&'static str; 4] {
        let mut out = [""; 4];
        for (slot, pair) in out.iter_mut().zip(self.0.chunks(2)) {
            let index = u16::from_be_bytes([pair[0], pair[1]]) as usize % FINGERPRINT_EMOJI.len();
            *slot = FINGERPRINT_EMOJI[index];
        }
        out
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({})", self.to_hex())
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Keys derived for one call
pub struct SessionKeys {
    role: CallRole,
    key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    nonce_salt: Zeroizing<[u8; NONCE_SALT_LEN]>,
    fingerprint: KeyFingerprint,
}

impl SessionKeys {
    fn derive(shared_secret: &[u8], transcript: &[u8], role: CallRole) -> CallEngineResult<Self> {
        let salt = Sha256::digest(transcript);
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret);

        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        hkdf.expand(b"callcore call key", key.as_mut())
            .map_err(|e| CallEngineError::Crypto(format!("HKDF error: {}", e)))?;

        let mut nonce_salt = Zeroizing::new([0u8; NONCE_SALT_LEN]);
        hkdf.expand(b"callcore nonce salt", nonce_salt.as_mut())
            .map_err(|e| CallEngineError::Crypto(format!("HKDF error: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(key.as_ref());
        hasher.update(transcript);
        let digest = hasher.finalize();
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);

        Ok(SessionKeys {
            role,
            key,
            nonce_salt,
            fingerprint: KeyFingerprint(fingerprint),
        })
    }

    /// Our role in the exchange; selects the nonce direction
    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        self.fingerprint
    }

    pub(crate) fn key_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    pub(crate) fn nonce_salt(&self) -> &[u8; NONCE_SALT_LEN] {
        &self.nonce_salt
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("role", &self.role)
            .field("key", &"<redacted>")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Result of feeding peer material into the exchange
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// More material is required before a key can be derived
    NeedMore,
    /// Key derived; `reply` must be sent to the peer if present
    Complete {
        keys: SessionKeys,
        reply: Option<ExchangeMaterial>,
    },
}

/// Commitment to a public value
pub fn commitment(public_value: &[u8; EXCHANGE_VALUE_LEN]) -> [u8; EXCHANGE_VALUE_LEN] {
    Sha256::digest(public_value).into()
}

/// Reject values that would give a predictable shared secret
fn validate_public_value(
    peer: &[u8; EXCHANGE_VALUE_LEN],
    own: &[u8; EXCHANGE_VALUE_LEN],
) -> CallEngineResult<()> {
    if peer.iter().all(|b| *b == 0) {
        return Err(CallEngineError::InvalidKeyMaterial(
            "peer public value is zero".to_string(),
        ));
    }
    if peer == own {
        return Err(CallEngineError::InvalidKeyMaterial(
            "peer public value reflects our own".to_string(),
        ));
    }
    Ok(())
}

/// Ephemeral key-exchange state for one call
pub struct KeyExchange {
    role: CallRole,
    call_id: Uuid,
    secret: Option<EphemeralSecret>,
    local_public: [u8; EXCHANGE_VALUE_LEN],
    peer_commitment: Option<[u8; EXCHANGE_VALUE_LEN]>,
}

impl KeyExchange {
    /// Start an exchange, returning the material to send first
    pub fn begin(role: CallRole, call_id: Uuid) -> (Self, ExchangeMaterial) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let local_public = *PublicKey::from(&secret).as_bytes();

        let material = match role {
            CallRole::Initiator => ExchangeMaterial::Commitment(commitment(&local_public)),
            CallRole::Responder => ExchangeMaterial::PublicValue(local_public),
        };

        let exchange = KeyExchange {
            role,
            call_id,
            secret: Some(secret),
            local_public,
            peer_commitment: None,
        };
        (exchange, material)
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Whether the secret has been consumed (derived or aborted)
    pub fn is_finished(&self) -> bool {
        self.secret.is_none()
    }

    /// Feed material received from the peer
    pub fn on_material(&mut self, incoming: ExchangeMaterial) -> CallEngineResult<ExchangeOutcome> {
        if self.secret.is_none() {
            return Err(CallEngineError::InvalidKeyMaterial(
                "key exchange already finished".to_string(),
            ));
        }

        match (self.role, incoming) {
            (CallRole::Initiator, ExchangeMaterial::PublicValue(peer)) => {
                let keys = self.derive(&peer)?;
                Ok(ExchangeOutcome::Complete {
                    keys,
                    reply: Some(ExchangeMaterial::PublicValue(self.local_public)),
                })
            }
            (CallRole::Initiator, ExchangeMaterial::Commitment(_)) => {
                Err(CallEngineError::InvalidKeyMaterial(
                    "initiator received a commitment".to_string(),
                ))
            }
            (CallRole::Responder, ExchangeMaterial::Commitment(hash)) => {
                if self.peer_commitment.is_some() {
                    return Err(CallEngineError::InvalidKeyMaterial(
                        "duplicate commitment".to_string(),
                    ));
                }
                self.peer_commitment = Some(hash);
                Ok(ExchangeOutcome::NeedMore)
            }
            (CallRole::Responder, ExchangeMaterial::PublicValue(peer)) => {
                let expected = self.peer_commitment.ok_or_else(|| {
                    CallEngineError::InvalidKeyMaterial(
                        "public value arrived before its commitment".to_string(),
                    )
                })?;
                if commitment(&peer) != expected {
                    return Err(CallEngineError::InvalidKeyMaterial(
                        "public value does not match commitment".to_string(),
                    ));
                }
                let keys = self.derive(&peer)?;
                Ok(ExchangeOutcome::Complete { keys, reply: None })
            }
        }
    }

    /// Drop the ephemeral secret without deriving anything
    pub fn abort(&mut self) {
        self.secret = None;
        self.peer_commitment = None;
    }

    fn derive(&mut self, peer: &[u8; EXCHANGE_VALUE_LEN]) -> CallEngineResult<SessionKeys> {
        validate_public_value(peer, &self.local_public)?;

        let secret = self.secret.take().ok_or_else(|| {
            CallEngineError::InvalidKeyMaterial("key exchange already finished".to_string())
        })?;
        // EphemeralSecret is consumed here and zeroized on drop
        let shared = secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CallEngineError::InvalidKeyMaterial(
                "peer public value is a low-order point".to_string(),
            ));
        }

        let (initiator_public, responder_public) = match self.role {
            CallRole::Initiator => (&self.local_public, peer),
            CallRole::Responder => (peer, &self.local_public),
        };
        let mut transcript = Vec::with_capacity(TRANSCRIPT_LABEL.len() + 16 + 2 * EXCHANGE_VALUE_LEN);
        transcript.extend_from_slice(TRANSCRIPT_LABEL);
        transcript.extend_from_slice(self.call_id.as_bytes());
        transcript.extend_from_slice(initiator_public);
        transcript.extend_from_slice(responder_public);

        self.peer_commitment = None;
        SessionKeys::derive(shared.as_bytes(), &transcript, self.role)
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("role", &self.role)
            .field("call_id", &self.call_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
