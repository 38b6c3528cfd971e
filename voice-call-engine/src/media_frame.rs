//! Media frame payload layout
//!
//! Carried inside the encrypted payload of `Media` packets:
//! frame seq (u32), timestamp in samples (u32), codec id (u8),
//! quality tier (u8), encoded audio.
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


use crate::audio_codec::QualityTier;
use crate::error::{CallEngineError, CallEngineResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Bytes ahead of the encoded audio
pub const MEDIA_HEADER_LEN: usize = 10;

/// One encoded audio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Strictly increasing per direction
    pub seq: u32,
    /// Sample clock of the first sample
    pub timestamp: u32,
    pub codec_id: u8,
    pub tier: QualityTier,
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MEDIA_HEADER_LEN + self.payload.len());
        buf.put_u32(self.seq);
        buf.put_u32(self.timestamp);
        buf.put_u8(self.codec_id);
        buf.put_u8(self.tier as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> CallEngineResult<Self> {
        if data.len() < MEDIA_HEADER_LEN {
            return Err(CallEngineError::MalformedPacket(format!(
                "media payload too short: {} bytes",
                data.len()
            )));
        }
        let seq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let codec_id = data[8];
        let tier = QualityTier::from_u8(data[9]).ok_or_else(|| {
            CallEngineError::MalformedPacket(format!("unknown quality tier {}", data[9]))
        })?;

        Ok(MediaFrame {
            seq,
            timestamp,
            codec_id,
            tier,
            payload: Bytes::copy_from_slice(&data[MEDIA_HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let frame = MediaFrame {
            seq: 0x01020304,
            timestamp: 960,
            codec_id: 1,
            tier: QualityTier::Low,
            payload: Bytes::from_static(b"abc"),
        };
        let wire = frame.to_bytes();
        assert_eq!(&wire[..4], &[1, 2, 3, 4]);
        assert_eq!(wire[9], 1);
        assert_eq!(MediaFrame::parse(&wire).unwrap(), frame);
    }

    #[test]
    fn test_short_and_bad_tier() {
        assert!(MediaFrame::parse(&[0u8; 9]).is_err());
        let mut wire = vec![0u8; MEDIA_HEADER_LEN];
        wire[9] = 7;
        assert!(MediaFrame::parse(&wire).is_err());
    }
}
