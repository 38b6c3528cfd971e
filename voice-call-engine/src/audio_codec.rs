//! Audio codecs
//!
//! The engine treats codecs as pluggable `AudioCodec` implementations that
//! turn one fixed-size PCM frame into an independently decodable payload.
//! Congestion control moves the codec between quality tiers.
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
use serde::{Deserialize, Serialize};

/// Codec id carried in media payloads
pub const PCM_CODEC_ID: u8 = 0;
pub const OPUS_CODEC_ID: u8 = 1;

/// Codec operating point chosen by congestion control
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QualityTier {
    Minimal = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [
        QualityTier::Minimal,
        QualityTier::Low,
        QualityTier::Medium,
        QualityTier::High,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// One step down, saturating
    pub fn lower(self) -> Self {
        Self::from_u8((self as u8).saturating_sub(1)).unwrap_or(QualityTier::Minimal)
    }

    /// One step up, saturating
    pub fn higher(self) -> Self {
        Self::from_u8(self as u8 + 1).unwrap_or(QualityTier::High)
    }

    /// Nominal bitrate for compressed codecs
    pub fn bitrate_bps(self) -> i32 {
        match self {
            QualityTier::Minimal => 8_000,
            QualityTier::Low => 16_000,
            QualityTier::Medium => 24_000,
            QualityTier::High => 32_000,
        }
    }
}

/// A frame codec
pub trait AudioCodec: Send {
    /// Name used in signaling negotiation
    fn name(&self) -> &'static str;

    /// Id written into media payloads
    fn codec_id(&self) -> u8;

    /// Switch operating point
    fn set_tier(&mut self, tier: QualityTier) -> CallEngineResult<()>;

    /// Encode exactly one frame of PCM
    fn encode(&mut self, pcm: &[i16]) -> CallEngineResult<Bytes>;

    /// Decode one payload into `frame_samples` samples
    fn decode(&mut self, payload: &[u8], frame_samples: usize) -> CallEngineResult<Vec<i16>>;
}

/// Codecs this build can negotiate, in preference order
pub fn supported_codecs() -> Vec<String> {
    let mut codecs = Vec::new();
    #[cfg(feature = "opus")]
    codecs.push("opus".to_string());
    codecs.push("pcm".to_string());
    codecs
}

/// Instantiate a codec by negotiated name
pub fn create_codec(name: &str, sample_rate: u32) -> CallEngineResult<Box<dyn AudioCodec>> {
    match name.to_lowercase().as_str() {
        "pcm" => Ok(Box::new(PcmCodec::new())),
        #[cfg(feature = "opus")]
        "opus" => Ok(Box::new(OpusCodec::new(sample_rate)?)),
        other => {
            let _ = sample_rate;
            Err(CallEngineError::CodecError(format!(
                "Unsupported codec: {}",
                other
            )))
        }
    }
}

/// Encoding byte leading every PCM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PcmEncoding {
    /// Linear 16-bit big endian, full rate
    Linear16 = 0,
    /// G.711 mu-law, full rate
    MuLaw = 1,
    /// G.711 mu-law, every second sample
    MuLawHalf = 2,
    /// G.711 mu-law, every fourth sample
    MuLawQuarter = 3,
}

impl PcmEncoding {
    fn for_tier(tier: QualityTier) -> Self {
        match tier {
            QualityTier::High => PcmEncoding::Linear16,
            QualityTier::Medium => PcmEncoding::MuLaw,
            QualityTier::Low => PcmEncoding::MuLawHalf,
            QualityTier::Minimal => PcmEncoding::MuLawQuarter,
        }
    }

    fn from_byte(byte: u8) -> CallEngineResult<Self> {
        match byte {
            0 => Ok(PcmEncoding::Linear16),
            1 => Ok(PcmEncoding::MuLaw),
            2 => Ok(PcmEncoding::MuLawHalf),
            3 => Ok(PcmEncoding::MuLawQuarter),
            other => Err(CallEngineError::CodecError(format!(
                "unknown PCM encoding {}",
                other
            ))),
        }
    }

    fn decimation(self) -> usize {
        match self {
            PcmEncoding::Linear16 | PcmEncoding::MuLaw => 1,
            PcmEncoding::MuLawHalf => 2,
            PcmEncoding::MuLawQuarter => 4,
        }
    }
}

/// Uncompressed codec: linear PCM at the top tier, G.711 mu-law below
#[derive(Debug, Clone)]
pub struct PcmCodec {
    encoding: PcmEncoding,
}

impl PcmCodec {
    pub fn new() -> Self {
        PcmCodec {
            encoding: PcmEncoding::for_tier(QualityTier::Medium),
        }
    }
}

impl Default for PcmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCodec for PcmCodec {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn codec_id(&self) -> u8 {
        PCM_CODEC_ID
    }

    fn set_tier(&mut self, tier: QualityTier) -> CallEngineResult<()> {
        self.encoding = PcmEncoding::for_tier(tier);
        Ok(())
    }

    fn encode(&mut self, pcm: &[i16]) -> CallEngineResult<Bytes> {
        let step = self.encoding.decimation();
        let mut buf = BytesMut::with_capacity(1 + pcm.len() * 2 / step);
        buf.put_u8(self.encoding as u8);

        match self.encoding {
            PcmEncoding::Linear16 => {
                for sample in pcm {
                    buf.put_i16(*sample);
                }
            }
            _ => {
                for sample in pcm.iter().step_by(step) {
                    buf.put_u8(mulaw_encode(*sample));
                }
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&mut self, payload: &[u8], frame_samples: usize) -> CallEngineResult<Vec<i16>> {
        let (&first, body) = payload
            .split_first()
            .ok_or_else(|| CallEngineError::CodecError("empty PCM payload".to_string()))?;
        let encoding = PcmEncoding::from_byte(first)?;

        let samples: Vec<i16> = match encoding {
            PcmEncoding::Linear16 => {
                if body.len() % 2 != 0 {
                    return Err(CallEngineError::CodecError(
                        "odd linear PCM payload".to_string(),
                    ));
                }
                body.chunks_exact(2)
                    .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            }
            _ => {
                let step = encoding.decimation();
                body.iter()
                    .flat_map(|byte| std::iter::repeat(mulaw_decode(*byte)).take(step))
                    .collect()
            }
        };

        let mut samples = samples;
        samples.resize(frame_samples, 0);
        Ok(samples)
    }
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// G.711 mu-law compress one sample
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = if value < 0 {
        value = -value;
        0x80
    } else {
        0x00
    };
    value = value.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && value & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (value >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

/// G.711 mu-law expand one byte
pub fn mulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Opus through libopus
#[cfg(feature = "opus")]
pub struct OpusCodec {
    encoder: audiopus::coder::Encoder,
    decoder: audiopus::coder::Decoder,
}

#[cfg(feature = "opus")]
impl OpusCodec {
    pub fn new(sample_rate: u32) -> CallEngineResult<Self> {
        use audiopus::{coder::Decoder, coder::Encoder, Application, Channels, SampleRate};

        let rate = match sample_rate {
            8000 => SampleRate::Hz8000,
            12000 => SampleRate::Hz12000,
            16000 => SampleRate::Hz16000,
            24000 => SampleRate::Hz24000,
            48000 => SampleRate::Hz48000,
            _ => {
                return Err(CallEngineError::CodecError(format!(
                    "Unsupported sample rate: {}",
                    sample_rate
                )))
            }
        };

        let mut encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| CallEngineError::CodecError(format!("Failed to create encoder: {:?}", e)))?;
        encoder
            .set_bitrate(audiopus::Bitrate::BitsPerSecond(
                QualityTier::Medium.bitrate_bps(),
            ))
            .map_err(|e| CallEngineError::CodecError(format!("Failed to set bitrate: {:?}", e)))?;
        let decoder = Decoder::new(rate, Channels::Mono)
            .map_err(|e| CallEngineError::CodecError(format!("Failed to create decoder: {:?}", e)))?;

        Ok(OpusCodec { encoder, decoder })
    }
}

#[cfg(feature = "opus")]
impl AudioCodec for OpusCodec {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn codec_id(&self) -> u8 {
        OPUS_CODEC_ID
    }

    fn set_tier(&mut self, tier: QualityTier) -> CallEngineResult<()> {
        self.encoder
            .set_bitrate(audiopus::Bitrate::BitsPerSecond(tier.bitrate_bps()))
            .map_err(|e| CallEngineError::CodecError(format!("Failed to set bitrate: {:?}", e)))
    }

    fn encode(&mut self, pcm: &[i16]) -> CallEngineResult<Bytes> {
        let mut encoded = vec![0u8; 4000];
        let len = self
            .encoder
            .encode(pcm, &mut encoded)
            .map_err(|e| CallEngineError::CodecError(format!("Opus encoding error: {:?}", e)))?;
        encoded.truncate(len);
        Ok(Bytes::from(encoded))
    }

    fn decode(&mut self, payload: &[u8], frame_samples: usize) -> CallEngineResult<Vec<i16>> {
        let mut pcm = vec![0i16; frame_samples];
        let decoded = self
            .decoder
            .decode(Some(payload), &mut pcm, false)
            .map_err(|e| CallEngineError::CodecError(format!("Opus decoding error: {:?}", e)))?;
        pcm.truncate(decoded);
        pcm.resize(frame_samples, 0);
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| ((i as i32 * 97) % 20_000 - 10_000) as i16).collect()
    }

    #[test]
    fn test_linear_tier_is_lossless() {
        let mut codec = PcmCodec::new();
        codec.set_tier(QualityTier::High).unwrap();
        let pcm = ramp(960);
        let payload = codec.encode(&pcm).unwrap();
        assert_eq!(payload.len(), 1 + 960 * 2);
        assert_eq!(codec.decode(&payload, 960).unwrap(), pcm);
    }

    #[test]
    fn test_lower_tiers_shrink_payload() {
        let mut codec = PcmCodec::new();
        let pcm = ramp(960);
        let mut last = usize::MAX;
        for tier in QualityTier::ALL.iter().rev() {
            codec.set_tier(*tier).unwrap();
            let payload = codec.encode(&pcm).unwrap();
            assert!(payload.len() < last);
            last = payload.len();
            assert_eq!(codec.decode(&payload, 960).unwrap().len(), 960);
        }
    }

    #[test]
    fn test_mulaw_error_is_bounded() {
        for sample in (i16::MIN as i32 + 1..i16::MAX as i32).step_by(37) {
            let sample = sample as i16;
            let decoded = mulaw_decode(mulaw_encode(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            // mu-law quantisation step grows with magnitude
            assert!(error <= (sample as i32).abs() / 16 + 140, "{} -> {}", sample, decoded);
        }
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let mut codec = PcmCodec::new();
        assert!(matches!(codec.decode(&[], 960), Err(CallEngineError::CodecError(_))));
        assert!(matches!(codec.decode(&[9, 1, 2], 960), Err(CallEngineError::CodecError(_))));
        assert!(codec.decode(&[0, 1, 2, 3], 960).is_err());
    }

    #[test]
    fn test_tier_stepping_saturates() {
        assert_eq!(QualityTier::Minimal.lower(), QualityTier::Minimal);
        assert_eq!(QualityTier::High.higher(), QualityTier::High);
        assert_eq!(QualityTier::Low.higher(), QualityTier::Medium);
        assert_eq!(QualityTier::from_u8(4), None);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(create_codec("speex", 48_000).is_err());
        assert!(supported_codecs().contains(&"pcm".to_string()));
    }
}
