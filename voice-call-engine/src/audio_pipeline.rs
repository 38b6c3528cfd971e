//! Audio media pipeline
//!
//! Outgoing: PCM frame -> codec at the current quality tier -> `MediaFrame`.
//! Incoming: `MediaFrame` -> jitter buffer -> codec -> PCM, with loss
//! concealment filling any slot the buffer reports missing.
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


use crate::audio_codec::{create_codec, AudioCodec, QualityTier};
use crate::config::EngineConfig;
use crate::congestion_control::CongestionController;
use crate::connection_health::NetworkMetrics;
use crate::error::{CallEngineError, CallEngineResult};
use crate::jitter_buffer::{InsertOutcome, JitterBuffer, JitterStats, Playout};
use crate::media_frame::MediaFrame;
use crate::packet_loss_concealment::AudioPlc;
use std::time::Instant;
use tracing::{debug, warn};

/// Audio format for VoIP
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame size in milliseconds
    pub frame_duration_ms: u32,
    /// Preferred codec name
    pub codec: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 48_000,
            frame_duration_ms: 20,
            codec: "pcm".to_string(),
        }
    }
}

impl AudioConfig {
    /// Mono samples per frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn validate(&self) -> CallEngineResult<()> {
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.sample_rate) {
            return Err(CallEngineError::Config(format!(
                "Invalid sample rate: {} (must be 8/12/16/24/48 kHz)",
                self.sample_rate
            )));
        }
        if ![10, 20, 40, 60].contains(&self.frame_duration_ms) {
            return Err(CallEngineError::Config(format!(
                "Invalid frame duration: {} ms",
                self.frame_duration_ms
            )));
        }
        Ok(())
    }
}

/// One frame handed to the audio sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayoutFrame {
    /// Decoded from a received frame
    Voice(Vec<i16>),
    /// Synthesized to mask a loss
    Concealed(Vec<i16>),
    Silence(Vec<i16>),
}

impl PlayoutFrame {
    pub fn samples(&self) -> &[i16] {
        match self {
            PlayoutFrame::Voice(s) | PlayoutFrame::Concealed(s) | PlayoutFrame::Silence(s) => s,
        }
    }

    pub fn into_samples(self) -> Vec<i16> {
        match self {
            PlayoutFrame::Voice(s) | PlayoutFrame::Concealed(s) | PlayoutFrame::Silence(s) => s,
        }
    }
}

/// Media counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub silence_frames: u64,
    pub codec_errors: u64,
}

/// Encoding and playout state for one call
pub struct MediaPipeline {
    audio: AudioConfig,
    codec: Box<dyn AudioCodec>,
    jitter: JitterBuffer,
    plc: AudioPlc,
    congestion: CongestionController,
    next_frame_seq: u32,
    timestamp: u32,
    stats: MediaStats,
}

impl MediaPipeline {
    /// Build a pipeline for the negotiated codec
    pub fn new(config: &EngineConfig, codec_name: &str) -> CallEngineResult<Self> {
        config.audio.validate()?;
        let codec = create_codec(codec_name, config.audio.sample_rate)?;
        Self::with_codec(config, codec)
    }

    /// Build a pipeline around a caller-supplied codec
    pub fn with_codec(config: &EngineConfig, mut codec: Box<dyn AudioCodec>) -> CallEngineResult<Self> {
        let mut jitter_config = config.jitter_buffer.clone();
        jitter_config.frame_duration_ms = config.audio.frame_duration_ms;
        let congestion = CongestionController::new(config.congestion.clone());
        codec.set_tier(congestion.tier())?;

        Ok(MediaPipeline {
            audio: config.audio.clone(),
            codec,
            jitter: JitterBuffer::new(jitter_config),
            plc: AudioPlc::new(config.plc.clone()),
            congestion,
            next_frame_seq: 0,
            timestamp: 0,
            stats: MediaStats::default(),
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.audio.frame_samples()
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    /// Encode one frame of captured PCM. Short input is zero padded.
    pub fn encode_frame(&mut self, pcm: &[i16]) -> CallEngineResult<MediaFrame> {
        let samples = self.frame_samples();
        let payload = if pcm.len() == samples {
            self.codec.encode(pcm)?
        } else {
            let mut padded = pcm[..pcm.len().min(samples)].to_vec();
            padded.resize(samples, 0);
            self.codec.encode(&padded)?
        };

        let frame = MediaFrame {
            seq: self.next_frame_seq,
            timestamp: self.timestamp,
            codec_id: self.codec.codec_id(),
            tier: self.congestion.tier(),
            payload,
        };
        self.next_frame_seq = self.next_frame_seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples as u32);
        self.stats.frames_encoded += 1;
        Ok(frame)
    }

    /// Queue a frame from the peer
    pub fn on_frame_received(&mut self, frame: MediaFrame, arrival: Instant) -> InsertOutcome {
        self.jitter.insert(frame, arrival)
    }

    /// Produce the next frame for the sink. Never blocks.
    pub fn pull_for_playout(&mut self) -> PlayoutFrame {
        let samples = self.frame_samples();
        match self.jitter.pull() {
            Playout::Frame(frame) => match self.decode(&frame) {
                Ok(pcm) => {
                    self.plc.process_frame(&pcm);
                    self.stats.frames_decoded += 1;
                    PlayoutFrame::Voice(pcm)
                }
                Err(e) => {
                    self.stats.codec_errors += 1;
                    debug!(seq = frame.seq, error = %e, "Frame decode failed, concealing");
                    self.conceal(samples)
                }
            },
            Playout::Missing(_) | Playout::Hold => self.conceal(samples),
            Playout::Buffering => {
                self.stats.silence_frames += 1;
                PlayoutFrame::Silence(vec![0; samples])
            }
        }
    }

    fn decode(&mut self, frame: &MediaFrame) -> CallEngineResult<Vec<i16>> {
        if frame.codec_id != self.codec.codec_id() {
            return Err(CallEngineError::CodecError(format!(
                "frame codec {} does not match negotiated {}",
                frame.codec_id,
                self.codec.codec_id()
            )));
        }
        self.codec.decode(&frame.payload, self.frame_samples())
    }

    fn conceal(&mut self, samples: usize) -> PlayoutFrame {
        match self.plc.conceal() {
            Some(mut pcm) => {
                pcm.resize(samples, 0);
                self.stats.frames_concealed += 1;
                PlayoutFrame::Concealed(pcm)
            }
            None => {
                self.stats.silence_frames += 1;
                PlayoutFrame::Silence(vec![0; samples])
            }
        }
    }

    /// Feed link metrics to congestion control and retune the codec
    pub fn on_network_metrics(&mut self, metrics: &NetworkMetrics) -> QualityTier {
        let before = self.congestion.tier();
        let tier = self.congestion.adjust(metrics);
        if tier != before {
            if let Err(e) = self.codec.set_tier(tier) {
                warn!(error = %e, ?tier, "Codec rejected quality tier");
            }
        }
        tier
    }

    pub fn tier(&self) -> QualityTier {
        self.congestion.tier()
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    pub fn stats(&self) -> MediaStats {
        self.stats.clone()
    }
}
