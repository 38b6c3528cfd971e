//! Audio sources and sinks
//!
//! The media task pulls one frame per tick from an `AudioSource` and hands
//! one `PlayoutFrame` per tick to an `AudioSink`. Both can be swapped while
//! a call runs.
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


use crate::audio_pipeline::PlayoutFrame;
use std::collections::VecDeque;
use std::f32::consts::PI;
use tokio::sync::mpsc;

/// Captured audio
pub trait AudioSource: Send {
    /// Next `samples` mono samples, or `None` when there is nothing to send
    fn read_frame(&mut self, samples: usize) -> Option<Vec<i16>>;
}

/// Playback
pub trait AudioSink: Send {
    fn write_frame(&mut self, frame: PlayoutFrame);
}

/// Always silent
#[derive(Debug, Default)]
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn read_frame(&mut self, samples: usize) -> Option<Vec<i16>> {
        Some(vec![0; samples])
    }
}

/// Sine generator
#[derive(Debug, Clone)]
pub struct ToneSource {
    frequency_hz: f32,
    sample_rate: u32,
    amplitude: f32,
    phase: f32,
}

impl ToneSource {
    pub fn new(frequency_hz: f32, sample_rate: u32) -> Self {
        ToneSource {
            frequency_hz,
            sample_rate,
            amplitude: 0.3,
            phase: 0.0,
        }
    }

    /// Peak level as a fraction of full scale
    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }
}

impl AudioSource for ToneSource {
    fn read_frame(&mut self, samples: usize) -> Option<Vec<i16>> {
        let step = 2.0 * PI * self.frequency_hz / self.sample_rate.max(1) as f32;
        let peak = self.amplitude * i16::MAX as f32;
        let frame = (0..samples)
            .map(|_| {
                let sample = (self.phase.sin() * peak) as i16;
                self.phase = (self.phase + step) % (2.0 * PI);
                sample
            })
            .collect();
        Some(frame)
    }
}

/// Host pushes captured frames through a channel
pub struct ChannelSource {
    frames: mpsc::Receiver<Vec<i16>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Vec<i16>>, Self) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        (tx, ChannelSource { frames })
    }
}

impl AudioSource for ChannelSource {
    fn read_frame(&mut self, samples: usize) -> Option<Vec<i16>> {
        let mut frame = self.frames.try_recv().ok()?;
        frame.resize(samples, 0);
        Some(frame)
    }
}

/// Host pulls decoded frames from a channel. Frames are dropped when the
/// host falls behind.
pub struct ChannelSink {
    frames: mpsc::Sender<PlayoutFrame>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PlayoutFrame>) {
        let (frames, rx) = mpsc::channel(capacity.max(1));
        (ChannelSink { frames }, rx)
    }
}

impl AudioSink for ChannelSink {
    fn write_frame(&mut self, frame: PlayoutFrame) {
        let _ = self.frames.try_send(frame);
    }
}

/// Discards playback
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write_frame(&mut self, _frame: PlayoutFrame) {}
}

/// Plays queued PCM once, then either silence or a looping hold clip
#[derive(Debug, Default)]
pub struct PcmQueueSource {
    queue: VecDeque<i16>,
    hold_clip: Vec<i16>,
    hold_pos: usize,
    on_hold: bool,
}

impl PcmQueueSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples to the play queue
    pub fn enqueue(&mut self, samples: &[i16]) {
        self.queue.extend(samples.iter().copied());
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.len()
    }

    /// Clip looped while on hold
    pub fn set_hold_clip(&mut self, clip: Vec<i16>) {
        self.hold_clip = clip;
        self.hold_pos = 0;
    }

    /// While on hold the queue is paused and the hold clip plays
    pub fn set_on_hold(&mut self, on_hold: bool) {
        self.on_hold = on_hold;
        self.hold_pos = 0;
    }

    pub fn is_on_hold(&self) -> bool {
        self.on_hold
    }
}

impl AudioSource for PcmQueueSource {
    fn read_frame(&mut self, samples: usize) -> Option<Vec<i16>> {
        if self.on_hold {
            if self.hold_clip.is_empty() {
                return Some(vec![0; samples]);
            }
            let clip_len = self.hold_clip.len();
            let frame = (0..samples)
                .map(|i| self.hold_clip[(self.hold_pos + i) % clip_len])
                .collect();
            self.hold_pos = (self.hold_pos + samples) % clip_len;
            return Some(frame);
        }

        if self.queue.is_empty() {
            return Some(vec![0; samples]);
        }
        let take = samples.min(self.queue.len());
        let mut frame: Vec<i16> = self.queue.drain(..take).collect();
        frame.resize(samples, 0);
        Some(frame)
    }
}
