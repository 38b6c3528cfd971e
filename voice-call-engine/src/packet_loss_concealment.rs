//! Packet Loss Concealment (PLC)
//!
//! Masks missing audio frames by replaying the last good frame with a
//! decaying gain. After `max_conceal_frames` consecutive misses the output
//! falls back to silence until a good frame arrives.
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


/// Audio PLC configuration
#[derive(Debug, Clone)]
pub struct AudioPlcConfig {
    /// Enable PLC
    pub enabled: bool,
    /// Maximum consecutive lost frames to conceal
    pub max_conceal_frames: usize,
    /// Gain applied per concealed frame (0.0 - 1.0)
    pub attenuation: f32,
}

impl Default for AudioPlcConfig {
    fn default() -> Self {
        AudioPlcConfig {
            enabled: true,
            max_conceal_frames: 5,
            attenuation: 0.7,
        }
    }
}

/// Audio packet loss concealment
pub struct AudioPlc {
    /// Last decoded audio samples
    last_samples: Vec<i16>,
    config: AudioPlcConfig,
    /// Consecutive lost frames
    consecutive_lost: usize,
}

impl AudioPlc {
    /// Create a new audio PLC
    pub fn new(config: AudioPlcConfig) -> Self {
        AudioPlc {
            last_samples: Vec::new(),
            config,
            consecutive_lost: 0,
        }
    }

    /// Remember a successfully decoded frame
    pub fn process_frame(&mut self, samples: &[i16]) {
        self.consecutive_lost = 0;
        self.last_samples.clear();
        self.last_samples.extend_from_slice(samples);
    }

    /// Produce a replacement for a lost frame, or `None` once concealment
    /// is exhausted (the caller plays silence).
    pub fn conceal(&mut self) -> Option<Vec<i16>> {
        self.consecutive_lost += 1;

        if !self.config.enabled
            || self.last_samples.is_empty()
            || self.consecutive_lost > self.config.max_conceal_frames
        {
            return None;
        }

        let start_gain = self.config.attenuation.powi(self.consecutive_lost as i32 - 1);
        let end_gain = self.config.attenuation.powi(self.consecutive_lost as i32);
        let len = self.last_samples.len().max(1) as f32;

        // Ramp across the frame so consecutive replays join without a step
        let samples = self
            .last_samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let gain = start_gain + (end_gain - start_gain) * (i as f32 / len);
                (*s as f32 * gain) as i16
            })
            .collect();
        Some(samples)
    }

    pub fn consecutive_lost(&self) -> usize {
        self.consecutive_lost
    }

    /// Reset PLC state
    pub fn reset(&mut self) {
        self.last_samples.clear();
        self.consecutive_lost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(samples: &[i16]) -> i32 {
        samples.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0)
    }

    #[test]
    fn test_audio_plc_fades_then_gives_up() {
        let mut plc = AudioPlc::new(AudioPlcConfig::default());
        plc.process_frame(&vec![10_000i16; 960]);

        let mut last_peak = 10_000;
        for _ in 0..5 {
            let frame = plc.conceal().unwrap();
            assert_eq!(frame.len(), 960);
            let p = peak(&frame);
            assert!(p <= last_peak);
            last_peak = p;
        }
        assert!(last_peak < 10_000);
        assert!(plc.conceal().is_none());
        assert_eq!(plc.consecutive_lost(), 6);
    }

    #[test]
    fn test_good_frame_restarts_concealment() {
        let mut plc = AudioPlc::new(AudioPlcConfig::default());
        plc.process_frame(&[1000; 10]);
        for _ in 0..7 {
            plc.conceal();
        }
        plc.process_frame(&[1000; 10]);
        assert!(plc.conceal().is_some());
    }

    #[test]
    fn test_nothing_to_replay() {
        let mut plc = AudioPlc::new(AudioPlcConfig::default());
        assert!(plc.conceal().is_none());
    }

    #[test]
    fn test_audio_plc_reset() {
        let mut plc = AudioPlc::new(AudioPlcConfig::default());
        plc.process_frame(&[5; 4]);
        plc.conceal();
        plc.reset();
        assert_eq!(plc.consecutive_lost(), 0);
        assert!(plc.conceal().is_none());
    }
}
