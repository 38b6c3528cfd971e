//! Congestion control
//!
//! AIMD over codec quality tiers. Loss and RTT above their thresholds cut
//! the tier multiplicatively; sustained clean conditions climb one tier
//! up at a time.
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
use crate::connection_health::NetworkMetrics;
use tracing::debug;

/// Congestion control configuration
#[derive(Debug, Clone)]
pub struct CongestionControlConfig {
    /// Tier used when media starts
    pub initial_tier: QualityTier,
    /// Lowest tier ever selected
    pub min_tier: QualityTier,
    /// Highest tier ever selected
    pub max_tier: QualityTier,
    /// Packet loss threshold (0.0 - 1.0)
    pub packet_loss_threshold: f32,
    /// RTT threshold (milliseconds)
    pub rtt_threshold_ms: f64,
    /// Consecutive clean updates before probing one tier up
    pub increase_after_updates: u32,
    /// Multiplicative decrease factor applied to the tier index (0.0 - 1.0)
    pub multiplicative_decrease: f32,
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        CongestionControlConfig {
            initial_tier: QualityTier::Medium,
            min_tier: QualityTier::Minimal,
            max_tier: QualityTier::High,
            packet_loss_threshold: 0.05, // 5% loss
            rtt_threshold_ms: 400.0,
            increase_after_updates: 5,
            multiplicative_decrease: 0.5,
        }
    }
}

/// Congestion controller
pub struct CongestionController {
    config: CongestionControlConfig,
    tier: QualityTier,
    clean_updates: u32,
}

impl CongestionController {
    /// Create a new congestion controller
    pub fn new(config: CongestionControlConfig) -> Self {
        let tier = config.initial_tier.clamp(config.min_tier, config.max_tier);
        CongestionController {
            config,
            tier,
            clean_updates: 0,
        }
    }

    /// Pick the tier for the next interval from current link metrics
    pub fn adjust(&mut self, metrics: &NetworkMetrics) -> QualityTier {
        let is_congested = metrics.packet_loss_rate > self.config.packet_loss_threshold
            || metrics.rtt_ms > self.config.rtt_threshold_ms;

        let previous = self.tier;
        if is_congested {
            self.clean_updates = 0;
            let index = self.tier as u8 as f32 * self.config.multiplicative_decrease;
            let lowered = QualityTier::from_u8(index.floor() as u8).unwrap_or(QualityTier::Minimal);
            // Always make progress while congested
            self.tier = lowered.min(self.tier.lower());
        } else if metrics.packet_loss_rate < 0.01
            && metrics.rtt_ms < self.config.rtt_threshold_ms * 0.8
        {
            self.clean_updates += 1;
            if self.clean_updates >= self.config.increase_after_updates {
                self.clean_updates = 0;
                self.tier = self.tier.higher();
            }
        } else {
            // Otherwise, hold and restart the recovery count
            self.clean_updates = 0;
        }

        self.tier = self.tier.clamp(self.config.min_tier, self.config.max_tier);
        if self.tier != previous {
            debug!(from = ?previous, to = ?self.tier, loss = metrics.packet_loss_rate, rtt_ms = metrics.rtt_ms, "Quality tier changed");
        }
        self.tier
    }

    /// Get current tier
    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    /// Reset controller
    pub fn reset(&mut self) {
        self.tier = self
            .config
            .initial_tier
            .clamp(self.config.min_tier, self.config.max_tier);
        self.clean_updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f32, rtt_ms: f64) -> NetworkMetrics {
        NetworkMetrics {
            rtt_ms,
            packet_loss_rate: loss,
            jitter_ms: 5.0,
        }
    }

    #[test]
    fn test_congestion_control_decrease() {
        let mut controller = CongestionController::new(CongestionControlConfig {
            initial_tier: QualityTier::High,
            ..Default::default()
        });

        // 10% loss is above the 5% threshold
        assert_eq!(controller.adjust(&metrics(0.1, 50.0)), QualityTier::Low);
        assert_eq!(controller.adjust(&metrics(0.1, 50.0)), QualityTier::Minimal);
        assert_eq!(controller.adjust(&metrics(0.1, 50.0)), QualityTier::Minimal);
    }

    #[test]
    fn test_congestion_control_increase() {
        let mut controller = CongestionController::new(CongestionControlConfig {
            initial_tier: QualityTier::Minimal,
            ..Default::default()
        });

        for _ in 0..4 {
            assert_eq!(controller.adjust(&metrics(0.0, 50.0)), QualityTier::Minimal);
        }
        assert_eq!(controller.adjust(&metrics(0.0, 50.0)), QualityTier::Low);

        // A single noisy update restarts the recovery count
        for _ in 0..4 {
            controller.adjust(&metrics(0.0, 50.0));
        }
        controller.adjust(&metrics(0.03, 50.0));
        assert_eq!(controller.adjust(&metrics(0.0, 50.0)), QualityTier::Low);
    }

    #[test]
    fn test_rtt_counts_as_congestion() {
        let mut controller = CongestionController::new(CongestionControlConfig::default());
        assert_eq!(controller.adjust(&metrics(0.0, 900.0)), QualityTier::Low);
    }

    #[test]
    fn test_congestion_control_bounds() {
        let mut controller = CongestionController::new(CongestionControlConfig {
            initial_tier: QualityTier::High,
            min_tier: QualityTier::Low,
            max_tier: QualityTier::Medium,
            ..Default::default()
        });
        assert_eq!(controller.tier(), QualityTier::Medium);
        for _ in 0..10 {
            controller.adjust(&metrics(0.5, 50.0));
        }
        assert_eq!(controller.tier(), QualityTier::Low);
        controller.reset();
        assert_eq!(controller.tier(), QualityTier::Medium);
    }
}
