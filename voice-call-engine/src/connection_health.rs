//! Connection health monitoring
//!
//! Tracks liveness of the active candidate, round-trip time from ping/pong
//! exchanges and loss from ack reports, and classifies the link for
//! congestion control and the host's signal indicator.
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


use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Delivery outcomes kept for the loss estimate
const LOSS_WINDOW: usize = 100;

/// RTT samples kept for the average
const RTT_WINDOW: usize = 50;

/// Connection quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Excellent: < 100ms RTT, < 1% loss
    Excellent,
    /// Good: < 200ms RTT, < 3% loss
    Good,
    /// Fair: < 400ms RTT, < 8% loss
    Fair,
    /// Poor: anything worse that still answers
    Poor,
    /// Disconnected: silent past the grace period
    Disconnected,
}

/// Network metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkMetrics {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss_rate: f32,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
}

/// Connection health monitor
pub struct ConnectionHealthMonitor {
    call_id: Uuid,
    grace_period: Duration,
    last_heard: Instant,
    connection_quality: ConnectionQuality,
    deliveries: VecDeque<bool>,
    rtt_samples: VecDeque<f64>,
    smoothed_rtt_ms: Option<f64>,
    jitter_ms: f64,
    // Statistics
    packets_sent: u64,
    packets_received: u64,
    packets_lost: u64,
}

impl ConnectionHealthMonitor {
    /// Create a new connection health monitor
    pub fn new(call_id: Uuid, grace_period: Duration, now: Instant) -> Self {
        ConnectionHealthMonitor {
            call_id,
            grace_period,
            last_heard: now,
            connection_quality: ConnectionQuality::Good,
            deliveries: VecDeque::with_capacity(LOSS_WINDOW),
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW),
            smoothed_rtt_ms: None,
            jitter_ms: 0.0,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
        }
    }

    /// Record packet sent
    pub fn record_packet_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Record an authenticated packet from the peer
    pub fn record_packet_received(&mut self, now: Instant) {
        self.packets_received += 1;
        self.last_heard = now;
    }

    /// Record the verdicts of one ack report
    pub fn record_delivery(&mut self, delivered: usize, lost: usize) {
        self.packets_lost += lost as u64;
        let outcomes = std::iter::repeat(true)
            .take(delivered)
            .chain(std::iter::repeat(false).take(lost));
        for outcome in outcomes {
            self.deliveries.push_back(outcome);
            if self.deliveries.len() > LOSS_WINDOW {
                self.deliveries.pop_front();
            }
        }
    }

    /// Record RTT measurement
    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        self.rtt_samples.push_back(rtt_ms);
        if self.rtt_samples.len() > RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.smoothed_rtt_ms = Some(match self.smoothed_rtt_ms {
            Some(srtt) => srtt + (rtt_ms - srtt) / 8.0,
            None => rtt_ms,
        });
    }

    /// Record jitter measurement
    pub fn record_jitter(&mut self, jitter_ms: f64) {
        self.jitter_ms = jitter_ms;
    }

    /// Whether the peer has been silent longer than the grace period
    pub fn is_silent(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heard) > self.grace_period
    }

    /// Restart the liveness clock, e.g. after switching candidates
    pub fn mark_alive(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Update connection health
    pub fn update_health(&mut self, now: Instant) -> ConnectionQuality {
        let previous = self.connection_quality;

        self.connection_quality = if self.is_silent(now) {
            ConnectionQuality::Disconnected
        } else {
            let rtt = self.smoothed_rtt();
            let loss = self.packet_loss_rate();
            if rtt < 100.0 && loss < 0.01 {
                ConnectionQuality::Excellent
            } else if rtt < 200.0 && loss < 0.03 {
                ConnectionQuality::Good
            } else if rtt < 400.0 && loss < 0.08 {
                ConnectionQuality::Fair
            } else {
                ConnectionQuality::Poor
            }
        };

        if previous != self.connection_quality {
            debug!(
                call_id = %self.call_id,
                from = previous.as_str(),
                to = self.connection_quality.as_str(),
                "Link quality changed"
            );
        }
        self.connection_quality
    }

    /// Get current connection quality
    pub fn quality(&self) -> ConnectionQuality {
        self.connection_quality
    }

    /// Smoothed RTT, or a conservative default before the first sample
    pub fn smoothed_rtt(&self) -> f64 {
        self.smoothed_rtt_ms.unwrap_or(100.0)
    }

    /// Get average RTT
    pub fn average_rtt(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            return self.smoothed_rtt();
        }
        self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64
    }

    /// Loss rate over the recent delivery window
    pub fn packet_loss_rate(&self) -> f32 {
        if self.deliveries.is_empty() {
            return 0.0;
        }
        let lost = self.deliveries.iter().filter(|d| !**d).count();
        lost as f32 / self.deliveries.len() as f32
    }

    pub fn metrics(&self) -> NetworkMetrics {
        NetworkMetrics {
            rtt_ms: self.smoothed_rtt(),
            packet_loss_rate: self.packet_loss_rate(),
            jitter_ms: self.jitter_ms,
        }
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            packet_loss_rate: self.packet_loss_rate(),
            average_rtt_ms: self.average_rtt(),
            quality: self.connection_quality,
        }
    }

    /// Reset path measurements after a candidate change
    pub fn reset(&mut self, now: Instant) {
        self.deliveries.clear();
        self.rtt_samples.clear();
        self.smoothed_rtt_ms = None;
        self.last_heard = now;
        self.connection_quality = ConnectionQuality::Good;
    }
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packet_loss_rate: f32,
    pub average_rtt_ms: f64,
    pub quality: ConnectionQuality,
}

impl ConnectionQuality {
    /// Get quality as string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Disconnected => "disconnected",
        }
    }

    /// Signal indicator bars (0-4)
    pub fn signal_bars(&self) -> u8 {
        match self {
            ConnectionQuality::Excellent => 4,
            ConnectionQuality::Good => 3,
            ConnectionQuality::Fair => 2,
            ConnectionQuality::Poor => 1,
            ConnectionQuality::Disconnected => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> ConnectionHealthMonitor {
        ConnectionHealthMonitor::new(Uuid::new_v4(), Duration::from_secs(3), now)
    }

    #[test]
    fn test_excellent_link() {
        let now = Instant::now();
        let mut monitor = monitor(now);
        monitor.record_delivery(50, 0);
        monitor.record_rtt(Duration::from_millis(40));
        monitor.record_packet_received(now);

        assert_eq!(monitor.update_health(now), ConnectionQuality::Excellent);
        assert_eq!(monitor.quality().signal_bars(), 4);
    }

    #[test]
    fn test_silence_past_grace_is_disconnected() {
        let now = Instant::now();
        let mut monitor = monitor(now);
        assert!(!monitor.is_silent(now + Duration::from_secs(2)));
        assert!(monitor.is_silent(now + Duration::from_secs(4)));
        assert_eq!(
            monitor.update_health(now + Duration::from_secs(4)),
            ConnectionQuality::Disconnected
        );

        monitor.record_packet_received(now + Duration::from_secs(4));
        assert!(!monitor.is_silent(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_packet_loss_calculation() {
        let now = Instant::now();
        let mut monitor = monitor(now);
        monitor.record_delivery(95, 5);
        assert!((monitor.packet_loss_rate() - 0.05).abs() < 0.001);
        assert_eq!(monitor.update_health(now), ConnectionQuality::Fair);

        // Old outcomes age out of the window
        monitor.record_delivery(100, 0);
        assert_eq!(monitor.packet_loss_rate(), 0.0);
        assert_eq!(monitor.stats().packets_lost, 5);
    }

    #[test]
    fn test_rtt_smoothing() {
        let now = Instant::now();
        let mut monitor = monitor(now);
        monitor.record_rtt(Duration::from_millis(100));
        monitor.record_rtt(Duration::from_millis(180));
        assert!((monitor.smoothed_rtt() - 110.0).abs() < 0.01);
        assert!((monitor.average_rtt() - 140.0).abs() < 0.01);
    }
}
