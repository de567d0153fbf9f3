//! Connection status, latency window and quality tiers

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Status of the transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Discrete connection quality derived from round-trip latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl ConnectionQuality {
    /// Tier for an average round-trip latency
    pub fn from_latency(latency_ms: f64) -> Self {
        if latency_ms <= 50.0 {
            ConnectionQuality::Excellent
        } else if latency_ms <= 100.0 {
            ConnectionQuality::Good
        } else if latency_ms <= 200.0 {
            ConnectionQuality::Fair
        } else if latency_ms <= 400.0 {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::VeryPoor
        }
    }

    /// Numeric score in (0, 1]
    pub fn score(&self) -> f32 {
        match self {
            ConnectionQuality::Excellent => 1.0,
            ConnectionQuality::Good => 0.8,
            ConnectionQuality::Fair => 0.6,
            ConnectionQuality::Poor => 0.4,
            ConnectionQuality::VeryPoor => 0.2,
        }
    }
}

/// Bounded ring buffer of latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn samples(&self) -> Vec<u64> {
        self.samples.iter().copied().collect()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    pub fn quality(&self) -> Option<ConnectionQuality> {
        self.average().map(ConnectionQuality::from_latency)
    }
}

/// Point-in-time view of the connection, published on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub endpoint: Option<String>,
    pub last_error: Option<String>,
    pub latency_samples: Vec<u64>,
    pub average_latency_ms: Option<f64>,
    pub quality: Option<ConnectionQuality>,
    /// Quality score in [0, 1]; 0 when not connected or unmeasured
    pub quality_score: f32,
    /// Current reconnect attempt (0 when not reconnecting)
    pub reconnect_attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(ConnectionQuality::from_latency(10.0), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_latency(50.0), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_latency(75.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_latency(150.0), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::from_latency(300.0), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::from_latency(900.0), ConnectionQuality::VeryPoor);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = LatencyWindow::new(3);
        for ms in [100, 200, 300, 400] {
            window.push(ms);
        }
        assert_eq!(window.samples(), vec![200, 300, 400]);
        assert_eq!(window.average(), Some(300.0));
        assert_eq!(window.quality(), Some(ConnectionQuality::Poor));
    }

    #[test]
    fn test_empty_window_has_no_quality() {
        let window = LatencyWindow::new(10);
        assert!(window.average().is_none());
        assert!(window.quality().is_none());
    }
}
