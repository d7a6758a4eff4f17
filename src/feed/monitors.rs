// =============================================================================
// Feed monitors — connection health and latency spike detection
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::events::LatencySpikeInfo;
use crate::types::ConnectionHealth;

// ---------------------------------------------------------------------------
// Connection health
// ---------------------------------------------------------------------------

/// Silence thresholds, in milliseconds since the last signal.
const DEGRADED_SILENCE_MS: u64 = 2_000;
const MINIMAL_SILENCE_MS: u64 = 10_000;
const OFFLINE_SILENCE_MS: u64 = 30_000;

/// Error-rate threshold beyond which the feed is considered degraded.
const DEGRADED_ERROR_RATE_PCT: f64 = 5.0;
/// Rate-limiter drop-rate threshold beyond which the feed is degraded.
const DEGRADED_DROP_RATE_PCT: f64 = 20.0;

/// Tracks connectivity and signal cadence; derives a coarse health label.
pub struct ConnectionHealthMonitor {
    connected: AtomicBool,
    signals: AtomicU64,
    errors: AtomicU64,
    last_signal: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub health: ConnectionHealth,
    pub connected: bool,
    pub signals: u64,
    pub errors: u64,
    pub ms_since_last_signal: Option<u64>,
}

impl ConnectionHealthMonitor {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            signals: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_signal: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        *self.last_signal.lock() = Some(Instant::now());
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ms_since_last_signal(&self) -> Option<u64> {
        self.last_signal
            .lock()
            .map(|at| at.elapsed().as_millis() as u64)
    }

    /// Derive health from connectivity, silence, error rate, and the rate
    /// limiter's observed drop rate.
    pub fn health(&self, drop_rate_pct: f64) -> ConnectionHealth {
        if !self.is_connected() {
            return ConnectionHealth::Offline;
        }
        let silence_ms = self.ms_since_last_signal();
        match silence_ms {
            None => return ConnectionHealth::Degraded, // connected, nothing seen yet
            Some(ms) if ms >= OFFLINE_SILENCE_MS => return ConnectionHealth::Offline,
            Some(ms) if ms >= MINIMAL_SILENCE_MS => return ConnectionHealth::Minimal,
            Some(ms) if ms >= DEGRADED_SILENCE_MS => return ConnectionHealth::Degraded,
            _ => {}
        }

        let signals = self.signals.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let error_rate_pct = if signals > 0 {
            errors as f64 / signals as f64 * 100.0
        } else {
            0.0
        };
        if error_rate_pct > DEGRADED_ERROR_RATE_PCT || drop_rate_pct > DEGRADED_DROP_RATE_PCT {
            return ConnectionHealth::Degraded;
        }
        ConnectionHealth::Healthy
    }

    pub fn snapshot(&self, drop_rate_pct: f64) -> HealthSnapshot {
        HealthSnapshot {
            health: self.health(drop_rate_pct),
            connected: self.is_connected(),
            signals: self.signals.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ms_since_last_signal: self.ms_since_last_signal(),
        }
    }
}

// ---------------------------------------------------------------------------
// Latency spike detection
// ---------------------------------------------------------------------------

/// Samples kept for the rolling baseline.
const SPIKE_WINDOW: usize = 1_000;
/// Minimum samples before spikes are reported.
const SPIKE_MIN_SAMPLES: usize = 10;
/// A sample must exceed both the multiplier over baseline and this floor.
const SPIKE_FLOOR_MS: f64 = 1_000.0;
const SPIKE_MULTIPLIER: f64 = 3.0;

/// Detects inter-tick intervals far above the rolling baseline.
pub struct LatencySpikeDetector {
    samples: Mutex<VecDeque<f64>>,
    total_samples: AtomicU64,
    spikes: AtomicU64,
}

impl LatencySpikeDetector {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(SPIKE_WINDOW)),
            total_samples: AtomicU64::new(0),
            spikes: AtomicU64::new(0),
        }
    }

    /// Record one inter-tick interval; returns spike details when the
    /// sample is anomalous against the current baseline.
    pub fn record(&self, interval_ms: f64) -> Option<LatencySpikeInfo> {
        let mut samples = self.samples.lock();
        let baseline = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        let enough_history = samples.len() >= SPIKE_MIN_SAMPLES;

        if samples.len() == SPIKE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(interval_ms);
        drop(samples);
        self.total_samples.fetch_add(1, Ordering::Relaxed);

        if enough_history
            && interval_ms > SPIKE_FLOOR_MS
            && interval_ms > baseline * SPIKE_MULTIPLIER
        {
            self.spikes.fetch_add(1, Ordering::Relaxed);
            return Some(LatencySpikeInfo {
                interval_ms,
                baseline_ms: baseline,
                reason: format!(
                    "interval {interval_ms:.0}ms exceeds {SPIKE_MULTIPLIER}x baseline {baseline:.0}ms"
                ),
            });
        }
        None
    }

    /// Clear the baseline. Called after reconnects and large gaps so stale
    /// history cannot trigger spike spam.
    pub fn reset(&self) {
        self.samples.lock().clear();
        self.total_samples.store(0, Ordering::Relaxed);
        debug!("latency baseline reset");
    }

    pub fn spike_count(&self) -> u64 {
        self.spikes.load(Ordering::Relaxed)
    }

    /// 95th-percentile interval over the rolling window.
    pub fn p95_ms(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_offline_when_disconnected() {
        let monitor = ConnectionHealthMonitor::new();
        assert_eq!(monitor.health(0.0), ConnectionHealth::Offline);
    }

    #[test]
    fn health_tracks_signals_and_errors() {
        let monitor = ConnectionHealthMonitor::new();
        monitor.set_connected(true);
        for _ in 0..100 {
            monitor.record_signal();
        }
        assert_eq!(monitor.health(0.0), ConnectionHealth::Healthy);

        // Push the error rate above threshold.
        for _ in 0..10 {
            monitor.record_error();
        }
        assert_eq!(monitor.health(0.0), ConnectionHealth::Degraded);
    }

    #[test]
    fn health_degrades_on_drop_rate() {
        let monitor = ConnectionHealthMonitor::new();
        monitor.set_connected(true);
        monitor.record_signal();
        assert_eq!(monitor.health(50.0), ConnectionHealth::Degraded);
    }

    #[test]
    fn no_spike_before_enough_history() {
        let detector = LatencySpikeDetector::new();
        assert!(detector.record(100_000.0).is_none());
    }

    #[test]
    fn spike_detected_over_baseline() {
        let detector = LatencySpikeDetector::new();
        for _ in 0..50 {
            assert!(detector.record(250.0).is_none());
        }
        let spike = detector.record(5_000.0).expect("spike expected");
        assert!(spike.baseline_ms > 200.0 && spike.baseline_ms < 300.0);
        assert_eq!(detector.spike_count(), 1);
    }

    #[test]
    fn small_jitter_is_not_a_spike() {
        let detector = LatencySpikeDetector::new();
        for _ in 0..50 {
            detector.record(250.0);
        }
        // 3x baseline but under the absolute floor.
        assert!(detector.record(800.0).is_none());
    }

    #[test]
    fn reset_clears_baseline() {
        let detector = LatencySpikeDetector::new();
        for _ in 0..50 {
            detector.record(250.0);
        }
        detector.reset();
        assert!(detector.record(10_000.0).is_none());
        assert_eq!(detector.p95_ms(), 10_000.0);
    }
}
