//! Per-connection traffic metrics.
//!
//! Producers (transport workers) and readers (redundancy manager, frame
//! scheduler, sync checker) both take the lock briefly; nothing holds it
//! across I/O. `snapshot()` is the only way state leaves the lock.

use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct MetricsInner {
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    failed_send_attempts: u64,
    average_rtt_millis: f64,
    last_metrics_update: Instant,
}

/// Counters for one connection, shared between the server thread and the
/// transport workers.
#[derive(Debug)]
pub struct ConnectionMetrics {
    inner: Mutex<MetricsInner>,
}

/// Point-in-time copy of the counters, safe to hold outside the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub failed_send_attempts: u64,
    pub average_rtt_millis: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} pkts / {} B, received {} pkts / {} B, {} failed sends, avg rtt {:.1} ms",
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.failed_send_attempts,
            self.average_rtt_millis,
        )
    }
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                packets_sent: 0,
                packets_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                failed_send_attempts: 0,
                average_rtt_millis: 0.0,
                last_metrics_update: Instant::now(),
            }),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.packets_sent += 1;
        inner.bytes_sent += bytes as u64;
    }

    pub fn record_received(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.packets_received += 1;
        inner.bytes_received += bytes as u64;
    }

    pub fn record_send_failure(&self) {
        self.inner.lock().failed_send_attempts += 1;
    }

    /// Clears the failure counter (after a successful reconnect or failover).
    pub fn reset_failures(&self) {
        self.inner.lock().failed_send_attempts = 0;
    }

    pub fn failed_send_attempts(&self) -> u64 {
        self.inner.lock().failed_send_attempts
    }

    /// Exponentially-smoothed RTT; a zero sample is ignored.
    pub fn record_rtt(&self, rtt_millis: f64) {
        if rtt_millis <= 0.0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.average_rtt_millis = if inner.average_rtt_millis == 0.0 {
            rtt_millis
        } else {
            inner.average_rtt_millis * 0.875 + rtt_millis * 0.125
        };
    }

    pub fn average_rtt_millis(&self) -> f64 {
        self.inner.lock().average_rtt_millis
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            packets_sent: inner.packets_sent,
            packets_received: inner.packets_received,
            bytes_sent: inner.bytes_sent,
            bytes_received: inner.bytes_received,
            failed_send_attempts: inner.failed_send_attempts,
            average_rtt_millis: inner.average_rtt_millis,
        }
    }

    /// True if the emission cadence has elapsed; stamps the update time so
    /// the caller emits at most once per interval.
    pub fn should_emit(&self, interval: std::time::Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.last_metrics_update.elapsed() >= interval {
            inner.last_metrics_update = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counters() {
        let metrics = ConnectionMetrics::new();
        metrics.record_sent(100);
        metrics.record_sent(50);
        metrics.record_received(10);
        metrics.record_send_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.failed_send_attempts, 1);
    }

    #[test]
    fn test_rtt_smoothing() {
        let metrics = ConnectionMetrics::new();
        metrics.record_rtt(100.0);
        assert!((metrics.average_rtt_millis() - 100.0).abs() < 1e-9);
        metrics.record_rtt(200.0);
        let rtt = metrics.average_rtt_millis();
        assert!(rtt > 100.0 && rtt < 200.0);
        // Zero samples are ignored.
        metrics.record_rtt(0.0);
        assert!((metrics.average_rtt_millis() - rtt).abs() < 1e-9);
    }

    #[test]
    fn test_reset_failures() {
        let metrics = ConnectionMetrics::new();
        for _ in 0..12 {
            metrics.record_send_failure();
        }
        assert_eq!(metrics.failed_send_attempts(), 12);
        metrics.reset_failures();
        assert_eq!(metrics.failed_send_attempts(), 0);
    }

    #[test]
    fn test_should_emit_cadence() {
        let metrics = ConnectionMetrics::new();
        assert!(!metrics.should_emit(Duration::from_secs(60)));
        assert!(metrics.should_emit(Duration::ZERO));
    }
}
