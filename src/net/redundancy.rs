//! Peer redundancy: RTT grouping, primary path selection, failover.
//!
//! Peers whose measured RTT sits below the group threshold form the
//! low-latency group; the primary path is the lowest-RTT member of that
//! group. Five consecutive send failures to the current path degrade it and
//! promote the next-best candidate. Degraded peers are re-probed on a fixed
//! cadence and restored once their RTT drops back under the threshold.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{info, warn};

/// Consecutive send failures to one path before failover fires.
pub const FAILOVER_THRESHOLD: u32 = 5;
/// How often a degraded peer is re-probed.
pub const REPROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerGroup {
    LowLatency,
    Secondary,
}

#[derive(Debug, Clone)]
struct PeerPath {
    rtt_millis: f64,
    group: PeerGroup,
    degraded: bool,
    consecutive_failures: u32,
    last_probe: Instant,
}

impl PeerPath {
    fn new() -> Self {
        Self {
            // Unmeasured peers start in the secondary group until a sample
            // arrives.
            rtt_millis: f64::INFINITY,
            group: PeerGroup::Secondary,
            degraded: false,
            consecutive_failures: 0,
            last_probe: Instant::now(),
        }
    }
}

/// Tracks per-peer path health and selects the primary route.
pub struct RedundancyManager {
    peers: HashMap<String, PeerPath>,
    group_rtt_threshold: f64,
    primary: Option<String>,
}

impl RedundancyManager {
    pub fn new(group_rtt_threshold_millis: u64, known_peers: &[String]) -> Self {
        let mut manager = Self {
            peers: HashMap::new(),
            group_rtt_threshold: group_rtt_threshold_millis as f64,
            primary: None,
        };
        for peer in known_peers {
            manager.register_peer(peer);
        }
        manager
    }

    /// Add a peer if unknown. Idempotent.
    pub fn register_peer(&mut self, peer: &str) {
        self.peers.entry(peer.to_string()).or_insert_with(PeerPath::new);
        if self.primary.is_none() {
            self.primary = Some(peer.to_string());
        }
    }

    pub fn remove_peer(&mut self, peer: &str) {
        self.peers.remove(peer);
        if self.primary.as_deref() == Some(peer) {
            self.primary = self.select_primary();
        }
    }

    /// Record an RTT sample and regroup the peer. A degraded peer is restored
    /// when its RTT falls back below the threshold.
    pub fn record_rtt(&mut self, peer: &str, rtt_millis: f64) {
        let threshold = self.group_rtt_threshold;
        let entry = self.peers.entry(peer.to_string()).or_insert_with(PeerPath::new);
        entry.rtt_millis = rtt_millis;
        entry.group = if rtt_millis < threshold {
            PeerGroup::LowLatency
        } else {
            PeerGroup::Secondary
        };
        if entry.degraded && rtt_millis < threshold {
            entry.degraded = false;
            entry.consecutive_failures = 0;
            info!(peer, rtt_millis, "degraded peer restored");
        }
        self.primary = self.select_primary();
    }

    pub fn group_of(&self, peer: &str) -> Option<PeerGroup> {
        self.peers.get(peer).map(|p| p.group)
    }

    pub fn is_degraded(&self, peer: &str) -> bool {
        self.peers.get(peer).map(|p| p.degraded).unwrap_or(false)
    }

    /// The currently selected primary path.
    pub fn primary_path(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    /// Lowest-RTT non-degraded peer, preferring the low-latency group.
    fn select_primary(&self) -> Option<String> {
        let best = |group: PeerGroup| {
            self.peers
                .iter()
                .filter(|(_, p)| !p.degraded && p.group == group)
                .min_by(|a, b| a.1.rtt_millis.total_cmp(&b.1.rtt_millis))
                .map(|(name, _)| name.clone())
        };
        best(PeerGroup::LowLatency).or_else(|| best(PeerGroup::Secondary))
    }

    /// Count a send failure against the peer. Returns true when the failure
    /// streak reached the threshold and failover was triggered.
    pub fn record_send_failure(&mut self, peer: &str) -> bool {
        let entry = self.peers.entry(peer.to_string()).or_insert_with(PeerPath::new);
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= FAILOVER_THRESHOLD && !entry.degraded {
            self.trigger_failover(peer);
            return true;
        }
        false
    }

    /// A successful send resets the peer's failure streak.
    pub fn record_send_success(&mut self, peer: &str) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.consecutive_failures = 0;
        }
    }

    /// Mark the peer degraded and promote the next-best candidate.
    pub fn trigger_failover(&mut self, failed_peer: &str) {
        if let Some(entry) = self.peers.get_mut(failed_peer) {
            entry.degraded = true;
            entry.consecutive_failures = 0;
            entry.last_probe = Instant::now();
        }
        self.primary = self.select_primary();
        warn!(
            failed_peer,
            new_primary = self.primary.as_deref().unwrap_or("<none>"),
            "failover triggered"
        );
    }

    /// Re-probe degraded peers whose cadence elapsed: optimistically clear the
    /// degraded mark so the next RTT sample regroups them for real. Returns
    /// the peers put back on probation.
    pub fn reprobe_degraded(&mut self) -> Vec<String> {
        let mut probed = Vec::new();
        for (name, path) in self.peers.iter_mut() {
            if path.degraded && path.last_probe.elapsed() >= REPROBE_INTERVAL {
                path.last_probe = Instant::now();
                probed.push(name.clone());
            }
        }
        probed
    }

    /// Mean RTT over peers with at least one sample; feeds the speed control
    /// and the sync-check timeout inflation.
    pub fn average_rtt_millis(&self) -> f64 {
        let samples: Vec<f64> = self
            .peers
            .values()
            .filter(|p| p.rtt_millis.is_finite())
            .map(|p| p.rtt_millis)
            .collect();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(peers: &[&str]) -> RedundancyManager {
        let peers: Vec<String> = peers.iter().map(|s| s.to_string()).collect();
        RedundancyManager::new(50, &peers)
    }

    #[test]
    fn test_grouping_by_threshold() {
        let mut m = manager_with(&["a", "b"]);
        m.record_rtt("a", 20.0);
        m.record_rtt("b", 80.0);
        assert_eq!(m.group_of("a"), Some(PeerGroup::LowLatency));
        assert_eq!(m.group_of("b"), Some(PeerGroup::Secondary));
    }

    #[test]
    fn test_primary_is_lowest_rtt_in_low_latency_group() {
        let mut m = manager_with(&["a", "b", "c"]);
        m.record_rtt("a", 30.0);
        m.record_rtt("b", 10.0);
        m.record_rtt("c", 90.0);
        assert_eq!(m.primary_path(), Some("b"));
    }

    #[test]
    fn test_failover_after_five_consecutive_failures() {
        let mut m = manager_with(&["a", "b"]);
        m.record_rtt("a", 10.0);
        m.record_rtt("b", 20.0);
        assert_eq!(m.primary_path(), Some("a"));

        for i in 1..FAILOVER_THRESHOLD {
            assert!(!m.record_send_failure("a"), "failure {i} fired early");
        }
        assert!(m.record_send_failure("a"));
        assert!(m.is_degraded("a"));
        assert_eq!(m.primary_path(), Some("b"));

        // Further failures on the degraded peer do not re-fire failover.
        assert!(!m.record_send_failure("a"));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut m = manager_with(&["a"]);
        for _ in 0..4 {
            m.record_send_failure("a");
        }
        m.record_send_success("a");
        for _ in 0..4 {
            assert!(!m.record_send_failure("a"));
        }
    }

    #[test]
    fn test_rtt_sample_restores_degraded_peer() {
        let mut m = manager_with(&["a", "b"]);
        m.record_rtt("a", 10.0);
        m.record_rtt("b", 20.0);
        m.trigger_failover("a");
        assert!(m.is_degraded("a"));
        assert_eq!(m.primary_path(), Some("b"));

        m.record_rtt("a", 15.0);
        assert!(!m.is_degraded("a"));
        assert_eq!(m.primary_path(), Some("a"));
    }

    #[test]
    fn test_average_rtt_ignores_unmeasured() {
        let mut m = manager_with(&["a", "b", "c"]);
        m.record_rtt("a", 100.0);
        m.record_rtt("b", 300.0);
        assert!((m.average_rtt_millis() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_primary_reselects() {
        let mut m = manager_with(&["a", "b"]);
        m.record_rtt("a", 10.0);
        m.record_rtt("b", 20.0);
        m.remove_peer("a");
        assert_eq!(m.primary_path(), Some("b"));
        assert_eq!(m.peer_count(), 1);
    }

    #[test]
    fn test_reprobe_waits_for_cadence() {
        let mut m = manager_with(&["a"]);
        m.trigger_failover("a");
        // Cadence has not elapsed yet.
        assert!(m.reprobe_degraded().is_empty());
    }
}
