use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

/// Per-peer scoring used by the scheduler to prefer fast, reliable peers.
/// Mirrors the reference client's weighting: success rate divided by
/// average request latency, floored so a peer we've never tried isn't
/// scored at zero.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub successes: u32,
    pub failures: u32,
    pub total_latency: Duration,
    pub pieces_up: u64,
    pub pieces_down: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub last_update: Instant,
}

const DEFAULT_LATENCY_SECS: f64 = 10.0;
const MIN_WEIGHT: f64 = 0.1;
const MIN_AVG_LATENCY_SECS: f64 = 0.1;

impl PeerStats {
    fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            total_latency: Duration::ZERO,
            pieces_up: 0,
            pieces_down: 0,
            bytes_up: 0,
            bytes_down: 0,
            last_update: Instant::now(),
        }
    }

    pub fn requests(&self) -> u32 {
        self.successes + self.failures
    }

    fn success_rate(&self) -> f64 {
        if self.requests() == 0 {
            return 0.0;
        }
        self.successes as f64 / self.requests() as f64
    }

    fn avg_latency_secs(&self) -> f64 {
        if self.successes == 0 {
            return DEFAULT_LATENCY_SECS;
        }
        self.total_latency.as_secs_f64() / self.successes as f64
    }

    /// `max(success_rate / max(avg_latency, 0.1), 0.1)` — never zero, so a
    /// peer with no track record yet still gets picked occasionally.
    pub fn weight(&self) -> f64 {
        let avg_latency = self.avg_latency_secs().max(MIN_AVG_LATENCY_SECS);
        (self.success_rate() / avg_latency).max(MIN_WEIGHT)
    }

    pub fn record_success(&mut self, latency: Duration, bytes: u64) {
        self.successes += 1;
        self.total_latency += latency;
        self.pieces_down += 1;
        self.bytes_down += bytes;
        self.last_update = Instant::now();
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.last_update = Instant::now();
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.pieces_up += 1;
        self.bytes_up += bytes;
        self.last_update = Instant::now();
    }
}

impl Default for PeerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared table of per-peer stats, keyed by the peer's `ip:port` string.
/// Stale entries are pruned by a background sweep so long-lived clients
/// don't accumulate unbounded history for peers that have disconnected.
#[derive(Debug, Default)]
pub struct PeerStatsTable {
    inner: RwLock<HashMap<String, PeerStats>>,
}

impl PeerStatsTable {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub fn record_success(&self, peer: &str, latency: Duration, bytes: u64) {
        self.inner.write().unwrap().entry(peer.to_string()).or_default().record_success(latency, bytes);
    }

    pub fn record_failure(&self, peer: &str) {
        self.inner.write().unwrap().entry(peer.to_string()).or_default().record_failure();
    }

    pub fn record_upload(&self, peer: &str, bytes: u64) {
        self.inner.write().unwrap().entry(peer.to_string()).or_default().record_upload(bytes);
    }

    pub fn weight(&self, peer: &str) -> f64 {
        self.inner.read().unwrap().get(peer).map(PeerStats::weight).unwrap_or(MIN_WEIGHT)
    }

    /// Removes any peer untouched for longer than `ttl`. Run periodically
    /// from a background thread.
    pub fn sweep(&self, ttl: Duration) {
        let now = Instant::now();
        let mut table = self.inner.write().unwrap();
        let before = table.len();
        table.retain(|_, stats| now.duration_since(stats.last_update) < ttl);
        let removed = before - table.len();
        if removed > 0 {
            tracing::debug!("peer stats sweep: removed {} stale entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rolling throughput counters, sampled once per second by the swarm's
/// speed-tracking thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {
    pub up: Counter,
    pub down: Counter,
}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {
    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_peer_has_minimum_weight() {
        let stats = PeerStats::new();
        assert_eq!(stats.weight(), MIN_WEIGHT);
    }

    #[test]
    fn fast_reliable_peer_outweighs_slow_unreliable_one() {
        let mut fast = PeerStats::new();
        fast.record_success(Duration::from_millis(50), 1024);
        fast.record_success(Duration::from_millis(50), 1024);

        let mut slow = PeerStats::new();
        slow.record_success(Duration::from_secs(5), 1024);
        slow.record_failure();

        assert!(fast.weight() > slow.weight());
    }

    #[test]
    fn sweep_removes_stale_entries_only() {
        let table = PeerStatsTable::new();
        table.record_success("1.2.3.4:6881", Duration::from_millis(10), 16);
        table.sweep(Duration::from_secs(0));
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let table = PeerStatsTable::new();
        table.record_success("1.2.3.4:6881", Duration::from_millis(10), 16);
        table.sweep(Duration::from_secs(60));
        assert_eq!(table.len(), 1);
    }
}
