// Counter deltas between consecutive samples into per-second and percentage rates.

use std::collections::HashMap;
use std::time::Instant;

use crate::models::{DerivedRates, DetailedStats};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
const NANOS_PER_MS: f64 = 1_000_000.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory percentage reported when only an allocation figure is known.
pub const MEM_PERCENT_FALLBACK: f64 = 50.0;

/// Counters remembered from the previous sample of one VM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleState {
    pub cpu_time: Option<u64>,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_reqs: u64,
    pub block_write_reqs: u64,
    pub at: Instant,
}

impl SampleState {
    pub fn capture(stats: &DetailedStats, at: Instant) -> Self {
        Self {
            cpu_time: stats.cpu_time,
            net_rx_bytes: stats.net_rx_bytes,
            net_tx_bytes: stats.net_tx_bytes,
            block_read_reqs: stats.block_read_reqs,
            block_write_reqs: stats.block_write_reqs,
            at,
        }
    }
}

/// Non-negative per-second delta; counter resets read as 0.
fn per_sec(current: u64, previous: u64, elapsed_secs: f64) -> f64 {
    current.saturating_sub(previous) as f64 / elapsed_secs
}

/// Average service time per request in ms over the VM's lifetime.
fn avg_latency_ms(total_time_ns: u64, reqs: u64) -> f64 {
    if reqs == 0 {
        return 0.0;
    }
    total_time_ns as f64 / reqs as f64 / NANOS_PER_MS
}

/// Guest memory in use as a percentage of the allocation.
pub fn memory_percent(stats: &DetailedStats) -> f64 {
    let actual = stats.memory_actual.filter(|&a| a > 0);
    match (actual, stats.memory_unused, stats.memory_rss) {
        (Some(actual), Some(unused), _) => {
            (actual.saturating_sub(unused) as f64 / actual as f64 * 100.0).clamp(0.0, 100.0)
        }
        (Some(actual), None, Some(rss)) => (rss as f64 / actual as f64 * 100.0).clamp(0.0, 100.0),
        _ if stats.memory_actual.is_some() || stats.memory_available.is_some() => {
            MEM_PERCENT_FALLBACK
        }
        _ => 0.0,
    }
}

/// Derive rates for `current` against `previous`, returning the state to keep for the next call.
///
/// Every field is 0 on the first sample or when the clock did not advance. Memory and
/// latency come from `current` alone; the rest are deltas over the elapsed window.
pub fn derive_rates(
    current: &DetailedStats,
    previous: Option<&SampleState>,
    now: Instant,
) -> (DerivedRates, SampleState) {
    let mut rates = DerivedRates::default();

    let window = previous.and_then(|p| {
        let secs = now.checked_duration_since(p.at)?.as_secs_f64();
        (secs > 0.0).then_some((p, secs))
    });

    if let Some((prev, secs)) = window {
        if let (Some(cur), Some(old)) = (current.cpu_time, prev.cpu_time) {
            let cpu_secs = cur.saturating_sub(old) as f64 / NANOS_PER_SEC;
            let vcpus = current.effective_vcpus() as f64;
            rates.cpu_percent = (cpu_secs / (secs * vcpus) * 100.0).clamp(0.0, 100.0);
        }
        rates.net_rx_mbps = per_sec(current.net_rx_bytes, prev.net_rx_bytes, secs) / BYTES_PER_MB;
        rates.net_tx_mbps = per_sec(current.net_tx_bytes, prev.net_tx_bytes, secs) / BYTES_PER_MB;
        rates.read_iops = per_sec(current.block_read_reqs, prev.block_read_reqs, secs);
        rates.write_iops = per_sec(current.block_write_reqs, prev.block_write_reqs, secs);
        rates.mem_percent = memory_percent(current);
        rates.avg_read_latency_ms =
            avg_latency_ms(current.block_read_times, current.block_read_reqs);
        rates.avg_write_latency_ms =
            avg_latency_ms(current.block_write_times, current.block_write_reqs);
    }

    (rates, SampleState::capture(current, now))
}

/// Previous-sample state per VM. Owned by the poller; not shared across tasks.
#[derive(Debug, Default)]
pub struct SampleCache {
    states: HashMap<String, SampleState>,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive rates for `vm` and remember `stats` as its latest sample.
    pub fn observe(&mut self, vm: &str, stats: &DetailedStats, now: Instant) -> DerivedRates {
        let (rates, state) = derive_rates(stats, self.states.get(vm), now);
        self.states.insert(vm.to_string(), state);
        rates
    }

    /// Forget one VM, e.g. when it stops, so a restart does not diff against stale counters.
    pub fn clear(&mut self, vm: &str) {
        self.states.remove(vm);
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    pub fn contains(&self, vm: &str) -> bool {
        self.states.contains_key(vm)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats() -> DetailedStats {
        DetailedStats {
            cpu_time: Some(1_000_000_000),
            vcpu_maximum: Some(2),
            ..DetailedStats::default()
        }
    }

    /// Sample with every counter family populated, memory 75% used.
    fn busy_stats() -> DetailedStats {
        DetailedStats {
            cpu_time: Some(9_000_000_000),
            memory_actual: Some(2_097_152),
            memory_unused: Some(524_288),
            net_rx_bytes: 1 << 20,
            net_tx_bytes: 1 << 20,
            block_read_reqs: 10,
            block_read_times: 50_000_000,
            block_write_reqs: 10,
            block_write_times: 50_000_000,
            ..stats()
        }
    }

    #[test]
    fn first_sample_has_all_zero_rates() {
        let now = Instant::now();
        let (rates, state) = derive_rates(&busy_stats(), None, now);
        assert_eq!(rates, DerivedRates::default());
        assert_eq!(state.cpu_time, Some(9_000_000_000));
        assert_eq!(state.at, now);
    }

    #[test]
    fn cpu_percent_scenario() {
        let t0 = Instant::now();
        let (_, prev) = derive_rates(&stats(), None, t0);
        let current = DetailedStats {
            cpu_time: Some(2_000_000_000),
            ..stats()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(5));
        assert!((rates.cpu_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_gives_zero_rates() {
        let t0 = Instant::now();
        let (_, prev) = derive_rates(&stats(), None, t0);
        let (rates, _) = derive_rates(&busy_stats(), Some(&prev), t0);
        assert_eq!(rates, DerivedRates::default());
    }

    #[test]
    fn second_sample_fills_memory_and_latency() {
        let t0 = Instant::now();
        let (_, prev) = derive_rates(&busy_stats(), None, t0);
        let (rates, _) = derive_rates(&busy_stats(), Some(&prev), t0 + Duration::from_secs(1));
        assert!((rates.mem_percent - 75.0).abs() < 1e-9);
        assert!((rates.avg_read_latency_ms - 5.0).abs() < 1e-9);
        assert!((rates.avg_write_latency_ms - 5.0).abs() < 1e-9);
        assert_eq!(rates.cpu_percent, 0.0);
    }

    #[test]
    fn clock_going_backwards_gives_zero_rates() {
        let t1 = Instant::now() + Duration::from_secs(10);
        let prev = SampleState::capture(&stats(), t1);
        let current = DetailedStats {
            net_rx_bytes: 1 << 30,
            ..stats()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t1 - Duration::from_secs(1));
        assert_eq!(rates, DerivedRates::default());
    }

    #[test]
    fn read_iops_scenario() {
        let t0 = Instant::now();
        let prev = SampleState::capture(
            &DetailedStats {
                block_read_reqs: 1000,
                ..DetailedStats::default()
            },
            t0,
        );
        let current = DetailedStats {
            block_read_reqs: 1250,
            ..DetailedStats::default()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(5));
        assert!((rates.read_iops - 50.0).abs() < 1e-9);
    }

    #[test]
    fn counter_reset_never_negative() {
        let t0 = Instant::now();
        let prev = SampleState::capture(
            &DetailedStats {
                cpu_time: Some(5_000_000_000),
                net_rx_bytes: 10_000,
                net_tx_bytes: 10_000,
                block_read_reqs: 500,
                block_write_reqs: 500,
                ..DetailedStats::default()
            },
            t0,
        );
        let current = DetailedStats {
            cpu_time: Some(1),
            ..DetailedStats::default()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(5));
        assert_eq!(rates.cpu_percent, 0.0);
        assert_eq!(rates.net_rx_mbps, 0.0);
        assert_eq!(rates.net_tx_mbps, 0.0);
        assert_eq!(rates.read_iops, 0.0);
        assert_eq!(rates.write_iops, 0.0);
    }

    #[test]
    fn cpu_percent_is_clamped() {
        let t0 = Instant::now();
        let prev = SampleState::capture(&stats(), t0);
        let current = DetailedStats {
            cpu_time: Some(100_000_000_000),
            vcpu_maximum: Some(0),
            ..DetailedStats::default()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(1));
        assert_eq!(rates.cpu_percent, 100.0);
    }

    #[test]
    fn network_throughput_in_mib_per_second() {
        let t0 = Instant::now();
        let prev = SampleState::capture(&DetailedStats::default(), t0);
        let current = DetailedStats {
            net_rx_bytes: 10 * 1024 * 1024,
            net_tx_bytes: 5 * 1024 * 1024,
            ..DetailedStats::default()
        };
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(5));
        assert!((rates.net_rx_mbps - 2.0).abs() < 1e-9);
        assert!((rates.net_tx_mbps - 1.0).abs() < 1e-9);
    }

    #[test]
    fn memory_percent_preference() {
        let used = DetailedStats {
            memory_actual: Some(4_000_000),
            memory_unused: Some(1_000_000),
            memory_rss: Some(3_900_000),
            ..DetailedStats::default()
        };
        assert!((memory_percent(&used) - 75.0).abs() < 1e-9);

        let rss_only = DetailedStats {
            memory_actual: Some(4_000_000),
            memory_rss: Some(2_000_000),
            ..DetailedStats::default()
        };
        assert!((memory_percent(&rss_only) - 50.0).abs() < 1e-9);

        let over = DetailedStats {
            memory_actual: Some(1_000),
            memory_rss: Some(2_000),
            ..DetailedStats::default()
        };
        assert_eq!(memory_percent(&over), 100.0);

        let allocation_only = DetailedStats {
            memory_available: Some(4_000_000),
            ..DetailedStats::default()
        };
        assert_eq!(memory_percent(&allocation_only), MEM_PERCENT_FALLBACK);

        assert_eq!(memory_percent(&DetailedStats::default()), 0.0);
    }

    #[test]
    fn latency_is_lifetime_average() {
        let current = DetailedStats {
            block_read_reqs: 1000,
            block_read_times: 2_000_000_000,
            block_write_reqs: 0,
            block_write_times: 5_000,
            ..DetailedStats::default()
        };
        let t0 = Instant::now();
        let prev = SampleState::capture(&current, t0);
        let (rates, _) = derive_rates(&current, Some(&prev), t0 + Duration::from_secs(5));
        assert!((rates.avg_read_latency_ms - 2.0).abs() < 1e-9);
        assert_eq!(rates.avg_write_latency_ms, 0.0);
    }

    #[test]
    fn cache_tracks_and_clears_per_vm() {
        let mut cache = SampleCache::new();
        let t0 = Instant::now();
        assert_eq!(cache.observe("manjaro1", &stats(), t0).cpu_percent, 0.0);
        let next = DetailedStats {
            cpu_time: Some(2_000_000_000),
            ..stats()
        };
        let rates = cache.observe("manjaro1", &next, t0 + Duration::from_secs(5));
        assert!((rates.cpu_percent - 10.0).abs() < 1e-9);
        assert!(cache.contains("manjaro1"));

        cache.clear("manjaro1");
        assert!(!cache.contains("manjaro1"));
        cache.observe("manjaro2", &stats(), t0);
        assert_eq!(cache.len(), 1);
        cache.reset();
        assert!(cache.is_empty());
    }
}
