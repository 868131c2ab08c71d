// Counter snapshots (domstats, dommemstat, vcpuinfo) and derived rates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters for one VM at one instant, as reported by `virsh domstats`.
/// Identity metrics stay `None` when not reported; block/net aggregates default to 0
/// and are summed across devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStats {
    pub vcpu_current: Option<u64>,
    pub vcpu_maximum: Option<u64>,
    /// Sum of `vcpu.<n>.time` (ns).
    pub vcpu_time: Option<u64>,
    /// Cumulative CPU time (ns).
    pub cpu_time: Option<u64>,
    pub cpu_user: Option<u64>,
    pub cpu_system: Option<u64>,

    /// Memory figures in KiB.
    pub memory_actual: Option<u64>,
    pub memory_available: Option<u64>,
    pub memory_unused: Option<u64>,
    pub memory_usable: Option<u64>,
    pub memory_rss: Option<u64>,

    #[serde(default)]
    pub block_count: u64,
    #[serde(default)]
    pub block_capacity: u64,
    #[serde(default)]
    pub block_allocation: u64,
    #[serde(default)]
    pub block_physical: u64,
    #[serde(default)]
    pub block_read_bytes: u64,
    #[serde(default)]
    pub block_write_bytes: u64,
    #[serde(default)]
    pub block_read_reqs: u64,
    #[serde(default)]
    pub block_write_reqs: u64,
    /// Cumulative read service time (ns).
    #[serde(default)]
    pub block_read_times: u64,
    /// Cumulative write service time (ns).
    #[serde(default)]
    pub block_write_times: u64,

    #[serde(default)]
    pub net_count: u64,
    #[serde(default)]
    pub net_rx_bytes: u64,
    #[serde(default)]
    pub net_tx_bytes: u64,
    #[serde(default)]
    pub net_rx_pkts: u64,
    #[serde(default)]
    pub net_tx_pkts: u64,
    #[serde(default)]
    pub net_rx_drop: u64,
    #[serde(default)]
    pub net_tx_drop: u64,
}

impl DetailedStats {
    /// vCPU count used for CPU percentages; never 0.
    pub fn effective_vcpus(&self) -> u64 {
        self.vcpu_maximum.filter(|&n| n > 0).unwrap_or(1)
    }

    /// Fill memory fields that domstats did not report from `dommemstat`.
    pub fn merge_memory_usage(&mut self, usage: &MemoryUsage) {
        self.memory_actual = self.memory_actual.or(usage.actual);
        self.memory_available = self.memory_available.or(usage.available);
        self.memory_unused = self.memory_unused.or(usage.unused);
        self.memory_usable = self.memory_usable.or(usage.usable);
        self.memory_rss = self.memory_rss.or(usage.rss);
    }
}

/// `virsh dommemstat` output (KiB).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub actual: Option<u64>,
    pub available: Option<u64>,
    pub unused: Option<u64>,
    pub usable: Option<u64>,
    pub rss: Option<u64>,
    /// Every reported key, including ones without a dedicated field.
    pub raw: BTreeMap<String, u64>,
}

/// One `virsh vcpuinfo` block; keys lower-cased with spaces replaced by `_`
/// (e.g. "vcpu", "cpu", "state", "cpu_time", "cpu_affinity").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuInfo(pub BTreeMap<String, String>);

impl VcpuInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Values derived from two consecutive DetailedStats samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRates {
    pub cpu_percent: f64,
    pub net_rx_mbps: f64,
    pub net_tx_mbps: f64,
    pub read_iops: f64,
    pub write_iops: f64,
    pub avg_read_latency_ms: f64,
    pub avg_write_latency_ms: f64,
    pub mem_percent: f64,
}
