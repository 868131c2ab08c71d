// Per-VM snapshot published to the presentation layer

use serde::{Deserialize, Serialize};

use super::{DerivedRates, DetailedStats, VmStatus};

/// Best-effort facts refreshed on a slower cadence than the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmExtras {
    pub ip_address: Option<String>,
    pub uptime_secs: Option<u64>,
    pub guest_users: Option<Vec<String>>,
    pub virtio_drivers: Vec<String>,
    pub host_cpu_temp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSnapshot {
    /// Unix millis when the snapshot was assembled.
    pub timestamp: u64,
    pub status: VmStatus,
    /// Present only while the VM is running and domstats succeeded.
    pub stats: Option<DetailedStats>,
    pub rates: Option<DerivedRates>,
    pub extras: Option<VmExtras>,
}

impl VmSnapshot {
    pub fn stopped(timestamp: u64, status: VmStatus) -> Self {
        Self {
            timestamp,
            status,
            stats: None,
            rates: None,
            extras: None,
        }
    }
}
