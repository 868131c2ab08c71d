// Flat `key=value` dump from `virsh domstats` into DetailedStats.
// Tracked counters are a table edit: add a row to FIELDS.

use crate::error::VirtError;
use crate::models::DetailedStats;

enum Pattern {
    /// Key equals the literal.
    Exact(&'static str),
    /// Key starts with `prefix` and contains `infix` anywhere after it (per-device keys).
    Device {
        prefix: &'static str,
        infix: &'static str,
    },
    /// Key starts with `prefix` and ends with `suffix` (per-vCPU keys).
    PrefixSuffix {
        prefix: &'static str,
        suffix: &'static str,
    },
}

impl Pattern {
    fn matches(&self, key: &str) -> bool {
        match *self {
            Pattern::Exact(k) => key == k,
            Pattern::Device { prefix, infix } => {
                key.strip_prefix(prefix).is_some_and(|rest| rest.contains(infix))
            }
            Pattern::PrefixSuffix { prefix, suffix } => {
                key.len() > prefix.len() + suffix.len()
                    && key.starts_with(prefix)
                    && key.ends_with(suffix)
            }
        }
    }
}

enum Target {
    /// Last value wins.
    Set(fn(&mut DetailedStats) -> &mut Option<u64>),
    /// Values accumulate (absent counts as 0).
    SumOptional(fn(&mut DetailedStats) -> &mut Option<u64>),
    /// Values accumulate into an aggregate that defaults to 0.
    Sum(fn(&mut DetailedStats) -> &mut u64),
}

struct Field {
    pattern: Pattern,
    target: Target,
}

const fn exact(key: &'static str, f: fn(&mut DetailedStats) -> &mut Option<u64>) -> Field {
    Field {
        pattern: Pattern::Exact(key),
        target: Target::Set(f),
    }
}

const fn block(infix: &'static str, f: fn(&mut DetailedStats) -> &mut u64) -> Field {
    Field {
        pattern: Pattern::Device {
            prefix: "block.",
            infix,
        },
        target: Target::Sum(f),
    }
}

const fn net(infix: &'static str, f: fn(&mut DetailedStats) -> &mut u64) -> Field {
    Field {
        pattern: Pattern::Device {
            prefix: "net.",
            infix,
        },
        target: Target::Sum(f),
    }
}

// First matching row wins, so exact keys come before structural patterns.
const FIELDS: &[Field] = &[
    exact("cpu.time", |s| &mut s.cpu_time),
    exact("cpu.user", |s| &mut s.cpu_user),
    exact("cpu.system", |s| &mut s.cpu_system),
    exact("vcpu.current", |s| &mut s.vcpu_current),
    exact("vcpu.maximum", |s| &mut s.vcpu_maximum),
    Field {
        pattern: Pattern::PrefixSuffix {
            prefix: "vcpu.",
            suffix: ".time",
        },
        target: Target::SumOptional(|s| &mut s.vcpu_time),
    },
    exact("balloon.current", |s| &mut s.memory_actual),
    exact("balloon.maximum", |s| &mut s.memory_available),
    exact("memory.unused", |s| &mut s.memory_unused),
    exact("memory.usable", |s| &mut s.memory_usable),
    exact("memory.rss", |s| &mut s.memory_rss),
    Field {
        pattern: Pattern::Exact("block.count"),
        target: Target::Sum(|s| &mut s.block_count),
    },
    block(".capacity", |s| &mut s.block_capacity),
    block(".allocation", |s| &mut s.block_allocation),
    block(".physical", |s| &mut s.block_physical),
    block(".rd.bytes", |s| &mut s.block_read_bytes),
    block(".wr.bytes", |s| &mut s.block_write_bytes),
    block(".rd.reqs", |s| &mut s.block_read_reqs),
    block(".wr.reqs", |s| &mut s.block_write_reqs),
    block(".rd.times", |s| &mut s.block_read_times),
    block(".wr.times", |s| &mut s.block_write_times),
    Field {
        pattern: Pattern::Exact("net.count"),
        target: Target::Sum(|s| &mut s.net_count),
    },
    net(".rx.bytes", |s| &mut s.net_rx_bytes),
    net(".tx.bytes", |s| &mut s.net_tx_bytes),
    net(".rx.pkts", |s| &mut s.net_rx_pkts),
    net(".tx.pkts", |s| &mut s.net_tx_pkts),
    net(".rx.drop", |s| &mut s.net_rx_drop),
    net(".tx.drop", |s| &mut s.net_tx_drop),
];

fn parse_counter(key: &str, value: &str) -> Result<u64, VirtError> {
    value.parse::<u64>().map_err(|e| VirtError::Parse {
        field: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `virsh domstats` output. Lines without `=` and unknown keys are ignored; a
/// malformed value skips only that field.
pub fn parse_flat_stats(stdout: &str) -> DetailedStats {
    let mut stats = DetailedStats::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        let Some(field) = FIELDS.iter().find(|f| f.pattern.matches(key)) else {
            continue;
        };
        let value = match parse_counter(key, value.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, operation = "parse_flat_stats", "skipping field");
                continue;
            }
        };
        match field.target {
            Target::Set(slot) => *slot(&mut stats) = Some(value),
            Target::SumOptional(slot) => {
                let s = slot(&mut stats);
                *s = Some(s.unwrap_or(0).saturating_add(value));
            }
            Target::Sum(slot) => {
                let s = slot(&mut stats);
                *s = s.saturating_add(value);
            }
        }
    }
    stats
}
