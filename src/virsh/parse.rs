// Parsers for the tabular and key/value virsh output shapes.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::config::HypervisorConfig;
use crate::models::{MemoryUsage, RUNNING_STATES, VcpuInfo, VmState, VmStatus};

/// Parse `virsh list --all`, keeping only VMs named in `config`.
///
/// ```text
///  Id   Name       State
/// ---------------------------
///  3    manjaro1   running
///  -    manjaro2   shut off
/// ```
pub fn parse_vm_list(stdout: &str, config: &HypervisorConfig) -> Vec<VmStatus> {
    stdout
        .trim()
        .lines()
        .skip(2)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            let name = parts[1];
            if !config.is_managed(name) {
                return None;
            }
            let id = match parts[0] {
                "-" => None,
                other => other.parse::<u32>().ok(),
            };
            let state_text = parts[2..].join(" ");
            Some(VmStatus {
                name: name.to_string(),
                id,
                state: VmState::from_virsh(&state_text),
                running: RUNNING_STATES.contains(&state_text.as_str()),
                state_text,
            })
        })
        .collect()
}

/// Parse colon-delimited `virsh dominfo` output into an ordered map (split on first `:`).
pub fn parse_key_colon_value(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .trim()
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Parse blank-line-delimited `virsh vcpuinfo` blocks.
pub fn parse_vcpu_info(stdout: &str) -> Vec<VcpuInfo> {
    let mut vcpus = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                vcpus.push(VcpuInfo(std::mem::take(&mut current)));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase().replace(' ', "_");
            current.insert(key, value.trim().to_string());
        }
    }
    if !current.is_empty() {
        vcpus.push(VcpuInfo(current));
    }
    vcpus
}

/// Parse whitespace-separated `virsh dommemstat` pairs (`actual 2097152`).
/// Lines whose value is not an integer are skipped.
pub fn parse_memory_usage(stdout: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            tracing::debug!(key, value, operation = "parse_memory_usage", "skipping field");
            continue;
        };
        match key {
            "actual" => usage.actual = Some(value),
            "available" => usage.available = Some(value),
            "unused" => usage.unused = Some(value),
            "usable" => usage.usable = Some(value),
            "rss" => usage.rss = Some(value),
            _ => {}
        }
        usage.raw.insert(key.to_string(), value);
    }
    usage
}

/// First routable IPv4 address in `virsh domifaddr` output.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------
///  vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.45/24
/// ```
pub fn parse_domifaddr_ipv4(stdout: &str) -> Option<Ipv4Addr> {
    stdout
        .trim()
        .lines()
        .skip(2)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| parts.len() >= 4)
        .flat_map(|parts| parts.into_iter())
        .filter(|tok| tok.contains('.') && tok.contains('/'))
        .filter_map(|tok| tok.split('/').next()?.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && ip.octets()[0] != 0)
}

#[derive(Deserialize)]
struct AgentReply<T> {
    #[serde(rename = "return")]
    ret: T,
}

#[derive(Deserialize)]
struct AgentUser {
    user: Option<String>,
}

/// Usernames from a `guest-get-users` reply; `None` when malformed or empty.
pub fn parse_guest_users(stdout: &str) -> Option<Vec<String>> {
    let reply: AgentReply<Vec<AgentUser>> = match serde_json::from_str(stdout.trim()) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, operation = "parse_guest_users", "unexpected agent reply");
            return None;
        }
    };
    let users: Vec<String> = reply
        .ret
        .into_iter()
        .map(|u| u.user.unwrap_or_else(|| "unknown".into()))
        .collect();
    (!users.is_empty()).then_some(users)
}

/// True when a guest-agent reply carries a `return` member.
pub fn agent_replied(stdout: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(stdout.trim())
        .ok()
        .is_some_and(|v| v.get("return").is_some())
}
