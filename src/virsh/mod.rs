// QEMU/KVM domain access through the virsh CLI

mod command;
mod domstats;
mod parse;
mod xml;

pub use command::{CommandOutput, CommandRunner, VirshRunner};
pub use domstats::parse_flat_stats;
pub use parse::{
    agent_replied, parse_domifaddr_ipv4, parse_guest_users, parse_key_colon_value,
    parse_memory_usage, parse_vcpu_info, parse_vm_list,
};
pub use xml::parse_device_config;

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::config::HypervisorConfig;
use crate::error::{ErrorKind, StructuredError, VirtError};
use crate::host;
use crate::models::{
    DetailedStats, DeviceConfig, MemoryUsage, VcpuInfo, VirtioFlags, VmAction, VmExtras,
    VmStatus,
};

/// Address sources tried by `ip_address`, in priority order.
pub const IP_SOURCES: &[&str] = &["lease", "agent", "arp"];

pub struct VirshRepo<R = VirshRunner> {
    runner: R,
    config: HypervisorConfig,
}

impl VirshRepo<VirshRunner> {
    pub fn connect(config: HypervisorConfig) -> Self {
        Self {
            runner: VirshRunner::new(config.clone()),
            config,
        }
    }
}

impl<R: CommandRunner> VirshRepo<R> {
    pub fn with_runner(runner: R, config: HypervisorConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Run an arbitrary virsh subcommand with the shared timeout/elevation policy.
    pub async fn run(&self, args: &[&str]) -> CommandOutput {
        self.runner.run(args).await
    }

    /// Startup probe: logs whether virsh answers on the configured connection.
    #[instrument(skip(self), fields(repo = "virsh", operation = "check_requirements"))]
    pub async fn check_requirements(&self) -> bool {
        let out = self.runner.run(&["version"]).await;
        if out.success {
            info!(uri = %self.config.connection_uri, "virsh reachable");
        } else {
            warn!(stderr = %out.stderr.trim(), "virsh not usable; VM panel will show no data");
        }
        out.success
    }

    /// Configured VMs as listed by `virsh list --all`; empty when the listing fails.
    pub async fn list_vms(&self) -> Vec<VmStatus> {
        self.try_list_vms().await.unwrap_or_default()
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "list_vms"))]
    pub async fn try_list_vms(&self) -> Result<Vec<VmStatus>, StructuredError> {
        let out = self.runner.run(&["list", "--all"]).await;
        if !out.success {
            let err = VirtError::from_stderr(&out.stderr);
            warn!(kind = ?err.kind(), error = %err, "virsh list failed");
            return Err(err.into());
        }
        Ok(parse_vm_list(&out.stdout, &self.config))
    }

    pub async fn vm_status(&self, name: &str) -> Option<VmStatus> {
        self.list_vms().await.into_iter().find(|v| v.name == name)
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "vm_info"))]
    pub async fn vm_info(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let out = self.runner.run(&["dominfo", name]).await;
        if !out.success {
            warn!(vm = name, stderr = %out.stderr.trim(), "virsh dominfo failed");
            return None;
        }
        Some(parse_key_colon_value(&out.stdout))
    }

    /// Issue a lifecycle action after checking the VM's current state.
    #[instrument(skip(self), fields(repo = "virsh", operation = "perform"))]
    pub async fn perform(&self, name: &str, action: VmAction) -> Result<(), StructuredError> {
        if !self.config.is_managed(name) {
            return Err(StructuredError::new(
                ErrorKind::NotFound,
                format!("VM '{}' is not managed by this panel", name),
                Some("Check hypervisor.vm_names in the configuration"),
            ));
        }

        if action == VmAction::Start {
            match self.vm_status(name).await {
                None => {
                    return Err(StructuredError::new(
                        ErrorKind::NotFound,
                        format!("VM '{}' does not exist on this host", name),
                        Some("Check the VM name"),
                    ));
                }
                Some(vm) if vm.running => {
                    warn!(vm = name, "VM already running");
                    return Err(StructuredError::new(
                        ErrorKind::AlreadyRunning,
                        format!("VM '{}' is already running", name),
                        None,
                    ));
                }
                Some(_) => {}
            }
        } else if action.requires_running() {
            let running = self.vm_status(name).await.is_some_and(|v| v.running);
            if !running {
                warn!(vm = name, action = action.as_str(), "VM not running");
                return Err(StructuredError::new(
                    ErrorKind::NotRunning,
                    format!("VM '{}' is not running", name),
                    Some("Start the VM first"),
                ));
            }
        }

        let out = self.runner.run(&[action.subcommand(), name]).await;
        if out.success {
            info!(vm = name, action = action.as_str(), "VM action succeeded");
            Ok(())
        } else {
            let err = VirtError::from_stderr(&out.stderr);
            warn!(
                vm = name,
                action = action.as_str(),
                kind = ?err.kind(),
                error = %err,
                "VM action failed"
            );
            Err(err.into())
        }
    }

    pub async fn start_vm(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::Start).await
    }

    pub async fn shutdown_vm(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::Shutdown).await
    }

    pub async fn destroy_vm(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::Destroy).await
    }

    pub async fn reboot_vm(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::Reboot).await
    }

    pub async fn save_vm(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::Save).await
    }

    pub async fn remove_saved_state(&self, name: &str) -> Result<(), StructuredError> {
        self.perform(name, VmAction::RemoveSavedState).await
    }

    /// `virsh domstats` for one VM, with `dommemstat` filling memory figures domstats lacks.
    #[instrument(skip(self), fields(repo = "virsh", operation = "detailed_stats"))]
    pub async fn detailed_stats(&self, name: &str) -> Option<DetailedStats> {
        let out = self.runner.run(&["domstats", name]).await;
        if !out.success {
            debug!(vm = name, stderr = %out.stderr.trim(), "virsh domstats failed");
            return None;
        }
        let mut stats = parse_flat_stats(&out.stdout);
        if stats.memory_unused.is_none() || stats.memory_rss.is_none() {
            if let Some(usage) = self.memory_usage(name).await {
                stats.merge_memory_usage(&usage);
            }
        }
        Some(stats)
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "memory_usage"))]
    pub async fn memory_usage(&self, name: &str) -> Option<MemoryUsage> {
        let out = self.runner.run(&["dommemstat", name]).await;
        if !out.success {
            debug!(vm = name, stderr = %out.stderr.trim(), "virsh dommemstat failed");
            return None;
        }
        Some(parse_memory_usage(&out.stdout))
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "vcpu_info"))]
    pub async fn vcpu_info(&self, name: &str) -> Option<Vec<VcpuInfo>> {
        let out = self.runner.run(&["vcpuinfo", name]).await;
        if !out.success {
            debug!(vm = name, stderr = %out.stderr.trim(), "virsh vcpuinfo failed");
            return None;
        }
        let vcpus = parse_vcpu_info(&out.stdout);
        (!vcpus.is_empty()).then_some(vcpus)
    }

    /// First valid non-loopback IPv4, trying lease, guest agent and ARP in that order.
    #[instrument(skip(self), fields(repo = "virsh", operation = "ip_address"))]
    pub async fn ip_address(&self, name: &str) -> Option<String> {
        for &source in IP_SOURCES {
            let out = self
                .runner
                .run(&["domifaddr", name, "--source", source])
                .await;
            let Some(stdout) = out.stdout_if_ok() else {
                continue;
            };
            if let Some(ip) = parse_domifaddr_ipv4(stdout) {
                debug!(vm = name, source, %ip, "IP address found");
                return Some(ip.to_string());
            }
        }
        debug!(vm = name, "no IP address from any source");
        None
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "device_config"))]
    pub async fn device_config(&self, name: &str) -> Option<DeviceConfig> {
        let out = self.runner.run(&["dumpxml", name]).await;
        if !out.success {
            debug!(vm = name, stderr = %out.stderr.trim(), "virsh dumpxml failed");
            return None;
        }
        Some(parse_device_config(&out.stdout))
    }

    pub async fn virtio_drivers(&self, name: &str) -> Option<VirtioFlags> {
        self.device_config(name).await.map(|c| c.virtio)
    }

    #[instrument(skip(self), fields(repo = "virsh", operation = "guest_users"))]
    pub async fn guest_users(&self, name: &str) -> Option<Vec<String>> {
        let out = self
            .runner
            .run(&[
                "qemu-agent-command",
                name,
                r#"{"execute":"guest-get-users"}"#,
            ])
            .await;
        parse_guest_users(out.stdout_if_ok()?)
    }

    /// Whether the in-guest agent answers `guest-info`.
    pub async fn agent_available(&self, name: &str) -> bool {
        let out = self
            .runner
            .run(&["qemu-agent-command", name, r#"{"execute":"guest-info"}"#])
            .await;
        out.stdout_if_ok().is_some_and(agent_replied)
    }

    /// Uptime approximation in seconds: consumed CPU time spread over the vCPUs.
    pub async fn uptime_secs(&self, name: &str) -> Option<u64> {
        let stats = self.detailed_stats(name).await?;
        approximate_uptime_secs(&stats)
    }

    /// Slow-cadence facts for a running VM, gathered concurrently.
    #[instrument(skip(self, stats), fields(repo = "virsh", operation = "extras"))]
    pub async fn extras(&self, name: &str, stats: Option<&DetailedStats>) -> VmExtras {
        let (ip_address, guest_users, devices, host_cpu_temp) = futures_util::join!(
            self.ip_address(name),
            self.guest_users(name),
            self.device_config(name),
            host::host_cpu_temp(),
        );
        VmExtras {
            ip_address,
            uptime_secs: stats.and_then(approximate_uptime_secs),
            guest_users,
            virtio_drivers: devices
                .map(|d| d.virtio.enabled().into_iter().map(str::to_string).collect::<Vec<_>>())
                .unwrap_or_default(),
            host_cpu_temp,
        }
    }
}

/// `cpu_time / max(1, vcpus)` in whole seconds; `None` without a CPU counter.
pub fn approximate_uptime_secs(stats: &DetailedStats) -> Option<u64> {
    let cpu_time = stats.cpu_time.filter(|&t| t > 0)?;
    Some(cpu_time / 1_000_000_000 / stats.effective_vcpus())
}
