use serde::Deserialize;

pub const DEFAULT_CONNECTION_URI: &str = "qemu:///system";
pub const DEFAULT_VM_NAMES: &[&str] = &["manjaro1", "manjaro2"];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    pub publishing: PublishingConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Fixed hypervisor target and the VMs this panel shows. Passed by reference into the
/// virsh layer; never read from global state.
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default = "default_connection_uri")]
    pub connection_uri: String,
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Wrapper used to re-run a command when virsh reports a permission failure.
    #[serde(default = "default_elevation_wrapper")]
    pub elevation_wrapper: String,
    #[serde(default = "default_vm_names")]
    pub vm_names: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_elevated_timeout_secs")]
    pub elevated_timeout_secs: u64,
}

fn default_connection_uri() -> String {
    DEFAULT_CONNECTION_URI.into()
}

fn default_binary() -> String {
    "virsh".into()
}

fn default_elevation_wrapper() -> String {
    "pkexec".into()
}

fn default_vm_names() -> Vec<String> {
    DEFAULT_VM_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_elevated_timeout_secs() -> u64 {
    60
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connection_uri: default_connection_uri(),
            binary: default_binary(),
            elevation_wrapper: default_elevation_wrapper(),
            vm_names: default_vm_names(),
            command_timeout_secs: default_command_timeout_secs(),
            elevated_timeout_secs: default_elevated_timeout_secs(),
        }
    }
}

impl HypervisorConfig {
    /// Config with the compiled-in target and a custom VM set (e.g. for tests).
    pub fn with_vms<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vm_names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.vm_names.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishingConfig {
    /// Max number of VM snapshots kept in the broadcast channel for /ws/vms (slow clients may lag).
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub sample_interval_ms: u64,
    /// How often IP address, uptime, guest users, virtio drivers and host temperature are refreshed.
    #[serde(default = "default_extras_interval_secs")]
    pub extras_interval_secs: u64,
    /// How often to log app stats (ws clients, polls completed) at INFO level.
    pub stats_log_interval_secs: u64,
}

fn default_extras_interval_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            !self.hypervisor.connection_uri.is_empty(),
            "hypervisor.connection_uri must be non-empty"
        );
        anyhow::ensure!(
            !self.hypervisor.binary.is_empty(),
            "hypervisor.binary must be non-empty"
        );
        anyhow::ensure!(
            !self.hypervisor.vm_names.is_empty(),
            "hypervisor.vm_names must list at least one VM"
        );
        anyhow::ensure!(
            self.hypervisor.vm_names.iter().all(|n| !n.trim().is_empty()),
            "hypervisor.vm_names must not contain empty names"
        );
        anyhow::ensure!(
            self.hypervisor.command_timeout_secs > 0,
            "hypervisor.command_timeout_secs must be > 0, got {}",
            self.hypervisor.command_timeout_secs
        );
        anyhow::ensure!(
            self.hypervisor.elevated_timeout_secs > 0,
            "hypervisor.elevated_timeout_secs must be > 0, got {}",
            self.hypervisor.elevated_timeout_secs
        );
        anyhow::ensure!(
            self.publishing.broadcast_capacity > 0,
            "publishing.broadcast_capacity must be > 0, got {}",
            self.publishing.broadcast_capacity
        );
        anyhow::ensure!(
            self.monitoring.sample_interval_ms > 0,
            "monitoring.sample_interval_ms must be > 0, got {}",
            self.monitoring.sample_interval_ms
        );
        anyhow::ensure!(
            self.monitoring.extras_interval_secs > 0,
            "monitoring.extras_interval_secs must be > 0, got {}",
            self.monitoring.extras_interval_secs
        );
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        Ok(())
    }
}
