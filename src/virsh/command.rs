// virsh process invocation: bounded timeout, single pkexec retry on permission failure.

use std::future::Future;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

use crate::config::HypervisorConfig;
use crate::error::VirtError;

/// Outcome of one management-tool invocation. Failures are data, never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout when the command succeeded with non-empty output.
    pub fn stdout_if_ok(&self) -> Option<&str> {
        (self.success && !self.stdout.trim().is_empty()).then_some(self.stdout.as_str())
    }
}

/// Seam between the virsh layer and process execution.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run the management tool with `args` (connection target is added by the runner).
    fn run(&self, args: &[&str]) -> impl Future<Output = CommandOutput> + Send;
}

/// Runs the real `virsh` binary against the configured connection URI.
pub struct VirshRunner {
    config: HypervisorConfig,
}

impl VirshRunner {
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }
}

/// True when stderr indicates the call should be retried through the elevation wrapper.
pub(crate) fn needs_elevation(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission") || lower.contains("access denied")
}

async fn invoke(
    program: &str,
    args: &[String],
    timeout_secs: u64,
    command_line: &str,
) -> Result<Output, VirtError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
        Err(_) => Err(VirtError::Timeout {
            command: command_line.to_string(),
            secs: timeout_secs,
        }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(VirtError::ToolNotFound {
            tool: program.to_string(),
        }),
        Ok(Err(e)) => Err(VirtError::Io {
            tool: program.to_string(),
            source: e,
        }),
        Ok(Ok(output)) => Ok(output),
    }
}

fn to_command_output(output: Output) -> CommandOutput {
    CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

impl CommandRunner for VirshRunner {
    #[instrument(skip(self), fields(operation = "virsh"))]
    async fn run(&self, args: &[&str]) -> CommandOutput {
        let command_line = args.join(" ");
        let mut full: Vec<String> = vec!["-c".into(), self.config.connection_uri.clone()];
        full.extend(args.iter().map(|a| a.to_string()));

        let first = match invoke(
            &self.config.binary,
            &full,
            self.config.command_timeout_secs,
            &command_line,
        )
        .await
        {
            Ok(o) => to_command_output(o),
            Err(e) => {
                error!(error = %e, command = %command_line, "virsh invocation failed");
                return CommandOutput::failed(e.to_string());
            }
        };

        if first.success || !needs_elevation(&first.stderr) {
            return first;
        }

        warn!(command = %command_line, "permission denied; retrying through {}", self.config.elevation_wrapper);
        let mut elevated = Vec::with_capacity(full.len() + 1);
        elevated.push(self.config.binary.clone());
        elevated.extend(full);
        match invoke(
            &self.config.elevation_wrapper,
            &elevated,
            self.config.elevated_timeout_secs,
            &command_line,
        )
        .await
        {
            Ok(o) => {
                let out = to_command_output(o);
                debug!(command = %command_line, success = out.success, "elevated virsh finished");
                out
            }
            Err(e) => {
                error!(error = %e, command = %command_line, "elevated virsh invocation failed");
                CommandOutput::failed(e.to_string())
            }
        }
    }
}
