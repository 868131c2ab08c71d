// Error taxonomy and virsh stderr classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure category; serializes to snake_case (e.g. "not_running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Permission,
    NotFound,
    AlreadyRunning,
    NotRunning,
    Network,
    Resources,
    Unknown,
}

/// User-facing error shape shared by every lifecycle operation and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

struct Rule {
    any_of: &'static [&'static str],
    all_of: &'static [&'static str],
    kind: ErrorKind,
    message: &'static str,
    suggestion: Option<&'static str>,
}

// Order matters: first match wins.
const RULES: &[Rule] = &[
    Rule {
        any_of: &["failed to connect", "connection refused"],
        all_of: &[],
        kind: ErrorKind::Connection,
        message: "Could not connect to the virtualization service",
        suggestion: Some("Run: sudo systemctl start libvirtd"),
    },
    Rule {
        any_of: &["permission denied", "access denied"],
        all_of: &[],
        kind: ErrorKind::Permission,
        message: "Insufficient permissions for this operation",
        suggestion: Some("Run: sudo usermod -a -G libvirt $USER and log in again"),
    },
    Rule {
        any_of: &["domain not found", "failed to get domain"],
        all_of: &[],
        kind: ErrorKind::NotFound,
        message: "The virtual machine does not exist",
        suggestion: Some("Check the VM name with: virsh list --all"),
    },
    Rule {
        any_of: &["already active"],
        all_of: &[],
        kind: ErrorKind::AlreadyRunning,
        message: "The VM is already running",
        suggestion: None,
    },
    Rule {
        any_of: &["domain is not running", "not running"],
        all_of: &[],
        kind: ErrorKind::NotRunning,
        message: "The VM is not running",
        suggestion: Some("Start the VM first"),
    },
    Rule {
        any_of: &[],
        all_of: &["network", "error"],
        kind: ErrorKind::Network,
        message: "Network configuration error",
        suggestion: Some("Check the network configuration of the VM"),
    },
    Rule {
        any_of: &["no space", "out of memory"],
        all_of: &[],
        kind: ErrorKind::Resources,
        message: "Insufficient system resources",
        suggestion: Some("Free disk space or RAM"),
    },
];

impl Rule {
    fn matches(&self, haystack: &str) -> bool {
        let any = self.any_of.is_empty() || self.any_of.iter().any(|p| haystack.contains(p));
        let all = self.all_of.iter().all(|p| haystack.contains(p));
        any && all
    }
}

/// Classify virsh stderr into a StructuredError. Total: unmatched text is `Unknown`
/// carrying the trimmed raw message.
pub fn classify_error(stderr: &str) -> StructuredError {
    let lower = stderr.to_lowercase();
    match RULES.iter().find(|r| r.matches(&lower)) {
        Some(rule) => StructuredError {
            kind: rule.kind,
            message: rule.message.to_string(),
            suggestion: rule.suggestion.map(str::to_string),
        },
        None => StructuredError::from_message(stderr),
    }
}

impl StructuredError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, suggestion: Option<&str>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: suggestion.map(str::to_string),
        }
    }

    /// Normalize a bare message into the `Unknown` shape.
    pub fn from_message(message: &str) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: message.trim().to_string(),
            suggestion: None,
        }
    }

    /// `already_running` / `not_running` describe state, not a failure of the tool.
    pub fn is_informational(&self) -> bool {
        matches!(self.kind, ErrorKind::AlreadyRunning | ErrorKind::NotRunning)
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suggestion {
            Some(s) => write!(f, "{} ({})", self.message, s),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for StructuredError {}

/// Internal failure taxonomy for invocation and parsing.
#[derive(Error, Debug)]
pub enum VirtError {
    #[error("{tool} is not installed or not in PATH")]
    ToolNotFound { tool: String },

    #[error("command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("failed to run {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to hypervisor: {0}")]
    ConnectionRefused(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("domain not found: {0}")]
    EntityNotFound(String),

    #[error("domain already running: {0}")]
    AlreadyRunning(String),

    #[error("domain not running: {0}")]
    NotRunning(String),

    #[error("network configuration error: {0}")]
    NetworkConfigError(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cannot parse {field}={value}: {reason}")]
    Parse {
        field: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Unknown(String),
}

impl VirtError {
    /// Map a classified stderr into the taxonomy.
    pub fn from_stderr(stderr: &str) -> Self {
        let msg = stderr.trim().to_string();
        match classify_error(stderr).kind {
            ErrorKind::Connection => VirtError::ConnectionRefused(msg),
            ErrorKind::Permission => VirtError::PermissionDenied(msg),
            ErrorKind::NotFound => VirtError::EntityNotFound(msg),
            ErrorKind::AlreadyRunning => VirtError::AlreadyRunning(msg),
            ErrorKind::NotRunning => VirtError::NotRunning(msg),
            ErrorKind::Network => VirtError::NetworkConfigError(msg),
            ErrorKind::Resources => VirtError::ResourceExhausted(msg),
            ErrorKind::Unknown => VirtError::Unknown(msg),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VirtError::ConnectionRefused(_) => ErrorKind::Connection,
            VirtError::PermissionDenied(_) => ErrorKind::Permission,
            VirtError::EntityNotFound(_) => ErrorKind::NotFound,
            VirtError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            VirtError::NotRunning(_) => ErrorKind::NotRunning,
            VirtError::NetworkConfigError(_) => ErrorKind::Network,
            VirtError::ResourceExhausted(_) => ErrorKind::Resources,
            VirtError::ToolNotFound { .. }
            | VirtError::Timeout { .. }
            | VirtError::Io { .. }
            | VirtError::Parse { .. }
            | VirtError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl From<VirtError> for StructuredError {
    fn from(e: VirtError) -> Self {
        match e {
            VirtError::ToolNotFound { .. }
            | VirtError::Timeout { .. }
            | VirtError::Io { .. }
            | VirtError::Parse { .. }
            | VirtError::Unknown(_) => StructuredError::from_message(&e.to_string()),
            VirtError::ConnectionRefused(ref m)
            | VirtError::PermissionDenied(ref m)
            | VirtError::EntityNotFound(ref m)
            | VirtError::AlreadyRunning(ref m)
            | VirtError::NotRunning(ref m)
            | VirtError::NetworkConfigError(ref m)
            | VirtError::ResourceExhausted(ref m) => classify_error(m),
        }
    }
}
