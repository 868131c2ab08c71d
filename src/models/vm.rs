// VM identity, lifecycle state and lifecycle actions

use serde::{Deserialize, Serialize};

/// Localized `virsh list` states that mean "running" (English and Spanish locales).
pub const RUNNING_STATES: &[&str] = &["running", "ejecutando"];
const SHUT_OFF_STATES: &[&str] = &["shut off", "apagado", "apagada"];
const PAUSED_STATES: &[&str] = &["paused", "pausado", "pausada"];

/// Lifecycle state; serializes to snake_case JSON (e.g. "shut_off").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Running,
    ShutOff,
    Paused,
    #[serde(other)]
    Other,
}

impl VmState {
    /// Parse from the state column of `virsh list --all`.
    pub fn from_virsh(s: &str) -> Self {
        if RUNNING_STATES.contains(&s) {
            VmState::Running
        } else if SHUT_OFF_STATES.contains(&s) {
            VmState::ShutOff
        } else if PAUSED_STATES.contains(&s) {
            VmState::Paused
        } else {
            VmState::Other
        }
    }
}

/// One configured VM as observed in the domain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub name: String,
    /// Domain id; only present while the VM is running.
    pub id: Option<u32>,
    pub state: VmState,
    /// Literal state text as printed by virsh, kept for display.
    pub state_text: String,
    pub running: bool,
}

impl VmStatus {
    /// Status for a configured VM that the listing did not report.
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            state: VmState::Other,
            state_text: "unknown".into(),
            running: false,
        }
    }
}

/// Lifecycle verbs the panel can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmAction {
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Save,
    RemoveSavedState,
}

impl VmAction {
    /// virsh subcommand for this action.
    pub fn subcommand(self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Shutdown => "shutdown",
            VmAction::Destroy => "destroy",
            VmAction::Reboot => "reboot",
            VmAction::Save => "managedsave",
            VmAction::RemoveSavedState => "managedsave-remove",
        }
    }

    /// Whether the VM must be running before the action is issued.
    pub fn requires_running(self) -> bool {
        matches!(
            self,
            VmAction::Shutdown | VmAction::Destroy | VmAction::Reboot | VmAction::Save
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Shutdown => "shutdown",
            VmAction::Destroy => "destroy",
            VmAction::Reboot => "reboot",
            VmAction::Save => "save",
            VmAction::RemoveSavedState => "remove-saved-state",
        }
    }
}

impl std::str::FromStr for VmAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(VmAction::Start),
            "shutdown" => Ok(VmAction::Shutdown),
            "destroy" => Ok(VmAction::Destroy),
            "reboot" => Ok(VmAction::Reboot),
            "save" => Ok(VmAction::Save),
            "remove-saved-state" => Ok(VmAction::RemoveSavedState),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}
