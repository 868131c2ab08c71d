// Device configuration models (from domain XML)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    #[serde(rename = "type")]
    pub type_: String,
    pub mac: Option<String>,
    /// Network name, bridge or host device the interface is attached to.
    pub source: Option<String>,
    pub model: Option<String>,
    pub target: Option<String>,
    pub alias: Option<String>,
    pub link_state: String,
}

/// Which virtio devices the domain uses. Absent element means `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtioFlags {
    pub disk: bool,
    pub network: bool,
    pub balloon: bool,
    pub serial: bool,
    pub rng: bool,
    pub scsi: bool,
}

impl VirtioFlags {
    /// Names of the enabled capabilities, in a fixed order.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("disk", self.disk),
            ("network", self.network),
            ("balloon", self.balloon),
            ("serial", self.serial),
            ("rng", self.rng),
            ("scsi", self.scsi),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub interfaces: Vec<InterfaceInfo>,
    pub virtio: VirtioFlags,
}
