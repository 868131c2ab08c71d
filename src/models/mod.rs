// Domain models

mod device;
mod snapshot;
mod stats;
mod vm;

pub use device::{DeviceConfig, InterfaceInfo, VirtioFlags};
pub use snapshot::{VmExtras, VmSnapshot};
pub use stats::{DerivedRates, DetailedStats, MemoryUsage, VcpuInfo};
pub use vm::{RUNNING_STATES, VmAction, VmState, VmStatus};
