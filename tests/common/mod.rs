// Shared test helpers: a scripted virsh runner and canned virsh output.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vmpanel::config::HypervisorConfig;
use vmpanel::virsh::{CommandOutput, CommandRunner, VirshRepo};

pub const LIST_ONE_RUNNING: &str = " Id   Name       State
-----------------------------
 3    manjaro1   running
 -    otherVM    running
 -    manjaro2   shut off
";

pub const DOMSTATS: &str = "Domain: 'manjaro1'
  state.state=1
  cpu.time=5000000000
  balloon.current=2097152
  balloon.maximum=2097152
  vcpu.current=2
  vcpu.maximum=2
  vcpu.0.time=2000000000
  vcpu.1.time=2500000000
  net.count=1
  net.0.rx.bytes=1048576
  net.0.tx.bytes=524288
  block.count=1
  block.0.rd.reqs=1000
  block.0.rd.times=2000000000
  block.0.wr.reqs=500
  block.0.wr.times=1000000000
";

pub const DOMMEMSTAT: &str = "actual 2097152
unused 524288
available 2035000
rss 1700000
";

pub const DOMIFADDR: &str = " Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.45/24
";

pub const DUMPXML: &str = "<domain type='kvm'><name>manjaro1</name><devices>
<disk type='file' device='disk'><target dev='vda' bus='virtio'/></disk>
<interface type='network'><mac address='52:54:00:aa:bb:cc'/><source network='default'/><model type='virtio'/></interface>
<memballoon model='virtio'/>
</devices></domain>";

pub const VCPUINFO: &str = "VCPU:           0
CPU:            5
State:          running
CPU time:       120.3s

VCPU:           1
CPU:            2
State:          running
CPU time:       98.1s
";

/// Replays canned output keyed by the space-joined argument list and records every call.
/// Clones share state, so a test can keep a handle after moving one into a repo.
#[derive(Clone, Default)]
pub struct FakeRunner {
    responses: Arc<Mutex<HashMap<String, CommandOutput>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, args: &str, out: CommandOutput) -> Self {
        self.set(args, out);
        self
    }

    pub fn set(&self, args: &str, out: CommandOutput) {
        self.responses.lock().unwrap().insert(args.to_string(), out);
    }

    /// Make `args` take `delay` before answering, like a slow virsh call.
    pub fn delay(self, args: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(args.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, args: &str) -> bool {
        self.calls().iter().any(|c| c == args)
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, args: &[&str]) -> CommandOutput {
        let key = args.join(" ");
        self.calls.lock().unwrap().push(key.clone());
        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CommandOutput::failed(format!("unscripted command: {}", key)))
    }
}

/// Runner scripted for a host where manjaro1 runs and manjaro2 is shut off.
pub fn running_host() -> FakeRunner {
    FakeRunner::new()
        .respond("list --all", CommandOutput::ok(LIST_ONE_RUNNING))
        .respond("domstats manjaro1", CommandOutput::ok(DOMSTATS))
        .respond("dommemstat manjaro1", CommandOutput::ok(DOMMEMSTAT))
        .respond("vcpuinfo manjaro1", CommandOutput::ok(VCPUINFO))
        .respond("dumpxml manjaro1", CommandOutput::ok(DUMPXML))
        .respond(
            "domifaddr manjaro1 --source lease",
            CommandOutput::ok(DOMIFADDR),
        )
        .respond(
            "qemu-agent-command manjaro1 {\"execute\":\"guest-get-users\"}",
            CommandOutput::ok(r#"{"return":[{"user":"alice","login-time":1.0}]}"#),
        )
}

pub fn repo<R: CommandRunner>(runner: R) -> VirshRepo<R> {
    VirshRepo::with_runner(runner, HypervisorConfig::with_vms(["manjaro1", "manjaro2"]))
}
