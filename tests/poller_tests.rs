// Poller: listing drives per-VM samples, snapshots land in the store and on the broadcast

mod common;

use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::{RwLock, broadcast, oneshot};
use tokio::time::{Duration, Instant};
use vmpanel::models::{DerivedRates, VmSnapshot};
use vmpanel::poller::{self, PollerConfig, PollerDeps, SnapshotStore};
use vmpanel::virsh::{CommandOutput, CommandRunner};

struct Running {
    store: SnapshotStore,
    rx: broadcast::Receiver<VmSnapshot>,
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

fn start<R: CommandRunner>(runner: R) -> Running {
    start_every(runner, 50)
}

fn start_every<R: CommandRunner>(runner: R, sample_interval_ms: u64) -> Running {
    let (tx, rx) = broadcast::channel(64);
    let store: SnapshotStore = Arc::new(RwLock::new(HashMap::new()));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = poller::spawn(
        PollerDeps {
            repo: Arc::new(repo(runner)),
            tx,
            snapshots: store.clone(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_rx,
        },
        PollerConfig {
            sample_interval_ms,
            extras_interval_secs: 3600,
            stats_log_interval_secs: 60,
        },
    );
    Running {
        store,
        rx,
        shutdown_tx,
        handle,
    }
}

/// Wait until `pred` holds for the stored snapshot of `vm`.
async fn wait_for(
    store: &SnapshotStore,
    vm: &str,
    pred: impl Fn(&VmSnapshot) -> bool,
) -> VmSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(s) = store.read().await.get(vm).filter(|s| pred(s)) {
            return s.clone();
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", vm);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_poller_publishes_running_and_stopped_vms() {
    let runner = running_host();
    let mut running = start(runner.clone());

    let stopped = wait_for(&running.store, "manjaro2", |_| true).await;
    assert!(!stopped.status.running);
    assert!(stopped.stats.is_none());
    assert!(stopped.rates.is_none());

    // Memory and latency need a second sample, like every other rate.
    let sampled = wait_for(&running.store, "manjaro1", |s| {
        s.rates.is_some_and(|r| r.mem_percent > 0.0)
    })
    .await;
    assert!(sampled.status.running);
    let rates = sampled.rates.unwrap();
    assert!((rates.mem_percent - 75.0).abs() < 1e-9);
    assert!((rates.avg_read_latency_ms - 2.0).abs() < 1e-9);
    let extras = sampled.extras.unwrap();
    assert_eq!(extras.ip_address.as_deref(), Some("192.168.122.45"));

    // Unconfigured VMs are never polled or published.
    assert!(!runner.called("domstats otherVM"));
    assert!(running.store.read().await.get("otherVM").is_none());

    let published = loop {
        match running.rx.recv().await {
            Ok(s) => break s,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("broadcast closed: {}", e),
        }
    };
    assert!(published.status.name == "manjaro1" || published.status.name == "manjaro2");

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_derives_rates_between_samples() {
    let runner = running_host();
    let mut running = start(runner.clone());
    wait_for(&running.store, "manjaro1", |s| s.stats.is_some()).await;

    // Counters move forward; the first sample that sees them diffs against the old ones.
    runner.set(
        "domstats manjaro1",
        CommandOutput::ok(DOMSTATS.replace("block.0.rd.reqs=1000", "block.0.rd.reqs=1100")),
    );
    let next = loop {
        match running.rx.recv().await {
            Ok(s) if s.stats.as_ref().is_some_and(|st| st.block_read_reqs == 1100) => break s,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("broadcast closed: {}", e),
        }
    };
    let rates = next.rates.unwrap();
    assert!(rates.read_iops > 0.0);
    assert!((0.0..=100.0).contains(&rates.cpu_percent));
    assert!(rates.net_rx_mbps >= 0.0);
    // Extras are refreshed slowly but carried forward on every snapshot.
    assert!(next.extras.is_some());

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_marks_vm_stopped_when_listing_changes() {
    let runner = running_host();
    let running = start(runner.clone());
    wait_for(&running.store, "manjaro1", |s| s.stats.is_some()).await;

    runner.set(
        "list --all",
        CommandOutput::ok(" Id Name State\n----\n - manjaro1 shut off\n - manjaro2 shut off\n"),
    );
    let stopped = wait_for(&running.store, "manjaro1", |s| !s.status.running).await;
    assert!(stopped.stats.is_none());
    assert!(stopped.extras.is_none());

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_survives_virsh_failure() {
    let running = start(FakeRunner::new());
    // Nothing lists; every configured VM is published as not running.
    let s = wait_for(&running.store, "manjaro1", |_| true).await;
    assert!(!s.status.running);
    assert_eq!(s.status.state_text, "unknown");

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

/// Next manjaro1 snapshot matching `pred`, skipping anything else on the channel.
async fn next_matching(
    rx: &mut broadcast::Receiver<VmSnapshot>,
    pred: impl Fn(&VmSnapshot) -> bool,
) -> VmSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(s)) if s.status.name == "manjaro1" && pred(&s) => return s,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("broadcast closed: {}", e),
            Err(_) => panic!("timed out waiting for manjaro1 snapshot"),
        }
    }
}

/// Received bytes on manjaro1 grow at exactly 1 MiB per wall-clock second.
#[derive(Clone)]
struct SteadyTrafficRunner {
    inner: FakeRunner,
    started: std::time::Instant,
}

impl CommandRunner for SteadyTrafficRunner {
    async fn run(&self, args: &[&str]) -> CommandOutput {
        if args == ["domstats", "manjaro1"] {
            let bytes = self.started.elapsed().as_micros() as u64 * (1 << 20) / 1_000_000;
            return CommandOutput::ok(DOMSTATS.replace(
                "net.0.rx.bytes=1048576",
                &format!("net.0.rx.bytes={}", bytes),
            ));
        }
        self.inner.run(args).await
    }
}

#[tokio::test]
async fn test_poller_times_samples_when_counters_are_read() {
    // The first sample also fetches extras, and the lease lookup takes a full second.
    let runner = SteadyTrafficRunner {
        inner: running_host().delay("domifaddr manjaro1 --source lease", Duration::from_secs(1)),
        started: std::time::Instant::now(),
    };
    let mut running = start_every(runner, 200);

    let sample = next_matching(&mut running.rx, |s| {
        s.rates.is_some_and(|r| r.net_rx_mbps > 0.0)
    })
    .await;
    let mbps = sample.rates.unwrap().net_rx_mbps;
    assert!((0.5..1.5).contains(&mbps), "expected ~1 MiB/s, got {}", mbps);

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_drops_sample_finished_after_vm_stopped() {
    let runner = running_host().delay("domstats manjaro1", Duration::from_millis(300));
    let mut running = start(runner.clone());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.called("domstats manjaro1") {
        assert!(Instant::now() < deadline, "manjaro1 was never sampled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // The VM goes down while its first sample is still in flight.
    runner.set(
        "list --all",
        CommandOutput::ok(" Id Name State\n----\n - manjaro1 shut off\n - manjaro2 shut off\n"),
    );

    let window_end = Instant::now() + Duration::from_millis(800);
    let mut seen = Vec::new();
    while let Ok(msg) = tokio::time::timeout_at(window_end, running.rx.recv()).await {
        match msg {
            Ok(s) if s.status.name == "manjaro1" => seen.push((s.status.running, s.rates.is_some())),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("broadcast closed: {}", e),
        }
    }
    let first_stop = seen
        .iter()
        .position(|&(running, _)| !running)
        .expect("manjaro1 never published as stopped");
    assert!(
        seen[first_stop..].iter().all(|&(running, rates)| !running && !rates),
        "running snapshot after stop: {:?}",
        seen
    );
    let stored = running.store.read().await.get("manjaro1").cloned().unwrap();
    assert!(!stored.status.running);

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_starts_fresh_after_listing_failure() {
    let runner = running_host();
    let running = start(runner.clone());
    wait_for(&running.store, "manjaro1", |s| {
        s.rates.is_some_and(|r| r.mem_percent > 0.0)
    })
    .await;

    runner.set(
        "list --all",
        CommandOutput::failed("error: failed to connect to the hypervisor"),
    );
    wait_for(&running.store, "manjaro1", |s| !s.status.running).await;

    let mut rx = running.rx.resubscribe();
    runner.set("list --all", CommandOutput::ok(LIST_ONE_RUNNING));
    let resumed = next_matching(&mut rx, |s| s.status.running && s.stats.is_some()).await;
    // Nothing survives the failure, so the first sample back has no window yet.
    assert_eq!(resumed.rates, Some(DerivedRates::default()));

    running.shutdown_tx.send(()).unwrap();
    running.handle.await.unwrap();
}
