// Background VM poller.
// Every virsh call runs in its own task; results come back over a channel and only this
// task touches the sample cache. Busy flags keep one in-flight poll per VM.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, interval};
use tracing::Instrument;

use crate::error::StructuredError;
use crate::models::{DetailedStats, VmExtras, VmSnapshot, VmStatus};
use crate::rates::SampleCache;
use crate::virsh::{CommandRunner, VirshRepo};

/// Rate limit for the "no receivers" debug line.
const NO_RECEIVERS_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Latest snapshot per configured VM, shared with HTTP handlers.
pub type SnapshotStore = Arc<RwLock<HashMap<String, VmSnapshot>>>;

/// Clears its flag on drop, so a panicking poll task never leaves a VM stuck as busy.
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    /// `None` when a poll using this flag is already in flight.
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Completed work reported back to the poller.
#[derive(Debug)]
pub enum PollEvent {
    Listing(Result<Vec<VmStatus>, StructuredError>),
    Sample {
        status: VmStatus,
        /// Generation of the VM when the sample was requested.
        generation: u64,
        stats: Option<DetailedStats>,
        extras: Option<VmExtras>,
        /// When the counters in `stats` were read.
        at: std::time::Instant,
    },
}

pub struct PollerDeps<R: CommandRunner> {
    pub repo: Arc<VirshRepo<R>>,
    pub tx: broadcast::Sender<VmSnapshot>,
    pub snapshots: SnapshotStore,
    pub ws_connections: Arc<AtomicUsize>,
    pub shutdown_rx: oneshot::Receiver<()>,
}

/// Poller timing. Stats logging uses real seconds, independent of sample_interval_ms.
pub struct PollerConfig {
    pub sample_interval_ms: u64,
    pub extras_interval_secs: u64,
    pub stats_log_interval_secs: u64,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, operation = "get_timestamp", "system time error");
            0
        })
}

struct Poller<R: CommandRunner> {
    repo: Arc<VirshRepo<R>>,
    tx: broadcast::Sender<VmSnapshot>,
    snapshots: SnapshotStore,
    events: mpsc::Sender<PollEvent>,
    cache: SampleCache,
    listing_busy: Arc<AtomicBool>,
    vm_busy: HashMap<String, Arc<AtomicBool>>,
    last_extras: HashMap<String, Instant>,
    // Bumped whenever a VM's sample state is dropped; samples from older generations are stale.
    generations: HashMap<String, u64>,
    extras_interval: Duration,
    published_total: u64,
    last_no_receivers_warn: Option<Instant>,
}

impl<R: CommandRunner> Poller<R> {
    fn request_listing(&self) {
        let Some(guard) = BusyGuard::try_acquire(&self.listing_busy) else {
            tracing::debug!(operation = "list_vms", "listing still in flight; skipping tick");
            return;
        };
        let repo = self.repo.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let vms = repo.try_list_vms().await;
            if events.send(PollEvent::Listing(vms)).await.is_err() {
                tracing::debug!("Poller channel closed");
            }
        });
    }

    fn generation(&self, name: &str) -> u64 {
        self.generations.get(name).copied().unwrap_or(0)
    }

    /// Drop everything remembered about `name` and invalidate its in-flight sample.
    fn forget(&mut self, name: &str) {
        self.cache.clear(name);
        self.last_extras.remove(name);
        *self.generations.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Drop all sample state, e.g. when the hypervisor cannot be listed.
    fn reset(&mut self) {
        self.cache.reset();
        self.last_extras.clear();
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
    }

    fn extras_due(&mut self, name: &str) -> bool {
        let now = Instant::now();
        let due = self
            .last_extras
            .get(name)
            .is_none_or(|t| now.duration_since(*t) >= self.extras_interval);
        if due {
            self.last_extras.insert(name.to_string(), now);
        }
        due
    }

    fn request_sample(&mut self, status: VmStatus) {
        let flag = self
            .vm_busy
            .entry(status.name.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        let Some(guard) = BusyGuard::try_acquire(&flag) else {
            tracing::debug!(vm = %status.name, "previous poll still in flight; skipping");
            return;
        };
        let with_extras = self.extras_due(&status.name);
        let generation = self.generation(&status.name);
        let repo = self.repo.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let stats = repo.detailed_stats(&status.name).await;
            let at = std::time::Instant::now();
            let extras = if with_extras {
                Some(repo.extras(&status.name, stats.as_ref()).await)
            } else {
                None
            };
            let event = PollEvent::Sample {
                status,
                generation,
                stats,
                extras,
                at,
            };
            if events.send(event).await.is_err() {
                tracing::debug!("Poller channel closed");
            }
        });
    }

    async fn handle(&mut self, event: PollEvent) {
        match event {
            PollEvent::Listing(listing) => {
                let vms = match listing {
                    Ok(vms) => vms,
                    Err(err) => {
                        tracing::warn!(
                            kind = ?err.kind,
                            error = %err.message,
                            "listing failed; resetting sample state"
                        );
                        self.reset();
                        Vec::new()
                    }
                };
                let names = self.repo.config().vm_names.clone();
                for name in names {
                    let status = vms
                        .iter()
                        .find(|v| v.name == name)
                        .cloned()
                        .unwrap_or_else(|| VmStatus::missing(&name));
                    if status.running {
                        self.request_sample(status);
                    } else {
                        self.forget(&name);
                        self.publish(VmSnapshot::stopped(now_millis(), status)).await;
                    }
                }
            }
            PollEvent::Sample {
                status,
                generation,
                stats,
                extras,
                at,
            } => {
                if generation != self.generation(&status.name) {
                    tracing::debug!(vm = %status.name, "VM stopped while sampling; dropping sample");
                    return;
                }
                let rates = stats
                    .as_ref()
                    .map(|s| self.cache.observe(&status.name, s, at));
                let extras = match extras {
                    Some(e) => Some(e),
                    None => self
                        .snapshots
                        .read()
                        .await
                        .get(&status.name)
                        .and_then(|s| s.extras.clone()),
                };
                let snapshot = VmSnapshot {
                    timestamp: now_millis(),
                    status,
                    stats,
                    rates,
                    extras,
                };
                self.publish(snapshot).await;
            }
        }
    }

    async fn publish(&mut self, snapshot: VmSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.status.name.clone(), snapshot.clone());
        self.published_total += 1;
        if self.tx.send(snapshot).is_err() {
            let should_warn = self
                .last_no_receivers_warn
                .is_none_or(|t| t.elapsed() >= NO_RECEIVERS_WARN_INTERVAL);
            if should_warn {
                tracing::debug!(
                    operation = "broadcast_snapshot",
                    "No active WebSocket clients; broadcast channel has no receivers"
                );
                self.last_no_receivers_warn = Some(Instant::now());
            }
        }
    }
}

pub fn spawn<R: CommandRunner>(
    deps: PollerDeps<R>,
    config: PollerConfig,
) -> tokio::task::JoinHandle<()> {
    let PollerDeps {
        repo,
        tx,
        snapshots,
        ws_connections,
        mut shutdown_rx,
    } = deps;
    let PollerConfig {
        sample_interval_ms,
        extras_interval_secs,
        stats_log_interval_secs,
    } = config;

    let (events_tx, mut events_rx) = mpsc::channel(repo.config().vm_names.len().max(1) * 4);
    let mut poller = Poller {
        repo,
        tx,
        snapshots,
        events: events_tx,
        cache: SampleCache::new(),
        listing_busy: Arc::new(AtomicBool::new(false)),
        vm_busy: HashMap::new(),
        last_extras: HashMap::new(),
        generations: HashMap::new(),
        extras_interval: Duration::from_secs(extras_interval_secs),
        published_total: 0,
        last_no_receivers_warn: None,
    };
    let span = tracing::debug_span!("poller", sample_interval_ms);

    tokio::spawn(
        async move {
            let mut tick = interval(Duration::from_millis(sample_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stats_log_tick = interval(Duration::from_secs(stats_log_interval_secs));
            stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => poller.request_listing(),
                    Some(event) = events_rx.recv() => poller.handle(event).await,
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Poller shutting down");
                        break;
                    }
                    _ = stats_log_tick.tick() => {
                        tracing::info!(
                            ws_vm_clients = ws_connections.load(Ordering::Relaxed),
                            snapshots_published_total = poller.published_total,
                            vms_sampled = poller.cache.len(),
                            "app stats"
                        );
                    }
                }
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_guard_is_exclusive_and_released_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = BusyGuard::try_acquire(&flag).unwrap();
        assert!(BusyGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(BusyGuard::try_acquire(&flag).is_some());
    }

    #[test]
    fn busy_guard_released_when_task_panics() {
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = BusyGuard::try_acquire(&f).unwrap();
            panic!("poll failed");
        });
        assert!(result.is_err());
        assert!(!flag.load(Ordering::Acquire));
    }
}
