//! Trigger scheduler: a bounded worker pool with per-bundle serialization.
//! Triggers arriving while a cycle is in flight coalesce into exactly one
//! follow-up; failures retry with exponential backoff; idle bundles resync
//! periodically with deterministic per-identity jitter.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rudder_core::BundleId;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::{CancelFlag, CycleOutcome, Reconciler};

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Bundle spec or source content may have changed; subject to checksum
    /// gating.
    Changed(BundleId),
    /// An owned live object changed; runs a full cycle (drift repair).
    Owned(BundleId),
    /// Periodic resync; runs a full cycle.
    Resync(BundleId),
    /// Bundle deletion observed.
    Deleted(BundleId),
}

impl Trigger {
    fn id(&self) -> &BundleId {
        match self {
            Trigger::Changed(id) | Trigger::Owned(id) | Trigger::Resync(id) | Trigger::Deleted(id) => id,
        }
    }

    fn full(&self) -> bool {
        !matches!(self, Trigger::Changed(_))
    }

    fn deletion(&self) -> bool {
        matches!(self, Trigger::Deleted(_))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_cap: usize,
    pub resync: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let workers = std::env::var("RUDDER_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(4);
        let queue_cap =
            std::env::var("RUDDER_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024);
        let resync_secs: u64 =
            std::env::var("RUDDER_RESYNC_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(600);
        let base_ms: u64 = std::env::var("RUDDER_BACKOFF_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);
        let max_secs: u64 = std::env::var("RUDDER_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        Self {
            workers,
            queue_cap,
            resync: Duration::from_secs(resync_secs),
            backoff_base: Duration::from_millis(base_ms),
            backoff_max: Duration::from_secs(max_secs),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    full: bool,
    deletion: bool,
}

struct IdState {
    running: bool,
    pending: Option<Pending>,
    attempts: u32,
    resync_scheduled: bool,
    cancel_tx: watch::Sender<bool>,
}

impl IdState {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self { running: false, pending: None, attempts: 0, resync_scheduled: false, cancel_tx }
    }
}

struct Done {
    id: BundleId,
    retry: bool,
    gone: bool,
}

/// Handle for feeding triggers into the dispatch loop.
pub struct Scheduler {
    tx: mpsc::Sender<Trigger>,
}

impl Scheduler {
    pub fn spawn(reconciler: Arc<dyn Reconciler>, cfg: SchedulerConfig) -> Scheduler {
        let (tx, rx) = mpsc::channel(cfg.queue_cap.max(1));
        tokio::spawn(dispatch(reconciler, cfg, rx));
        Scheduler { tx }
    }

    pub fn sender(&self) -> mpsc::Sender<Trigger> {
        self.tx.clone()
    }

    pub async fn trigger(&self, t: Trigger) {
        if let Err(e) = self.tx.send(t).await {
            warn!(error = %e, "scheduler stopped, trigger dropped");
        }
    }
}

async fn dispatch(
    reconciler: Arc<dyn Reconciler>,
    cfg: SchedulerConfig,
    mut rx: mpsc::Receiver<Trigger>,
) {
    let semaphore = Arc::new(Semaphore::new(cfg.workers.max(1)));
    let (done_tx, mut done_rx) = mpsc::channel::<Done>(cfg.queue_cap.max(16));
    // Retry and resync timers feed back through their own channel so a
    // dropped handle still shuts the loop down cleanly.
    let (timer_tx, mut timer_rx) = mpsc::channel::<Trigger>(cfg.queue_cap.max(16));
    let mut states: FxHashMap<BundleId, IdState> = FxHashMap::default();
    let mut closed = false;

    loop {
        tokio::select! {
            maybe = rx.recv(), if !closed => {
                match maybe {
                    Some(t) => on_trigger(t, &mut states, &reconciler, &semaphore, &done_tx),
                    None => closed = true,
                }
            }
            Some(t) = timer_rx.recv() => {
                on_trigger(t, &mut states, &reconciler, &semaphore, &done_tx);
            }
            Some(d) = done_rx.recv() => {
                on_done(d, &mut states, &cfg, &reconciler, &semaphore, &done_tx, &timer_tx);
            }
        }
        if closed && states.values().all(|s| !s.running) {
            break;
        }
    }
    info!("scheduler stopped");
}

fn on_trigger(
    t: Trigger,
    states: &mut FxHashMap<BundleId, IdState>,
    reconciler: &Arc<dyn Reconciler>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::Sender<Done>,
) {
    let id = t.id().clone();
    let st = states.entry(id.clone()).or_insert_with(IdState::new);
    if matches!(t, Trigger::Resync(_)) {
        st.resync_scheduled = false;
    }
    if st.running {
        // Deletion must reach the in-flight cycle, not just the follow-up.
        if t.deletion() {
            let _ = st.cancel_tx.send(true);
        }
        let p = st.pending.get_or_insert_with(Pending::default);
        p.full |= t.full();
        p.deletion |= t.deletion();
        counter!("bundle_triggers_coalesced", 1u64);
        debug!(bundle = %id, "trigger coalesced into pending follow-up");
    } else {
        start_cycle(st, &id, t.full(), t.deletion(), reconciler, semaphore, done_tx);
    }
}

fn on_done(
    d: Done,
    states: &mut FxHashMap<BundleId, IdState>,
    cfg: &SchedulerConfig,
    reconciler: &Arc<dyn Reconciler>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::Sender<Done>,
    timer_tx: &mpsc::Sender<Trigger>,
) {
    let Some(st) = states.get_mut(&d.id) else { return };
    st.running = false;
    if d.gone {
        states.remove(&d.id);
        return;
    }
    if let Some(p) = st.pending.take() {
        start_cycle(st, &d.id, p.full, p.deletion, reconciler, semaphore, done_tx);
        return;
    }
    if d.retry {
        st.attempts = st.attempts.saturating_add(1);
        let delay = backoff(cfg, st.attempts);
        debug!(bundle = %d.id, attempt = st.attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
        let timer_tx = timer_tx.clone();
        let id = d.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(Trigger::Owned(id)).await;
        });
        return;
    }
    st.attempts = 0;
    if !st.resync_scheduled {
        st.resync_scheduled = true;
        let delay = cfg.resync + resync_jitter(&d.id, cfg.resync);
        let timer_tx = timer_tx.clone();
        let id = d.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(Trigger::Resync(id)).await;
        });
    }
}

fn start_cycle(
    st: &mut IdState,
    id: &BundleId,
    full: bool,
    deletion: bool,
    reconciler: &Arc<dyn Reconciler>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::Sender<Done>,
) {
    st.running = true;
    let _ = st.cancel_tx.send(deletion);
    let cancel = CancelFlag::from_receiver(st.cancel_tx.subscribe());
    let reconciler = Arc::clone(reconciler);
    let semaphore = Arc::clone(semaphore);
    let done_tx = done_tx.clone();
    let id = id.clone();
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else { return };
        let res = reconciler.reconcile(&id, full, &cancel).await;
        let (retry, gone) = match &res {
            Ok(CycleOutcome::TornDown) | Ok(CycleOutcome::Skipped) => (false, true),
            Ok(CycleOutcome::TeardownPending) => (true, false),
            Ok(_) => (false, false),
            Err(e) => {
                warn!(bundle = %id, error = %e, "reconcile failed");
                (true, false)
            }
        };
        let _ = done_tx.send(Done { id, retry, gone }).await;
    });
}

fn backoff(cfg: &SchedulerConfig, attempts: u32) -> Duration {
    let exp = attempts.min(16).saturating_sub(1);
    cfg.backoff_base.saturating_mul(2u32.saturating_pow(exp)).min(cfg.backoff_max)
}

/// Deterministic per-identity offset spreading resyncs over a tenth of the
/// interval.
fn resync_jitter(id: &BundleId, resync: Duration) -> Duration {
    let window = (resync.as_millis() as u64 / 10).max(1);
    Duration::from_millis(fnv1a(id.to_string().as_bytes()) % window)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}
