//! Rudder reconcile loop: drives live cluster state toward each bundle's
//! declared manifests, tracks the owned-object set across cycles, reclaims
//! orphans and aggregates health into status conditions.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use rudder_apply::injector::MergeConflict;
use rudder_apply::{apply_all, ApplyFailure, ApplyOptions};
use rudder_core::condition::{set_condition, touch_conditions};
use rudder_core::{
    BundleId, BundleSpec, BundleStatus, CanonicalId, ConditionStatus, ConditionType, ErrorCode,
    ObjectRef,
};
use rudder_source::{load, DecodeFailure};
use rudder_store::{SourceStore, StoreError, TargetStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod index;
mod reclaim;
pub mod scheduler;

pub use index::OwnershipIndex;
pub use scheduler::{Scheduler, SchedulerConfig, Trigger};

/// One bundle as read at cycle start: spec snapshot, last written status,
/// generation and whether deletion has been requested.
#[derive(Debug, Clone)]
pub struct BundleState {
    pub spec: BundleSpec,
    pub status: BundleStatus,
    pub generation: i64,
    pub deleted: bool,
}

/// Access to the bundle objects themselves. The engine reads the state once
/// at cycle start and writes status once at cycle end.
#[async_trait]
pub trait BundleApi: Send + Sync {
    async fn get(&self, id: &BundleId) -> Result<Option<BundleState>, StoreError>;

    async fn update_status(&self, id: &BundleId, status: &BundleStatus) -> Result<(), StoreError>;

    /// Add or remove the reclaimer finalizer. Idempotent.
    async fn set_finalizer(&self, id: &BundleId, present: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Bundle gone or owned by a different class.
    Skipped,
    /// Spec or source content is invalid; reported via conditions, not
    /// retried until it changes.
    Rejected,
    /// Source checksum and generation unchanged, no work done.
    Unchanged,
    /// Full cycle ran and status was written.
    Applied,
    /// All owned objects reclaimed (or kept) and the finalizer dropped.
    TornDown,
    /// Some deletes are still pending; retried with backoff.
    TeardownPending,
}

/// Deletion observed mid-cycle. Checked between phases; the running cycle
/// finishes its current phase and jumps to teardown.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
}

impl CancelFlag {
    pub fn new() -> (watch::Sender<bool>, CancelFlag) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelFlag { rx })
    }

    /// A flag that never fires, for direct invocations.
    pub fn none() -> CancelFlag {
        let (_tx, rx) = watch::channel(false);
        CancelFlag { rx }
    }

    pub(crate) fn from_receiver(rx: watch::Receiver<bool>) -> CancelFlag {
        CancelFlag { rx }
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The scheduler's view of a reconcile cycle.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Run one cycle. `full` bypasses checksum gating (resync, drift repair).
    async fn reconcile(
        &self,
        id: &BundleId,
        full: bool,
        cancel: &CancelFlag,
    ) -> Result<CycleOutcome, StoreError>;
}

fn cycle_timeout_from_env() -> Duration {
    let secs: u64 = std::env::var("RUDDER_CYCLE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(120);
    Duration::from_secs(secs)
}

/// Ties the loader, apply engine, reclaimer and health aggregator together
/// for one bundle identity per call.
pub struct Engine {
    target: Arc<dyn TargetStore>,
    source: Arc<dyn SourceStore>,
    bundles: Arc<dyn BundleApi>,
    index: Arc<OwnershipIndex>,
    class: Option<String>,
    cycle_timeout: Duration,
}

impl Engine {
    pub fn new(
        target: Arc<dyn TargetStore>,
        source: Arc<dyn SourceStore>,
        bundles: Arc<dyn BundleApi>,
    ) -> Self {
        Self {
            target,
            source,
            bundles,
            index: Arc::new(OwnershipIndex::default()),
            class: None,
            cycle_timeout: cycle_timeout_from_env(),
        }
    }

    /// Restrict this instance to bundles of one class.
    pub fn with_class(mut self, class: Option<String>) -> Self {
        self.class = class;
        self
    }

    pub fn ownership(&self) -> Arc<OwnershipIndex> {
        Arc::clone(&self.index)
    }

    pub async fn reconcile(
        &self,
        id: &BundleId,
        full: bool,
        cancel: &CancelFlag,
    ) -> Result<CycleOutcome, StoreError> {
        let started = std::time::Instant::now();
        let res = tokio::time::timeout(self.cycle_timeout, self.run_cycle(id, full, cancel))
            .await
            .map_err(|_| StoreError::Unavailable(format!("cycle deadline exceeded for {id}")))?;
        histogram!("bundle_reconcile_seconds", started.elapsed().as_secs_f64());
        match &res {
            Ok(_) => counter!("bundle_reconcile_ok", 1u64),
            Err(_) => counter!("bundle_reconcile_err", 1u64),
        }
        res
    }

    fn class_matches(&self, spec: &BundleSpec) -> bool {
        self.class.as_deref().unwrap_or("") == spec.class.as_deref().unwrap_or("")
    }

    async fn run_cycle(
        &self,
        id: &BundleId,
        full: bool,
        cancel: &CancelFlag,
    ) -> Result<CycleOutcome, StoreError> {
        let Some(state) = self.bundles.get(id).await? else {
            debug!(bundle = %id, "bundle gone, nothing to reconcile");
            return Ok(CycleOutcome::Skipped);
        };
        if !self.class_matches(&state.spec) {
            debug!(bundle = %id, class = ?state.spec.class, "bundle belongs to another class");
            return Ok(CycleOutcome::Skipped);
        }
        if state.deleted || cancel.is_set() {
            return self.teardown(id, state).await;
        }

        // Teardown must run before the bundle object can go away.
        self.bundles.set_finalizer(id, true).await?;
        let now = Utc::now();

        let eq = match rudder_core::validate_spec(&state.spec) {
            Ok(eq) => eq,
            Err(msg) => {
                warn!(bundle = %id, error = %msg, "spec rejected");
                let mut status = state.status.clone();
                status.observed_generation = state.generation;
                set_condition(
                    &mut status.conditions,
                    ConditionType::Applied,
                    ConditionStatus::False,
                    "InvalidSpec",
                    msg,
                    vec![ErrorCode::Config],
                    now,
                );
                self.bundles.update_status(id, &status).await?;
                return Ok(CycleOutcome::Rejected);
            }
        };

        let loaded = match load(self.source.as_ref(), &id.namespace, &state.spec.secret_refs).await
        {
            Ok(loaded) => loaded,
            Err(StoreError::NotFound(m)) => {
                let mut status = state.status.clone();
                set_condition(
                    &mut status.conditions,
                    ConditionType::Applied,
                    ConditionStatus::False,
                    "SourceNotFound",
                    format!("source bundle not found: {m}"),
                    vec![ErrorCode::SourceNotFound],
                    now,
                );
                self.bundles.update_status(id, &status).await?;
                return Err(StoreError::NotFound(m));
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                // Unreadable payload; permanent until the source changes.
                let mut status = state.status.clone();
                status.observed_generation = state.generation;
                set_condition(
                    &mut status.conditions,
                    ConditionType::Applied,
                    ConditionStatus::False,
                    "DecodeFailed",
                    e.to_string(),
                    vec![ErrorCode::Decode],
                    now,
                );
                self.bundles.update_status(id, &status).await?;
                return Ok(CycleOutcome::Rejected);
            }
        };

        if cancel.is_set() {
            return self.teardown(id, state).await;
        }

        // Checksum gating: unchanged source, unchanged spec, no resync due.
        if !full
            && state.status.observed_generation == state.generation
            && state.status.secrets_data_checksum.as_deref() == Some(loaded.checksum.as_str())
        {
            debug!(bundle = %id, "source unchanged, cycle skipped");
            let mut status = state.status.clone();
            touch_conditions(&mut status.conditions, now);
            self.bundles.update_status(id, &status).await?;
            return Ok(CycleOutcome::Unchanged);
        }

        let mut prev: FxHashMap<CanonicalId, ObjectRef> = FxHashMap::default();
        for r in &state.status.resources {
            let cid = eq.canonical_id(&r.group_kind(), r.namespace.as_deref(), &r.name);
            prev.insert(cid, r.clone());
        }

        let opts = ApplyOptions {
            inject_labels: state.spec.inject_labels.clone(),
            force_overwrite_labels: state.spec.force_overwrite_labels,
            force_overwrite_annotations: state.spec.force_overwrite_annotations,
        };
        let outcome = apply_all(self.target.as_ref(), &eq, &loaded.objects, &prev, &opts).await?;
        if !outcome.conflicts.is_empty() {
            debug!(
                bundle = %id,
                keys = %conflict_keys(&outcome.conflicts).join(", "),
                "foreign metadata values kept"
            );
        }

        if cancel.is_set() {
            // Deletion arrived mid-cycle: tear down everything we own, the
            // just-applied objects included.
            let mut owned: Vec<ObjectRef> =
                outcome.owned.iter().map(|(_, r)| r.clone()).collect();
            let applied_ids: FxHashSet<&CanonicalId> =
                outcome.owned.iter().map(|(cid, _)| cid).collect();
            for (cid, r) in &prev {
                if !applied_ids.contains(cid) {
                    owned.push(r.clone());
                }
            }
            let mut state = state;
            state.status.resources = owned;
            return self.teardown(id, state).await;
        }

        // Previously owned, no longer desired. Apply failures stay in the
        // desired set, so they are never reclaim candidates. With decode
        // failures the desired set is incomplete and reclaim is deferred.
        let mut orphan_refs = Vec::new();
        if loaded.failures.is_empty() {
            let desired_ids: FxHashSet<CanonicalId> = loaded
                .objects
                .iter()
                .map(|d| eq.canonical_id(&d.group_kind(), d.namespace.as_deref(), &d.name))
                .collect();
            for (cid, r) in &prev {
                if !desired_ids.contains(cid) {
                    orphan_refs.push(r.clone());
                }
            }
            orphan_refs.sort_by(|a, b| {
                (&a.group, &a.kind, &a.namespace, &a.name)
                    .cmp(&(&b.group, &b.kind, &b.namespace, &b.name))
            });
        } else if !prev.is_empty() {
            warn!(
                bundle = %id,
                failures = loaded.failures.len(),
                "decode failures present, orphan reclaim deferred"
            );
        }
        let reclaimed = reclaim::reclaim(
            self.target.as_ref(),
            &orphan_refs,
            state.spec.delete_persistent_volume_claims,
        )
        .await;

        let applied_refs: Vec<ObjectRef> = outcome.owned.iter().map(|(_, r)| r.clone()).collect();
        let health = rudder_health::aggregate(self.target.as_ref(), &applied_refs).await?;

        let mut conditions = state.status.conditions.clone();
        let (applied_status, reason, message, codes) = applied_condition(
            applied_refs.len(),
            &loaded.failures,
            &outcome.failures,
            &outcome.conflicts,
        );
        set_condition(&mut conditions, ConditionType::Applied, applied_status, reason, message, codes, now);
        set_condition(
            &mut conditions,
            ConditionType::Healthy,
            health.healthy.status,
            health.healthy.reason,
            health.healthy.message,
            vec![],
            now,
        );
        set_condition(
            &mut conditions,
            ConditionType::Progressing,
            health.progressing.status,
            health.progressing.reason,
            health.progressing.message,
            vec![],
            now,
        );

        let mut resources = applied_refs;
        resources.extend(reclaimed.kept);
        resources.sort_by(|a, b| {
            (&a.group, &a.kind, &a.namespace, &a.name)
                .cmp(&(&b.group, &b.kind, &b.namespace, &b.name))
        });
        let status = BundleStatus {
            observed_generation: state.generation,
            resources,
            conditions,
            secrets_data_checksum: Some(loaded.checksum),
        };
        self.bundles.update_status(id, &status).await?;
        self.index.set_owned(id, &status.resources);

        info!(
            bundle = %id,
            objects = loaded.objects.len(),
            owned = status.resources.len(),
            failed = loaded.failures.len() + outcome.failures.len(),
            orphans = reclaimed.deleted,
            mutations = outcome.mutations,
            "reconcile complete"
        );
        Ok(CycleOutcome::Applied)
    }

    async fn teardown(&self, id: &BundleId, state: BundleState) -> Result<CycleOutcome, StoreError> {
        if state.spec.keep_objects {
            info!(
                bundle = %id,
                kept = state.status.resources.len(),
                "bundle deleted, owned objects kept in place"
            );
            self.bundles.update_status(id, &BundleStatus::default()).await?;
            self.index.set_owned(id, &[]);
            self.bundles.set_finalizer(id, false).await?;
            return Ok(CycleOutcome::TornDown);
        }

        let out = reclaim::reclaim(
            self.target.as_ref(),
            &state.status.resources,
            state.spec.delete_persistent_volume_claims,
        )
        .await;
        if out.kept.is_empty() {
            info!(bundle = %id, deleted = out.deleted, "teardown complete");
            counter!("bundle_teardown_ok", 1u64);
            self.bundles.update_status(id, &BundleStatus::default()).await?;
            self.index.set_owned(id, &[]);
            self.bundles.set_finalizer(id, false).await?;
            Ok(CycleOutcome::TornDown)
        } else {
            info!(
                bundle = %id,
                deleted = out.deleted,
                pending = out.kept.len(),
                "teardown pending, deletes blocked"
            );
            let mut status = state.status;
            status.resources = out.kept;
            self.bundles.update_status(id, &status).await?;
            self.index.set_owned(id, &status.resources);
            Ok(CycleOutcome::TeardownPending)
        }
    }
}

#[async_trait]
impl Reconciler for Engine {
    async fn reconcile(
        &self,
        id: &BundleId,
        full: bool,
        cancel: &CancelFlag,
    ) -> Result<CycleOutcome, StoreError> {
        Engine::reconcile(self, id, full, cancel).await
    }
}

fn conflict_keys(conflicts: &[MergeConflict]) -> Vec<String> {
    let mut keys: Vec<String> = conflicts.iter().map(|c| c.key.clone()).collect();
    keys.sort();
    keys.dedup();
    keys
}

fn applied_condition(
    applied: usize,
    decode_failures: &[DecodeFailure],
    apply_failures: &[ApplyFailure],
    conflicts: &[MergeConflict],
) -> (ConditionStatus, &'static str, String, Vec<ErrorCode>) {
    if decode_failures.is_empty() && apply_failures.is_empty() {
        let mut message = format!("{applied} objects applied");
        if !conflicts.is_empty() {
            message.push_str(&format!(
                "; foreign values kept for {}",
                list_some(&conflict_keys(conflicts))
            ));
        }
        return (ConditionStatus::True, "ApplySucceeded", message, vec![]);
    }
    let mut codes: Vec<ErrorCode> = decode_failures
        .iter()
        .map(|_| ErrorCode::Decode)
        .chain(apply_failures.iter().map(|f| f.code))
        .collect();
    codes.sort();
    codes.dedup();
    let parts: Vec<String> = decode_failures
        .iter()
        .map(|f| f.to_string())
        .chain(apply_failures.iter().map(|f| format!("{}: {}", f.id, f.message)))
        .collect();
    let reason = if apply_failures.is_empty() { "DecodeFailed" } else { "ApplyFailed" };
    (ConditionStatus::False, reason, list_some(&parts), codes)
}

fn list_some(items: &[String]) -> String {
    const SHOWN: usize = 5;
    if items.len() <= SHOWN {
        items.join("; ")
    } else {
        format!("{}; and {} more", items[..SHOWN].join("; "), items.len() - SHOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use rudder_core::condition::get_condition;
    use rudder_core::{GroupKind, SourceRef};
    use rudder_store::{MemSource, MemStore, StoreKey, StoreOp};

    struct Entry {
        spec: BundleSpec,
        status: BundleStatus,
        generation: i64,
        deleted: bool,
        finalizer: bool,
    }

    #[derive(Default)]
    struct MemBundles {
        inner: Mutex<BTreeMap<BundleId, Entry>>,
    }

    impl MemBundles {
        fn new() -> Self {
            Self::default()
        }

        fn put(&self, id: &BundleId, spec: BundleSpec) {
            self.inner.lock().unwrap().insert(
                id.clone(),
                Entry { spec, status: BundleStatus::default(), generation: 1, deleted: false, finalizer: false },
            );
        }

        fn set_spec(&self, id: &BundleId, spec: BundleSpec) {
            let mut g = self.inner.lock().unwrap();
            let e = g.get_mut(id).unwrap();
            e.spec = spec;
            e.generation += 1;
        }

        fn mark_deleted(&self, id: &BundleId) {
            self.inner.lock().unwrap().get_mut(id).unwrap().deleted = true;
        }

        fn status(&self, id: &BundleId) -> BundleStatus {
            self.inner.lock().unwrap().get(id).unwrap().status.clone()
        }

        fn has_finalizer(&self, id: &BundleId) -> bool {
            self.inner.lock().unwrap().get(id).unwrap().finalizer
        }
    }

    #[async_trait]
    impl BundleApi for MemBundles {
        async fn get(&self, id: &BundleId) -> Result<Option<BundleState>, StoreError> {
            Ok(self.inner.lock().unwrap().get(id).map(|e| BundleState {
                spec: e.spec.clone(),
                status: e.status.clone(),
                generation: e.generation,
                deleted: e.deleted,
            }))
        }

        async fn update_status(
            &self,
            id: &BundleId,
            status: &BundleStatus,
        ) -> Result<(), StoreError> {
            let mut g = self.inner.lock().unwrap();
            let e = g.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            e.status = status.clone();
            Ok(())
        }

        async fn set_finalizer(&self, id: &BundleId, present: bool) -> Result<(), StoreError> {
            let mut g = self.inner.lock().unwrap();
            let e = g.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            e.finalizer = present;
            Ok(())
        }
    }

    struct Rig {
        store: Arc<MemStore>,
        source: Arc<MemSource>,
        bundles: Arc<MemBundles>,
        engine: Engine,
        id: BundleId,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemStore::new());
        let source = Arc::new(MemSource::new());
        let bundles = Arc::new(MemBundles::new());
        let engine = Engine::new(store.clone(), source.clone(), bundles.clone());
        Rig { store, source, bundles, engine, id: BundleId::new("ns", "bundle") }
    }

    fn spec_with_refs(names: &[&str]) -> BundleSpec {
        BundleSpec {
            secret_refs: names.iter().map(|n| SourceRef { name: n.to_string() }).collect(),
            ..Default::default()
        }
    }

    fn cm_yaml(name: &str) -> String {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: ns\n")
    }

    fn cm_key(name: &str) -> StoreKey {
        StoreKey::new("", "v1", "ConfigMap", Some("ns"), name)
    }

    async fn run(r: &Rig, full: bool) -> CycleOutcome {
        r.engine.reconcile(&r.id, full, &CancelFlag::none()).await.unwrap()
    }

    #[tokio::test]
    async fn first_cycle_applies_objects_and_writes_status() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &format!("{}---\n{}", cm_yaml("a"), cm_yaml("b")));

        assert_eq!(run(&r, false).await, CycleOutcome::Applied);
        assert!(r.store.contains(&cm_key("a")));
        assert!(r.store.contains(&cm_key("b")));
        assert!(r.bundles.has_finalizer(&r.id));

        let status = r.bundles.status(&r.id);
        assert_eq!(status.observed_generation, 1);
        assert_eq!(status.resources.len(), 2);
        assert!(status.secrets_data_checksum.is_some());
        let applied = get_condition(&status.conditions, ConditionType::Applied).unwrap();
        assert_eq!(applied.status, ConditionStatus::True);
        assert_eq!(applied.reason, "ApplySucceeded");
    }

    #[tokio::test]
    async fn unchanged_source_performs_no_target_calls() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);
        let before = r.bundles.status(&r.id);

        r.store.clear_ops();
        assert_eq!(run(&r, false).await, CycleOutcome::Unchanged);
        assert!(r.store.ops().is_empty());

        let after = r.bundles.status(&r.id);
        assert_eq!(after.secrets_data_checksum, before.secrets_data_checksum);
        assert_eq!(after.resources, before.resources);
        for (a, b) in after.conditions.iter().zip(before.conditions.iter()) {
            assert_eq!(a.status, b.status);
            assert_eq!(a.reason, b.reason);
            assert_eq!(a.last_transition_time, b.last_transition_time);
        }
    }

    #[tokio::test]
    async fn forced_resync_of_unchanged_state_mutates_nothing() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);
        let before = r.bundles.status(&r.id);

        r.store.clear_ops();
        assert_eq!(run(&r, true).await, CycleOutcome::Applied);
        assert_eq!(r.store.mutation_count(), 0);

        let after = r.bundles.status(&r.id);
        for (a, b) in after.conditions.iter().zip(before.conditions.iter()) {
            assert_eq!(a.status, b.status);
            assert_eq!(a.last_transition_time, b.last_transition_time);
        }
    }

    #[tokio::test]
    async fn declared_kind_migration_keeps_identity() {
        let r = rig();
        let mut spec = spec_with_refs(&["manifests"]);
        spec.equivalences = vec![vec![
            GroupKind::new("apps", "Deployment"),
            GroupKind::new("apps", "StatefulSet"),
        ]];
        r.bundles.put(&r.id, spec);
        r.source.put_single(
            "ns",
            "manifests",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: x\n  namespace: ns\n",
        );
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        r.source.put_single(
            "ns",
            "manifests",
            "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: x\n  namespace: ns\n",
        );
        r.store.clear_ops();
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        // Same canonical identity: no orphan delete for the old kind.
        assert!(!r.store.ops().iter().any(|op| matches!(op, StoreOp::Delete(_))));
        let status = r.bundles.status(&r.id);
        assert_eq!(status.resources.len(), 1);
        assert_eq!(status.resources[0].kind, "StatefulSet");
    }

    #[tokio::test]
    async fn object_removed_from_source_is_reclaimed() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &format!("{}---\n{}", cm_yaml("a"), cm_yaml("b")));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);
        assert!(r.store.contains(&cm_key("a")));
        assert!(!r.store.contains(&cm_key("b")));
        assert_eq!(r.bundles.status(&r.id).resources.len(), 1);
    }

    #[tokio::test]
    async fn teardown_deletes_owned_objects_and_drops_finalizer() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        r.bundles.mark_deleted(&r.id);
        assert_eq!(run(&r, false).await, CycleOutcome::TornDown);
        assert!(!r.store.contains(&cm_key("a")));
        assert!(!r.bundles.has_finalizer(&r.id));
        assert!(r.bundles.status(&r.id).resources.is_empty());
    }

    #[tokio::test]
    async fn keep_objects_clears_status_but_preserves_objects() {
        let r = rig();
        let mut spec = spec_with_refs(&["manifests"]);
        spec.keep_objects = true;
        r.bundles.put(&r.id, spec);
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        r.bundles.mark_deleted(&r.id);
        assert_eq!(run(&r, false).await, CycleOutcome::TornDown);
        assert!(r.store.contains(&cm_key("a")));
        assert!(!r.bundles.has_finalizer(&r.id));
        assert!(r.bundles.status(&r.id).resources.is_empty());
    }

    #[tokio::test]
    async fn blocked_teardown_is_retried() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        r.store.hold_delete(&cm_key("a"), true);
        r.bundles.mark_deleted(&r.id);
        assert_eq!(run(&r, false).await, CycleOutcome::TeardownPending);
        assert!(r.bundles.has_finalizer(&r.id));
        assert_eq!(r.bundles.status(&r.id).resources.len(), 1);

        r.store.hold_delete(&cm_key("a"), false);
        assert_eq!(run(&r, false).await, CycleOutcome::TornDown);
        assert!(!r.bundles.has_finalizer(&r.id));
    }

    #[tokio::test]
    async fn malformed_document_is_isolated_and_reported() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single(
            "ns",
            "manifests",
            &format!("{}---\nkind: Broken\nmetadata:\n  name: b\n", cm_yaml("a")),
        );
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        assert!(r.store.contains(&cm_key("a")));
        let status = r.bundles.status(&r.id);
        assert_eq!(status.resources.len(), 1);
        let applied = get_condition(&status.conditions, ConditionType::Applied).unwrap();
        assert_eq!(applied.status, ConditionStatus::False);
        assert_eq!(applied.reason, "DecodeFailed");
        assert!(applied.codes.contains(&ErrorCode::Decode));
        assert!(applied.message.contains("doc 1"), "{}", applied.message);
    }

    #[tokio::test]
    async fn kept_foreign_values_are_reported_in_the_applied_message() {
        let r = rig();
        let mut spec = spec_with_refs(&["manifests"]);
        spec.inject_labels.insert("team".into(), "rudder".into());
        r.bundles.put(&r.id, spec);
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        r.store.seed(
            &cm_key("a"),
            serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "ns", "labels": {"team": "other"}}}),
        );

        assert_eq!(run(&r, false).await, CycleOutcome::Applied);
        let status = r.bundles.status(&r.id);
        let applied = get_condition(&status.conditions, ConditionType::Applied).unwrap();
        assert_eq!(applied.status, ConditionStatus::True);
        assert!(applied.message.contains("foreign values kept"), "{}", applied.message);
        assert!(applied.message.contains("team"), "{}", applied.message);
        let live = r.store.payload(&cm_key("a")).unwrap();
        assert_eq!(live["metadata"]["labels"]["team"], "other");
    }

    #[tokio::test]
    async fn duplicate_source_refs_are_rejected_as_config_error() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests", "manifests"]));
        assert_eq!(run(&r, false).await, CycleOutcome::Rejected);

        let status = r.bundles.status(&r.id);
        let applied = get_condition(&status.conditions, ConditionType::Applied).unwrap();
        assert_eq!(applied.status, ConditionStatus::False);
        assert_eq!(applied.reason, "InvalidSpec");
        assert_eq!(applied.codes, vec![ErrorCode::Config]);
        assert!(applied.message.contains("duplicate"), "{}", applied.message);
    }

    #[tokio::test]
    async fn missing_source_is_reported_and_retried() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["ghost"]));
        let err = r.engine.reconcile(&r.id, false, &CancelFlag::none()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let status = r.bundles.status(&r.id);
        let applied = get_condition(&status.conditions, ConditionType::Applied).unwrap();
        assert_eq!(applied.reason, "SourceNotFound");
        assert_eq!(applied.codes, vec![ErrorCode::SourceNotFound]);
    }

    #[tokio::test]
    async fn other_class_is_skipped() {
        let store = Arc::new(MemStore::new());
        let source = Arc::new(MemSource::new());
        let bundles = Arc::new(MemBundles::new());
        let engine = Engine::new(store.clone(), source.clone(), bundles.clone())
            .with_class(Some("edge".into()));
        let id = BundleId::new("ns", "bundle");
        bundles.put(&id, spec_with_refs(&["manifests"]));
        source.put_single("ns", "manifests", &cm_yaml("a"));

        let out = engine.reconcile(&id, false, &CancelFlag::none()).await.unwrap();
        assert_eq!(out, CycleOutcome::Skipped);
        assert!(store.ops().is_empty());
        assert!(!bundles.has_finalizer(&id));
    }

    #[tokio::test]
    async fn cancellation_routes_into_teardown() {
        let r = rig();
        r.bundles.put(&r.id, spec_with_refs(&["manifests"]));
        r.source.put_single("ns", "manifests", &cm_yaml("a"));
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        let (tx, cancel) = CancelFlag::new();
        tx.send(true).unwrap();
        let out = r.engine.reconcile(&r.id, false, &cancel).await.unwrap();
        assert_eq!(out, CycleOutcome::TornDown);
        assert!(!r.store.contains(&cm_key("a")));
    }

    #[tokio::test]
    async fn stateful_teardown_cascades_claims_when_asked() {
        let r = rig();
        let mut spec = spec_with_refs(&["manifests"]);
        spec.delete_persistent_volume_claims = true;
        r.bundles.put(&r.id, spec);
        r.source.put_single(
            "ns",
            "manifests",
            "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\n  namespace: ns\nspec:\n  selector:\n    matchLabels:\n      app: db\n",
        );
        assert_eq!(run(&r, false).await, CycleOutcome::Applied);

        let pvc = StoreKey::new("", "v1", "PersistentVolumeClaim", Some("ns"), "data-db-0");
        r.store.seed(
            &pvc,
            serde_json::json!({"metadata": {"name": "data-db-0", "namespace": "ns", "labels": {"app": "db"}}}),
        );

        r.bundles.mark_deleted(&r.id);
        assert_eq!(run(&r, false).await, CycleOutcome::TornDown);
        assert!(!r.store.contains(&StoreKey::new("apps", "v1", "StatefulSet", Some("ns"), "db")));
        assert!(!r.store.contains(&pvc));
    }
}
