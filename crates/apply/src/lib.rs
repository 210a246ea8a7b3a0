//! Rudder apply engine: ordered create-or-update of desired objects with
//! optimistic concurrency, overwrite policy, and per-object failure
//! isolation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use metrics::counter;
use rudder_core::{
    kinds, CanonicalId, EquivalenceSet, ErrorCode, ObjectDescriptor, ObjectRef,
    DESIRED_HASH_ANNOTATION,
};
use rudder_store::{StoreError, StoreKey, TargetStore};
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub mod injector;

use injector::{merge_maps, metadata_map, set_metadata_map, MergeConflict};

/// Per-cycle apply policy, lifted straight from the bundle spec.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub inject_labels: BTreeMap<String, String>,
    pub force_overwrite_labels: bool,
    pub force_overwrite_annotations: bool,
}

/// A non-transient per-object failure. The object stays out of the owned set
/// and is reported through the Applied condition.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub id: CanonicalId,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Successfully applied objects, keyed by canonical identity.
    pub owned: Vec<(CanonicalId, ObjectRef)>,
    pub failures: Vec<ApplyFailure>,
    /// Informational: keys kept at a pre-existing value because the force
    /// flag was off.
    pub conflicts: Vec<MergeConflict>,
    /// Create/update calls actually issued.
    pub mutations: usize,
}

/// Apply every desired object in namespace-then-kind-priority order.
/// Transient store errors abort the whole cycle; everything else is isolated
/// per object.
pub async fn apply_all(
    store: &dyn TargetStore,
    eq: &EquivalenceSet,
    desired: &[ObjectDescriptor],
    prev_owned: &FxHashMap<CanonicalId, ObjectRef>,
    opts: &ApplyOptions,
) -> Result<ApplyOutcome, StoreError> {
    let mut ordered: Vec<&ObjectDescriptor> = desired.iter().collect();
    ordered.sort_by_key(|d| {
        let id = canonical_of(eq, d);
        (kinds::apply_priority(&id.group_kind), id.namespace, id.group_kind, id.name)
    });

    let mut outcome = ApplyOutcome::default();
    let mut seen: FxHashMap<CanonicalId, ()> = FxHashMap::default();

    for desc in ordered {
        let id = canonical_of(eq, desc);
        if seen.insert(id.clone(), ()).is_some() {
            outcome.failures.push(ApplyFailure {
                id: id.clone(),
                code: ErrorCode::Config,
                message: format!("duplicate canonical identity {id} in desired set"),
            });
            continue;
        }
        counter!("bundle_apply_attempts", 1u64);
        match apply_one(store, desc, prev_owned.get(&id), opts, &mut outcome).await {
            Ok(obj_ref) => {
                counter!("bundle_apply_ok", 1u64);
                outcome.owned.push((id, obj_ref));
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                counter!("bundle_apply_err", 1u64);
                let (code, message) = classify(&e);
                warn!(id = %id, code = ?code, error = %e, "apply failed");
                outcome.failures.push(ApplyFailure { id, code, message });
            }
        }
    }
    Ok(outcome)
}

fn canonical_of(eq: &EquivalenceSet, d: &ObjectDescriptor) -> CanonicalId {
    eq.canonical_id(&d.group_kind(), d.namespace.as_deref(), &d.name)
}

fn classify(e: &StoreError) -> (ErrorCode, String) {
    match e {
        StoreError::Immutable { .. } => (ErrorCode::Immutable, e.to_string()),
        StoreError::Invalid(_) => (ErrorCode::Decode, e.to_string()),
        // AlreadyExists/NotFound mid-flight are races; defer to next cycle.
        StoreError::Conflict { .. } | StoreError::AlreadyExists(_) | StoreError::NotFound(_) => {
            (ErrorCode::Conflict, e.to_string())
        }
        StoreError::Unavailable(_) => (ErrorCode::TargetUnavailable, e.to_string()),
    }
}

/// Deterministic hash of the desired payload (labels injected, identity
/// annotation excluded), stamped on every owned object as the engine's mark.
fn desired_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let out = hasher.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for b in out {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

async fn apply_one(
    store: &dyn TargetStore,
    desc: &ObjectDescriptor,
    prev: Option<&ObjectRef>,
    opts: &ApplyOptions,
    outcome: &mut ApplyOutcome,
) -> Result<ObjectRef, StoreError> {
    let key = StoreKey::from_descriptor(desc);

    // Inject spec labels into the manifest's own labels first. Conflicts at
    // this layer are manifest-vs-spec and follow the same overwrite policy.
    let manifest_labels = metadata_map(&desc.payload, "labels");
    let (desired_labels, inject_conflicts) = merge_maps(
        &manifest_labels,
        &opts.inject_labels,
        &BTreeMap::new(),
        opts.force_overwrite_labels,
    );
    outcome.conflicts.extend(inject_conflicts);

    let mut payload = desc.payload.clone();
    set_metadata_map(&mut payload, "labels", &desired_labels);
    let hash = desired_hash(&payload);

    let mut desired_annotations = metadata_map(&payload, "annotations");
    desired_annotations.insert(DESIRED_HASH_ANNOTATION.to_string(), hash);
    set_metadata_map(&mut payload, "annotations", &desired_annotations);

    // Create fast path only for objects we did not own last cycle; owned
    // objects go straight to the read path so an unchanged cycle issues no
    // mutation calls at all.
    if prev.is_none() {
        match store.create(&key, &payload).await {
            Ok(applied) => {
                outcome.mutations += 1;
                return Ok(make_ref(desc, &applied, &desired_labels, &desired_annotations));
            }
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // Update path, with one in-cycle reload on conflict.
    let mut attempts = 0;
    loop {
        attempts += 1;
        let live = match store.get(&key).await? {
            Some(live) => live,
            // Deleted between create and get; take the create result next cycle.
            None => {
                let applied = store.create(&key, &payload).await?;
                outcome.mutations += 1;
                return Ok(make_ref(desc, &applied, &desired_labels, &desired_annotations));
            }
        };

        let live_meta = live.get("metadata").cloned().unwrap_or_default();
        let live_rv = live_meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let live_uid =
            live_meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string());

        let prev_labels = prev.map(|p| p.labels.clone()).unwrap_or_default();
        let prev_annotations = prev.map(|p| p.annotations.clone()).unwrap_or_default();

        let live_labels = metadata_map(&live, "labels");
        let live_annotations = metadata_map(&live, "annotations");
        let (final_labels, label_conflicts) = merge_maps(
            &live_labels,
            &desired_labels,
            &prev_labels,
            opts.force_overwrite_labels,
        );
        let (final_annotations, annotation_conflicts) = merge_maps(
            &live_annotations,
            &desired_annotations,
            &prev_annotations,
            opts.force_overwrite_annotations,
        );
        outcome.conflicts.extend(label_conflicts.iter().cloned());
        outcome.conflicts.extend(annotation_conflicts);

        let mut updated = payload.clone();
        set_metadata_map(&mut updated, "labels", &final_labels);
        set_metadata_map(&mut updated, "annotations", &final_annotations);

        // The stamped hash only proves the desired payload is unchanged; the
        // live content decides whether anything has to be written. Out-of-band
        // edits and freshly flipped force flags both surface here.
        if covered_by(&updated, &live) {
            debug!(key = %key, "apply skipped, live object matches desired state");
            counter!("bundle_apply_skipped", 1u64);
            let applied = rudder_store::Applied {
                uid: live_uid.unwrap_or_default(),
                resource_version: live_rv.unwrap_or_default(),
            };
            let label_snapshot = enforced(&desired_labels, &final_labels);
            let annotation_snapshot = enforced(&desired_annotations, &final_annotations);
            return Ok(make_ref(desc, &applied, &label_snapshot, &annotation_snapshot));
        }

        match store.update(&key, &updated, live_rv.as_deref()).await {
            Ok(applied) => {
                outcome.mutations += 1;
                // Snapshot only the keys we actually enforced; keys kept at a
                // foreign value stay foreign next cycle.
                let label_snapshot = enforced(&desired_labels, &final_labels);
                let annotation_snapshot = enforced(&desired_annotations, &final_annotations);
                return Ok(make_ref(desc, &applied, &label_snapshot, &annotation_snapshot));
            }
            Err(StoreError::Conflict { .. }) if attempts < 2 => {
                debug!(key = %key, "update conflict, reloading once");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// True when every field of `desired` is present in `live` with the same
/// value. Server-populated fields on the live object are ignored.
fn covered_by(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            d.iter().all(|(k, v)| l.get(k).map_or(false, |lv| covered_by(v, lv)))
        }
        _ => desired == live,
    }
}

fn enforced(
    desired: &BTreeMap<String, String>,
    written: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(k, v)| written.get(*k) == Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn make_ref(
    desc: &ObjectDescriptor,
    applied: &rudder_store::Applied,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ObjectRef {
    ObjectRef {
        group: desc.group.clone(),
        kind: desc.kind.clone(),
        namespace: desc.namespace.clone(),
        name: desc.name.clone(),
        api_version: desc.api_version(),
        uid: if applied.uid.is_empty() { None } else { Some(applied.uid.clone()) },
        resource_version: if applied.resource_version.is_empty() {
            None
        } else {
            Some(applied.resource_version.clone())
        },
        labels: labels.clone(),
        annotations: annotations.clone(),
        field_path: desc.field_path.clone(),
    }
}
