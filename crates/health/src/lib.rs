//! Health aggregation over the currently-owned live objects.
//!
//! Healthy is the AND over every object with readiness semantics;
//! Progressing is the OR over objects mid-rollout. A missing aggregation
//! input yields Unknown, never False.

#![forbid(unsafe_code)]

use rudder_core::{kinds, ConditionStatus, ObjectRef};
use rudder_store::{StoreError, StoreKey, TargetStore};
use tracing::debug;

/// Result of one condition's aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct HealthOutcome {
    pub healthy: Verdict,
    pub progressing: Verdict,
}

fn list_names(items: &[String]) -> String {
    const SHOWN: usize = 5;
    if items.len() <= SHOWN {
        items.join(", ")
    } else {
        format!("{}, and {} more", items[..SHOWN].join(", "), items.len() - SHOWN)
    }
}

fn display(r: &ObjectRef) -> String {
    match &r.namespace {
        Some(ns) => format!("{}/{} {}/{}", r.group, r.kind, ns, r.name),
        None => format!("{}/{} {}", r.group, r.kind, r.name),
    }
}

/// Inspect every owned object with health semantics. Transient store errors
/// abort the cycle; a not-found object only degrades the verdict to Unknown.
pub async fn aggregate(
    store: &dyn TargetStore,
    owned: &[ObjectRef],
) -> Result<HealthOutcome, StoreError> {
    let mut unhealthy = Vec::new();
    let mut progressing = Vec::new();
    let mut missing = Vec::new();

    for r in owned {
        let Some(probe) = kinds::probe(&r.group_kind()) else {
            continue; // no health semantics, vacuously healthy
        };
        let key = StoreKey::from_ref(r);
        match store.get(&key).await? {
            Some(live) => {
                if !(probe.is_healthy)(&live) {
                    unhealthy.push(display(r));
                }
                if (probe.is_progressing)(&live) {
                    progressing.push(display(r));
                }
            }
            None => missing.push(display(r)),
        }
    }
    debug!(
        unhealthy = unhealthy.len(),
        progressing = progressing.len(),
        missing = missing.len(),
        "health aggregated"
    );

    // AND semantics: a definitive False wins, then a missing input.
    let healthy = if !unhealthy.is_empty() {
        Verdict {
            status: ConditionStatus::False,
            reason: "UnhealthyObjects".into(),
            message: format!("not ready: {}", list_names(&unhealthy)),
        }
    } else if !missing.is_empty() {
        Verdict {
            status: ConditionStatus::Unknown,
            reason: "ObjectMissing".into(),
            message: format!("owned objects not found: {}", list_names(&missing)),
        }
    } else {
        Verdict {
            status: ConditionStatus::True,
            reason: "ObjectsHealthy".into(),
            message: "all owned objects are ready".into(),
        }
    };

    // OR semantics: a definitive True wins, then a missing input.
    let progressing = if !progressing.is_empty() {
        Verdict {
            status: ConditionStatus::True,
            reason: "ObjectsProgressing".into(),
            message: format!("rolling out: {}", list_names(&progressing)),
        }
    } else if !missing.is_empty() {
        Verdict {
            status: ConditionStatus::Unknown,
            reason: "ObjectMissing".into(),
            message: format!("owned objects not found: {}", list_names(&missing)),
        }
    } else {
        Verdict {
            status: ConditionStatus::False,
            reason: "ObjectsSettled".into(),
            message: "no rollout in progress".into(),
        }
    };

    Ok(HealthOutcome { healthy, progressing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_store::MemStore;
    use serde_json::json;

    fn obj_ref(group: &str, kind: &str, name: &str) -> ObjectRef {
        ObjectRef {
            group: group.into(),
            kind: kind.into(),
            namespace: Some("ns".into()),
            name: name.into(),
            api_version: if group.is_empty() { "v1".into() } else { format!("{group}/v1") },
            ..Default::default()
        }
    }

    fn key(r: &ObjectRef) -> StoreKey {
        StoreKey::from_ref(r)
    }

    #[tokio::test]
    async fn all_ready_is_healthy_and_settled() {
        let store = MemStore::new();
        let dep = obj_ref("apps", "Deployment", "web");
        store.seed(
            &key(&dep),
            json!({
                "metadata": {"generation": 1},
                "spec": {"replicas": 1},
                "status": {"observedGeneration": 1, "readyReplicas": 1, "updatedReplicas": 1}
            }),
        );
        let out = aggregate(&store, &[dep]).await.unwrap();
        assert_eq!(out.healthy.status, ConditionStatus::True);
        assert_eq!(out.progressing.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn mid_rollout_is_unhealthy_and_progressing() {
        let store = MemStore::new();
        let dep = obj_ref("apps", "Deployment", "web");
        store.seed(
            &key(&dep),
            json!({
                "metadata": {"generation": 2},
                "spec": {"replicas": 3},
                "status": {"observedGeneration": 2, "readyReplicas": 1, "updatedReplicas": 3}
            }),
        );
        let out = aggregate(&store, &[dep]).await.unwrap();
        assert_eq!(out.healthy.status, ConditionStatus::False);
        assert!(out.healthy.message.contains("web"));
        assert_eq!(out.progressing.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn missing_object_degrades_to_unknown_not_false() {
        let store = MemStore::new();
        let dep = obj_ref("apps", "Deployment", "gone");
        let out = aggregate(&store, &[dep]).await.unwrap();
        assert_eq!(out.healthy.status, ConditionStatus::Unknown);
        assert_eq!(out.healthy.reason, "ObjectMissing");
        assert_eq!(out.progressing.status, ConditionStatus::Unknown);
    }

    #[tokio::test]
    async fn kinds_without_semantics_are_vacuously_healthy() {
        let store = MemStore::new();
        let cm = obj_ref("", "ConfigMap", "cfg");
        // Not even present in the store: no health input is consulted.
        let out = aggregate(&store, &[cm]).await.unwrap();
        assert_eq!(out.healthy.status, ConditionStatus::True);
        assert_eq!(out.progressing.status, ConditionStatus::False);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn definitive_progress_beats_missing_input() {
        let store = MemStore::new();
        let rolling = obj_ref("apps", "Deployment", "rolling");
        store.seed(
            &key(&rolling),
            json!({
                "metadata": {"generation": 2},
                "spec": {"replicas": 1},
                "status": {"observedGeneration": 1}
            }),
        );
        let gone = obj_ref("apps", "StatefulSet", "gone");
        let out = aggregate(&store, &[rolling, gone]).await.unwrap();
        assert_eq!(out.progressing.status, ConditionStatus::True);
        assert_eq!(out.healthy.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn transient_store_error_aborts() {
        let store = MemStore::new();
        store.set_unavailable(true);
        let dep = obj_ref("apps", "Deployment", "web");
        let err = aggregate(&store, &[dep]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
