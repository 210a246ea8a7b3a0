//! Per-kind capability table: apply ordering priority plus readiness and
//! progress probes over raw object JSON. Unknown kinds fall back to a
//! default priority and vacuous health.

use serde_json::Value;

use crate::GroupKind;

/// Pure readiness/progress probes for one kind.
pub struct KindProbe {
    pub is_healthy: fn(&Value) -> bool,
    pub is_progressing: fn(&Value) -> bool,
}

fn i64_at<'a>(v: &'a Value, path: &[&str]) -> Option<i64> {
    let mut cur = v;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_i64()
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_str()
}

fn generation_lags(v: &Value) -> bool {
    let gen = i64_at(v, &["metadata", "generation"]).unwrap_or(0);
    let observed = i64_at(v, &["status", "observedGeneration"]).unwrap_or(0);
    observed < gen
}

fn desired_replicas(v: &Value) -> i64 {
    i64_at(v, &["spec", "replicas"]).unwrap_or(1)
}

fn deployment_healthy(v: &Value) -> bool {
    !generation_lags(v)
        && i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) >= desired_replicas(v)
        && i64_at(v, &["status", "updatedReplicas"]).unwrap_or(0) >= desired_replicas(v)
}

fn deployment_progressing(v: &Value) -> bool {
    generation_lags(v)
        || i64_at(v, &["status", "updatedReplicas"]).unwrap_or(0) < desired_replicas(v)
        || i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) < desired_replicas(v)
}

fn statefulset_healthy(v: &Value) -> bool {
    let current = str_at(v, &["status", "currentRevision"]);
    let update = str_at(v, &["status", "updateRevision"]);
    !generation_lags(v)
        && i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) >= desired_replicas(v)
        && (update.is_none() || current == update)
}

fn statefulset_progressing(v: &Value) -> bool {
    let current = str_at(v, &["status", "currentRevision"]);
    let update = str_at(v, &["status", "updateRevision"]);
    generation_lags(v)
        || i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) < desired_replicas(v)
        || (update.is_some() && current != update)
}

fn daemonset_healthy(v: &Value) -> bool {
    let desired = i64_at(v, &["status", "desiredNumberScheduled"]).unwrap_or(0);
    !generation_lags(v) && i64_at(v, &["status", "numberReady"]).unwrap_or(0) >= desired
}

fn daemonset_progressing(v: &Value) -> bool {
    let desired = i64_at(v, &["status", "desiredNumberScheduled"]).unwrap_or(0);
    generation_lags(v)
        || i64_at(v, &["status", "updatedNumberScheduled"]).unwrap_or(desired) < desired
        || i64_at(v, &["status", "numberReady"]).unwrap_or(0) < desired
}

fn replicaset_healthy(v: &Value) -> bool {
    !generation_lags(v)
        && i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) >= desired_replicas(v)
}

fn replicaset_progressing(v: &Value) -> bool {
    generation_lags(v)
        || i64_at(v, &["status", "readyReplicas"]).unwrap_or(0) < desired_replicas(v)
}

fn pod_ready_condition(v: &Value) -> bool {
    v.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

fn pod_healthy(v: &Value) -> bool {
    match str_at(v, &["status", "phase"]) {
        Some("Succeeded") => true,
        Some("Running") => pod_ready_condition(v),
        _ => false,
    }
}

fn pod_progressing(v: &Value) -> bool {
    matches!(str_at(v, &["status", "phase"]), Some("Pending"))
        || (str_at(v, &["status", "phase"]) == Some("Running") && !pod_ready_condition(v))
}

fn job_condition(v: &Value, kind: &str) -> bool {
    v.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(kind)
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

fn job_healthy(v: &Value) -> bool {
    job_condition(v, "Complete") && !job_condition(v, "Failed")
}

fn job_progressing(v: &Value) -> bool {
    !job_condition(v, "Complete")
        && !job_condition(v, "Failed")
        && i64_at(v, &["status", "active"]).unwrap_or(0) > 0
}

fn pvc_healthy(v: &Value) -> bool {
    str_at(v, &["status", "phase"]) == Some("Bound")
}

fn pvc_progressing(v: &Value) -> bool {
    str_at(v, &["status", "phase"]) == Some("Pending")
}

/// Readiness/progress probes for a canonical (group, kind). `None` means the
/// kind has no health semantics (vacuously healthy, never progressing).
pub fn probe(gk: &GroupKind) -> Option<&'static KindProbe> {
    static DEPLOYMENT: KindProbe =
        KindProbe { is_healthy: deployment_healthy, is_progressing: deployment_progressing };
    static STATEFULSET: KindProbe =
        KindProbe { is_healthy: statefulset_healthy, is_progressing: statefulset_progressing };
    static DAEMONSET: KindProbe =
        KindProbe { is_healthy: daemonset_healthy, is_progressing: daemonset_progressing };
    static REPLICASET: KindProbe =
        KindProbe { is_healthy: replicaset_healthy, is_progressing: replicaset_progressing };
    static POD: KindProbe = KindProbe { is_healthy: pod_healthy, is_progressing: pod_progressing };
    static JOB: KindProbe = KindProbe { is_healthy: job_healthy, is_progressing: job_progressing };
    static PVC: KindProbe = KindProbe { is_healthy: pvc_healthy, is_progressing: pvc_progressing };

    match (gk.group.as_str(), gk.kind.as_str()) {
        ("apps", "Deployment") => Some(&DEPLOYMENT),
        ("apps", "StatefulSet") => Some(&STATEFULSET),
        ("apps", "DaemonSet") => Some(&DAEMONSET),
        ("apps", "ReplicaSet") => Some(&REPLICASET),
        ("", "Pod") => Some(&POD),
        ("batch", "Job") => Some(&JOB),
        ("", "PersistentVolumeClaim") => Some(&PVC),
        _ => None,
    }
}

/// Apply ordering class, lowest first. Prerequisites (namespaces, CRDs,
/// RBAC, config) sort before the workloads that consume them; admission
/// wiring goes last.
pub fn apply_priority(gk: &GroupKind) -> u8 {
    match (gk.group.as_str(), gk.kind.as_str()) {
        ("", "Namespace") => 0,
        ("apiextensions.k8s.io", "CustomResourceDefinition") => 1,
        ("rbac.authorization.k8s.io", _) | ("", "ServiceAccount") => 2,
        ("", "ConfigMap") | ("", "Secret") => 3,
        ("", "PersistentVolume")
        | ("", "PersistentVolumeClaim")
        | ("storage.k8s.io", _)
        | ("", "Service") => 4,
        ("apps", _) | ("batch", _) | ("", "Pod") => 5,
        ("admissionregistration.k8s.io", _) | ("apiregistration.k8s.io", "APIService") => 7,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gk(group: &str, kind: &str) -> GroupKind {
        GroupKind::new(group, kind)
    }

    #[test]
    fn priority_orders_prerequisites_first() {
        assert!(apply_priority(&gk("", "Namespace")) < apply_priority(&gk("", "ConfigMap")));
        assert!(apply_priority(&gk("", "ConfigMap")) < apply_priority(&gk("apps", "Deployment")));
        assert!(
            apply_priority(&gk("apps", "Deployment"))
                < apply_priority(&gk("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"))
        );
        // Unknown kinds take the default slot between workloads and webhooks.
        assert_eq!(apply_priority(&gk("example.com", "Widget")), 6);
    }

    #[test]
    fn deployment_probe_tracks_rollout() {
        let p = probe(&gk("apps", "Deployment")).unwrap();
        let rolling = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "readyReplicas": 1, "updatedReplicas": 2}
        });
        assert!(!(p.is_healthy)(&rolling));
        assert!((p.is_progressing)(&rolling));

        let settled = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "readyReplicas": 2, "updatedReplicas": 2}
        });
        assert!((p.is_healthy)(&settled));
        assert!(!(p.is_progressing)(&settled));

        let stale = json!({
            "metadata": {"generation": 4},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "readyReplicas": 2, "updatedReplicas": 2}
        });
        assert!(!(p.is_healthy)(&stale));
        assert!((p.is_progressing)(&stale));
    }

    #[test]
    fn statefulset_probe_checks_revisions() {
        let p = probe(&gk("apps", "StatefulSet")).unwrap();
        let mid_update = json!({
            "metadata": {"generation": 1},
            "spec": {"replicas": 1},
            "status": {
                "observedGeneration": 1,
                "readyReplicas": 1,
                "currentRevision": "a",
                "updateRevision": "b"
            }
        });
        assert!(!(p.is_healthy)(&mid_update));
        assert!((p.is_progressing)(&mid_update));
    }

    #[test]
    fn job_probe_distinguishes_outcomes() {
        let p = probe(&gk("batch", "Job")).unwrap();
        let done = json!({"status": {"conditions": [{"type": "Complete", "status": "True"}]}});
        assert!((p.is_healthy)(&done));
        assert!(!(p.is_progressing)(&done));
        let running = json!({"status": {"active": 1}});
        assert!(!(p.is_healthy)(&running));
        assert!((p.is_progressing)(&running));
    }

    #[test]
    fn unknown_kind_has_no_probe() {
        assert!(probe(&gk("example.com", "Widget")).is_none());
    }
}
