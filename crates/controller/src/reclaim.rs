//! Orphan reclaim: delete previously-owned objects that fell out of the
//! desired set. A not-found delete is success; any other failure keeps the
//! reference so the next cycle retries.

use std::collections::BTreeMap;

use metrics::counter;
use rudder_core::ObjectRef;
use rudder_store::{StoreError, StoreKey, TargetStore};
use tracing::{debug, warn};

pub(crate) struct ReclaimOutcome {
    pub deleted: usize,
    /// References whose delete did not go through (finalizers pending,
    /// transient failure). They stay in the owned set.
    pub kept: Vec<ObjectRef>,
}

pub(crate) async fn reclaim(
    store: &dyn TargetStore,
    refs: &[ObjectRef],
    delete_pvcs: bool,
) -> ReclaimOutcome {
    let mut out = ReclaimOutcome { deleted: 0, kept: Vec::new() };
    for r in refs {
        let key = StoreKey::from_ref(r);
        // The selector has to be read before the workload disappears.
        let selector = if delete_pvcs && r.group == "apps" && r.kind == "StatefulSet" {
            stateful_selector(store, &key).await
        } else {
            None
        };
        match store.delete(&key).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                out.deleted += 1;
                counter!("bundle_orphans_deleted", 1u64);
                debug!(object = %key, "orphan reclaimed");
                if let Some(labels) = selector {
                    delete_claims(store, r.namespace.as_deref(), &labels).await;
                }
            }
            Err(e) => {
                warn!(object = %key, error = %e, "orphan delete failed, retrying next cycle");
                out.kept.push(r.clone());
            }
        }
    }
    out
}

async fn stateful_selector(
    store: &dyn TargetStore,
    key: &StoreKey,
) -> Option<BTreeMap<String, String>> {
    let live = match store.get(key).await {
        Ok(Some(live)) => live,
        Ok(None) => return None,
        Err(e) => {
            warn!(object = %key, error = %e, "selector read failed, claims not cascaded");
            return None;
        }
    };
    let labels = live
        .get("spec")?
        .get("selector")?
        .get("matchLabels")?
        .as_object()?
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect::<BTreeMap<_, _>>();
    (!labels.is_empty()).then_some(labels)
}

async fn delete_claims(
    store: &dyn TargetStore,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) {
    let list_key = StoreKey::new("", "v1", "PersistentVolumeClaim", namespace, "");
    let claims = match store.list(&list_key, labels).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "claim listing failed, claims not cascaded");
            return;
        }
    };
    for claim in claims {
        let name = claim
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let key = StoreKey::new("", "v1", "PersistentVolumeClaim", namespace, name);
        match store.delete(&key).await {
            Ok(()) | Err(StoreError::NotFound(_)) => debug!(claim = %key, "claim reclaimed"),
            Err(e) => warn!(claim = %key, error = %e, "claim delete failed"),
        }
    }
}
