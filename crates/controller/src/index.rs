//! Ownership index: maps live objects back to the bundles that own them and
//! tracks the set of GVKs that need watchers.

use std::collections::BTreeSet;
use std::sync::RwLock;

use rudder_core::{BundleId, ObjectRef};
use rustc_hash::FxHashMap;

// group, kind, namespace, name
type OwnerKey = (String, String, Option<String>, String);

#[derive(Default)]
struct Inner {
    owners: FxHashMap<OwnerKey, BTreeSet<BundleId>>,
    by_bundle: FxHashMap<BundleId, Vec<OwnerKey>>,
    // Grows monotonically: a watcher once started stays up.
    gvks: BTreeSet<(String, String, String)>,
}

/// Shared between the engine (writes after every cycle) and the watch wiring
/// (reads on every event).
#[derive(Default)]
pub struct OwnershipIndex {
    inner: RwLock<Inner>,
}

impl OwnershipIndex {
    /// Replace the owned set recorded for one bundle.
    pub fn set_owned(&self, id: &BundleId, refs: &[ObjectRef]) {
        let mut g = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = g.by_bundle.remove(id) {
            for key in old {
                let emptied = match g.owners.get_mut(&key) {
                    Some(set) => {
                        set.remove(id);
                        set.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    g.owners.remove(&key);
                }
            }
        }
        let mut keys = Vec::with_capacity(refs.len());
        for r in refs {
            let key = (r.group.clone(), r.kind.clone(), r.namespace.clone(), r.name.clone());
            g.owners.entry(key.clone()).or_default().insert(id.clone());
            let version = r
                .api_version
                .rsplit_once('/')
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| r.api_version.clone());
            g.gvks.insert((r.group.clone(), version, r.kind.clone()));
            keys.push(key);
        }
        g.by_bundle.insert(id.clone(), keys);
    }

    /// Bundles owning the given live object, if any.
    pub fn owners_of(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Vec<BundleId> {
        let key = (
            group.to_string(),
            kind.to_string(),
            namespace.map(|s| s.to_string()),
            name.to_string(),
        );
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        g.owners.get(&key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Every (group, version, kind) that has ever been owned.
    pub fn watched_gvks(&self) -> Vec<(String, String, String)> {
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        g.gvks.iter().cloned().collect()
    }
}
