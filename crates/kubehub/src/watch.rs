//! Watch wiring: bundle, source-secret and owned-object watchers feeding the
//! trigger scheduler. Each watcher runs in its own task and restarts itself
//! on stream errors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use k8s_openapi::api::core::v1::Secret;
use rudder_controller::{OwnershipIndex, Trigger};
use rudder_core::BundleId;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ManagedBundle;

const STREAM_RETRY: Duration = Duration::from_secs(5);
const GVK_SCAN: Duration = Duration::from_secs(15);

/// Reverse index from source secrets to the bundles referencing them, kept
/// current by the bundle watcher.
#[derive(Default)]
pub struct SourceIndex {
    inner: std::sync::RwLock<FxHashMap<(String, String), BTreeSet<BundleId>>>,
}

impl SourceIndex {
    pub fn set_refs(&self, id: &BundleId, secret_names: &[String]) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
        for name in secret_names {
            map.entry((id.namespace.clone(), name.clone())).or_default().insert(id.clone());
        }
    }

    pub fn remove(&self, id: &BundleId) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    pub fn referencing(&self, namespace: &str, secret_name: &str) -> Vec<BundleId> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&(namespace.to_string(), secret_name.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Spawn the bundle, secret and owned-object watchers. Returns the source
/// index so callers can inspect it; triggers flow out through `triggers`.
pub fn spawn_watchers(
    client: Client,
    namespace: Option<String>,
    index: Arc<OwnershipIndex>,
    triggers: mpsc::Sender<Trigger>,
) -> Arc<SourceIndex> {
    let sources = Arc::new(SourceIndex::default());
    tokio::spawn(watch_bundles(
        client.clone(),
        namespace.clone(),
        sources.clone(),
        triggers.clone(),
    ));
    tokio::spawn(watch_sources(client.clone(), namespace, sources.clone(), triggers.clone()));
    tokio::spawn(watch_owned(client, index, triggers));
    sources
}

fn bundle_id(mb: &ManagedBundle) -> BundleId {
    BundleId::new(mb.namespace().unwrap_or_default(), mb.name_any())
}

async fn on_bundle_event(
    mb: &ManagedBundle,
    sources: &SourceIndex,
    triggers: &mpsc::Sender<Trigger>,
) {
    let id = bundle_id(mb);
    let refs: Vec<String> = mb.spec.bundle.secret_refs.iter().map(|r| r.name.clone()).collect();
    sources.set_refs(&id, &refs);
    let trigger = if mb.metadata.deletion_timestamp.is_some() {
        Trigger::Deleted(id)
    } else {
        Trigger::Changed(id)
    };
    let _ = triggers.send(trigger).await;
}

async fn watch_bundles(
    client: Client,
    namespace: Option<String>,
    sources: Arc<SourceIndex>,
    triggers: mpsc::Sender<Trigger>,
) {
    let api: Api<ManagedBundle> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(ns = ?namespace, "bundle watcher started");
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(mb))) => on_bundle_event(&mb, &sources, &triggers).await,
                Ok(Some(Event::Deleted(mb))) => {
                    let id = bundle_id(&mb);
                    sources.remove(&id);
                    let _ = triggers.send(Trigger::Deleted(id)).await;
                }
                Ok(Some(Event::Restarted(list))) => {
                    debug!(count = list.len(), "bundle watch restart");
                    for mb in &list {
                        on_bundle_event(mb, &sources, &triggers).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bundle watch stream error");
                    break;
                }
            }
        }
        tokio::time::sleep(STREAM_RETRY).await;
    }
}

async fn on_secret_event(
    secret: &Secret,
    sources: &SourceIndex,
    triggers: &mpsc::Sender<Trigger>,
) {
    let ns = secret.namespace().unwrap_or_default();
    for id in sources.referencing(&ns, &secret.name_any()) {
        let _ = triggers.send(Trigger::Changed(id)).await;
    }
}

async fn watch_sources(
    client: Client,
    namespace: Option<String>,
    sources: Arc<SourceIndex>,
    triggers: mpsc::Sender<Trigger>,
) {
    let api: Api<Secret> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(ns = ?namespace, "source watcher started");
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(s))) | Ok(Some(Event::Deleted(s))) => {
                    on_secret_event(&s, &sources, &triggers).await
                }
                // The bundle cycle re-reads sources anyway; a relist adds
                // nothing the next resync will not cover.
                Ok(Some(Event::Restarted(_))) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "source watch stream error");
                    break;
                }
            }
        }
        tokio::time::sleep(STREAM_RETRY).await;
    }
}

/// Periodically scan the ownership index for newly owned kinds and start a
/// watcher per kind. Kinds are never unwatched; the set only grows while the
/// process lives.
async fn watch_owned(
    client: Client,
    index: Arc<OwnershipIndex>,
    triggers: mpsc::Sender<Trigger>,
) {
    let mut watched: BTreeSet<(String, String, String)> = BTreeSet::new();
    loop {
        for gvk in index.watched_gvks() {
            if watched.insert(gvk.clone()) {
                tokio::spawn(watch_gvk(client.clone(), gvk, index.clone(), triggers.clone()));
            }
        }
        tokio::time::sleep(GVK_SCAN).await;
    }
}

async fn on_owned_event(
    obj: &DynamicObject,
    gvk: &(String, String, String),
    index: &OwnershipIndex,
    triggers: &mpsc::Sender<Trigger>,
) {
    let ns = obj.namespace();
    for id in index.owners_of(&gvk.0, &gvk.2, ns.as_deref(), &obj.name_any()) {
        let _ = triggers.send(Trigger::Owned(id)).await;
    }
}

async fn watch_gvk(
    client: Client,
    gvk: (String, String, String),
    index: Arc<OwnershipIndex>,
    triggers: mpsc::Sender<Trigger>,
) {
    let kube_gvk = GroupVersionKind::gvk(&gvk.0, &gvk.1, &gvk.2);
    loop {
        let (ar, _caps) = match discovery::pinned_kind(&client, &kube_gvk).await {
            Ok(found) => found,
            Err(e) => {
                warn!(group = %gvk.0, kind = %gvk.2, error = %e, "owned kind discovery failed");
                tokio::time::sleep(STREAM_RETRY).await;
                continue;
            }
        };
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(group = %gvk.0, kind = %gvk.2, "owned watcher started");
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(o))) | Ok(Some(Event::Deleted(o))) => {
                    on_owned_event(&o, &gvk, &index, &triggers).await
                }
                Ok(Some(Event::Restarted(list))) => {
                    for o in &list {
                        on_owned_event(o, &gvk, &index, &triggers).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(group = %gvk.0, kind = %gvk.2, error = %e, "owned watch stream error");
                    break;
                }
            }
        }
        tokio::time::sleep(STREAM_RETRY).await;
    }
}
