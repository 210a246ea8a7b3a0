//! Kube-backed store seams: a `TargetStore` over `DynamicObject` with
//! discovery-resolved kinds, a `SourceStore` reading Secret payloads, and the
//! `BundleApi` the reconcile loop drives bundles through.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, ResourceExt,
};
use k8s_openapi::api::core::v1::Secret;
use rudder_core::{BundleId, BundleStatus, RECLAIMER_FINALIZER};
use rudder_store::{Applied, SourceStore, StoreError, StoreKey, TargetStore};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use rudder_controller::{BundleApi, BundleState};

use crate::{call_timeout_from_env, ManagedBundle};

fn api_error(key: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(key.to_string()),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(key.to_string()),
            409 => StoreError::Conflict { key: key.to_string(), expected: None, actual: None },
            422 if ae.message.contains("immutable") => {
                StoreError::Immutable { key: key.to_string(), message: ae.message }
            }
            400 | 422 => StoreError::Invalid(ae.message),
            _ => StoreError::Unavailable(format!("{key}: {}", ae.message)),
        },
        other => StoreError::Unavailable(format!("{key}: {other}")),
    }
}

async fn with_timeout<T, F>(timeout: Duration, key: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(|e| api_error(key, e)),
        Err(_) => Err(StoreError::Unavailable(format!("{key}: call timed out"))),
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

fn applied_of(obj: &DynamicObject) -> Applied {
    Applied {
        uid: obj.metadata.uid.clone().unwrap_or_default(),
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
    }
}

/// `TargetStore` over arbitrary kinds via discovery + `DynamicObject`.
pub struct KubeTargetStore {
    client: Client,
    call_timeout: Duration,
    kinds: RwLock<FxHashMap<(String, String, String), (ApiResource, bool)>>,
}

impl KubeTargetStore {
    pub fn new(client: Client) -> Self {
        Self { client, call_timeout: call_timeout_from_env(), kinds: RwLock::new(FxHashMap::default()) }
    }

    async fn resolve(&self, key: &StoreKey) -> Result<(ApiResource, bool), StoreError> {
        let ck = (key.group.clone(), key.version.clone(), key.kind.clone());
        if let Some(hit) = self.kinds.read().await.get(&ck) {
            return Ok(hit.clone());
        }
        let gvk = GroupVersionKind::gvk(&key.group, &key.version, &key.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
            // A kind the cluster does not serve is a manifest problem, not an
            // outage.
            kube::Error::Api(ae) if ae.code == 404 => {
                StoreError::Invalid(format!("kind not served by the cluster: {key}"))
            }
            other => StoreError::Unavailable(format!("{key}: discovery failed: {other}")),
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(key = %key, namespaced, "kind resolved");
        self.kinds.write().await.insert(ck, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, key: &StoreKey) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(key).await?;
        let api = if namespaced {
            match key.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::default_namespaced_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

fn decode_payload(key: &StoreKey, payload: &Value) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| StoreError::Invalid(format!("{key}: not a valid object: {e}")))
}

fn encode_object(key: &StoreKey, obj: &DynamicObject) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("{key}: {e}")))
}

#[async_trait]
impl TargetStore for KubeTargetStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, StoreError> {
        let api = self.api_for(key).await?;
        let ks = key.to_string();
        let obj = with_timeout(self.call_timeout, &ks, api.get_opt(&key.name)).await?;
        obj.map(|o| encode_object(key, &o)).transpose()
    }

    async fn list(
        &self,
        key: &StoreKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, StoreError> {
        let api = self.api_for(key).await?;
        let ks = key.to_string();
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = with_timeout(self.call_timeout, &ks, api.list(&lp)).await?;
        list.items.iter().map(|o| encode_object(key, o)).collect()
    }

    async fn create(&self, key: &StoreKey, payload: &Value) -> Result<Applied, StoreError> {
        let api = self.api_for(key).await?;
        let ks = key.to_string();
        let obj = decode_payload(key, payload)?;
        let created =
            with_timeout(self.call_timeout, &ks, api.create(&PostParams::default(), &obj)).await?;
        Ok(applied_of(&created))
    }

    async fn update(
        &self,
        key: &StoreKey,
        payload: &Value,
        expected_rv: Option<&str>,
    ) -> Result<Applied, StoreError> {
        let api = self.api_for(key).await?;
        let ks = key.to_string();
        let mut obj = decode_payload(key, payload)?;
        // The server enforces optimistic concurrency off the carried rv.
        obj.metadata.resource_version = expected_rv.map(String::from);
        let updated = with_timeout(
            self.call_timeout,
            &ks,
            api.replace(&key.name, &PostParams::default(), &obj),
        )
        .await?;
        Ok(applied_of(&updated))
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let api = self.api_for(key).await?;
        let ks = key.to_string();
        with_timeout(self.call_timeout, &ks, api.delete(&key.name, &DeleteParams::default()))
            .await?;
        Ok(())
    }
}

/// `SourceStore` reading manifest payloads out of Secret data entries.
pub struct KubeSourceStore {
    client: Client,
    call_timeout: Duration,
}

impl KubeSourceStore {
    pub fn new(client: Client) -> Self {
        Self { client, call_timeout: call_timeout_from_env() }
    }
}

#[async_trait]
impl SourceStore for KubeSourceStore {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let ks = format!("v1/Secret {namespace}/{name}");
        let secret = with_timeout(self.call_timeout, &ks, api.get_opt(name))
            .await?
            .ok_or_else(|| StoreError::NotFound(ks.clone()))?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}

/// `BundleApi` over the `ManagedBundle` custom resource.
pub struct KubeBundleApi {
    client: Client,
    call_timeout: Duration,
}

impl KubeBundleApi {
    pub fn new(client: Client) -> Self {
        Self { client, call_timeout: call_timeout_from_env() }
    }

    fn api(&self, namespace: &str) -> Api<ManagedBundle> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn state_of(mb: &ManagedBundle) -> BundleState {
    BundleState {
        spec: mb.spec.bundle.clone(),
        status: mb.status.clone().unwrap_or_default(),
        generation: mb.metadata.generation.unwrap_or_default(),
        deleted: mb.metadata.deletion_timestamp.is_some(),
    }
}

#[async_trait]
impl BundleApi for KubeBundleApi {
    async fn get(&self, id: &BundleId) -> Result<Option<BundleState>, StoreError> {
        let ks = format!("ManagedBundle {id}");
        let mb =
            with_timeout(self.call_timeout, &ks, self.api(&id.namespace).get_opt(&id.name)).await?;
        Ok(mb.as_ref().map(state_of))
    }

    async fn update_status(&self, id: &BundleId, status: &BundleStatus) -> Result<(), StoreError> {
        let ks = format!("ManagedBundle {id}");
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        with_timeout(
            self.call_timeout,
            &ks,
            self.api(&id.namespace).patch_status(&id.name, &PatchParams::default(), &patch),
        )
        .await?;
        Ok(())
    }

    async fn set_finalizer(&self, id: &BundleId, present: bool) -> Result<(), StoreError> {
        let ks = format!("ManagedBundle {id}");
        let api = self.api(&id.namespace);
        let mb = match with_timeout(self.call_timeout, &ks, api.get_opt(&id.name)).await? {
            Some(mb) => mb,
            // Removing a finalizer from a gone object is a no-op.
            None if !present => return Ok(()),
            None => return Err(StoreError::NotFound(ks)),
        };
        let mut finalizers = mb.finalizers().to_vec();
        let has = finalizers.iter().any(|f| f == RECLAIMER_FINALIZER);
        if has == present {
            return Ok(());
        }
        if present {
            finalizers.push(RECLAIMER_FINALIZER.to_string());
        } else {
            finalizers.retain(|f| f != RECLAIMER_FINALIZER);
        }
        let patch = Patch::Merge(serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": mb.resource_version(),
            }
        }));
        with_timeout(
            self.call_timeout,
            &ks,
            api.patch(&id.name, &PatchParams::default(), &patch),
        )
        .await?;
        Ok(())
    }
}

/// Build one engine-ready store set from a client.
pub fn stores(client: &Client) -> (KubeTargetStore, KubeSourceStore, KubeBundleApi) {
    (
        KubeTargetStore::new(client.clone()),
        KubeSourceStore::new(client.clone()),
        KubeBundleApi::new(client.clone()),
    )
}
