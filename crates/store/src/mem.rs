//! In-memory target/source stores. Back the engine's test suites and keep a
//! full operation log so tests can assert on call traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{Applied, SourceStore, StoreError, StoreKey, TargetStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Get(StoreKey),
    List(StoreKey),
    Create(StoreKey),
    Update(StoreKey),
    Delete(StoreKey),
}

impl StoreOp {
    pub fn is_mutation(&self) -> bool {
        matches!(self, StoreOp::Create(_) | StoreOp::Update(_) | StoreOp::Delete(_))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    payload: Value,
    uid: String,
    resource_version: u64,
}

// Mem keys ignore the version: one kind, one storage slot.
type MemKey = (String, String, Option<String>, String);

fn mem_key(key: &StoreKey) -> MemKey {
    (key.group.clone(), key.kind.clone(), key.namespace.clone(), key.name.clone())
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<MemKey, StoredObject>,
    ops: Vec<StoreOp>,
    next_rv: u64,
    unavailable: bool,
    deny_update_immutable: BTreeSet<MemKey>,
    conflict_once: BTreeSet<MemKey>,
    hold_delete: BTreeSet<MemKey>,
}

/// In-memory `TargetStore` with fault injection knobs.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything fails with `Unavailable` until cleared.
    pub fn set_unavailable(&self, on: bool) {
        self.lock().unavailable = on;
    }

    /// Updates of this key fail as an immutable-field mismatch.
    pub fn deny_update_immutable(&self, key: &StoreKey) {
        self.lock().deny_update_immutable.insert(mem_key(key));
    }

    /// The next update of this key fails with `Conflict` (then succeeds).
    pub fn conflict_once(&self, key: &StoreKey) {
        self.lock().conflict_once.insert(mem_key(key));
    }

    /// Deletes of this key fail (finalizer still present).
    pub fn hold_delete(&self, key: &StoreKey, on: bool) {
        let mut g = self.lock();
        if on {
            g.hold_delete.insert(mem_key(key));
        } else {
            g.hold_delete.remove(&mem_key(key));
        }
    }

    /// Seed a live object directly, bypassing the op log.
    pub fn seed(&self, key: &StoreKey, payload: Value) -> Applied {
        let mut g = self.lock();
        g.next_rv += 1;
        let obj = StoredObject {
            payload,
            uid: Uuid::new_v4().to_string(),
            resource_version: g.next_rv,
        };
        let applied =
            Applied { uid: obj.uid.clone(), resource_version: obj.resource_version.to_string() };
        g.objects.insert(mem_key(key), obj);
        applied
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().ops.iter().filter(|o| o.is_mutation()).count()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.lock().objects.contains_key(&mem_key(key))
    }

    pub fn payload(&self, key: &StoreKey) -> Option<Value> {
        self.lock().objects.get(&mem_key(key)).map(|o| o.payload.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn with_meta(payload: &Value, obj: &StoredObject) -> Value {
    let mut v = payload.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("uid".into(), Value::String(obj.uid.clone()));
        meta.insert("resourceVersion".into(), Value::String(obj.resource_version.to_string()));
    }
    v
}

fn labels_match(payload: &Value, wanted: &BTreeMap<String, String>) -> bool {
    let labels = payload.get("metadata").and_then(|m| m.get("labels"));
    wanted.iter().all(|(k, v)| {
        labels.and_then(|l| l.get(k)).and_then(|x| x.as_str()) == Some(v.as_str())
    })
}

#[async_trait]
impl TargetStore for MemStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, StoreError> {
        let mut g = self.lock();
        g.ops.push(StoreOp::Get(key.clone()));
        if g.unavailable {
            return Err(StoreError::Unavailable("mem store offline".into()));
        }
        Ok(g.objects.get(&mem_key(key)).map(|o| with_meta(&o.payload, o)))
    }

    async fn list(
        &self,
        key: &StoreKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut g = self.lock();
        g.ops.push(StoreOp::List(key.clone()));
        if g.unavailable {
            return Err(StoreError::Unavailable("mem store offline".into()));
        }
        let out = g
            .objects
            .iter()
            .filter(|((group, kind, ns, _), _)| {
                group == &key.group && kind == &key.kind && ns == &key.namespace
            })
            .filter(|(_, o)| labels_match(&o.payload, labels))
            .map(|(_, o)| with_meta(&o.payload, o))
            .collect();
        Ok(out)
    }

    async fn create(&self, key: &StoreKey, payload: &Value) -> Result<Applied, StoreError> {
        let mut g = self.lock();
        g.ops.push(StoreOp::Create(key.clone()));
        if g.unavailable {
            return Err(StoreError::Unavailable("mem store offline".into()));
        }
        if g.objects.contains_key(&mem_key(key)) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        g.next_rv += 1;
        let obj = StoredObject {
            payload: payload.clone(),
            uid: Uuid::new_v4().to_string(),
            resource_version: g.next_rv,
        };
        let applied =
            Applied { uid: obj.uid.clone(), resource_version: obj.resource_version.to_string() };
        g.objects.insert(mem_key(key), obj);
        Ok(applied)
    }

    async fn update(
        &self,
        key: &StoreKey,
        payload: &Value,
        expected_rv: Option<&str>,
    ) -> Result<Applied, StoreError> {
        let mut g = self.lock();
        g.ops.push(StoreOp::Update(key.clone()));
        if g.unavailable {
            return Err(StoreError::Unavailable("mem store offline".into()));
        }
        let mk = mem_key(key);
        if g.deny_update_immutable.contains(&mk) {
            return Err(StoreError::Immutable {
                key: key.to_string(),
                message: "field is immutable".into(),
            });
        }
        if g.conflict_once.remove(&mk) {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_rv.map(|s| s.to_string()),
                actual: None,
            });
        }
        // Bumped before the object borrow; failed updates leave gaps in the
        // sequence.
        g.next_rv += 1;
        let next_rv = g.next_rv;
        let obj = g.objects.get_mut(&mk).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(expected) = expected_rv {
            let live = obj.resource_version.to_string();
            if live != expected {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: Some(expected.to_string()),
                    actual: Some(live),
                });
            }
        }
        obj.payload = payload.clone();
        obj.resource_version = next_rv;
        Ok(Applied { uid: obj.uid.clone(), resource_version: next_rv.to_string() })
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.ops.push(StoreOp::Delete(key.clone()));
        if g.unavailable {
            return Err(StoreError::Unavailable("mem store offline".into()));
        }
        let mk = mem_key(key);
        if g.hold_delete.contains(&mk) {
            return Err(StoreError::Unavailable(format!("{key}: finalizers pending")));
        }
        if g.objects.remove(&mk).is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

/// In-memory `SourceStore`: (namespace, name) -> named payload entries.
#[derive(Default)]
pub struct MemSource {
    bundles: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, namespace: &str, name: &str, entries: BTreeMap<String, Vec<u8>>) {
        self.bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((namespace.to_string(), name.to_string()), entries);
    }

    pub fn put_single(&self, namespace: &str, name: &str, body: &str) {
        let mut entries = BTreeMap::new();
        entries.insert("data.yaml".to_string(), body.as_bytes().to_vec());
        self.put(namespace, name, entries);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl SourceStore for MemSource {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        self.bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))
    }
}
