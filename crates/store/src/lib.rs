//! Store seams the engine reconciles through: a target store with
//! get/list/create/update/delete semantics keyed by group-version-kind +
//! namespace + name, and a source store resolving bundle references to
//! opaque byte payloads.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod mem;

pub use mem::{MemSource, MemStore, StoreOp};

/// Addressing for one live object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl StoreKey {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    pub fn from_descriptor(d: &rudder_core::ObjectDescriptor) -> Self {
        Self::new(&d.group, &d.version, &d.kind, d.namespace.as_deref(), &d.name)
    }

    pub fn from_ref(r: &rudder_core::ObjectRef) -> Self {
        let version = r
            .api_version
            .rsplit_once('/')
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| r.api_version.clone());
        Self { group: r.group.clone(), version, kind: r.kind.clone(), namespace: r.namespace.clone(), name: r.name.clone() }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gv = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", gv, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", gv, self.kind, self.name),
        }
    }
}

/// Result of a successful create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub uid: String,
    pub resource_version: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict on {key}: expected rv {expected:?}, live rv {actual:?}")]
    Conflict { key: String, expected: Option<String>, actual: Option<String> },
    #[error("immutable field on {key}: {message}")]
    Immutable { key: String, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors abort the cycle and are retried with backoff; the
    /// rest are isolated per object.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The target cluster, as far as the engine is concerned.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, StoreError>;

    /// List objects of one kind in a namespace matching all given labels.
    async fn list(
        &self,
        key: &StoreKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, StoreError>;

    async fn create(&self, key: &StoreKey, payload: &Value) -> Result<Applied, StoreError>;

    /// Update with optimistic concurrency: when `expected_rv` is given and
    /// the live resourceVersion differs, fails with `Conflict`.
    async fn update(
        &self,
        key: &StoreKey,
        payload: &Value,
        expected_rv: Option<&str>,
    ) -> Result<Applied, StoreError>;

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;
}

/// The store that resolves bundle references. Entries come back keyed by
/// payload name so concatenation order is stable.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;
}
