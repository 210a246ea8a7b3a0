//! Rudder core types: bundle spec/status, object identities, conditions and
//! the per-kind capability table.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod condition;
pub mod identity;
pub mod kinds;

pub use condition::{Condition, ConditionStatus, ConditionType, ErrorCode};
pub use identity::{CanonicalId, EquivalenceSet};

/// Annotation carrying a hash of the desired payload, stamped on every owned
/// object as the engine's mark.
pub const DESIRED_HASH_ANNOTATION: &str = "rudder.io/desired-hash";

/// Finalizer guarding teardown of owned objects before the bundle goes away.
pub const RECLAIMER_FINALIZER: &str = "rudder.io/reclaimer";

/// API group + kind, the unit the equivalence resolver folds over.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.group, self.kind)
        }
    }
}

/// Decoded form of one manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Full object payload as loaded from the source bundle.
    pub payload: serde_json::Value,
    pub field_path: Option<String>,
}

impl ObjectDescriptor {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// One entry of the persisted owned-object set (`status.resources`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

impl ObjectRef {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }
}

/// Reference to one source bundle, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceRef {
    pub name: String,
}

/// Desired-state half of a `ManagedBundle`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Partitions responsibility among engine instances; empty means the
    /// default class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Ordered bundle references; duplicates by name are rejected.
    pub secret_refs: Vec<SourceRef>,
    /// Groups of interchangeable (group, kind) pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equivalences: Vec<Vec<GroupKind>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub force_overwrite_labels: bool,
    #[serde(default)]
    pub force_overwrite_annotations: bool,
    /// Leave owned objects in place when the bundle itself is deleted.
    #[serde(default)]
    pub keep_objects: bool,
    /// Also delete claims owned by a reclaimed stateful workload.
    #[serde(default)]
    pub delete_persistent_volume_claims: bool,
}

/// Observed-state half of a `ManagedBundle`, written once per cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_data_checksum: Option<String>,
}

/// Identity of one bundle instance: the unit of reconcile serialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleId {
    pub namespace: String,
    pub name: String,
}

impl BundleId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Validate the parts of a spec that make a cycle impossible before it
/// starts: duplicate source refs and overlapping equivalence groups. Returns
/// the compiled equivalence set so callers do not build it twice.
pub fn validate_spec(spec: &BundleSpec) -> Result<EquivalenceSet, String> {
    let mut seen = std::collections::BTreeSet::new();
    for r in &spec.secret_refs {
        if !seen.insert(r.name.as_str()) {
            return Err(format!("duplicate secretRef {:?}", r.name));
        }
    }
    EquivalenceSet::new(&spec.equivalences).map_err(|e| e.to_string())
}
