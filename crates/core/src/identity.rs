//! Equivalence folding: recognizing "the same logical object" across a
//! declared group/kind migration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GroupKind;

/// Primary key for ownership tracking: namespace + name + the
/// equivalence-resolved (group, kind).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalId {
    pub group_kind: GroupKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.group_kind, ns, self.name),
            None => write!(f, "{} {}", self.group_kind, self.name),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EquivalenceError {
    #[error("(group, kind) pair {0} claimed by more than one equivalence group")]
    Overlap(GroupKind),
}

/// Compiled equivalence rules. Maps every member of a group to the
/// lowest-sorted member, which acts as the stable representative.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceSet {
    fold: BTreeMap<GroupKind, GroupKind>,
}

impl EquivalenceSet {
    /// Build from caller-declared groups. A pair claimed by two groups is a
    /// configuration error, not a silent precedence.
    pub fn new(groups: &[Vec<GroupKind>]) -> Result<Self, EquivalenceError> {
        let mut fold = BTreeMap::new();
        for group in groups {
            let representative = match group.iter().min() {
                Some(r) => r.clone(),
                None => continue,
            };
            for member in group {
                if let Some(prev) = fold.insert(member.clone(), representative.clone()) {
                    if prev != representative {
                        return Err(EquivalenceError::Overlap(member.clone()));
                    }
                }
            }
        }
        Ok(Self { fold })
    }

    /// Canonical representative for a (group, kind); literal identity when no
    /// group claims it. Total and deterministic.
    pub fn canonical(&self, gk: &GroupKind) -> GroupKind {
        self.fold.get(gk).cloned().unwrap_or_else(|| gk.clone())
    }

    pub fn canonical_id(
        &self,
        gk: &GroupKind,
        namespace: Option<&str>,
        name: &str,
    ) -> CanonicalId {
        CanonicalId {
            group_kind: self.canonical(gk),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gk(group: &str, kind: &str) -> GroupKind {
        GroupKind::new(group, kind)
    }

    #[test]
    fn folds_to_lowest_sorted_member() {
        let eq = EquivalenceSet::new(&[vec![gk("apps", "StatefulSet"), gk("apps", "Deployment")]])
            .unwrap();
        assert_eq!(eq.canonical(&gk("apps", "StatefulSet")), gk("apps", "Deployment"));
        assert_eq!(eq.canonical(&gk("apps", "Deployment")), gk("apps", "Deployment"));
    }

    #[test]
    fn unmatched_pairs_keep_literal_identity() {
        let eq = EquivalenceSet::new(&[]).unwrap();
        assert_eq!(eq.canonical(&gk("", "ConfigMap")), gk("", "ConfigMap"));
    }

    #[test]
    fn same_identity_across_declared_kind_change() {
        let eq = EquivalenceSet::new(&[vec![gk("apps", "Deployment"), gk("apps", "StatefulSet")]])
            .unwrap();
        let a = eq.canonical_id(&gk("apps", "Deployment"), Some("ns"), "x");
        let b = eq.canonical_id(&gk("apps", "StatefulSet"), Some("ns"), "x");
        assert_eq!(a, b);
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        let err = EquivalenceSet::new(&[
            vec![gk("apps", "Deployment"), gk("apps", "StatefulSet")],
            vec![gk("apps", "Deployment"), gk("batch", "Job")],
        ])
        .unwrap_err();
        assert_eq!(err, EquivalenceError::Overlap(gk("apps", "Deployment")));
    }

    #[test]
    fn duplicate_pair_within_one_group_is_fine() {
        let eq = EquivalenceSet::new(&[vec![
            gk("apps", "Deployment"),
            gk("apps", "Deployment"),
            gk("apps", "StatefulSet"),
        ]]);
        assert!(eq.is_ok());
    }
}
