//! Pure label/annotation injection with overwrite policy. Values previously
//! written by the engine (recorded in the owned-reference snapshot) are
//! always ours to rewrite; values set by other actors win unless the force
//! flag is set.

use std::collections::BTreeMap;

use serde_json::Value;

/// One key kept at its pre-existing value because the force flag was off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub key: String,
    pub existing: String,
    pub injected: String,
}

/// Merge `inject` into `live`. Returns the merged map plus the conflicts
/// where the live value (set by someone else) was kept.
pub fn merge_maps(
    live: &BTreeMap<String, String>,
    inject: &BTreeMap<String, String>,
    ours_last_cycle: &BTreeMap<String, String>,
    force: bool,
) -> (BTreeMap<String, String>, Vec<MergeConflict>) {
    let mut merged = live.clone();
    let mut conflicts = Vec::new();
    for (k, v) in inject {
        match live.get(k) {
            Some(existing) if existing != v => {
                let wrote_it_last_cycle = ours_last_cycle.get(k) == Some(existing);
                if force || wrote_it_last_cycle {
                    merged.insert(k.clone(), v.clone());
                } else {
                    conflicts.push(MergeConflict {
                        key: k.clone(),
                        existing: existing.clone(),
                        injected: v.clone(),
                    });
                }
            }
            _ => {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    (merged, conflicts)
}

/// Read a metadata string map (`labels` or `annotations`) out of a payload.
pub fn metadata_map(payload: &Value, field: &str) -> BTreeMap<String, String> {
    payload
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Write a metadata string map back into a payload, creating metadata if
/// needed and dropping the field entirely when empty.
pub fn set_metadata_map(payload: &mut Value, field: &str, map: &BTreeMap<String, String>) {
    let Some(root) = payload.as_object_mut() else { return };
    let meta = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(meta) = meta.as_object_mut() else { return };
    if map.is_empty() {
        meta.remove(field);
        return;
    }
    let obj: serde_json::Map<String, Value> =
        map.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    meta.insert(field.to_string(), Value::Object(obj));
}
