//! Typed status conditions with machine-readable error codes.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Applied,
    Healthy,
    Progressing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Machine-readable failure codes, the sole externally observable error
/// channel besides the condition message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum ErrorCode {
    #[serde(rename = "ERR_SOURCE_NOT_FOUND")]
    SourceNotFound,
    #[serde(rename = "ERR_DECODE")]
    Decode,
    #[serde(rename = "ERR_CONFLICT")]
    Conflict,
    #[serde(rename = "ERR_IMMUTABLE")]
    Immutable,
    #[serde(rename = "ERR_TARGET_UNAVAILABLE")]
    TargetUnavailable,
    #[serde(rename = "ERR_CONFIG")]
    Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<ErrorCode>,
    /// Updates only when `status` changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Updates on every recomputation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Insert or update one condition, preserving `lastTransitionTime` when the
/// status did not change.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: ConditionType,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
    codes: Vec<ErrorCode>,
    now: DateTime<Utc>,
) {
    let stamp = rfc3339(now);
    match conditions.iter_mut().find(|c| c.r#type == r#type) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(stamp.clone());
            }
            existing.status = status;
            existing.reason = reason.into();
            existing.message = message.into();
            existing.codes = codes;
            existing.last_update_time = Some(stamp);
        }
        None => conditions.push(Condition {
            r#type,
            status,
            reason: reason.into(),
            message: message.into(),
            codes,
            last_transition_time: Some(stamp.clone()),
            last_update_time: Some(stamp),
        }),
    }
}

pub fn get_condition(conditions: &[Condition], r#type: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Refresh `lastUpdateTime` on every condition without touching status or
/// transition times. Used by cycles that recompute nothing.
pub fn touch_conditions(conditions: &mut [Condition], now: DateTime<Utc>) {
    let stamp = rfc3339(now);
    for c in conditions.iter_mut() {
        c.last_update_time = Some(stamp.clone());
    }
}
