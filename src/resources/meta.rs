//! Shared resource metadata and status conditions.
//!
//! Every stored resource embeds [`ResourceMeta`]; controllers report
//! progress through [`Condition`] entries on the resource status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The implicit namespace used when a request carries none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Normalize a request-supplied namespace. Applied once at API ingress;
/// downstream code never sees an empty namespace.
pub fn default_namespace(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace.to_string()
    }
}

/// Metadata common to all resource kinds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    /// Resource name, unique within (kind, namespace)
    pub name: String,
    /// Isolation namespace; `"default"` when unset
    pub namespace: String,
    /// Monotonic version counter used for optimistic concurrency.
    /// Set to 1 on create, incremented on every successful update.
    #[serde(default)]
    pub generation: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Free-form labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Free-form annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ResourceMeta {
    /// Fresh metadata for a resource being created now.
    pub fn new(name: &str, namespace: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            namespace: default_namespace(namespace),
            generation: 1,
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Fully qualified `<namespace>/<name>` identity, also the store key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Status of a condition: tri-valued per Kubernetes convention.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The closed set of condition types reported on Devnet status.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Progressing,
    PluginAvailable,
    NodesCreated,
    NodesRunning,
    Degraded,
}

/// A status signal with reason and last transition time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// Last time the condition status changed
    pub last_transition_time: DateTime<Utc>,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        Self {
            type_,
            status,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Upsert a condition into a status condition list. The transition time is
/// preserved when the status value is unchanged.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_defaults() {
        assert_eq!(default_namespace(""), "default");
        assert_eq!(default_namespace("team-a"), "team-a");
    }

    #[test]
    fn set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "Pending", ""),
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new(
                ConditionType::Ready,
                ConditionStatus::False,
                "StillPending",
                "",
            ),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason, "StillPending");

        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "AllRunning", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time >= first);
    }
}
