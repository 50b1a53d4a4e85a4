//! Node resource: one supervised chain process, child of a Devnet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::ResourceMeta;
use super::{Resource, ResourceKind};

/// Role a node plays in the network.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Validator,
    Fullnode,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Validator => write!(f, "validator"),
            NodeRole::Fullnode => write!(f, "fullnode"),
        }
    }
}

/// State the node controller converges toward.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

/// Desired state of a node. Created by the devnet controller during
/// provisioning; `binary_path` is bound late, after the plugin build.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Name of the parent Devnet in the same namespace
    pub devnet_ref: String,
    /// Namespace of the parent Devnet
    pub namespace_ref: String,
    /// Dense 0-based index within the devnet
    pub index: u32,
    pub role: NodeRole,
    /// Path to the chain binary; empty until the plugin build completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    /// Node home directory holding config, genesis and data
    pub home_dir: String,
    /// Listen address override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Chain identifier, copied from the parent at creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub desired: DesiredState,
}

/// Node lifecycle phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum NodePhase {
    #[default]
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodePhase::Pending => "Pending",
            NodePhase::Starting => "Starting",
            NodePhase::Running => "Running",
            NodePhase::Stopping => "Stopping",
            NodePhase::Stopped => "Stopped",
            NodePhase::Crashed => "Crashed",
        };
        write!(f, "{s}")
    }
}

/// Observed state of a node, written only by controllers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    /// OS process id when running under the process runtime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub peer_count: u32,
    #[serde(default)]
    pub catching_up: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator_pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Time the block height last advanced; drives the stuck-chain check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_block_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Earliest time the restart policy permits another start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_restart_time: Option<DateTime<Utc>>,
}

/// One chain node supervised by the daemon.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub meta: ResourceMeta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn new(name: &str, namespace: &str, spec: NodeSpec) -> Self {
        Self {
            meta: ResourceMeta::new(name, namespace),
            spec,
            status: NodeStatus::default(),
        }
    }
}

impl Resource for Node {
    const KIND: ResourceKind = ResourceKind::Node;

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ResourceMeta {
        &mut self.meta
    }

    fn parent_ref(&self) -> Option<&str> {
        Some(&self.spec.devnet_ref)
    }
}
