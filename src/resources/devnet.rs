//! Devnet resource: the aggregate root describing a cluster of nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::{Condition, ResourceMeta};
use super::{Resource, ResourceKind};

/// How node processes are executed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One container per node via the container engine
    Docker,
    /// Direct child processes of the daemon
    #[default]
    Local,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Docker => write!(f, "docker"),
            ExecutionMode::Local => write!(f, "local"),
        }
    }
}

/// Target network flavor
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    #[default]
    Testnet,
}

/// Where the node binary comes from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum BinarySource {
    /// Reuse a previously built binary from the build cache
    #[default]
    Cache,
    /// A binary already present on the local filesystem
    Local { path: String },
    /// Download from a GitHub release of the plugin's repository
    GithubRelease { tag: String },
    /// Download from an arbitrary URL
    Url { url: String },
}

/// Host port bases; each node offsets these by `100 * index`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortBases {
    pub p2p: u16,
    pub rpc: u16,
    pub rest: u16,
    pub grpc: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            p2p: 26656,
            rpc: 26657,
            rest: 1317,
            grpc: 9090,
        }
    }
}

impl PortBases {
    /// Ports for the node at `index`.
    pub fn for_index(&self, index: u32) -> NodePorts {
        let offset = (100 * index) as u16;
        NodePorts {
            p2p: self.p2p + offset,
            rpc: self.rpc + offset,
            rest: self.rest + offset,
            grpc: self.grpc + offset,
        }
    }
}

/// Concrete host ports assigned to one node.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodePorts {
    pub p2p: u16,
    pub rpc: u16,
    pub rest: u16,
    pub grpc: u16,
}

/// Resource limits applied to node containers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU cores (e.g., "500m", "2")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory (e.g., "1Gi", "4Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Desired state of a devnet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevnetSpec {
    /// Name of the network plugin that builds binaries and writes genesis
    pub plugin: String,
    #[serde(default)]
    pub network_type: NetworkType,
    /// Number of validator nodes (0-4)
    pub validators: u32,
    /// Number of full nodes (0-10)
    #[serde(default)]
    pub full_nodes: u32,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub binary_source: BinarySource,
    /// Chain identifier propagated to child nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Snapshot to restore node state from before first start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
    /// Pre-built genesis file to use instead of plugin initialization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genesis_path: Option<String>,
    #[serde(default)]
    pub port_bases: PortBases,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    /// Free-form options forwarded to the plugin
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_options: BTreeMap<String, serde_json::Value>,
    /// When true the devnet converges to Stopped instead of Running
    #[serde(default)]
    pub stopped: bool,
}

impl DevnetSpec {
    /// Total node count this spec declares.
    pub fn node_count(&self) -> u32 {
        self.validators + self.full_nodes
    }
}

/// Devnet lifecycle phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum DevnetPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Degraded,
    Stopped,
}

impl std::fmt::Display for DevnetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DevnetPhase::Pending => "Pending",
            DevnetPhase::Provisioning => "Provisioning",
            DevnetPhase::Running => "Running",
            DevnetPhase::Degraded => "Degraded",
            DevnetPhase::Stopped => "Stopped",
        };
        write!(f, "{s}")
    }
}

/// Observed state of a devnet, written only by controllers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevnetStatus {
    #[serde(default)]
    pub phase: DevnetPhase,
    /// Number of child Node resources
    #[serde(default)]
    pub nodes: u32,
    /// Number of child nodes reporting Running
    #[serde(default)]
    pub ready_nodes: u32,
    /// Highest block height observed across nodes
    #[serde(default)]
    pub current_height: u64,
    /// SDK versions seen on this chain, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sdk_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Operator-facing detail for the current phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A declarative cluster of development blockchain nodes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devnet {
    pub meta: ResourceMeta,
    pub spec: DevnetSpec,
    #[serde(default)]
    pub status: DevnetStatus,
}

impl Devnet {
    pub fn new(name: &str, namespace: &str, spec: DevnetSpec) -> Self {
        Self {
            meta: ResourceMeta::new(name, namespace),
            spec,
            status: DevnetStatus::default(),
        }
    }
}

impl Resource for Devnet {
    const KIND: ResourceKind = ResourceKind::Devnet;

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ResourceMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bases_offset_by_index() {
        let bases = PortBases::default();
        let node2 = bases.for_index(2);
        assert_eq!(node2.p2p, 26856);
        assert_eq!(node2.rpc, 26857);
        assert_eq!(node2.rest, 1517);
        assert_eq!(node2.grpc, 9290);
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = DevnetSpec {
            plugin: "stable".to_string(),
            validators: 2,
            full_nodes: 1,
            mode: ExecutionMode::Docker,
            chain_id: Some("test-1".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: DevnetSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
        assert_eq!(back.node_count(), 3);
    }
}
