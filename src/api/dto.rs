//! Request and response bodies for the API.
//!
//! Request specs deliberately carry loose types (strings, signed
//! integers) so the validation pipeline can report value-domain problems
//! with field paths instead of opaque deserialization failures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::{
    BinarySource, DevnetSpec, ExecutionMode, NetworkType, PortBases, ResourceLimits,
    TransactionSpec, UpgradeSpec,
};

// ============================================================================
// Devnets
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDevnetRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub spec: DevnetSpecRequest,
}

/// Loosely-typed devnet spec as received on the wire. All fields are
/// optional so the same shape serves create (full) and update (partial).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetSpecRequest {
    #[serde(default)]
    pub plugin: String,
    pub network_type: Option<String>,
    pub validators: Option<i64>,
    pub full_nodes: Option<i64>,
    pub mode: Option<String>,
    pub binary_source: Option<BinarySource>,
    pub chain_id: Option<String>,
    pub snapshot_url: Option<String>,
    pub genesis_path: Option<String>,
    pub port_bases: Option<PortBases>,
    pub resources: Option<ResourceLimits>,
    pub plugin_options: Option<BTreeMap<String, serde_json::Value>>,
}

impl DevnetSpecRequest {
    /// Convert into the typed spec. Only meaningful after the validation
    /// pipeline has accepted the request.
    pub fn into_spec(self) -> DevnetSpec {
        let mut spec = DevnetSpec {
            validators: self.validators.unwrap_or(0).max(0) as u32,
            full_nodes: self.full_nodes.unwrap_or(0).max(0) as u32,
            ..Default::default()
        };
        self.apply_overrides(&mut spec);
        spec.plugin = self.plugin;
        spec
    }

    /// Merge the provided fields onto an existing spec; absent fields are
    /// left untouched. Used by partial update.
    pub fn merge_into(self, spec: &mut DevnetSpec) {
        if !self.plugin.is_empty() {
            spec.plugin = self.plugin.clone();
        }
        if let Some(v) = self.validators {
            spec.validators = v.max(0) as u32;
        }
        if let Some(v) = self.full_nodes {
            spec.full_nodes = v.max(0) as u32;
        }
        self.apply_overrides(spec);
    }

    fn apply_overrides(&self, spec: &mut DevnetSpec) {
        if let Some(mode) = &self.mode {
            if mode == "docker" {
                spec.mode = ExecutionMode::Docker;
            } else if mode == "local" {
                spec.mode = ExecutionMode::Local;
            }
        }
        if let Some(nt) = &self.network_type {
            if nt == "mainnet" {
                spec.network_type = NetworkType::Mainnet;
            } else if nt == "testnet" {
                spec.network_type = NetworkType::Testnet;
            }
        }
        if let Some(source) = &self.binary_source {
            spec.binary_source = source.clone();
        }
        if let Some(chain_id) = &self.chain_id {
            spec.chain_id = Some(chain_id.clone());
        }
        if let Some(url) = &self.snapshot_url {
            spec.snapshot_url = Some(url.clone());
        }
        if let Some(path) = &self.genesis_path {
            spec.genesis_path = Some(path.clone());
        }
        if let Some(ports) = &self.port_bases {
            spec.port_bases = *ports;
        }
        if let Some(resources) = &self.resources {
            spec.resources = Some(resources.clone());
        }
        if let Some(options) = &self.plugin_options {
            spec.plugin_options = options.clone();
        }
    }
}

/// Partial spec update; the generation implements the read check of
/// optimistic concurrency on behalf of the client.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDevnetRequest {
    pub generation: i64,
    pub spec: DevnetSpecRequest,
}

// ============================================================================
// Upgrades
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUpgradeRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub spec: UpgradeSpecRequest,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpecRequest {
    #[serde(default)]
    pub devnet_ref: String,
    #[serde(default)]
    pub upgrade_name: String,
    pub target_height: Option<i64>,
    pub new_binary: Option<BinarySource>,
    pub with_export: Option<bool>,
    pub auto_vote: Option<bool>,
}

impl UpgradeSpecRequest {
    pub fn into_spec(self) -> UpgradeSpec {
        UpgradeSpec {
            devnet_ref: self.devnet_ref,
            upgrade_name: self.upgrade_name,
            target_height: self.target_height.unwrap_or(0).max(0) as u64,
            new_binary: self.new_binary.unwrap_or_default(),
            with_export: self.with_export.unwrap_or(false),
            auto_vote: self.auto_vote.unwrap_or(true),
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub spec: TransactionSpecRequest,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSpecRequest {
    #[serde(default)]
    pub devnet_ref: String,
    #[serde(default)]
    pub tx_type: String,
    #[serde(default)]
    pub signer: String,
    /// Hex-encoded opaque payload
    pub payload: Option<String>,
}

impl TransactionSpecRequest {
    pub fn into_spec(self) -> TransactionSpec {
        TransactionSpec {
            devnet_ref: self.devnet_ref,
            tx_type: self.tx_type,
            signer: self.signer,
            payload: self
                .payload
                .as_deref()
                .and_then(|p| hex::decode(p).ok())
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub namespaces: Vec<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Generic list envelope.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

/// Daemon health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Node health detail.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthResponse {
    pub phase: String,
    pub block_height: u64,
    pub peer_count: u32,
    pub catching_up: bool,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_restart_time: Option<chrono::DateTime<chrono::Utc>>,
}
