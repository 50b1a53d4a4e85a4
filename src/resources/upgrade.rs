//! Upgrade resource: a coordinated chain upgrade, child of a Devnet.

use serde::{Deserialize, Serialize};

use super::devnet::BinarySource;
use super::meta::ResourceMeta;
use super::{Resource, ResourceKind};

/// Desired state of an upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    /// Name of the parent Devnet in the same namespace
    pub devnet_ref: String,
    /// On-chain upgrade handler name
    pub upgrade_name: String,
    /// Height at which the chain halts and switches; 0 picks one
    /// automatically a short distance above the current height
    #[serde(default)]
    pub target_height: u64,
    /// Where the post-upgrade binary comes from
    #[serde(default)]
    pub new_binary: BinarySource,
    /// Export chain state before and after the switch
    #[serde(default)]
    pub with_export: bool,
    /// Vote yes from every validator once the proposal is live
    #[serde(default)]
    pub auto_vote: bool,
}

/// Upgrade lifecycle phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum UpgradePhase {
    #[default]
    Pending,
    Proposing,
    Voting,
    Waiting,
    Switching,
    Verifying,
    Completed,
    Failed,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpgradePhase::Pending => "Pending",
            UpgradePhase::Proposing => "Proposing",
            UpgradePhase::Voting => "Voting",
            UpgradePhase::Waiting => "Waiting",
            UpgradePhase::Switching => "Switching",
            UpgradePhase::Verifying => "Verifying",
            UpgradePhase::Completed => "Completed",
            UpgradePhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Observed state of an upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    #[serde(default)]
    pub phase: UpgradePhase,
    /// Governance proposal id once submitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<u64>,
    #[serde(default)]
    pub yes_votes: u32,
    #[serde(default)]
    pub no_votes: u32,
    #[serde(default)]
    pub current_height: u64,
    #[serde(default)]
    pub target_height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_export_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_export_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A coordinated chain upgrade tracked by the daemon.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Upgrade {
    pub meta: ResourceMeta,
    pub spec: UpgradeSpec,
    #[serde(default)]
    pub status: UpgradeStatus,
}

impl Upgrade {
    pub fn new(name: &str, namespace: &str, spec: UpgradeSpec) -> Self {
        Self {
            meta: ResourceMeta::new(name, namespace),
            spec,
            status: UpgradeStatus::default(),
        }
    }
}

impl Resource for Upgrade {
    const KIND: ResourceKind = ResourceKind::Upgrade;

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
