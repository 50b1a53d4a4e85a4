//! Resource model for the control plane.
//!
//! Four stored kinds share [`ResourceMeta`] and the [`Resource`] trait:
//! `Devnet` is the aggregate root; `Node`, `Upgrade` and `Transaction`
//! are its children, linked back by name reference.

mod devnet;
mod meta;
mod node;
mod transaction;
mod upgrade;

pub use devnet::{
    BinarySource, Devnet, DevnetPhase, DevnetSpec, DevnetStatus, ExecutionMode, NetworkType,
    NodePorts, PortBases, ResourceLimits,
};
pub use meta::{
    default_namespace, set_condition, Condition, ConditionStatus, ConditionType, ResourceMeta,
    DEFAULT_NAMESPACE,
};
pub use node::{DesiredState, Node, NodePhase, NodeRole, NodeSpec, NodeStatus};
pub use transaction::{Transaction, TransactionPhase, TransactionSpec, TransactionStatus};
pub use upgrade::{Upgrade, UpgradePhase, UpgradeSpec, UpgradeStatus};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The closed set of stored resource kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Devnet,
    Node,
    Upgrade,
    Transaction,
}

impl ResourceKind {
    /// Singular lowercase name, used in error messages and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Devnet => "devnet",
            ResourceKind::Node => "node",
            ResourceKind::Upgrade => "upgrade",
            ResourceKind::Transaction => "transaction",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Implemented by every stored resource kind; gives the store and the
/// watch hub a uniform view of identity and versioning.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ResourceMeta;
    fn meta_mut(&mut self) -> &mut ResourceMeta;

    /// Name of the parent Devnet for child kinds; `None` for roots.
    /// Drives the parent-scoped secondary index in the store.
    fn parent_ref(&self) -> Option<&str> {
        None
    }

    /// `<namespace>/<name>` store key.
    fn key(&self) -> String {
        self.meta().key()
    }
}
