//! Transaction resource: a submitted chain transaction, child of a Devnet.

use serde::{Deserialize, Serialize};

use super::meta::ResourceMeta;
use super::{Resource, ResourceKind};

/// Desired state of a transaction.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSpec {
    /// Name of the parent Devnet in the same namespace
    pub devnet_ref: String,
    /// Chain-specific transaction type (e.g., "bank-send")
    pub tx_type: String,
    /// Key name of the signing account
    pub signer: String,
    /// Opaque signed payload, hex-encoded in JSON
    #[serde(default, with = "hex_payload", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// Transaction lifecycle phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum TransactionPhase {
    #[default]
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionPhase::Pending => "Pending",
            TransactionPhase::Submitted => "Submitted",
            TransactionPhase::Confirmed => "Confirmed",
            TransactionPhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Observed state of a transaction.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    #[serde(default)]
    pub phase: TransactionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A chain transaction submitted through the daemon.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub meta: ResourceMeta,
    pub spec: TransactionSpec,
    #[serde(default)]
    pub status: TransactionStatus,
}

impl Transaction {
    pub fn new(name: &str, namespace: &str, spec: TransactionSpec) -> Self {
        Self {
            meta: ResourceMeta::new(name, namespace),
            spec,
            status: TransactionStatus::default(),
        }
    }
}

impl Resource for Transaction {
    const KIND: ResourceKind = ResourceKind::Transaction;

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

/// Hex encoding for the opaque payload blob.
mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrips_as_hex() {
        let spec = TransactionSpec {
            devnet_ref: "d1".to_string(),
            tx_type: "bank-send".to_string(),
            signer: "alice".to_string(),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["payload"], "deadbeef");
        let back: TransactionSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, spec.payload);
    }
}
