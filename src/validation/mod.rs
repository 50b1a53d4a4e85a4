//! Request validation pipeline.
//!
//! Four sequential stages run before any mutation: field presence and
//! format, value domains, cross-resource references, then namespace
//! authorization. The first failing stage short-circuits, but each stage
//! accumulates everything it finds so one response can report several
//! problems from the same layer.

use serde::Serialize;

use crate::api::dto::{
    CreateDevnetRequest, CreateTransactionRequest, CreateUpgradeRequest, DevnetSpecRequest,
};
use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::plugin::PluginRegistry;
use crate::resources::Devnet;
use crate::store::Store;

/// Closed set of validation failure codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Required,
    InvalidRange,
    InvalidValue,
    InvalidFormat,
    NotFound,
    MutuallyExclusive,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Required => "required",
            ErrorCode::InvalidRange => "invalid_range",
            ErrorCode::InvalidValue => "invalid_value",
            ErrorCode::InvalidFormat => "invalid_format",
            ErrorCode::NotFound => "not_found",
            ErrorCode::MutuallyExclusive => "mutually_exclusive",
        };
        write!(f, "{s}")
    }
}

/// One field-level problem.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code,
            message: message.into(),
        }
    }

    fn required(field: &str) -> Self {
        Self::new(field, ErrorCode::Required, format!("{field} is required"))
    }
}

/// The flattened multi-error carried by [`Error::Validation`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, err: ValidationError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// Short-circuit helper: `stage(errs)?` between stages.
    fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "validation failed"),
            [single] => write!(f, "{}: {} ({})", single.field, single.message, single.code),
            many => {
                writeln!(f, "validation failed:")?;
                for err in many {
                    writeln!(f, "  - {}: {} ({})", err.field, err.message, err.code)?;
                }
                Ok(())
            }
        }
    }
}

/// Dependencies consulted by the reference and authorization stages.
pub struct ValidationContext<'a> {
    pub store: &'a Store,
    pub plugins: &'a PluginRegistry,
    pub principal: &'a Principal,
}

// ============================================================================
// Shared field checks
// ============================================================================

/// RFC-1123-style label: lowercase alphanumeric and dashes, must start and
/// end alphanumeric, at most 63 characters.
fn check_name(field: &str, value: &str, errs: &mut ValidationErrors) {
    if value.is_empty() {
        errs.push(ValidationError::required(field));
        return;
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric());
    if value.len() > 63 || !valid_chars || !valid_edges {
        errs.push(ValidationError::new(
            field,
            ErrorCode::InvalidFormat,
            "must be a lowercase dns label (alphanumeric and dashes, max 63 chars)",
        ));
    }
}

/// Authorization stage shared by every operation, including reads.
pub fn check_namespace_access(principal: &Principal, namespace: &str) -> Result<()> {
    if principal.allows_namespace(namespace) {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            principal: principal.name.clone(),
            namespace: namespace.to_string(),
        })
    }
}

// ============================================================================
// Devnet
// ============================================================================

pub fn validate_devnet_create(ctx: &ValidationContext<'_>, req: &CreateDevnetRequest) -> Result<()> {
    // Stage 1: fields
    let mut errs = ValidationErrors::default();
    check_name("name", &req.name, &mut errs);
    check_name("namespace", &req.namespace, &mut errs);
    if req.spec.plugin.is_empty() {
        errs.push(ValidationError::required("spec.plugin"));
    }
    errs.into_result()?;

    // Stage 2: semantics
    devnet_semantic_stage(&req.spec)?;

    // Stage 3: references
    let mut errs = ValidationErrors::default();
    if !ctx.plugins.contains(&req.spec.plugin) {
        errs.push(ValidationError::new(
            "spec.plugin",
            ErrorCode::NotFound,
            format!("plugin {} is not registered", req.spec.plugin),
        ));
    }
    errs.into_result()?;

    // Stage 4: authorization
    check_namespace_access(ctx.principal, &req.namespace)
}

pub fn validate_devnet_update(
    ctx: &ValidationContext<'_>,
    namespace: &str,
    spec: &DevnetSpecRequest,
) -> Result<()> {
    devnet_semantic_stage(spec)?;

    if !spec.plugin.is_empty() && !ctx.plugins.contains(&spec.plugin) {
        let mut errs = ValidationErrors::default();
        errs.push(ValidationError::new(
            "spec.plugin",
            ErrorCode::NotFound,
            format!("plugin {} is not registered", spec.plugin),
        ));
        errs.into_result()?;
    }

    check_namespace_access(ctx.principal, namespace)
}

fn devnet_semantic_stage(spec: &DevnetSpecRequest) -> Result<()> {
    let mut errs = ValidationErrors::default();

    if let Some(mode) = &spec.mode {
        if mode != "docker" && mode != "local" {
            errs.push(ValidationError::new(
                "spec.mode",
                ErrorCode::InvalidValue,
                format!("mode {mode} is not one of docker, local"),
            ));
        }
    }
    if let Some(nt) = &spec.network_type {
        if nt != "mainnet" && nt != "testnet" {
            errs.push(ValidationError::new(
                "spec.networkType",
                ErrorCode::InvalidValue,
                format!("network type {nt} is not one of mainnet, testnet"),
            ));
        }
    }
    if let Some(validators) = spec.validators {
        if !(0..=4).contains(&validators) {
            errs.push(ValidationError::new(
                "spec.validators",
                ErrorCode::InvalidRange,
                "validators must be between 0 and 4",
            ));
        }
    }
    if let Some(full_nodes) = spec.full_nodes {
        if !(0..=10).contains(&full_nodes) {
            errs.push(ValidationError::new(
                "spec.fullNodes",
                ErrorCode::InvalidRange,
                "full nodes must be between 0 and 10",
            ));
        }
    }
    if spec.snapshot_url.is_some() && spec.genesis_path.is_some() {
        errs.push(ValidationError::new(
            "spec.snapshotUrl",
            ErrorCode::MutuallyExclusive,
            "snapshot url and genesis path cannot both be set",
        ));
    }

    errs.into_result()
}

// ============================================================================
// Upgrade
// ============================================================================

pub fn validate_upgrade_create(
    ctx: &ValidationContext<'_>,
    req: &CreateUpgradeRequest,
) -> Result<()> {
    let mut errs = ValidationErrors::default();
    check_name("name", &req.name, &mut errs);
    if req.spec.devnet_ref.is_empty() {
        errs.push(ValidationError::required("spec.devnet_ref"));
    }
    if req.spec.upgrade_name.is_empty() {
        errs.push(ValidationError::required("spec.upgradeName"));
    }
    errs.into_result()?;

    let mut errs = ValidationErrors::default();
    if let Some(height) = req.spec.target_height {
        if height < 0 {
            errs.push(ValidationError::new(
                "spec.targetHeight",
                ErrorCode::InvalidRange,
                "target height must be >= 0",
            ));
        }
    }
    errs.into_result()?;

    reference_devnet_stage(ctx, &req.namespace, &req.spec.devnet_ref)?;

    check_namespace_access(ctx.principal, &req.namespace)
}

// ============================================================================
// Transaction
// ============================================================================

pub fn validate_transaction_create(
    ctx: &ValidationContext<'_>,
    req: &CreateTransactionRequest,
) -> Result<()> {
    let mut errs = ValidationErrors::default();
    check_name("name", &req.name, &mut errs);
    if req.spec.devnet_ref.is_empty() {
        errs.push(ValidationError::required("spec.devnet_ref"));
    }
    if req.spec.tx_type.is_empty() {
        errs.push(ValidationError::required("spec.txType"));
    }
    if req.spec.signer.is_empty() {
        errs.push(ValidationError::required("spec.signer"));
    }
    errs.into_result()?;

    let mut errs = ValidationErrors::default();
    if let Some(payload) = &req.spec.payload {
        if hex::decode(payload).is_err() {
            errs.push(ValidationError::new(
                "spec.payload",
                ErrorCode::InvalidFormat,
                "payload must be hex-encoded",
            ));
        }
    }
    errs.into_result()?;

    reference_devnet_stage(ctx, &req.namespace, &req.spec.devnet_ref)?;

    check_namespace_access(ctx.principal, &req.namespace)
}

/// Reference stage shared by child kinds: the parent devnet must exist in
/// the request namespace.
fn reference_devnet_stage(
    ctx: &ValidationContext<'_>,
    namespace: &str,
    devnet_ref: &str,
) -> Result<()> {
    let mut errs = ValidationErrors::default();
    if ctx.store.get::<Devnet>(namespace, devnet_ref).is_err() {
        errs.push(ValidationError::new(
            "spec.devnet_ref",
            ErrorCode::NotFound,
            format!("devnet {devnet_ref} does not exist in namespace {namespace}"),
        ));
    }
    errs.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dto::UpgradeSpecRequest;
    use crate::plugin::StablePlugin;
    use crate::resources::DevnetSpec;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        plugins: PluginRegistry,
        principal: Principal,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.redb")).unwrap();
        let plugins = PluginRegistry::default();
        plugins.register(Arc::new(StablePlugin::default()));
        Fixture {
            _dir: dir,
            store,
            plugins,
            principal: Principal::local(),
        }
    }

    fn devnet_request(fx: &Fixture) -> (ValidationContext<'_>, CreateDevnetRequest) {
        let ctx = ValidationContext {
            store: &fx.store,
            plugins: &fx.plugins,
            principal: &fx.principal,
        };
        let req = CreateDevnetRequest {
            name: "d1".to_string(),
            namespace: "default".to_string(),
            spec: DevnetSpecRequest {
                plugin: "stable".to_string(),
                validators: Some(2),
                full_nodes: Some(1),
                mode: Some("docker".to_string()),
                ..Default::default()
            },
        };
        (ctx, req)
    }

    fn first_error(err: Error) -> ValidationError {
        match err {
            Error::Validation(errs) => errs.iter().next().cloned().unwrap(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_devnet_passes() {
        let fx = fixture();
        let (ctx, req) = devnet_request(&fx);
        validate_devnet_create(&ctx, &req).unwrap();
    }

    #[test]
    fn invalid_mode_reports_field() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.spec.mode = Some("invalid".to_string());
        let err = first_error(validate_devnet_create(&ctx, &req).unwrap_err());
        assert_eq!(err.field, "spec.mode");
        assert_eq!(err.code, ErrorCode::InvalidValue);
    }

    #[test]
    fn validators_out_of_range() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.spec.validators = Some(5);
        let err = first_error(validate_devnet_create(&ctx, &req).unwrap_err());
        assert_eq!(err.field, "spec.validators");
        assert_eq!(err.code, ErrorCode::InvalidRange);
    }

    #[test]
    fn field_stage_short_circuits_before_semantics() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.name = String::new();
        req.spec.validators = Some(99);
        let err = validate_devnet_create(&ctx, &req).unwrap_err();
        let Error::Validation(errs) = err else {
            panic!("expected validation error")
        };
        // Only the field stage reported; the range problem is not reached.
        assert!(errs.iter().all(|e| e.code == ErrorCode::Required));
    }

    #[test]
    fn one_stage_accumulates_multiple_errors() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.spec.validators = Some(5);
        req.spec.full_nodes = Some(11);
        let err = validate_devnet_create(&ctx, &req).unwrap_err();
        let Error::Validation(errs) = err else {
            panic!("expected validation error")
        };
        assert_eq!(errs.iter().count(), 2);
        let rendered = errs.to_string();
        assert!(rendered.contains("spec.validators"));
        assert!(rendered.contains("spec.fullNodes"));
    }

    #[test]
    fn snapshot_and_genesis_are_mutually_exclusive() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.spec.snapshot_url = Some("https://example.com/snap.tar".to_string());
        req.spec.genesis_path = Some("/tmp/genesis.json".to_string());
        let err = first_error(validate_devnet_create(&ctx, &req).unwrap_err());
        assert_eq!(err.code, ErrorCode::MutuallyExclusive);
    }

    #[test]
    fn unknown_plugin_is_reference_error() {
        let fx = fixture();
        let (ctx, mut req) = devnet_request(&fx);
        req.spec.plugin = "mystery".to_string();
        let err = first_error(validate_devnet_create(&ctx, &req).unwrap_err());
        assert_eq!(err.field, "spec.plugin");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn upgrade_with_missing_devnet_reports_ref() {
        let fx = fixture();
        let ctx = ValidationContext {
            store: &fx.store,
            plugins: &fx.plugins,
            principal: &fx.principal,
        };
        let req = CreateUpgradeRequest {
            name: "u1".to_string(),
            namespace: "default".to_string(),
            spec: UpgradeSpecRequest {
                devnet_ref: "nonexistent".to_string(),
                upgrade_name: "v2".to_string(),
                ..Default::default()
            },
        };
        let err = first_error(validate_upgrade_create(&ctx, &req).unwrap_err());
        assert_eq!(err.field, "spec.devnet_ref");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn namespace_denied_for_scoped_principal() {
        let fx = fixture();
        fx.store
            .create(Devnet::new("d1", "team-b", DevnetSpec::default()))
            .unwrap();
        let principal = Principal {
            name: "alice".to_string(),
            namespaces: vec!["team-a".to_string()],
        };
        let ctx = ValidationContext {
            store: &fx.store,
            plugins: &fx.plugins,
            principal: &principal,
        };
        let req = CreateDevnetRequest {
            name: "d1".to_string(),
            namespace: "team-b".to_string(),
            spec: DevnetSpecRequest {
                plugin: "stable".to_string(),
                ..Default::default()
            },
        };
        let err = validate_devnet_create(&ctx, &req).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }
}
