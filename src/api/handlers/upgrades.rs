//! Upgrade service handlers.
//!
//! The daemon tracks upgrade lifecycle state; proposal submission and
//! vote casting against the chain are driven by the plugin's tooling
//! outside this process, which reports back through status updates.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::dto::{CreateUpgradeRequest, ListResponse};
use crate::auth::Principal;
use crate::controller::ControllerState;
use crate::error::{Error, Result};
use crate::resources::{default_namespace, Devnet, Upgrade, UpgradePhase};
use crate::validation::{check_namespace_access, validate_upgrade_create, ValidationContext};

/// Auto-picked target heights land this far above the observed height,
/// leaving room for the proposal to pass.
const AUTO_HEIGHT_MARGIN: u64 = 20;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub devnet: Option<String>,
}

pub async fn create(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Json(mut req): Json<CreateUpgradeRequest>,
) -> Result<impl IntoResponse> {
    req.namespace = default_namespace(&req.namespace);
    let ctx = ValidationContext {
        store: &state.store,
        plugins: &state.plugins,
        principal: &principal,
    };
    validate_upgrade_create(&ctx, &req)?;

    let upgrade = Upgrade::new(&req.name, &req.namespace, req.spec.into_spec());
    let created = state.store.create(upgrade)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Upgrade>> {
    check_namespace_access(&principal, &namespace)?;
    Ok(Json(state.store.get(&namespace, &name)?))
}

pub async fn list(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Upgrade>>> {
    let namespace = default_namespace(query.namespace.as_deref().unwrap_or_default());
    check_namespace_access(&principal, &namespace)?;

    let items = match &query.devnet {
        Some(devnet) => state.store.list_upgrades_by_devnet(&namespace, devnet)?,
        None => state.store.list(Some(namespace.as_str()))?,
    };
    Ok(Json(ListResponse::new(items)))
}

pub async fn delete_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    check_namespace_access(&principal, &namespace)?;
    state.store.delete::<Upgrade>(&namespace, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pending → Proposing; resolves an automatic target height from the
/// devnet's current height.
pub async fn submit(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Upgrade>> {
    check_namespace_access(&principal, &namespace)?;
    let upgrade: Upgrade = state.store.get(&namespace, &name)?;
    if upgrade.status.phase != UpgradePhase::Pending {
        return Err(Error::Conflict {
            kind: "upgrade",
            key: format!("{namespace}/{name}"),
            stored: upgrade.meta.generation,
            requested: upgrade.meta.generation,
        });
    }

    let devnet: Devnet = state.store.get(&namespace, &upgrade.spec.devnet_ref)?;
    let target_height = if upgrade.spec.target_height > 0 {
        upgrade.spec.target_height
    } else {
        devnet.status.current_height + AUTO_HEIGHT_MARGIN
    };

    let updated = state
        .store
        .update_with::<Upgrade, _>(&namespace, &name, |u| {
            u.status.phase = UpgradePhase::Proposing;
            u.status.target_height = target_height;
            u.status.current_height = devnet.status.current_height;
        })?;
    Ok(Json(updated))
}

/// Abort an in-flight upgrade.
pub async fn cancel(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Upgrade>> {
    check_namespace_access(&principal, &namespace)?;
    let upgrade: Upgrade = state.store.get(&namespace, &name)?;
    if matches!(
        upgrade.status.phase,
        UpgradePhase::Completed | UpgradePhase::Failed
    ) {
        return Err(Error::Conflict {
            kind: "upgrade",
            key: format!("{namespace}/{name}"),
            stored: upgrade.meta.generation,
            requested: upgrade.meta.generation,
        });
    }

    let updated = state
        .store
        .update_with::<Upgrade, _>(&namespace, &name, |u| {
            u.status.phase = UpgradePhase::Failed;
            u.status.message = Some("cancelled by operator".to_string());
        })?;
    Ok(Json(updated))
}
