//! Credential management handlers.
//!
//! Only wildcard principals (the local socket, or an all-namespace
//! token) may mint or revoke credentials.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use crate::api::dto::{CreateCredentialRequest, ListResponse};
use crate::auth::{Credential, Principal};
use crate::controller::ControllerState;
use crate::error::{Error, Result};

fn require_admin(principal: &Principal) -> Result<()> {
    if principal.namespaces.iter().any(|ns| ns == "*") {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            principal: principal.name.clone(),
            namespace: "*".to_string(),
        })
    }
}

pub async fn create(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateCredentialRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&principal)?;
    let credential = state.credentials.create(&req.name, req.namespaces)?;
    Ok((StatusCode::CREATED, Json(credential)))
}

pub async fn list(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ListResponse<Credential>>> {
    require_admin(&principal)?;
    Ok(Json(ListResponse::new(state.credentials.list())))
}

pub async fn revoke(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&principal)?;
    state.credentials.revoke(&token)?;
    Ok(StatusCode::NO_CONTENT)
}
