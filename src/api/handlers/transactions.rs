//! Transaction service handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::dto::{CreateTransactionRequest, ListResponse};
use crate::auth::Principal;
use crate::controller::ControllerState;
use crate::error::{Error, Result};
use crate::resources::{default_namespace, Transaction, TransactionPhase};
use crate::validation::{
    check_namespace_access, validate_transaction_create, ValidationContext,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub devnet: Option<String>,
}

pub async fn create(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Json(mut req): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse> {
    req.namespace = default_namespace(&req.namespace);
    let ctx = ValidationContext {
        store: &state.store,
        plugins: &state.plugins,
        principal: &principal,
    };
    validate_transaction_create(&ctx, &req)?;

    let tx = Transaction::new(&req.name, &req.namespace, req.spec.into_spec());
    let created = state.store.create(tx)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Transaction>> {
    check_namespace_access(&principal, &namespace)?;
    Ok(Json(state.store.get(&namespace, &name)?))
}

pub async fn list(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Transaction>>> {
    let namespace = default_namespace(query.namespace.as_deref().unwrap_or_default());
    check_namespace_access(&principal, &namespace)?;

    let items = match &query.devnet {
        Some(devnet) => state
            .store
            .list_transactions_by_devnet(&namespace, devnet)?,
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
    state.store.delete::<Transaction>(&namespace, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Hand the payload to the chain. Pending → Submitted; confirmation is
/// reported back by the submitting tooling.
pub async fn submit(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Transaction>> {
    check_namespace_access(&principal, &namespace)?;
    let tx: Transaction = state.store.get(&namespace, &name)?;
    if tx.status.phase != TransactionPhase::Pending {
        return Err(Error::Conflict {
            kind: "transaction",
            key: format!("{namespace}/{name}"),
            stored: tx.meta.generation,
            requested: tx.meta.generation,
        });
    }

    let updated = state
        .store
        .update_with::<Transaction, _>(&namespace, &name, |t| {
            t.status.phase = TransactionPhase::Submitted;
        })?;
    Ok(Json(updated))
}
