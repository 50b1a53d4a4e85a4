//! Devnet service handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::api::dto::{CreateDevnetRequest, ListResponse, UpdateDevnetRequest};
use crate::auth::Principal;
use crate::controller::{cascade_delete_devnet, ControllerState};
use crate::error::{Error, Result};
use crate::resources::{default_namespace, Devnet, DevnetPhase};
use crate::validation::{
    check_namespace_access, validate_devnet_create, validate_devnet_update, ValidationContext,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
}

pub async fn create(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Json(mut req): Json<CreateDevnetRequest>,
) -> Result<impl IntoResponse> {
    req.namespace = default_namespace(&req.namespace);
    let ctx = ValidationContext {
        store: &state.store,
        plugins: &state.plugins,
        principal: &principal,
    };
    validate_devnet_create(&ctx, &req)?;

    let devnet = Devnet::new(&req.name, &req.namespace, req.spec.into_spec());
    let created = state.store.create(devnet)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Upsert: create when absent, otherwise merge the spec onto the stored
/// resource under the server-observed generation.
pub async fn apply(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut req): Json<CreateDevnetRequest>,
) -> Result<impl IntoResponse> {
    req.name = name.clone();
    req.namespace = default_namespace(&namespace);
    let ctx = ValidationContext {
        store: &state.store,
        plugins: &state.plugins,
        principal: &principal,
    };

    match state.store.get::<Devnet>(&req.namespace, &name) {
        Ok(_) => {
            validate_devnet_update(&ctx, &req.namespace, &req.spec)?;
            let spec = req.spec;
            let updated = state
                .store
                .update_with::<Devnet, _>(&req.namespace, &name, |d| {
                    spec.clone().merge_into(&mut d.spec);
                })?;
            Ok((StatusCode::OK, Json(updated)))
        }
        Err(Error::NotFound { .. }) => {
            validate_devnet_create(&ctx, &req)?;
            let devnet = Devnet::new(&req.name, &req.namespace, req.spec.into_spec());
            let created = state.store.create(devnet)?;
            Ok((StatusCode::CREATED, Json(created)))
        }
        Err(e) => Err(e),
    }
}

pub async fn get_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Devnet>> {
    check_namespace_access(&principal, &namespace)?;
    Ok(Json(state.store.get(&namespace, &name)?))
}

pub async fn list(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Devnet>>> {
    let namespace = default_namespace(query.namespace.as_deref().unwrap_or_default());
    check_namespace_access(&principal, &namespace)?;
    let items = state.store.list(Some(namespace.as_str()))?;
    Ok(Json(ListResponse::new(items)))
}

/// Partial spec update under client-supplied optimistic concurrency.
pub async fn update(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<UpdateDevnetRequest>,
) -> Result<Json<Devnet>> {
    let ctx = ValidationContext {
        store: &state.store,
        plugins: &state.plugins,
        principal: &principal,
    };
    validate_devnet_update(&ctx, &namespace, &req.spec)?;

    let mut devnet: Devnet = state.store.get(&namespace, &name)?;
    // Carry the client's generation so a stale read is rejected by the
    // store instead of silently overwritten.
    devnet.meta.generation = req.generation;
    req.spec.merge_into(&mut devnet.spec);
    Ok(Json(state.store.update(devnet)?))
}

/// Delete with cascade to every child in the namespace.
pub async fn delete_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    check_namespace_access(&principal, &namespace)?;
    cascade_delete_devnet(&state, &namespace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stopped → Pending, re-entering reconciliation.
pub async fn start(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Devnet>> {
    check_namespace_access(&principal, &namespace)?;
    let updated = state
        .store
        .update_with::<Devnet, _>(&namespace, &name, |d| {
            d.spec.stopped = false;
            d.status.phase = DevnetPhase::Pending;
            d.status.message = None;
        })?;
    Ok(Json(updated))
}

pub async fn stop(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Devnet>> {
    check_namespace_access(&principal, &namespace)?;
    let updated = state
        .store
        .update_with::<Devnet, _>(&namespace, &name, |d| {
            d.spec.stopped = true;
        })?;
    Ok(Json(updated))
}

/// Server-streaming provisioning log. Lagging clients get a resync
/// marker instead of blocking the controller.
pub async fn provision_logs(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    check_namespace_access(&principal, &namespace)?;
    // Ensure the devnet exists so a typo is a 404, not a silent stream.
    state.store.get::<Devnet>(&namespace, &name)?;

    let rx = state.provision_logs.subscribe(&format!("{namespace}/{name}"));
    let stream = BroadcastStream::new(rx).map(|item| {
        Ok(match item {
            Ok(line) => Event::default().data(line),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Event::default().data(format!("stream lagged, {missed} lines dropped"))
            }
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
