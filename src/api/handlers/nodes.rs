//! Node service handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::api::dto::{ListResponse, NodeHealthResponse};
use crate::auth::Principal;
use crate::controller::ControllerState;
use crate::error::Result;
use crate::logs::LogOptions;
use crate::resources::{default_namespace, DesiredState, Devnet, Node, Resource};
use crate::validation::check_namespace_access;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    /// Restrict to children of one devnet
    pub devnet: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub follow: bool,
    pub tail: Option<usize>,
}

pub async fn list(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Node>>> {
    let namespace = default_namespace(query.namespace.as_deref().unwrap_or_default());
    check_namespace_access(&principal, &namespace)?;

    let items = match &query.devnet {
        Some(devnet) => state.store.list_nodes_by_devnet(&namespace, devnet)?,
        None => state.store.list(Some(namespace.as_str()))?,
    };
    Ok(Json(ListResponse::new(items)))
}

pub async fn get_one(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Node>> {
    check_namespace_access(&principal, &namespace)?;
    Ok(Json(state.store.get(&namespace, &name)?))
}

pub async fn start(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Node>> {
    check_namespace_access(&principal, &namespace)?;
    let updated = state
        .store
        .update_with::<Node, _>(&namespace, &name, |n| {
            n.spec.desired = DesiredState::Running;
        })?;
    Ok(Json(updated))
}

pub async fn stop(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Node>> {
    check_namespace_access(&principal, &namespace)?;
    let updated = state
        .store
        .update_with::<Node, _>(&namespace, &name, |n| {
            n.spec.desired = DesiredState::Stopped;
        })?;
    Ok(Json(updated))
}

/// Imperative restart through the runtime; the restart counter starts a
/// fresh policy window.
pub async fn restart(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Node>> {
    check_namespace_access(&principal, &namespace)?;
    let node: Node = state.store.get(&namespace, &name)?;
    let devnet: Devnet = state
        .store
        .get(&node.spec.namespace_ref, &node.spec.devnet_ref)?;

    let runtime = state.runtimes.select(&devnet);
    runtime.restart_node(&node.key()).await?;

    let updated = state
        .store
        .update_with::<Node, _>(&namespace, &name, |n| {
            n.spec.desired = DesiredState::Running;
            n.status.restart_count = 0;
            n.status.consecutive_failures = 0;
        })?;
    Ok(Json(updated))
}

pub async fn health(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<NodeHealthResponse>> {
    check_namespace_access(&principal, &namespace)?;
    let node: Node = state.store.get(&namespace, &name)?;
    Ok(Json(NodeHealthResponse {
        phase: node.status.phase.to_string(),
        block_height: node.status.block_height,
        peer_count: node.status.peer_count,
        catching_up: node.status.catching_up,
        restart_count: node.status.restart_count,
        consecutive_failures: node.status.consecutive_failures,
        last_health_check: node.status.last_health_check,
        next_restart_time: node.status.next_restart_time,
    }))
}

/// Node log stream; plain tail by default, SSE-follow with `?follow=true`.
pub async fn logs(
    State(state): State<Arc<ControllerState>>,
    Extension(principal): Extension<Principal>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    check_namespace_access(&principal, &namespace)?;
    let node: Node = state.store.get(&namespace, &name)?;
    let devnet: Devnet = state
        .store
        .get(&node.spec.namespace_ref, &node.spec.devnet_ref)?;

    let opts = LogOptions {
        tail: query.tail.unwrap_or(100),
        follow: query.follow,
    };
    let runtime = state.runtimes.select(&devnet);
    let rx = runtime.logs(&node.key(), opts).await?;

    let stream = UnboundedReceiverStream::new(rx).map(|line| Ok(Event::default().data(line)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
