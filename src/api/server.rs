//! Axum servers for the API.
//!
//! One router is shared by two listeners: a TCP listener whose
//! connections must present a bearer token, and a unix-socket listener
//! whose connections are trusted as local. Each listener tags requests
//! with its [`ConnKind`] before the shared authentication middleware
//! runs.

use std::path::Path;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{authenticate, ConnKind};
use crate::controller::ControllerState;
use crate::error::{Error, Result};

use super::handlers;

/// Build the shared API router.
pub fn router(state: Arc<ControllerState>) -> Router {
    let v1 = Router::new()
        // Devnets
        .route(
            "/v1/devnets",
            post(handlers::devnets::create).get(handlers::devnets::list),
        )
        .route(
            "/v1/devnets/{namespace}/{name}",
            get(handlers::devnets::get_one)
                .put(handlers::devnets::apply)
                .patch(handlers::devnets::update)
                .delete(handlers::devnets::delete_one),
        )
        .route(
            "/v1/devnets/{namespace}/{name}/start",
            post(handlers::devnets::start),
        )
        .route(
            "/v1/devnets/{namespace}/{name}/stop",
            post(handlers::devnets::stop),
        )
        .route(
            "/v1/devnets/{namespace}/{name}/logs",
            get(handlers::devnets::provision_logs),
        )
        // Nodes
        .route("/v1/nodes", get(handlers::nodes::list))
        .route("/v1/nodes/{namespace}/{name}", get(handlers::nodes::get_one))
        .route(
            "/v1/nodes/{namespace}/{name}/start",
            post(handlers::nodes::start),
        )
        .route(
            "/v1/nodes/{namespace}/{name}/stop",
            post(handlers::nodes::stop),
        )
        .route(
            "/v1/nodes/{namespace}/{name}/restart",
            post(handlers::nodes::restart),
        )
        .route(
            "/v1/nodes/{namespace}/{name}/health",
            get(handlers::nodes::health),
        )
        .route(
            "/v1/nodes/{namespace}/{name}/logs",
            get(handlers::nodes::logs),
        )
        // Upgrades
        .route(
            "/v1/upgrades",
            post(handlers::upgrades::create).get(handlers::upgrades::list),
        )
        .route(
            "/v1/upgrades/{namespace}/{name}",
            get(handlers::upgrades::get_one).delete(handlers::upgrades::delete_one),
        )
        .route(
            "/v1/upgrades/{namespace}/{name}/submit",
            post(handlers::upgrades::submit),
        )
        .route(
            "/v1/upgrades/{namespace}/{name}/cancel",
            post(handlers::upgrades::cancel),
        )
        // Transactions
        .route(
            "/v1/transactions",
            post(handlers::transactions::create).get(handlers::transactions::list),
        )
        .route(
            "/v1/transactions/{namespace}/{name}",
            get(handlers::transactions::get_one).delete(handlers::transactions::delete_one),
        )
        .route(
            "/v1/transactions/{namespace}/{name}/submit",
            post(handlers::transactions::submit),
        )
        // Credentials (wildcard principals only)
        .route(
            "/v1/credentials",
            post(handlers::credentials::create).get(handlers::credentials::list),
        )
        .route(
            "/v1/credentials/{token}",
            delete(handlers::credentials::revoke),
        )
        .layer(middleware::from_fn_with_state(
            state.credentials.clone(),
            authenticate,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the remote (authenticated) TCP endpoint.
pub async fn serve_tcp(router: Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
    info!(addr, "api listening on tcp");

    axum::serve(listener, router.layer(Extension(ConnKind::Remote)))
        .await
        .map_err(|e| Error::Config(format!("tcp server error: {e}")))
}

/// Serve the local (implicitly trusted) unix-socket endpoint.
pub async fn serve_uds(router: Router, path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = tokio::net::UnixListener::bind(path)
        .map_err(|e| Error::Config(format!("failed to bind {}: {e}", path.display())))?;
    info!(path = %path.display(), "api listening on unix socket");

    axum::serve(listener, router.layer(Extension(ConnKind::Local)))
        .await
        .map_err(|e| Error::Config(format!("unix server error: {e}")))
}
