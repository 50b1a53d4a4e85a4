//! Crate-wide error type and result alias.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::validation::ValidationErrors;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors surfaced by the daemon.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} {key} conflict: stored generation {stored}, request carried {requested}")]
    Conflict {
        kind: &'static str,
        key: String,
        stored: i64,
        requested: i64,
    },

    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("namespace {namespace} denied for {principal}")]
    PermissionDenied {
        principal: String,
        namespace: String,
    },

    /// Deliberately opaque. All authentication failures collapse into this
    /// one message so the token structure cannot be probed through errors.
    #[error("authentication failed")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Store(#[from] redb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("plugin {0} not registered")]
    PluginNotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("{0} is not supported by this runtime")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a controller should retry soon rather than back off for the
    /// long interval. Transient runtime and storage hiccups are retriable;
    /// validation, auth and not-found are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::Store(_)
                | Error::Io(_)
                | Error::Docker(_)
                | Error::Runtime(_)
        )
    }

    /// Transport status for the API layer. Single mapping point for the
    /// whole error taxonomy.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. } | Error::Conflict { .. } => StatusCode::CONFLICT,
            // Request validation is always invalid-argument, including
            // reference errors; only store-level lookups are 404.
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Docker(_) | Error::Runtime(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Store(e.into())
    }
}
