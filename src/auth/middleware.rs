//! Request authentication for the API listeners.
//!
//! Both listeners share one router; each tags its connections with a
//! [`ConnKind`] extension. Local (unix socket) calls bypass authentication
//! and act with wildcard authority. Remote calls must present a bearer
//! token from the credential store.
//!
//! Every failure path returns the same opaque message so nothing about
//! the token structure leaks through error oracles; the specific cause is
//! only logged.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::{Error, Result};

use super::credentials::{validate_token_format, CredentialStore};

/// How the connection reached the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnKind {
    /// Local unix-socket endpoint; trusted implicitly
    Local,
    /// TCP endpoint; bearer required
    Remote,
}

/// The authenticated caller, attached to every request after the
/// middleware runs.
#[derive(Clone, Debug)]
pub struct Principal {
    pub name: String,
    pub namespaces: Vec<String>,
}

impl Principal {
    /// Implicit principal for local connections.
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            namespaces: vec!["*".to_string()],
        }
    }

    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .iter()
            .any(|ns| ns == "*" || ns == namespace)
    }
}

/// Bearer authentication middleware, applied to the whole API router.
pub async fn authenticate(
    State(credentials): State<Arc<CredentialStore>>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let kind = request
        .extensions()
        .get::<ConnKind>()
        .copied()
        .unwrap_or(ConnKind::Remote);

    let principal = match kind {
        ConnKind::Local => Principal::local(),
        ConnKind::Remote => {
            let header = request
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            resolve_bearer(&credentials, header)?
        }
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Resolve an `authorization` header value to a principal. All failures
/// collapse into [`Error::Unauthenticated`].
fn resolve_bearer(credentials: &CredentialStore, header: Option<&str>) -> Result<Principal> {
    let header = header.ok_or_else(|| {
        debug!("authentication: missing authorization header");
        Error::Unauthenticated
    })?;

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        debug!("authentication: unsupported authorization scheme");
        Error::Unauthenticated
    })?;

    if !validate_token_format(token) {
        debug!("authentication: malformed token");
        return Err(Error::Unauthenticated);
    }

    let credential = credentials.get(token).ok_or_else(|| {
        debug!("authentication: unknown token");
        Error::Unauthenticated
    })?;

    Ok(Principal {
        name: credential.name,
        namespaces: credential.namespaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_credentials() -> (tempfile::TempDir, Arc<CredentialStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&dir.path().join("api-keys.yaml")).unwrap();
        (dir, Arc::new(store))
    }

    /// Every failure mode must produce the identical opaque message.
    #[test]
    fn failure_message_is_uniform() {
        let (_dir, creds) = scratch_credentials();
        let cases: Vec<Option<&str>> = vec![
            None,
            Some("Basic abc"),
            Some("Bearer not-a-token"),
            Some("Bearer devnet_0123456789abcdef0123456789abcdef"),
        ];
        for header in cases {
            let err = resolve_bearer(&creds, header).unwrap_err();
            assert_eq!(err.to_string(), "authentication failed");
        }
    }

    #[test]
    fn known_token_resolves() {
        let (_dir, creds) = scratch_credentials();
        let cred = creds.create("alice", vec!["team-a".to_string()]).unwrap();
        let header = format!("Bearer {}", cred.key);
        let principal = resolve_bearer(&creds, Some(&header)).unwrap();
        assert_eq!(principal.name, "alice");
        assert!(principal.allows_namespace("team-a"));
        assert!(!principal.allows_namespace("team-b"));
    }

    #[test]
    fn local_principal_has_wildcard() {
        let p = Principal::local();
        assert!(p.allows_namespace("default"));
        assert!(p.allows_namespace("team-b"));
    }
}
