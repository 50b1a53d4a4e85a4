//! Credential persistence and request authentication.

mod credentials;
mod middleware;

pub use credentials::{
    validate_token_format, Credential, CredentialStore, TOKEN_LEN, TOKEN_PREFIX,
};
pub use middleware::{authenticate, ConnKind, Principal};
