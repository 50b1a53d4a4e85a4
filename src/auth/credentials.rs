//! Persistent bearer credential store.
//!
//! Credentials live in a YAML document under the daemon data directory.
//! The in-memory map is guarded by a read-write lock; every mutation is
//! persisted before returning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Fixed token prefix.
pub const TOKEN_PREFIX: &str = "devnet_";
/// Total token length: prefix + 32 hex characters.
pub const TOKEN_LEN: usize = 39;

/// A bearer credential and the namespaces it may act in.
/// A namespaces entry of `"*"` grants every namespace.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Credential {
    pub key: String,
    pub name: String,
    pub namespaces: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .iter()
            .any(|ns| ns == "*" || ns == namespace)
    }
}

/// On-disk document shape: `keys:` with one entry per credential.
#[derive(Debug, Default, Deserialize, Serialize)]
struct CredentialFile {
    keys: Vec<Credential>,
}

/// Structural token check: prefix, fixed length, hex tail. Content is
/// never inspected beyond its shape.
pub fn validate_token_format(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token.starts_with(TOKEN_PREFIX)
        && token[TOKEN_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit())
}

pub struct CredentialStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    /// Load the store from `path`, starting empty when the file does not
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let keys = match fs::read_to_string(path) {
            Ok(contents) => {
                let file: CredentialFile = serde_yaml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("malformed credential file: {e}")))?;
                file.keys.into_iter().map(|c| (c.key.clone(), c)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            keys: RwLock::new(keys),
        })
    }

    /// Generate and persist a new credential. Returns the token; it is not
    /// recoverable later other than by listing.
    pub fn create(&self, name: &str, namespaces: Vec<String>) -> Result<Credential> {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let token = format!("{TOKEN_PREFIX}{}", hex::encode(bytes));

        let credential = Credential {
            key: token.clone(),
            name: name.to_string(),
            namespaces,
            created_at: Utc::now(),
        };

        {
            let mut keys = self.keys.write().expect("credential lock poisoned");
            keys.insert(token, credential.clone());
        }
        self.save()?;
        info!(name, "created api credential");
        Ok(credential)
    }

    pub fn get(&self, token: &str) -> Option<Credential> {
        self.keys
            .read()
            .expect("credential lock poisoned")
            .get(token)
            .cloned()
    }

    pub fn list(&self) -> Vec<Credential> {
        let mut all: Vec<_> = self
            .keys
            .read()
            .expect("credential lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Remove a credential. Unknown tokens fail with not-found.
    pub fn revoke(&self, token: &str) -> Result<()> {
        {
            let mut keys = self.keys.write().expect("credential lock poisoned");
            if keys.remove(token).is_none() {
                return Err(Error::NotFound {
                    kind: "credential",
                    key: token.to_string(),
                });
            }
        }
        self.save()?;
        info!("revoked api credential");
        Ok(())
    }

    /// Atomic write: serialize to a sibling temp file, fix permissions,
    /// rename over the target. Directory is created with 0755, file 0600.
    fn save(&self) -> Result<()> {
        let file = CredentialFile {
            keys: self.list(),
        };
        let contents = serde_yaml::to_string(&file)
            .map_err(|e| Error::Config(format!("credential serialization: {e}")))?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
            }
        }

        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&dir.path().join("api-keys.yaml")).unwrap();
        (dir, store)
    }

    #[test]
    fn token_format() {
        let (_dir, store) = scratch_store();
        let cred = store.create("alice", vec!["team-a".to_string()]).unwrap();
        assert!(validate_token_format(&cred.key));
        assert_eq!(cred.key.len(), TOKEN_LEN);
        assert!(cred.key.starts_with(TOKEN_PREFIX));

        assert!(!validate_token_format("devnet_short"));
        assert!(!validate_token_format(
            "invalid_0123456789abcdef0123456789abcdef"
        ));
        assert!(!validate_token_format(
            "devnet_0123456789abcdef0123456789abcdeg"
        ));
        // case-insensitive hex
        assert!(validate_token_format(
            "devnet_0123456789ABCDEF0123456789abcdef"
        ));
    }

    #[test]
    fn create_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-keys.yaml");
        let cred = {
            let store = CredentialStore::load(&path).unwrap();
            store.create("alice", vec!["team-a".to_string()]).unwrap()
        };

        let reloaded = CredentialStore::load(&path).unwrap();
        let found = reloaded.get(&cred.key).unwrap();
        assert_eq!(found.name, "alice");
        assert_eq!(found.namespaces, vec!["team-a"]);
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = scratch_store();
        store.create("alice", vec!["*".to_string()]).unwrap();
        let mode = std::fs::metadata(dir.path().join("api-keys.yaml"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn revoke_missing_is_not_found() {
        let (_dir, store) = scratch_store();
        let err = store
            .revoke("devnet_0123456789abcdef0123456789abcdef")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn wildcard_namespace() {
        let (_dir, store) = scratch_store();
        let cred = store.create("admin", vec!["*".to_string()]).unwrap();
        assert!(cred.allows_namespace("team-a"));
        assert!(cred.allows_namespace("anything"));

        let scoped = store.create("alice", vec!["team-a".to_string()]).unwrap();
        assert!(scoped.allows_namespace("team-a"));
        assert!(!scoped.allows_namespace("team-b"));
    }
}
