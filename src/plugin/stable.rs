//! Built-in generic plugin for SDK-style chains.
//!
//! Good enough for development and tests: it resolves binaries from the
//! cache, a local path or a URL, and writes a minimal genesis. Real
//! networks ship their own plugin.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::resources::{BinarySource, Devnet, Node};

use super::{default_start_command, BinaryBinder, Plugin, PluginRuntime};

pub struct StablePlugin {
    binary_name: String,
    /// Bound once the build resolves; nodes created before that pick the
    /// path up from here.
    binder: Arc<BinaryBinder>,
}

impl Default for StablePlugin {
    fn default() -> Self {
        Self {
            binary_name: "simd".to_string(),
            binder: Arc::new(BinaryBinder::default()),
        }
    }
}

#[async_trait]
impl Plugin for StablePlugin {
    fn name(&self) -> &str {
        "stable"
    }

    async fn build_binary(&self, devnet: &Devnet, cache_dir: &Path) -> Result<PathBuf> {
        let resolved = self.resolve_binary(devnet, cache_dir).await?;
        self.binder.bind(resolved.clone());
        Ok(resolved)
    }

    async fn init_genesis(&self, devnet: &Devnet, homes: &[PathBuf]) -> Result<()> {
        let chain_id = devnet
            .spec
            .chain_id
            .clone()
            .unwrap_or_else(|| self.default_chain_id());

        let genesis = match &devnet.spec.genesis_path {
            Some(path) => tokio::fs::read(path).await?,
            None => serde_json::to_vec_pretty(&serde_json::json!({
                "chain_id": chain_id,
                "genesis_time": chrono::Utc::now().to_rfc3339(),
                "initial_height": "1",
                "app_state": {},
            }))?,
        };

        for home in homes {
            let config_dir = home.join("config");
            tokio::fs::create_dir_all(&config_dir).await?;
            tokio::fs::create_dir_all(home.join("data")).await?;
            tokio::fs::write(config_dir.join("genesis.json"), &genesis).await?;
        }
        info!(%chain_id, nodes = homes.len(), "initialized genesis");
        Ok(())
    }

    fn runtime(&self) -> Option<Arc<dyn PluginRuntime>> {
        Some(Arc::new(StableRuntime {
            binder: self.binder.clone(),
        }))
    }
}

impl StablePlugin {
    async fn resolve_binary(&self, devnet: &Devnet, cache_dir: &Path) -> Result<PathBuf> {
        match &devnet.spec.binary_source {
            BinarySource::Local { path } => {
                let path = PathBuf::from(path);
                if !path.is_file() {
                    return Err(Error::Config(format!(
                        "binary {} does not exist",
                        path.display()
                    )));
                }
                Ok(path)
            }
            BinarySource::Cache => {
                let cached = cache_dir.join(self.name()).join(&self.binary_name);
                if !cached.is_file() {
                    return Err(Error::Config(format!(
                        "no cached binary at {}",
                        cached.display()
                    )));
                }
                Ok(cached)
            }
            BinarySource::Url { url } => {
                let target_dir = cache_dir.join(self.name());
                tokio::fs::create_dir_all(&target_dir).await?;
                let target = target_dir.join(&self.binary_name);
                info!(%url, target = %target.display(), "downloading chain binary");

                let response = reqwest::get(url)
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::Runtime(format!("binary download failed: {e}")))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Runtime(format!("binary download failed: {e}")))?;
                tokio::fs::write(&target, &bytes).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(
                        &target,
                        std::fs::Permissions::from_mode(0o755),
                    )
                    .await?;
                }
                Ok(target)
            }
            BinarySource::GithubRelease { tag } => Err(Error::Config(format!(
                "stable plugin cannot resolve github release {tag}; use a url or local source"
            ))),
        }
    }
}

/// Default SDK-style runtime shaping; everything but the start command is
/// the trait default.
struct StableRuntime {
    binder: Arc<BinaryBinder>,
}

impl PluginRuntime for StableRuntime {
    fn start_command(&self, node: &Node) -> Vec<String> {
        let mut args = default_start_command(node);
        // Nodes created before the build finished get the late-bound path.
        if args[0].is_empty() {
            if let Some(binary) = self.binder.get() {
                args[0] = binary.to_string_lossy().into_owned();
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DevnetSpec;

    #[tokio::test]
    async fn genesis_written_to_each_home() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = StablePlugin::default();
        let devnet = Devnet::new(
            "d1",
            "default",
            DevnetSpec {
                plugin: "stable".to_string(),
                chain_id: Some("test-1".to_string()),
                validators: 2,
                ..Default::default()
            },
        );
        let homes = vec![dir.path().join("node0"), dir.path().join("node1")];
        plugin.init_genesis(&devnet, &homes).await.unwrap();

        for home in &homes {
            let raw = std::fs::read(home.join("config/genesis.json")).unwrap();
            let genesis: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(genesis["chain_id"], "test-1");
        }
    }

    #[tokio::test]
    async fn missing_local_binary_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = StablePlugin::default();
        let devnet = Devnet::new(
            "d1",
            "default",
            DevnetSpec {
                plugin: "stable".to_string(),
                binary_source: BinarySource::Local {
                    path: "/nonexistent/simd".to_string(),
                },
                ..Default::default()
            },
        );
        let err = plugin.build_binary(&devnet, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
