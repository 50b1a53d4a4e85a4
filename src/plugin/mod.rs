//! Network plugin contracts and registry.
//!
//! A plugin knows how to build a chain binary, write genesis state, and
//! shape per-node startup. The daemon holds plugins behind these small
//! capability traits and never looks inside them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;

use crate::error::{Error, Result};
use crate::resources::{Devnet, Node, NodePorts};

/// Per-node runtime shaping supplied by a plugin.
pub trait PluginRuntime: Send + Sync {
    /// Full argv used to start the node, binary first.
    fn start_command(&self, node: &Node) -> Vec<String>;

    /// Extra environment for the node process.
    fn start_env(&self, _node: &Node) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Signal used for graceful stop.
    fn stop_signal(&self) -> Signal {
        Signal::SIGTERM
    }

    /// How long to wait after the stop signal before SIGKILL.
    fn grace_period(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// URL polled by the health prober.
    fn health_endpoint(&self, _node: &Node, ports: &NodePorts) -> String {
        format!("http://127.0.0.1:{}/status", ports.rpc)
    }

    /// Where the node home is mounted inside a container.
    fn container_home_path(&self) -> String {
        "/root/.node".to_string()
    }
}

/// A network adapter: binary builder, genesis initializer, runtime shaping.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Chain id to use when the devnet spec leaves it unset.
    fn default_chain_id(&self) -> String {
        format!("{}-devnet-1", self.name())
    }

    /// Build or resolve the chain binary for this devnet. Returns the
    /// path the nodes will execute.
    async fn build_binary(&self, devnet: &Devnet, cache_dir: &Path) -> Result<PathBuf>;

    /// Initialize genesis and per-node home directories.
    async fn init_genesis(&self, devnet: &Devnet, homes: &[PathBuf]) -> Result<()>;

    /// Runtime shaping; `None` falls back to [`default_start_command`].
    fn runtime(&self) -> Option<Arc<dyn PluginRuntime>> {
        None
    }
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name()).finish()
    }
}

/// Synthesized start command used when a plugin supplies no runtime
/// adapter: `<binary> start --home <home> [--chain-id <id>]`.
pub fn default_start_command(node: &Node) -> Vec<String> {
    let mut args = vec![
        node.spec.binary_path.clone().unwrap_or_default(),
        "start".to_string(),
        "--home".to_string(),
        node.spec.home_dir.clone(),
    ];
    if let Some(chain_id) = &node.spec.chain_id {
        args.push("--chain-id".to_string());
        args.push(chain_id.clone());
    }
    args
}

/// Registered plugins, keyed by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        self.plugins
            .write()
            .expect("plugin registry lock poisoned")
            .insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .expect("plugin registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins
            .read()
            .expect("plugin registry lock poisoned")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .plugins
            .read()
            .expect("plugin registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Late binding for the binary path: the devnet controller sets it once
/// the plugin build finishes, node supervisors read it afterwards.
#[derive(Default)]
pub struct BinaryBinder {
    path: Mutex<Option<PathBuf>>,
}

impl BinaryBinder {
    pub fn bind(&self, path: PathBuf) {
        *self.path.lock().expect("binder lock poisoned") = Some(path);
    }

    pub fn get(&self) -> Option<PathBuf> {
        self.path.lock().expect("binder lock poisoned").clone()
    }
}

mod stable;

pub use stable::StablePlugin;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::NodeSpec;

    #[test]
    fn default_command_includes_chain_id_when_set() {
        let node = Node::new(
            "d1-node-0",
            "default",
            NodeSpec {
                devnet_ref: "d1".to_string(),
                namespace_ref: "default".to_string(),
                binary_path: Some("/opt/bin/gaiad".to_string()),
                home_dir: "/data/d1/node0".to_string(),
                chain_id: Some("test-1".to_string()),
                ..Default::default()
            },
        );
        let args = default_start_command(&node);
        assert_eq!(
            args,
            vec![
                "/opt/bin/gaiad",
                "start",
                "--home",
                "/data/d1/node0",
                "--chain-id",
                "test-1"
            ]
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = PluginRegistry::default();
        assert!(!registry.contains("stable"));
        registry.register(Arc::new(StablePlugin::default()));
        assert!(registry.contains("stable"));
        assert!(registry.get("stable").is_ok());
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            Error::PluginNotFound(_)
        ));
    }

    #[test]
    fn binder_is_set_once_and_read_later() {
        let binder = BinaryBinder::default();
        assert!(binder.get().is_none());
        binder.bind(PathBuf::from("/opt/bin/gaiad"));
        assert_eq!(binder.get(), Some(PathBuf::from("/opt/bin/gaiad")));
    }
}
