//! Controller manager and reconciliation loops.
//!
//! Each controller owns one work queue fed from the store watch (replay
//! included) and drains it in its own task, requeueing keys on a timer
//! when a reconcile asks for it or fails. There is no cross-controller
//! ordering; every loop converges on whatever the store holds now.

mod devnet;
mod node;

pub use devnet::DevnetController;
pub use node::NodeController;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::CredentialStore;
use crate::error::{Error, Result};
use crate::logs::LogManager;
use crate::plugin::PluginRegistry;
use crate::resources::{Devnet, Node, Resource};
use crate::runtime::RuntimeSelector;
use crate::store::{ResourceEvent, Store};

/// What a reconcile wants to happen next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run again after the delay even without a new event
    Requeue(Duration),
    /// Nothing more to do until the resource changes
    AwaitChange,
}

/// Requeue timing on errors: transient problems retry soon, everything
/// else waits for the long interval.
fn error_policy(err: &Error) -> Duration {
    if err.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Per-devnet provisioning log fan-out. Lagging subscribers lose old
/// lines rather than blocking the controller.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl BroadcastHub {
    const CAPACITY: usize = 256;

    fn sender(&self, key: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("broadcast hub lock poisoned");
        channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(Self::CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, key: &str, line: impl Into<String>) {
        let _ = self.sender(key).send(line.into());
    }

    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<String> {
        self.sender(key).subscribe()
    }

    pub fn remove(&self, key: &str) {
        self.channels
            .lock()
            .expect("broadcast hub lock poisoned")
            .remove(key);
    }
}

/// Shared dependencies for every controller and the API layer.
pub struct ControllerState {
    pub store: Arc<Store>,
    pub credentials: Arc<CredentialStore>,
    pub plugins: Arc<PluginRegistry>,
    pub runtimes: Arc<RuntimeSelector>,
    pub logs: Arc<LogManager>,
    pub data_dir: PathBuf,
    pub provision_logs: BroadcastHub,
}

impl ControllerState {
    /// Directory holding node homes for one devnet.
    pub fn devnet_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.data_dir.join("devnets").join(namespace).join(name)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

/// One reconciliation loop keyed by resource kind.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    type Resource: Resource;

    fn name(&self) -> &'static str;

    async fn reconcile(&self, state: &ControllerState, key: &str) -> Result<Action>;
}

/// Split a `<namespace>/<name>` key.
pub(crate) fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("default", key))
}

/// Drain one controller's queue forever. Store events and requeue timers
/// merge into the same stream of keys.
async fn controller_loop<C: Controller>(
    state: Arc<ControllerState>,
    mut events: mpsc::UnboundedReceiver<ResourceEvent<C::Resource>>,
    controller: C,
) {
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<String>();
    info!(controller = controller.name(), "controller started");

    loop {
        let key = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event.key,
                None => {
                    warn!(controller = controller.name(), "event stream closed");
                    return;
                }
            },
            Some(key) = requeue_rx.recv() => key,
        };

        let requeue_after = match controller.reconcile(&state, &key).await {
            Ok(Action::AwaitChange) => None,
            Ok(Action::Requeue(delay)) => Some(delay),
            Err(e) => {
                error!(controller = controller.name(), %key, "reconcile error: {e}");
                Some(error_policy(&e))
            }
        };

        if let Some(delay) = requeue_after {
            let tx = requeue_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(key);
            });
        }
    }
}

/// Registers the controllers, replays the store and runs until shutdown.
pub struct ControllerManager {
    state: Arc<ControllerState>,
}

impl ControllerManager {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    pub async fn run(&self) -> Result<()> {
        // Reattach to node processes left behind by a previous daemon
        // before any reconcile can decide they are dead.
        let nodes = self.state.store.list::<Node>(None)?;
        self.state.runtimes.process.reconnect_all(&nodes);

        let devnet_events = self.state.store.watch::<Devnet>()?;
        let node_events = self.state.store.watch::<Node>()?;

        let devnets = tokio::spawn(controller_loop(
            self.state.clone(),
            devnet_events,
            DevnetController,
        ));
        let nodes = tokio::spawn(controller_loop(
            self.state.clone(),
            node_events,
            NodeController,
        ));

        let _ = tokio::try_join!(devnets, nodes);
        Ok(())
    }
}

/// Delete a devnet and everything under it, in order: stop child nodes,
/// drop the children from the store, then the devnet itself. Sub-steps
/// are best-effort but failures are surfaced.
pub async fn cascade_delete_devnet(
    state: &ControllerState,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let devnet: Devnet = state.store.get(namespace, name)?;
    let runtime = state.runtimes.select(&devnet);

    let nodes = state.store.list_nodes_by_devnet(namespace, name)?;
    for node in &nodes {
        if let Err(e) = runtime.stop_node(&node.key(), true).await {
            warn!(node = %node.key(), "stop during cascade delete failed: {e}");
        }
    }

    let deleted_nodes = state.store.delete_nodes_by_devnet(namespace, name)?;
    let deleted_upgrades = state.store.delete_upgrades_by_devnet(namespace, name)?;
    let deleted_txs = state.store.delete_transactions_by_devnet(namespace, name)?;
    state.store.delete::<Devnet>(namespace, name)?;

    state.provision_logs.remove(&format!("{namespace}/{name}"));
    info!(
        namespace,
        name, deleted_nodes, deleted_upgrades, deleted_txs, "devnet deleted with children"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_splitting() {
        assert_eq!(split_key("team-a/d1"), ("team-a", "d1"));
        assert_eq!(split_key("bare"), ("default", "bare"));
    }

    #[tokio::test]
    async fn broadcast_hub_fans_out_per_key() {
        let hub = BroadcastHub::default();
        let mut rx1 = hub.subscribe("default/d1");
        let mut rx2 = hub.subscribe("default/d1");
        let mut other = hub.subscribe("default/d2");

        hub.publish("default/d1", "building binary");
        assert_eq!(rx1.recv().await.unwrap(), "building binary");
        assert_eq!(rx2.recv().await.unwrap(), "building binary");
        assert!(other.try_recv().is_err());
    }
}
