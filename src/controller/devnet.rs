//! Devnet reconciler: drives a devnet from Pending through provisioning
//! to a converged Running/Degraded/Stopped phase, creating child Node
//! resources along the way.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::resources::{
    set_condition, Condition, ConditionStatus, ConditionType, DesiredState, Devnet, DevnetPhase,
    Node, NodePhase, NodeRole, NodeSpec, Resource,
};

use super::{split_key, Action, Controller, ControllerState};

/// Requeue cadence while children are still converging.
const PROGRESS_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue cadence once settled, to refresh aggregate health.
const SETTLED_REQUEUE: Duration = Duration::from_secs(30);

pub struct DevnetController;

#[async_trait]
impl Controller for DevnetController {
    type Resource = Devnet;

    fn name(&self) -> &'static str {
        "devnet"
    }

    #[instrument(skip(self, state), fields(devnet = key))]
    async fn reconcile(&self, state: &ControllerState, key: &str) -> Result<Action> {
        let (namespace, name) = split_key(key);
        let devnet: Devnet = match state.store.get(namespace, name) {
            Ok(devnet) => devnet,
            Err(Error::NotFound { .. }) => return Ok(Action::AwaitChange),
            Err(e) => return Err(e),
        };

        if devnet.spec.stopped {
            return stop_devnet(state, &devnet).await;
        }

        match devnet.status.phase {
            DevnetPhase::Pending => provision(state, &devnet).await,
            DevnetPhase::Provisioning
            | DevnetPhase::Running
            | DevnetPhase::Degraded => observe(state, &devnet).await,
            // A stopped devnet is only restarted through the Start
            // operation, which resets the phase to Pending.
            DevnetPhase::Stopped => Ok(Action::AwaitChange),
        }
    }
}

/// Pending → Provisioning: build the binary, write genesis, create the
/// child Node resources with desired Running.
async fn provision(state: &ControllerState, devnet: &Devnet) -> Result<Action> {
    let key = devnet.key();
    let (namespace, name) = (devnet.meta.namespace.as_str(), devnet.meta.name.as_str());
    info!(devnet = %key, "provisioning devnet");

    state
        .store
        .update_with::<Devnet, _>(namespace, name, |d| {
            d.status.phase = DevnetPhase::Provisioning;
            d.status.message = Some("provisioning".to_string());
            set_condition(
                &mut d.status.conditions,
                Condition::new(
                    ConditionType::Progressing,
                    ConditionStatus::True,
                    "Provisioning",
                    "building binary and initializing nodes",
                ),
            );
            set_condition(
                &mut d.status.conditions,
                Condition::new(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "Provisioning",
                    "",
                ),
            );
        })?;

    let plugin = match state.plugins.get(&devnet.spec.plugin) {
        Ok(plugin) => plugin,
        Err(e) => {
            // Unknown plugin will not fix itself; record and wait for a
            // spec change.
            state.provision_logs.publish(&key, format!("error: {e}"));
            state
                .store
                .update_with::<Devnet, _>(namespace, name, |d| {
                    set_condition(
                        &mut d.status.conditions,
                        Condition::new(
                            ConditionType::PluginAvailable,
                            ConditionStatus::False,
                            "PluginNotFound",
                            &e.to_string(),
                        ),
                    );
                    set_condition(
                        &mut d.status.conditions,
                        Condition::new(
                            ConditionType::Degraded,
                            ConditionStatus::True,
                            "PluginNotFound",
                            &e.to_string(),
                        ),
                    );
                    d.status.message = Some(e.to_string());
                })?;
            return Ok(Action::AwaitChange);
        }
    };
    state
        .provision_logs
        .publish(&key, format!("plugin {} ready", plugin.name()));

    state
        .provision_logs
        .publish(&key, "building chain binary".to_string());
    let binary = match plugin.build_binary(devnet, &state.cache_dir()).await {
        Ok(binary) => binary,
        Err(e) => {
            state.provision_logs.publish(&key, format!("error: {e}"));
            state
                .store
                .update_with::<Devnet, _>(namespace, name, |d| {
                    set_condition(
                        &mut d.status.conditions,
                        Condition::new(
                            ConditionType::Degraded,
                            ConditionStatus::True,
                            "BuildFailed",
                            &e.to_string(),
                        ),
                    );
                    d.status.message = Some(e.to_string());
                })?;
            // Transient build problems retry under the error policy.
            return if e.is_retriable() {
                Err(e)
            } else {
                Ok(Action::AwaitChange)
            };
        }
    };
    state
        .provision_logs
        .publish(&key, format!("binary ready at {}", binary.display()));

    let node_count = devnet.spec.node_count();
    let devnet_dir = state.devnet_dir(namespace, name);
    let homes: Vec<_> = (0..node_count)
        .map(|i| devnet_dir.join(format!("node{i}")))
        .collect();

    state
        .provision_logs
        .publish(&key, "initializing genesis".to_string());
    plugin.init_genesis(devnet, &homes).await?;

    let chain_id = devnet
        .spec
        .chain_id
        .clone()
        .unwrap_or_else(|| plugin.default_chain_id());

    for index in 0..node_count {
        let node_name = format!("{name}-node-{index}");
        if state.store.get::<Node>(namespace, &node_name).is_ok() {
            continue;
        }
        let role = if index < devnet.spec.validators {
            NodeRole::Validator
        } else {
            NodeRole::Fullnode
        };
        let node = Node::new(
            &node_name,
            namespace,
            NodeSpec {
                devnet_ref: name.to_string(),
                namespace_ref: namespace.to_string(),
                index,
                role,
                binary_path: Some(binary.to_string_lossy().into_owned()),
                home_dir: homes[index as usize].to_string_lossy().into_owned(),
                address: None,
                chain_id: Some(chain_id.clone()),
                desired: DesiredState::Running,
            },
        );
        state.store.create(node)?;
        state
            .provision_logs
            .publish(&key, format!("created node {node_name} ({role})"));
    }

    state
        .store
        .update_with::<Devnet, _>(namespace, name, |d| {
            d.status.nodes = node_count;
            set_condition(
                &mut d.status.conditions,
                Condition::new(
                    ConditionType::PluginAvailable,
                    ConditionStatus::True,
                    "PluginReady",
                    "",
                ),
            );
            set_condition(
                &mut d.status.conditions,
                Condition::new(
                    ConditionType::NodesCreated,
                    ConditionStatus::True,
                    "NodesCreated",
                    &format!("{node_count} nodes created"),
                ),
            );
        })?;

    Ok(Action::Requeue(PROGRESS_REQUEUE))
}

/// Recompute the aggregate phase from the child nodes.
async fn observe(state: &ControllerState, devnet: &Devnet) -> Result<Action> {
    let (namespace, name) = (devnet.meta.namespace.as_str(), devnet.meta.name.as_str());
    let nodes = state.store.list_nodes_by_devnet(namespace, name)?;

    let total = nodes.len() as u32;
    let ready = nodes
        .iter()
        .filter(|n| n.status.phase == NodePhase::Running)
        .count() as u32;
    let crashed = nodes
        .iter()
        .any(|n| n.status.phase == NodePhase::Crashed);
    let current_height = nodes.iter().map(|n| n.status.block_height).max().unwrap_or(0);

    // A devnet with every declared node running (including the degenerate
    // zero-node spec) has converged.
    let all_running = ready == total && total == devnet.spec.node_count();
    let settled = all_running && !crashed;

    if settled && devnet.status.phase != DevnetPhase::Running {
        state
            .provision_logs
            .publish(&devnet.key(), "provisioning complete, all nodes running");
    }

    state
        .store
        .update_with::<Devnet, _>(namespace, name, |d| {
            d.status.nodes = total;
            d.status.ready_nodes = ready;
            d.status.current_height = current_height;
            d.status.last_health_check = Some(chrono::Utc::now());

            if crashed {
                d.status.phase = DevnetPhase::Degraded;
                d.status.message = Some("one or more nodes crashed".to_string());
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(
                        ConditionType::Degraded,
                        ConditionStatus::True,
                        "NodeCrashed",
                        "one or more nodes crashed",
                    ),
                );
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::False, "NodeCrashed", ""),
                );
            } else if all_running {
                d.status.phase = DevnetPhase::Running;
                d.status.message = None;
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(
                        ConditionType::NodesRunning,
                        ConditionStatus::True,
                        "AllNodesRunning",
                        "",
                    ),
                );
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::True, "AllNodesRunning", ""),
                );
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(
                        ConditionType::Progressing,
                        ConditionStatus::False,
                        "Settled",
                        "",
                    ),
                );
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(ConditionType::Degraded, ConditionStatus::False, "Settled", ""),
                );
            } else {
                // Still converging; never move backward out of Running.
                set_condition(
                    &mut d.status.conditions,
                    Condition::new(
                        ConditionType::NodesRunning,
                        ConditionStatus::False,
                        "NodesStarting",
                        &format!("{ready}/{total} nodes running"),
                    ),
                );
            }
        })?;

    if settled {
        Ok(Action::Requeue(SETTLED_REQUEUE))
    } else {
        Ok(Action::Requeue(PROGRESS_REQUEUE))
    }
}

/// Converge to Stopped: flip every child's desired state and report once
/// all of them got there.
async fn stop_devnet(state: &ControllerState, devnet: &Devnet) -> Result<Action> {
    let (namespace, name) = (devnet.meta.namespace.as_str(), devnet.meta.name.as_str());
    let nodes = state.store.list_nodes_by_devnet(namespace, name)?;

    for node in &nodes {
        if node.spec.desired != DesiredState::Stopped {
            let node_name = node.meta.name.clone();
            state
                .store
                .update_with::<Node, _>(namespace, &node_name, |n| {
                    n.spec.desired = DesiredState::Stopped;
                })?;
        }
    }

    let all_stopped = nodes
        .iter()
        .all(|n| n.status.phase == NodePhase::Stopped);

    state
        .store
        .update_with::<Devnet, _>(namespace, name, |d| {
            d.status.ready_nodes = 0;
            if all_stopped {
                d.status.phase = DevnetPhase::Stopped;
                d.status.message = None;
            } else {
                d.status.message = Some("stopping nodes".to_string());
            }
            set_condition(
                &mut d.status.conditions,
                Condition::new(ConditionType::Ready, ConditionStatus::False, "Stopped", ""),
            );
        })?;

    if all_stopped {
        info!(devnet = %devnet.key(), "devnet stopped");
        Ok(Action::AwaitChange)
    } else {
        Ok(Action::Requeue(Duration::from_secs(2)))
    }
}
