//! Node reconciler: converges each node on its desired state through the
//! runtime selected by the parent devnet, and probes chain health while
//! the node runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::resources::{DesiredState, Devnet, Node, NodePhase, Resource};
use crate::runtime::{ProcessStatus, RestartPolicy, StartOptions};

use super::{split_key, Action, Controller, ControllerState};

/// Requeue cadence while a node is between states.
const TRANSITION_REQUEUE: Duration = Duration::from_secs(2);
/// Health probe cadence for a running node.
const HEALTH_REQUEUE: Duration = Duration::from_secs(15);
/// No new block for this long marks the chain stuck.
const STUCK_THRESHOLD: Duration = Duration::from_secs(120);
/// Per-request probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct NodeController;

#[async_trait]
impl Controller for NodeController {
    type Resource = Node;

    fn name(&self) -> &'static str {
        "node"
    }

    #[instrument(skip(self, state), fields(node = key))]
    async fn reconcile(&self, state: &ControllerState, key: &str) -> Result<Action> {
        let (namespace, name) = split_key(key);
        let node: Node = match state.store.get(namespace, name) {
            Ok(node) => node,
            Err(Error::NotFound { .. }) => return Ok(Action::AwaitChange),
            Err(e) => return Err(e),
        };

        let devnet: Devnet = match state.store.get(&node.spec.namespace_ref, &node.spec.devnet_ref)
        {
            Ok(devnet) => devnet,
            // Orphan: the cascade delete is about to reclaim this node.
            Err(Error::NotFound { .. }) => return Ok(Action::AwaitChange),
            Err(e) => return Err(e),
        };

        let runtime = state.runtimes.select(&devnet);
        let proc = runtime.node_status(key).await.ok();

        let want_running =
            node.spec.desired == DesiredState::Running && !devnet.spec.stopped;

        if want_running {
            match proc {
                None => {
                    let opts = start_options(state, &devnet, &node);
                    runtime.start_node(&node, opts).await?;
                    write_status(state, &node, |s| {
                        s.phase = NodePhase::Starting;
                        s.next_restart_time = None;
                    })?;
                    Ok(Action::Requeue(TRANSITION_REQUEUE))
                }
                Some(proc) if proc.running => {
                    let health = probe_health(state, &devnet, &node).await;
                    let updated = write_status(state, &node, |s| {
                        s.phase = NodePhase::Running;
                        s.pid = proc.pid;
                        s.restart_count = proc.restarts;
                        s.next_restart_time = None;
                        if let Some(health) = &health {
                            s.last_health_check = Some(Utc::now());
                            s.catching_up = health.catching_up;
                            s.peer_count = health.peer_count;
                            if health.block_height > s.block_height {
                                s.block_height = health.block_height;
                                s.last_block_time = Some(Utc::now());
                                s.consecutive_failures = 0;
                            } else if let Some(last) = s.last_block_time {
                                let stalled = Utc::now().signed_duration_since(last);
                                if stalled.to_std().unwrap_or_default() > STUCK_THRESHOLD {
                                    s.consecutive_failures += 1;
                                }
                            }
                        } else {
                            s.last_health_check = Some(Utc::now());
                            s.consecutive_failures += 1;
                        }
                    })?;
                    let failures = updated.status.consecutive_failures;
                    if failures > 0 {
                        warn!(node = key, failures, "node health degraded");
                    }
                    Ok(Action::Requeue(HEALTH_REQUEUE))
                }
                Some(proc) => {
                    // Exited. The run loop owns policy restarts; we only
                    // report where it landed.
                    let policy = restart_policy(&devnet);
                    let success = proc.exit_code == Some(0);
                    let phase = classify_exit(&proc, success, &policy);
                    write_status(state, &node, |s| {
                        s.pid = None;
                        s.restart_count = proc.restarts;
                        s.phase = phase;
                        s.next_restart_time = if phase == NodePhase::Starting {
                            Some(
                                Utc::now()
                                    + chrono::Duration::from_std(
                                        policy.next_backoff(proc.restarts),
                                    )
                                    .unwrap_or_default(),
                            )
                        } else {
                            None
                        };
                    })?;
                    match phase {
                        NodePhase::Starting => Ok(Action::Requeue(TRANSITION_REQUEUE)),
                        _ => Ok(Action::AwaitChange),
                    }
                }
            }
        } else {
            match proc {
                Some(proc) if proc.running => {
                    write_status(state, &node, |s| s.phase = NodePhase::Stopping)?;
                    runtime.stop_node(key, true).await?;
                    write_status(state, &node, |s| {
                        s.phase = NodePhase::Stopped;
                        s.pid = None;
                    })?;
                    Ok(Action::AwaitChange)
                }
                _ => {
                    if node.status.phase != NodePhase::Stopped {
                        write_status(state, &node, |s| {
                            s.phase = NodePhase::Stopped;
                            s.pid = None;
                        })?;
                    }
                    Ok(Action::AwaitChange)
                }
            }
        }
    }
}

/// An exited process is either waiting out a backoff (Starting), done on
/// its own terms (Stopped), or out of policy (Crashed).
fn classify_exit(proc: &ProcessStatus, success: bool, policy: &RestartPolicy) -> NodePhase {
    if proc.last_error.is_some() {
        return NodePhase::Crashed;
    }
    if policy.should_restart(success, proc.restarts) {
        NodePhase::Starting
    } else if success {
        NodePhase::Stopped
    } else {
        NodePhase::Crashed
    }
}

fn start_options(state: &ControllerState, devnet: &Devnet, node: &Node) -> StartOptions {
    let plugin = state
        .plugins
        .get(&devnet.spec.plugin)
        .ok()
        .and_then(|p| p.runtime());
    let image = devnet
        .spec
        .plugin_options
        .get("image")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    StartOptions {
        restart_policy: restart_policy(devnet),
        env: Default::default(),
        plugin,
        image,
        ports: Some(devnet.spec.port_bases.for_index(node.spec.index)),
    }
}

/// Restart policy for a devnet's nodes; the spec can override the
/// defaults through plugin options.
fn restart_policy(devnet: &Devnet) -> RestartPolicy {
    devnet
        .spec
        .plugin_options
        .get("restartPolicy")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn write_status<F: FnMut(&mut crate::resources::NodeStatus)>(
    state: &ControllerState,
    node: &Node,
    mut mutate: F,
) -> Result<Node> {
    state
        .store
        .update_with::<Node, _>(&node.meta.namespace, &node.meta.name, |n| {
            mutate(&mut n.status)
        })
}

struct HealthSample {
    block_height: u64,
    peer_count: u32,
    catching_up: bool,
}

/// Poll the node's RPC status (and peer count) endpoints. `None` when the
/// node is unreachable or the response is unparseable.
async fn probe_health(
    state: &ControllerState,
    devnet: &Devnet,
    node: &Node,
) -> Option<HealthSample> {
    let ports = devnet.spec.port_bases.for_index(node.spec.index);
    let endpoint = state
        .plugins
        .get(&devnet.spec.plugin)
        .ok()
        .and_then(|p| p.runtime())
        .map(|r| r.health_endpoint(node, &ports))
        .unwrap_or_else(|| format!("http://127.0.0.1:{}/status", ports.rpc));

    let client = reqwest::Client::new();
    let status: serde_json::Value = client
        .get(&endpoint)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;

    let sync_info = &status["result"]["sync_info"];
    let block_height = sync_info["latest_block_height"]
        .as_str()
        .and_then(|h| h.parse().ok())
        .or_else(|| sync_info["latest_block_height"].as_u64())?;
    let catching_up = sync_info["catching_up"].as_bool().unwrap_or(false);

    // Peer count comes from the net_info endpoint next door; absence is
    // not a probe failure.
    let peer_count = async {
        let net_info: serde_json::Value = client
            .get(format!("http://127.0.0.1:{}/net_info", ports.rpc))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        net_info["result"]["n_peers"]
            .as_str()
            .and_then(|n| n.parse().ok())
            .or_else(|| net_info["result"]["n_peers"].as_u64())
    }
    .await
    .unwrap_or(0) as u32;

    debug!(node = %node.key(), block_height, peer_count, catching_up, "health probe");
    Some(HealthSample {
        block_height,
        peer_count,
        catching_up,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32, restarts: u32) -> ProcessStatus {
        ProcessStatus {
            running: false,
            exit_code: Some(code),
            restarts,
            ..Default::default()
        }
    }

    #[test]
    fn failed_exit_within_policy_is_starting() {
        let policy = RestartPolicy {
            max_restarts: 3,
            ..Default::default()
        };
        assert_eq!(
            classify_exit(&exited(1, 1), false, &policy),
            NodePhase::Starting
        );
    }

    #[test]
    fn exhausted_policy_is_crashed() {
        let policy = RestartPolicy {
            max_restarts: 3,
            ..Default::default()
        };
        assert_eq!(
            classify_exit(&exited(1, 3), false, &policy),
            NodePhase::Crashed
        );
    }

    #[test]
    fn clean_exit_is_stopped() {
        let policy = RestartPolicy::default();
        assert_eq!(
            classify_exit(&exited(0, 0), true, &policy),
            NodePhase::Stopped
        );
    }

    #[test]
    fn spawn_error_is_crashed() {
        let policy = RestartPolicy::default();
        let proc = ProcessStatus {
            running: false,
            last_error: Some("spawn failed: no such file".to_string()),
            ..Default::default()
        };
        assert_eq!(classify_exit(&proc, false, &policy), NodePhase::Crashed);
    }
}
