//! Container engine runtime.
//!
//! One container per node, named `dvb-<devnet>-node-<index>`, with the
//! four chain ports published at a `100 * index` offset, the node home
//! bind-mounted at the plugin's container path, and `dvb.*` labels for
//! discovery.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::logs::LogOptions;
use crate::plugin::default_start_command;
use crate::resources::{Node, NodePorts, PortBases, Resource};

use super::{ExecResult, NodeRuntime, ProcessStatus, StartOptions};

/// Container-internal chain ports; hosts bind these at an offset.
const CONTAINER_PORTS: [(&str, u16); 4] = [
    ("p2p", 26656),
    ("rpc", 26657),
    ("rest", 1317),
    ("grpc", 9090),
];

struct ContainerEntry {
    container: String,
    grace_secs: i64,
}

/// One container per node via the local container engine.
pub struct DockerRuntime {
    docker: Docker,
    nodes: Mutex<HashMap<String, ContainerEntry>>,
}

impl DockerRuntime {
    /// Connect using the environment's engine defaults. The connection is
    /// lazy; availability errors surface on the first operation.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn container_name(node: &Node) -> String {
        format!("dvb-{}-node-{}", node.spec.devnet_ref, node.spec.index)
    }

    fn entry(&self, node_id: &str) -> Result<(String, i64)> {
        let nodes = self.nodes.lock().expect("docker runtime lock poisoned");
        nodes
            .get(node_id)
            .map(|e| (e.container.clone(), e.grace_secs))
            .ok_or(Error::NotFound {
                kind: "container node",
                key: node_id.to_string(),
            })
    }

    fn port_bindings(
        ports: &NodePorts,
    ) -> (
        HashMap<String, HashMap<(), ()>>,
        HashMap<String, Option<Vec<PortBinding>>>,
    ) {
        let host_ports = [ports.p2p, ports.rpc, ports.rest, ports.grpc];
        let mut exposed = HashMap::new();
        let mut bindings = HashMap::new();
        for ((_, container_port), host_port) in CONTAINER_PORTS.iter().zip(host_ports) {
            let key = format!("{container_port}/tcp");
            exposed.insert(key.clone(), HashMap::new());
            bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }
        (exposed, bindings)
    }
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn start_node(&self, node: &Node, opts: StartOptions) -> Result<()> {
        let image = opts
            .image
            .clone()
            .ok_or_else(|| Error::Config(format!("node {} has no container image", node.key())))?;

        let (args, plugin_env, container_home, grace_secs) = match &opts.plugin {
            Some(plugin) => (
                plugin.start_command(node),
                plugin.start_env(node),
                plugin.container_home_path(),
                plugin.grace_period().as_secs() as i64,
            ),
            None => (
                default_start_command(node),
                HashMap::new(),
                "/root/.node".to_string(),
                30,
            ),
        };

        let mut env = plugin_env;
        env.extend(opts.env.clone());
        let env: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let ports = opts
            .ports
            .unwrap_or_else(|| PortBases::default().for_index(node.spec.index));
        let (exposed_ports, port_bindings) = Self::port_bindings(&ports);

        let mut labels = HashMap::new();
        labels.insert("dvb.devnet".to_string(), node.spec.devnet_ref.clone());
        labels.insert("dvb.index".to_string(), node.spec.index.to_string());
        labels.insert("dvb.role".to_string(), node.spec.role.to_string());

        let name = Self::container_name(node);
        let config = Config {
            image: Some(image),
            cmd: Some(args),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{container_home}", node.spec.home_dir)]),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        info!(node = %node.key(), container = %name, "container started");

        self.nodes
            .lock()
            .expect("docker runtime lock poisoned")
            .insert(
                node.key(),
                ContainerEntry {
                    container: name,
                    grace_secs,
                },
            );
        Ok(())
    }

    async fn stop_node(&self, node_id: &str, graceful: bool) -> Result<()> {
        let (container, grace_secs) = self.entry(node_id)?;
        if graceful {
            // The engine owns the escalation: stop signal, wait t, kill.
            self.docker
                .stop_container(&container, Some(StopContainerOptions { t: grace_secs }))
                .await?;
        } else {
            self.docker
                .kill_container(&container, None::<KillContainerOptions<String>>)
                .await?;
        }
        info!(node = node_id, %container, "container stopped");
        Ok(())
    }

    async fn restart_node(&self, node_id: &str) -> Result<()> {
        let (container, _) = self.entry(node_id)?;
        self.docker
            .restart_container(&container, None::<RestartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn node_status(&self, node_id: &str) -> Result<ProcessStatus> {
        let (container, _) = self.entry(node_id)?;
        let inspect = self.docker.inspect_container(&container, None).await?;

        let mut status = ProcessStatus {
            restarts: inspect.restart_count.unwrap_or(0).max(0) as u32,
            ..Default::default()
        };
        if let Some(state) = inspect.state {
            status.running = state.running.unwrap_or(false);
            status.pid = state.pid.filter(|&p| p > 0).map(|p| p as u32);
            status.exit_code = state.exit_code.map(|c| c as i32);
            status.started_at = state
                .started_at
                .as_deref()
                .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
            status.last_error = state.error.filter(|e| !e.is_empty());
        }
        Ok(status)
    }

    async fn logs(&self, node_id: &str, opts: LogOptions) -> Result<UnboundedReceiver<String>> {
        let (container, _) = self.entry(node_id)?;
        let mut stream = self.docker.logs(
            &container,
            Some(LogsOptions::<String> {
                follow: opts.follow,
                stdout: true,
                stderr: true,
                tail: opts.tail.to_string(),
                ..Default::default()
            }),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(output) => {
                        let line = output.to_string();
                        let line = line.strip_suffix('\n').unwrap_or(&line);
                        if tx.send(line.to_string()).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("container log stream error: {e}");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn exec(
        &self,
        node_id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult> {
        let (container, _) = self.entry(node_id)?;

        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let collect = async {
            if let StartExecResults::Attached { mut output, .. } =
                self.docker.start_exec(&exec.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            Ok::<_, Error>(())
        };
        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| Error::Runtime(format!("exec in {node_id} timed out")))??;

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Remove every tracked container, best-effort; the last failure is
    /// returned after all removals were attempted.
    async fn cleanup(&self) -> Result<()> {
        let entries: Vec<String> = self
            .nodes
            .lock()
            .expect("docker runtime lock poisoned")
            .values()
            .map(|e| e.container.clone())
            .collect();

        let mut last_err = None;
        for container in entries {
            let result = self
                .docker
                .remove_container(
                    &container,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            if let Err(e) = result {
                warn!(%container, "container removal failed: {e}");
                last_err = Some(Error::Docker(e));
            }
        }
        self.nodes
            .lock()
            .expect("docker runtime lock poisoned")
            .clear();
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{NodeRole, NodeSpec};

    fn node_with_index(index: u32) -> Node {
        Node::new(
            &format!("d1-node-{index}"),
            "default",
            NodeSpec {
                devnet_ref: "d1".to_string(),
                namespace_ref: "default".to_string(),
                index,
                role: NodeRole::Validator,
                home_dir: format!("/data/d1/node{index}"),
                ..Default::default()
            },
        )
    }

    #[test]
    fn container_name_embeds_devnet_and_index() {
        assert_eq!(
            DockerRuntime::container_name(&node_with_index(2)),
            "dvb-d1-node-2"
        );
    }

    #[test]
    fn port_bindings_offset_per_node() {
        let ports = PortBases::default().for_index(1);
        let (exposed, bindings) = DockerRuntime::port_bindings(&ports);
        assert_eq!(exposed.len(), 4);

        let rpc = bindings.get("26657/tcp").unwrap().as_ref().unwrap();
        assert_eq!(rpc[0].host_port.as_deref(), Some("26757"));
        let p2p = bindings.get("26656/tcp").unwrap().as_ref().unwrap();
        assert_eq!(p2p[0].host_port.as_deref(), Some("26756"));
    }
}
