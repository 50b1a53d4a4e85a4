//! Node execution runtimes.
//!
//! One uniform lifecycle contract over three substrates: direct child
//! processes, the per-user OS service manager, and the container engine.
//! The daemon picks an implementation per devnet execution mode.

mod docker;
mod process;
mod service;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;
pub use service::ServiceRuntime;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, Result};
use crate::logs::LogOptions;
use crate::plugin::PluginRuntime;
use crate::resources::{Devnet, ExecutionMode, Node};

/// When a supervised process may be restarted after exit.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    Never,
    Always,
    #[default]
    OnFailure,
}

/// Restart policy with capped exponential backoff.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    pub mode: RestartMode,
    pub max_restarts: u32,
    #[serde(with = "duration_millis")]
    pub backoff_initial: Duration,
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
    pub backoff_factor: f64,
    /// A run longer than this resets the restart counter
    #[serde(with = "duration_millis")]
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::OnFailure,
            max_restarts: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_factor: 2.0,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Whether the policy permits another restart after an exit.
    pub fn should_restart(&self, exit_success: bool, restarts: u32) -> bool {
        if restarts >= self.max_restarts {
            return false;
        }
        match self.mode {
            RestartMode::Never => false,
            RestartMode::Always => true,
            RestartMode::OnFailure => !exit_success,
        }
    }

    /// Delay before restart number `restarts + 1`: initial * factor^restarts,
    /// capped at the maximum.
    pub fn next_backoff(&self, restarts: u32) -> Duration {
        let factor = self.backoff_factor.powi(restarts as i32);
        let delay = self.backoff_initial.mul_f64(factor);
        delay.min(self.backoff_max)
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

/// Options for starting one node.
#[derive(Clone, Default)]
pub struct StartOptions {
    pub restart_policy: RestartPolicy,
    /// Extra environment on top of whatever the plugin supplies
    pub env: HashMap<String, String>,
    /// Per-node runtime shaping; `None` synthesizes a default command
    pub plugin: Option<Arc<dyn PluginRuntime>>,
    /// Container image, required by the container runtime only
    pub image: Option<String>,
    /// Host ports assigned to this node; the container runtime binds them
    pub ports: Option<crate::resources::NodePorts>,
}

/// Point-in-time view of a supervised node process.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Output of an in-container command.
#[derive(Clone, Debug, Serialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The uniform node lifecycle contract. Node ids are the resource key
/// `<namespace>/<name>`.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    async fn start_node(&self, node: &Node, opts: StartOptions) -> Result<()>;

    /// Graceful stop sends the configured stop signal and escalates to a
    /// hard kill after the grace period; non-graceful kills immediately.
    async fn stop_node(&self, node_id: &str, graceful: bool) -> Result<()>;

    async fn restart_node(&self, node_id: &str) -> Result<()>;

    async fn node_status(&self, node_id: &str) -> Result<ProcessStatus>;

    async fn logs(&self, node_id: &str, opts: LogOptions) -> Result<UnboundedReceiver<String>>;

    /// Run a command inside the node's container. Only the container
    /// runtime supports this.
    async fn exec(
        &self,
        _node_id: &str,
        _cmd: Vec<String>,
        _timeout: Duration,
    ) -> Result<ExecResult> {
        Err(Error::Unsupported("exec"))
    }

    /// Release every node this runtime tracks.
    async fn cleanup(&self) -> Result<()>;
}

/// Holds one instance of each runtime and picks per devnet mode.
pub struct RuntimeSelector {
    pub process: Arc<ProcessRuntime>,
    pub service: Arc<ServiceRuntime>,
    pub docker: Arc<DockerRuntime>,
}

impl RuntimeSelector {
    /// Local devnets run under the in-process supervisor unless the spec
    /// opts into the OS service manager; docker devnets always use the
    /// container engine.
    pub fn select(&self, devnet: &Devnet) -> Arc<dyn NodeRuntime> {
        match devnet.spec.mode {
            ExecutionMode::Docker => self.docker.clone(),
            ExecutionMode::Local => {
                let use_service = devnet
                    .spec
                    .plugin_options
                    .get("serviceManager")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if use_service {
                    self.service.clone()
                } else {
                    self.process.clone()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RestartPolicy {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            backoff_factor: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.next_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.next_backoff(1), Duration::from_millis(200));
        // 400ms would exceed the cap
        assert_eq!(policy.next_backoff(2), Duration::from_millis(350));
        assert_eq!(policy.next_backoff(10), Duration::from_millis(350));
    }

    #[test]
    fn on_failure_stops_at_max_restarts() {
        let policy = RestartPolicy {
            mode: RestartMode::OnFailure,
            max_restarts: 3,
            ..Default::default()
        };
        assert!(policy.should_restart(false, 0));
        assert!(policy.should_restart(false, 2));
        assert!(!policy.should_restart(false, 3));
        assert!(!policy.should_restart(true, 0));
    }

    #[test]
    fn never_mode_never_restarts() {
        let policy = RestartPolicy {
            mode: RestartMode::Never,
            ..Default::default()
        };
        assert!(!policy.should_restart(false, 0));
        assert!(!policy.should_restart(true, 0));
    }
}
