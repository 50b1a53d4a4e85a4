//! OS service manager runtime.
//!
//! Renders a per-user service definition from a template, loads it and
//! starts it: systemd user units on Linux, launchd agents on macOS.
//! Stop also unloads the definition so the service manager cannot
//! restart the node behind our back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::logs::{LogManager, LogOptions};
use crate::plugin::default_start_command;
use crate::resources::{Node, Resource};

use super::{NodeRuntime, ProcessStatus, StartOptions};

struct ServiceEntry {
    unit: String,
    definition_path: PathBuf,
}

/// Node lifecycle delegated to the platform service manager.
pub struct ServiceRuntime {
    logs: std::sync::Arc<LogManager>,
    nodes: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceRuntime {
    pub fn new(logs: std::sync::Arc<LogManager>) -> Self {
        Self {
            logs,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn unit_name(node: &Node) -> String {
        format!("devnet-{}-{}", node.meta.namespace, node.meta.name)
    }

    fn entry(&self, node_id: &str) -> Result<(String, PathBuf)> {
        let nodes = self.nodes.lock().expect("service runtime lock poisoned");
        nodes
            .get(node_id)
            .map(|e| (e.unit.clone(), e.definition_path.clone()))
            .ok_or(Error::NotFound {
                kind: "service node",
                key: node_id.to_string(),
            })
    }
}

async fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Runtime(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ============================================================================
// Linux backend: per-user systemd
// ============================================================================

#[cfg(target_os = "linux")]
mod backend {
    use super::*;

    pub fn definition_path(unit: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/systemd/user")
            .join(format!("{unit}.service"))
    }

    pub fn render(node: &Node, args: &[String], env: &HashMap<String, String>) -> String {
        let env_lines: String = env
            .iter()
            .map(|(k, v)| format!("Environment=\"{k}={v}\"\n"))
            .collect();
        format!(
            "[Unit]\n\
             Description=devnet node {key}\n\
             \n\
             [Service]\n\
             ExecStart={exec}\n\
             WorkingDirectory={home}\n\
             {env}Restart=no\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n",
            key = node.key(),
            exec = args.join(" "),
            home = node.spec.home_dir,
            env = env_lines,
        )
    }

    pub async fn load_and_start(unit: &str) -> Result<()> {
        run_checked("systemctl", &["--user", "daemon-reload"]).await?;
        run_checked("systemctl", &["--user", "start", unit]).await?;
        Ok(())
    }

    pub async fn stop_and_unload(unit: &str, definition: &PathBuf) -> Result<()> {
        run_checked("systemctl", &["--user", "stop", unit]).await?;
        if let Err(e) = std::fs::remove_file(definition) {
            warn!(%unit, "unit file removal failed: {e}");
        }
        run_checked("systemctl", &["--user", "daemon-reload"]).await?;
        Ok(())
    }

    pub async fn status(unit: &str) -> Result<ProcessStatus> {
        let out = run_checked(
            "systemctl",
            &["--user", "show", unit, "--property=MainPID,ActiveState"],
        )
        .await?;
        let mut status = ProcessStatus::default();
        for line in out.lines() {
            if let Some(pid) = line.strip_prefix("MainPID=") {
                let pid: u32 = pid.trim().parse().unwrap_or(0);
                if pid > 0 {
                    status.pid = Some(pid);
                }
            }
            if let Some(state) = line.strip_prefix("ActiveState=") {
                status.running = state.trim() == "active";
            }
        }
        Ok(status)
    }

    pub async fn restart(unit: &str) -> Result<()> {
        run_checked("systemctl", &["--user", "restart", unit]).await?;
        Ok(())
    }
}

// ============================================================================
// macOS backend: per-user launchd
// ============================================================================

#[cfg(target_os = "macos")]
mod backend {
    use super::*;

    pub fn definition_path(unit: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library/LaunchAgents")
            .join(format!("com.devnet-builder.{unit}.plist"))
    }

    pub fn render(node: &Node, args: &[String], env: &HashMap<String, String>) -> String {
        let args_xml: String = args
            .iter()
            .map(|a| format!("    <string>{a}</string>\n"))
            .collect();
        let env_xml: String = env
            .iter()
            .map(|(k, v)| format!("    <key>{k}</key><string>{v}</string>\n"))
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\">\n\
             <dict>\n\
               <key>Label</key><string>com.devnet-builder.{unit}</string>\n\
               <key>ProgramArguments</key>\n  <array>\n{args}  </array>\n\
               <key>EnvironmentVariables</key>\n  <dict>\n{env}  </dict>\n\
               <key>WorkingDirectory</key><string>{home}</string>\n\
               <key>KeepAlive</key><false/>\n\
             </dict>\n\
             </plist>\n",
            unit = ServiceRuntime::unit_name(node),
            args = args_xml,
            env = env_xml,
            home = node.spec.home_dir,
        )
    }

    pub async fn load_and_start(unit: &str) -> Result<()> {
        let path = definition_path(unit);
        run_checked("launchctl", &["load", "-w", &path.to_string_lossy()]).await?;
        Ok(())
    }

    pub async fn stop_and_unload(unit: &str, definition: &PathBuf) -> Result<()> {
        run_checked("launchctl", &["unload", &definition.to_string_lossy()]).await?;
        if let Err(e) = std::fs::remove_file(definition) {
            warn!(%unit, "agent plist removal failed: {e}");
        }
        Ok(())
    }

    pub async fn status(unit: &str) -> Result<ProcessStatus> {
        let label = format!("com.devnet-builder.{unit}");
        let out = run_checked("launchctl", &["list"]).await?;
        let mut status = ProcessStatus::default();
        for line in out.lines() {
            if line.ends_with(&label) {
                let pid = line.split_whitespace().next().unwrap_or("-");
                if let Ok(pid) = pid.parse::<u32>() {
                    status.pid = Some(pid);
                    status.running = true;
                }
            }
        }
        Ok(status)
    }

    pub async fn restart(unit: &str) -> Result<()> {
        let path = definition_path(unit);
        let path = path.to_string_lossy();
        let _ = run_checked("launchctl", &["unload", &path]).await;
        run_checked("launchctl", &["load", "-w", &path]).await?;
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod backend {
    use super::*;

    pub fn definition_path(_unit: &str) -> PathBuf {
        PathBuf::new()
    }

    pub fn render(_node: &Node, _args: &[String], _env: &HashMap<String, String>) -> String {
        String::new()
    }

    pub async fn load_and_start(_unit: &str) -> Result<()> {
        Err(Error::Unsupported("service manager"))
    }

    pub async fn stop_and_unload(_unit: &str, _definition: &PathBuf) -> Result<()> {
        Err(Error::Unsupported("service manager"))
    }

    pub async fn status(_unit: &str) -> Result<ProcessStatus> {
        Err(Error::Unsupported("service manager"))
    }

    pub async fn restart(_unit: &str) -> Result<()> {
        Err(Error::Unsupported("service manager"))
    }
}

#[async_trait]
impl NodeRuntime for ServiceRuntime {
    async fn start_node(&self, node: &Node, opts: StartOptions) -> Result<()> {
        let (args, env) = match &opts.plugin {
            Some(plugin) => (plugin.start_command(node), plugin.start_env(node)),
            None => (default_start_command(node), HashMap::new()),
        };
        let mut env = env;
        env.extend(opts.env.clone());

        let unit = Self::unit_name(node);
        let definition_path = backend::definition_path(&unit);
        if let Some(dir) = definition_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&definition_path, backend::render(node, &args, &env))?;

        backend::load_and_start(&unit).await?;
        info!(node = %node.key(), %unit, "service started");

        self.nodes
            .lock()
            .expect("service runtime lock poisoned")
            .insert(
                node.key(),
                ServiceEntry {
                    unit,
                    definition_path,
                },
            );
        Ok(())
    }

    async fn stop_node(&self, node_id: &str, _graceful: bool) -> Result<()> {
        let (unit, definition) = self.entry(node_id)?;
        backend::stop_and_unload(&unit, &definition).await?;
        info!(node = node_id, %unit, "service stopped and unloaded");
        Ok(())
    }

    async fn restart_node(&self, node_id: &str) -> Result<()> {
        let (unit, _) = self.entry(node_id)?;
        backend::restart(&unit).await
    }

    async fn node_status(&self, node_id: &str) -> Result<ProcessStatus> {
        let (unit, _) = self.entry(node_id)?;
        backend::status(&unit).await
    }

    async fn logs(&self, node_id: &str, opts: LogOptions) -> Result<UnboundedReceiver<String>> {
        let name = node_id.rsplit('/').next().unwrap_or(node_id);
        Ok(self.logs.stream(name, opts))
    }

    async fn cleanup(&self) -> Result<()> {
        let keys: Vec<String> = self
            .nodes
            .lock()
            .expect("service runtime lock poisoned")
            .keys()
            .cloned()
            .collect();
        let mut last_err = None;
        for key in keys {
            if let Err(e) = self.stop_node(&key, true).await {
                warn!(node = %key, "service cleanup failed: {e}");
                last_err = Some(e);
            }
        }
        self.nodes
            .lock()
            .expect("service runtime lock poisoned")
            .clear();
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::resources::NodeSpec;

    #[test]
    fn unit_rendering_includes_exec_and_home() {
        let node = Node::new(
            "d1-node-0",
            "default",
            NodeSpec {
                devnet_ref: "d1".to_string(),
                namespace_ref: "default".to_string(),
                binary_path: Some("/opt/bin/simd".to_string()),
                home_dir: "/data/d1/node0".to_string(),
                ..Default::default()
            },
        );
        let args = default_start_command(&node);
        let unit = backend::render(&node, &args, &HashMap::new());
        assert!(unit.contains("ExecStart=/opt/bin/simd start --home /data/d1/node0"));
        assert!(unit.contains("WorkingDirectory=/data/d1/node0"));
        assert!(unit.contains("Restart=no"));
    }
}
