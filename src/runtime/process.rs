//! In-process node supervisor.
//!
//! One run-and-wait task per node owns the process handle and the wait;
//! stop paths only signal. Supervisors can be marked detached so node
//! processes survive a daemon restart, and a monitoring mode reattaches
//! to such orphans by PID on the next start.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logs::{LogManager, LogOptions};
use crate::plugin::default_start_command;
use crate::resources::{Node, Resource};

use super::{NodeRuntime, ProcessStatus, RestartPolicy, StartOptions};

/// Liveness poll interval for reattached processes.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
/// How long a SIGKILL may take to be observed before we give up.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ProcState {
    running: bool,
    pid: Option<u32>,
    started_at: Option<chrono::DateTime<Utc>>,
    exit_code: Option<i32>,
    restarts: u32,
    last_error: Option<String>,
}

/// Everything needed to (re)spawn the node process.
struct SpawnSpec {
    args: Vec<String>,
    env: HashMap<String, String>,
    home_dir: String,
    log_name: String,
    policy: RestartPolicy,
    stop_signal: Signal,
    grace_period: Duration,
}

struct Supervised {
    key: String,
    spec: SpawnSpec,
    state: Mutex<ProcState>,
    /// Set before signalling so the run loop does not restart the exit.
    stopping: AtomicBool,
    /// Leave the process orphaned when the daemon goes away.
    detach: AtomicBool,
    exited: Notify,
    /// Interrupts backoff sleeps.
    stop_requested: Notify,
}

impl Supervised {
    fn status(&self) -> ProcessStatus {
        let st = self.state.lock().expect("supervisor state lock poisoned");
        ProcessStatus {
            running: st.running,
            pid: st.pid,
            started_at: st.started_at,
            exit_code: st.exit_code,
            restarts: st.restarts,
            last_error: st.last_error.clone(),
        }
    }

    /// Wait until the tracked process is no longer running.
    async fn wait_exit(&self) {
        loop {
            let notified = self.exited.notified();
            if !self.state.lock().expect("supervisor state lock poisoned").running {
                return;
            }
            notified.await;
        }
    }
}

/// Direct process spawning with restart policy and stop escalation.
pub struct ProcessRuntime {
    nodes: Mutex<HashMap<String, Arc<Supervised>>>,
    logs: Arc<LogManager>,
}

impl ProcessRuntime {
    pub fn new(logs: Arc<LogManager>) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            logs,
        }
    }

    fn get(&self, node_id: &str) -> Result<Arc<Supervised>> {
        self.nodes
            .lock()
            .expect("runtime lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "supervised node",
                key: node_id.to_string(),
            })
    }

    /// Mark every supervisor to leave its process orphaned on daemon exit.
    pub fn detach_all(&self) {
        let nodes = self.nodes.lock().expect("runtime lock poisoned");
        for sup in nodes.values() {
            sup.detach.store(true, Ordering::SeqCst);
            sup.stop_requested.notify_waiters();
        }
        info!(count = nodes.len(), "supervisors detached");
    }

    /// Reattach to processes left behind by a previous daemon. Returns
    /// the number of nodes now being monitored.
    pub fn reconnect_all(&self, nodes: &[Node]) -> usize {
        let mut reattached = 0;
        for node in nodes {
            match self.reattach(node) {
                Ok(true) => reattached += 1,
                Ok(false) => {}
                Err(e) => warn!(node = %node.key(), "reattach failed: {e}"),
            }
        }
        if reattached > 0 {
            info!(reattached, "reconnected to orphaned node processes");
        }
        reattached
    }

    /// Attach to one node's stored PID if it is alive and still looks
    /// like our process. The supervisor runs in monitoring mode: a
    /// liveness poll instead of a wait.
    pub fn reattach(&self, node: &Node) -> Result<bool> {
        let Some(pid) = node.status.pid else {
            return Ok(false);
        };
        let binary = node.spec.binary_path.clone().unwrap_or_default();
        if !pid_matches_node(pid, &binary, &node.spec.home_dir) {
            debug!(node = %node.key(), pid, "stored pid is gone or reused");
            return Ok(false);
        }

        let sup = Arc::new(Supervised {
            key: node.key(),
            spec: SpawnSpec {
                args: default_start_command(node),
                env: HashMap::new(),
                home_dir: node.spec.home_dir.clone(),
                log_name: node.meta.name.clone(),
                policy: RestartPolicy::default(),
                stop_signal: Signal::SIGTERM,
                grace_period: Duration::from_secs(30),
            },
            state: Mutex::new(ProcState {
                running: true,
                pid: Some(pid),
                restarts: node.status.restart_count,
                ..Default::default()
            }),
            stopping: AtomicBool::new(false),
            detach: AtomicBool::new(false),
            exited: Notify::new(),
            stop_requested: Notify::new(),
        });
        self.nodes
            .lock()
            .expect("runtime lock poisoned")
            .insert(sup.key.clone(), sup.clone());

        tokio::spawn(monitor_loop(sup));
        info!(node = %node.key(), pid, "reattached to running node");
        Ok(true)
    }
}

/// Check `/proc/<pid>/cmdline` (or `ps` where proc is unavailable) for
/// the node's binary path or home directory, guarding against PID reuse.
fn pid_matches_node(pid: u32, binary: &str, home_dir: &str) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    let cmdline = match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => String::from_utf8_lossy(&raw).replace('\0', " "),
        Err(_) => {
            let output = std::process::Command::new("ps")
                .args(["-p", &pid.to_string(), "-o", "command="])
                .output();
            match output {
                Ok(out) if out.status.success() => {
                    String::from_utf8_lossy(&out.stdout).into_owned()
                }
                _ => return false,
            }
        }
    };

    (!binary.is_empty() && cmdline.contains(binary))
        || (!home_dir.is_empty() && cmdline.contains(home_dir))
}

/// Liveness poll for a reattached process: signal 0 every tick until it
/// disappears or the supervisor detaches.
async fn monitor_loop(sup: Arc<Supervised>) {
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        if sup.detach.load(Ordering::SeqCst) {
            return;
        }
        let pid = {
            let st = sup.state.lock().expect("supervisor state lock poisoned");
            if !st.running {
                return;
            }
            st.pid
        };
        let Some(pid) = pid else { return };
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            let mut st = sup.state.lock().expect("supervisor state lock poisoned");
            st.running = false;
            st.pid = None;
            drop(st);
            sup.exited.notify_waiters();
            info!(node = %sup.key, pid, "monitored process exited");
            return;
        }
    }
}

/// The run-and-wait loop: owns spawn, the wait, and restart decisions.
async fn run_loop(sup: Arc<Supervised>, logs: Arc<LogManager>) {
    loop {
        let mut cmd = Command::new(&sup.spec.args[0]);
        cmd.args(&sup.spec.args[1..])
            .envs(&sup.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if Path::new(&sup.spec.home_dir).is_dir() {
            cmd.current_dir(&sup.spec.home_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Missing binary or bad permissions will not improve on
                // retry; leave it to the controller to surface.
                let mut st = sup.state.lock().expect("supervisor state lock poisoned");
                st.running = false;
                st.pid = None;
                st.last_error = Some(format!("spawn failed: {e}"));
                drop(st);
                sup.exited.notify_waiters();
                warn!(node = %sup.key, "spawn failed: {e}");
                return;
            }
        };

        let pid = child.id();
        {
            let mut st = sup.state.lock().expect("supervisor state lock poisoned");
            st.running = true;
            st.pid = pid;
            st.started_at = Some(Utc::now());
            st.exit_code = None;
        }
        info!(node = %sup.key, pid, "node process started");

        if let Ok(writer) = logs.writer_for(&sup.spec.log_name) {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_lines(stdout, writer.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump_lines(stderr, writer));
            }
        }

        let started = tokio::time::Instant::now();
        let status = child.wait().await;
        let success = status.as_ref().map(|s| s.success()).unwrap_or(false);
        let code = status.ok().and_then(|s| s.code());

        let restarts = {
            let mut st = sup.state.lock().expect("supervisor state lock poisoned");
            st.running = false;
            st.pid = None;
            st.exit_code = code;
            if started.elapsed() >= sup.spec.policy.reset_after {
                st.restarts = 0;
            }
            st.restarts
        };
        sup.exited.notify_waiters();
        info!(node = %sup.key, exit_code = ?code, "node process exited");

        if sup.detach.load(Ordering::SeqCst) || sup.stopping.load(Ordering::SeqCst) {
            return;
        }
        if !sup.spec.policy.should_restart(success, restarts) {
            if !success {
                warn!(node = %sup.key, restarts, "restart policy exhausted");
            }
            return;
        }

        let delay = sup.spec.policy.next_backoff(restarts);
        {
            let mut st = sup.state.lock().expect("supervisor state lock poisoned");
            st.restarts = restarts + 1;
        }
        debug!(node = %sup.key, ?delay, "restarting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = sup.stop_requested.notified() => return,
        }
        if sup.detach.load(Ordering::SeqCst) || sup.stopping.load(Ordering::SeqCst) {
            return;
        }
    }
}

async fn pump_lines<R>(reader: R, writer: Arc<Mutex<crate::logs::RotatingWriter>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut writer = writer.lock().expect("log writer lock poisoned");
        if let Err(e) = writer.write_line(&line) {
            warn!("log write failed: {e}");
            return;
        }
    }
}

#[async_trait]
impl NodeRuntime for ProcessRuntime {
    async fn start_node(&self, node: &Node, opts: StartOptions) -> Result<()> {
        let key = node.key();

        if let Ok(existing) = self.get(&key) {
            if existing.status().running {
                return Err(Error::Runtime(format!("node {key} is already running")));
            }
            // A replaced supervisor must not wake from a backoff sleep
            // and spawn a second process.
            existing.stopping.store(true, Ordering::SeqCst);
            existing.stop_requested.notify_waiters();
        }

        let (args, mut env, stop_signal, grace_period) = match &opts.plugin {
            Some(plugin) => (
                plugin.start_command(node),
                plugin.start_env(node),
                plugin.stop_signal(),
                plugin.grace_period(),
            ),
            None => (
                default_start_command(node),
                HashMap::new(),
                Signal::SIGTERM,
                Duration::from_secs(30),
            ),
        };
        env.extend(opts.env.clone());
        if args.is_empty() || args[0].is_empty() {
            return Err(Error::Config(format!("node {key} has no start command")));
        }

        let sup = Arc::new(Supervised {
            key: key.clone(),
            spec: SpawnSpec {
                args,
                env,
                home_dir: node.spec.home_dir.clone(),
                log_name: node.meta.name.clone(),
                policy: opts.restart_policy,
                stop_signal,
                grace_period,
            },
            state: Mutex::new(ProcState::default()),
            stopping: AtomicBool::new(false),
            detach: AtomicBool::new(false),
            exited: Notify::new(),
            stop_requested: Notify::new(),
        });
        self.nodes
            .lock()
            .expect("runtime lock poisoned")
            .insert(key, sup.clone());

        tokio::spawn(run_loop(sup, self.logs.clone()));
        Ok(())
    }

    async fn stop_node(&self, node_id: &str, graceful: bool) -> Result<()> {
        let sup = self.get(node_id)?;
        sup.stopping.store(true, Ordering::SeqCst);
        sup.stop_requested.notify_waiters();

        let pid = {
            let st = sup.state.lock().expect("supervisor state lock poisoned");
            if !st.running {
                return Ok(());
            }
            st.pid
        };
        let Some(pid) = pid else { return Ok(()) };
        let pid = Pid::from_raw(pid as i32);

        if graceful {
            // ESRCH just means it beat us to the exit.
            let _ = kill(pid, sup.spec.stop_signal);
            if tokio::time::timeout(sup.spec.grace_period, sup.wait_exit())
                .await
                .is_ok()
            {
                return Ok(());
            }
            warn!(node = node_id, "grace period expired, escalating to SIGKILL");
        }

        let _ = kill(pid, Signal::SIGKILL);
        tokio::time::timeout(KILL_WAIT, sup.wait_exit())
            .await
            .map_err(|_| Error::Runtime(format!("node {node_id} did not exit after SIGKILL")))
    }

    async fn restart_node(&self, node_id: &str) -> Result<()> {
        let sup = self.get(node_id)?;
        if sup.status().running {
            self.stop_node(node_id, true).await?;
        }

        // Manual restart starts a fresh policy window.
        sup.stopping.store(false, Ordering::SeqCst);
        {
            let mut st = sup.state.lock().expect("supervisor state lock poisoned");
            st.restarts = 0;
            st.last_error = None;
        }
        tokio::spawn(run_loop(sup, self.logs.clone()));
        Ok(())
    }

    async fn node_status(&self, node_id: &str) -> Result<ProcessStatus> {
        Ok(self.get(node_id)?.status())
    }

    async fn logs(&self, node_id: &str, opts: LogOptions) -> Result<UnboundedReceiver<String>> {
        let name = node_id.rsplit('/').next().unwrap_or(node_id);
        Ok(self.logs.stream(name, opts))
    }

    async fn cleanup(&self) -> Result<()> {
        let keys: Vec<String> = self
            .nodes
            .lock()
            .expect("runtime lock poisoned")
            .iter()
            .filter(|(_, sup)| !sup.detach.load(Ordering::SeqCst))
            .map(|(k, _)| k.clone())
            .collect();

        let mut last_err = None;
        for key in keys {
            if let Err(e) = self.stop_node(&key, true).await {
                warn!(node = %key, "cleanup stop failed: {e}");
                last_err = Some(e);
            }
        }
        self.nodes.lock().expect("runtime lock poisoned").clear();
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::RestartMode;
    use super::*;
    use crate::plugin::PluginRuntime;
    use crate::resources::NodeSpec;

    /// Plugin adapter that runs an arbitrary command, for exercising the
    /// supervisor without a chain binary.
    struct FakeRuntime {
        args: Vec<String>,
        grace: Duration,
    }

    impl PluginRuntime for FakeRuntime {
        fn start_command(&self, _node: &Node) -> Vec<String> {
            self.args.clone()
        }

        fn grace_period(&self) -> Duration {
            self.grace
        }
    }

    fn runtime() -> (tempfile::TempDir, ProcessRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogManager::new(&dir.path().join("logs"), 1024 * 1024, 3));
        (dir, ProcessRuntime::new(logs))
    }

    fn test_node(name: &str) -> Node {
        Node::new(
            name,
            "default",
            NodeSpec {
                devnet_ref: "d1".to_string(),
                namespace_ref: "default".to_string(),
                home_dir: "/tmp".to_string(),
                ..Default::default()
            },
        )
    }

    fn opts_for(args: &[&str], policy: RestartPolicy, grace: Duration) -> StartOptions {
        StartOptions {
            restart_policy: policy,
            plugin: Some(Arc::new(FakeRuntime {
                args: args.iter().map(|s| s.to_string()).collect(),
                grace,
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_reports_running_then_graceful_stop() {
        let (_dir, rt) = runtime();
        let node = test_node("n1");
        let policy = RestartPolicy {
            mode: RestartMode::Never,
            ..Default::default()
        };
        rt.start_node(&node, opts_for(&["sleep", "30"], policy, Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = rt.node_status(&node.key()).await.unwrap();
        assert!(status.running);
        assert!(status.pid.unwrap() > 0);

        rt.stop_node(&node.key(), true).await.unwrap();
        let status = rt.node_status(&node.key()).await.unwrap();
        assert!(!status.running);
    }

    #[tokio::test]
    async fn on_failure_policy_restarts_with_backoff_then_gives_up() {
        let (_dir, rt) = runtime();
        let node = test_node("n2");
        let policy = RestartPolicy {
            mode: RestartMode::OnFailure,
            max_restarts: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            backoff_factor: 2.0,
            reset_after: Duration::from_secs(60),
        };
        // Exits immediately with code 1.
        rt.start_node(
            &node,
            opts_for(&["sh", "-c", "exit 1"], policy, Duration::from_secs(1)),
        )
        .await
        .unwrap();

        // 100 + 200 + 400 ms of backoff plus four quick runs.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = rt.node_status(&node.key()).await.unwrap();
        assert!(!status.running);
        assert_eq!(status.restarts, 3);
        assert_eq!(status.exit_code, Some(1));
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill_for_stubborn_process() {
        let (_dir, rt) = runtime();
        let node = test_node("n3");
        let policy = RestartPolicy {
            mode: RestartMode::Never,
            ..Default::default()
        };
        // Traps and ignores TERM.
        rt.start_node(
            &node,
            opts_for(
                &["sh", "-c", "trap '' TERM; sleep 30"],
                policy,
                Duration::from_millis(500),
            ),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        rt.stop_node(&node.key(), true).await.unwrap();
        let elapsed = started.elapsed();

        // One grace period, then the kill lands quickly.
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(2500));
        assert!(!rt.node_status(&node.key()).await.unwrap().running);
    }

    #[tokio::test]
    async fn spawn_failure_records_error_without_retry() {
        let (_dir, rt) = runtime();
        let node = test_node("n4");
        rt.start_node(
            &node,
            opts_for(
                &["/nonexistent/binary"],
                RestartPolicy::default(),
                Duration::from_secs(1),
            ),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = rt.node_status(&node.key()).await.unwrap();
        assert!(!status.running);
        assert!(status.last_error.unwrap().contains("spawn failed"));
        assert_eq!(status.restarts, 0);
    }

    #[test]
    fn pid_validation_rejects_reused_pid() {
        // Our own PID is alive but runs no node binary.
        let pid = std::process::id();
        assert!(!pid_matches_node(pid, "/opt/bin/gaiad", "/data/devnets/d1/node0"));
        // A dead PID fails the liveness probe outright.
        assert!(!pid_matches_node(999_999, "/opt/bin/gaiad", "/tmp"));
    }
}
