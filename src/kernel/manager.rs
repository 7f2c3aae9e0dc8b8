//! Kernel lifecycle: tier selection, lazy start, health loop, restarts.
//!
//! The kernel runs in one of three isolation tiers. Tier 1 is a bare
//! subprocess on loopback; Tier 2 is a container with null DNS, bounded
//! memory/CPU, and a host-gateway alias so callbacks can reach the host;
//! Tier 3 is reserved for stronger nested isolation and may be absent.
//!
//! Nothing starts at process init. The first operation that needs the kernel
//! triggers a single-flight start; after every start and restart the
//! registered hooks run (helper injection, snapshot restore).

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::KernelConfig;
use crate::error::{BridgeError, BridgeResult};

use super::client::KernelClient;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const MAX_HEALTH_FAILURES: u32 = 3;
const START_TIMEOUT: Duration = Duration::from_secs(15);

/// Hook run after every kernel start and restart.
pub type RestartHook = Arc<dyn Fn() -> BoxFuture<'static, BridgeResult<()>> + Send + Sync>;

/// Isolation tier actually selected at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationTier {
    Bare,
    Container,
}

enum Proc {
    NotStarted,
    /// Attached to an externally managed kernel; we own no process.
    External,
    Bare(Child),
    Container(String),
}

impl Proc {
    fn tier(&self) -> Option<IsolationTier> {
        match self {
            Proc::NotStarted => None,
            Proc::External | Proc::Bare(_) => Some(IsolationTier::Bare),
            Proc::Container(_) => Some(IsolationTier::Container),
        }
    }
}

pub struct KernelManager {
    config: KernelConfig,
    client: KernelClient,
    proc: Mutex<Proc>,
    hooks: Mutex<Vec<RestartHook>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    /// Tier of the running kernel, readable without the process lock (hooks
    /// run while that lock is held). 0 = not started.
    tier_flag: std::sync::atomic::AtomicU8,
}

impl KernelManager {
    pub fn new(config: KernelConfig, http: reqwest::Client) -> Self {
        let client = KernelClient::new(http, config.base_url());
        Self {
            config,
            client,
            proc: Mutex::new(Proc::NotStarted),
            hooks: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
            tier_flag: std::sync::atomic::AtomicU8::new(0),
        }
    }

    pub fn client(&self) -> &KernelClient {
        &self.client
    }

    /// Execute with one silent retry: a transport error is retried once if a
    /// health check passes (the connection flaked, not the kernel). Anything
    /// beyond that is left to the health loop's restart policy.
    pub async fn execute(&self, code: &str, timeout_secs: u64) -> BridgeResult<super::ExecOutcome> {
        match self.client.execute(code, timeout_secs).await {
            Err(e) if matches!(e, BridgeError::Transport(_)) => {
                if self.client.health().await {
                    self.client.execute(code, timeout_secs).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    pub fn exec_timeout_secs(&self) -> u64 {
        self.config.exec_timeout_secs
    }

    /// Register a hook that re-runs after every start and restart.
    pub async fn on_restart(&self, hook: RestartHook) {
        self.hooks.lock().await.push(hook);
    }

    /// The tier currently in effect, if the kernel has started.
    pub async fn current_tier(&self) -> Option<IsolationTier> {
        self.proc.lock().await.tier()
    }

    /// Lock-free tier read, safe inside restart hooks.
    pub fn tier_hint(&self) -> Option<IsolationTier> {
        match self.tier_flag.load(std::sync::atomic::Ordering::SeqCst) {
            1 => Some(IsolationTier::Bare),
            2 => Some(IsolationTier::Container),
            _ => None,
        }
    }

    fn set_tier_flag(&self, tier: Option<IsolationTier>) {
        let v = match tier {
            None => 0,
            Some(IsolationTier::Bare) => 1,
            Some(IsolationTier::Container) => 2,
        };
        self.tier_flag.store(v, std::sync::atomic::Ordering::SeqCst);
    }

    /// Lazy single-flight start. Concurrent first callers queue on the lock
    /// and observe the started kernel. An already-started kernel is
    /// health-checked and restarted if unresponsive.
    pub async fn ensure_running(self: &Arc<Self>) -> BridgeResult<()> {
        let mut proc = self.proc.lock().await;
        if matches!(*proc, Proc::NotStarted) {
            self.start_locked(&mut proc).await?;
            self.spawn_health_loop().await;
            return Ok(());
        }
        if !self.client.health().await {
            warn!("kernel unresponsive on access, restarting");
            self.restart_locked(&mut proc).await?;
        }
        Ok(())
    }

    /// Restart the kernel and re-run the hooks.
    pub async fn restart(&self) -> BridgeResult<()> {
        let mut proc = self.proc.lock().await;
        self.restart_locked(&mut proc).await
    }

    pub async fn stop(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        let mut proc = self.proc.lock().await;
        match std::mem::replace(&mut *proc, Proc::NotStarted) {
            Proc::Container(name) => {
                let _ = Command::new("docker")
                    .args(["stop", "-t", "10", name.as_str()])
                    .output()
                    .await;
                let _ = Command::new("docker").args(["rm", "-f", name.as_str()]).output().await;
                info!(container = %name, "kernel container stopped");
            }
            Proc::Bare(mut child) => {
                let _ = child.kill().await;
                info!("bare kernel subprocess stopped");
            }
            Proc::External | Proc::NotStarted => {}
        }
        self.set_tier_flag(None);
    }

    async fn start_locked(&self, proc: &mut Proc) -> BridgeResult<()> {
        if self.config.url.is_some() {
            self.wait_healthy().await?;
            *proc = Proc::External;
            self.set_tier_flag(proc.tier());
            info!(url = %self.client.base_url(), "attached to external kernel");
            self.run_hooks().await;
            return Ok(());
        }

        let tier = self.select_tier().await;
        match tier {
            IsolationTier::Container => {
                self.start_container().await?;
                *proc = Proc::Container(self.config.container_name.clone());
            }
            IsolationTier::Bare => {
                let child = self.start_bare().await?;
                *proc = Proc::Bare(child);
            }
        }
        self.set_tier_flag(proc.tier());
        info!(?tier, "kernel started");
        self.run_hooks().await;
        Ok(())
    }

    async fn restart_locked(&self, proc: &mut Proc) -> BridgeResult<()> {
        match proc {
            Proc::NotStarted => return self.start_locked(proc).await,
            Proc::External => {
                // Nothing to restart; wait for it to come back.
                self.wait_healthy().await?;
            }
            Proc::Container(name) => {
                let output = Command::new("docker")
                    .args(["restart", "-t", "10", name.as_str()])
                    .output()
                    .await
                    .map_err(|e| BridgeError::Unavailable(format!("docker restart failed: {e}")))?;
                if !output.status.success() {
                    return Err(BridgeError::Unavailable(format!(
                        "docker restart failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                self.wait_healthy().await?;
            }
            Proc::Bare(child) => {
                let _ = child.kill().await;
                *proc = Proc::Bare(self.start_bare().await?);
            }
        }
        self.set_tier_flag(proc.tier());
        info!("kernel restarted");
        self.run_hooks().await;
        Ok(())
    }

    /// Requested tier if available, degrading to Tier 1 when the container
    /// runtime is unreachable. Tier 3 is reserved and treated as Tier 2.
    async fn select_tier(&self) -> IsolationTier {
        let requested = self.config.tier;
        if requested <= 1 {
            return IsolationTier::Bare;
        }
        if requested >= 3 {
            warn!("nested isolation tier is not available, trying container");
        }
        if Self::docker_available().await {
            IsolationTier::Container
        } else {
            warn!("container runtime unreachable, degrading to bare subprocess");
            IsolationTier::Bare
        }
    }

    async fn docker_available() -> bool {
        matches!(
            Command::new("docker").arg("info").output().await,
            Ok(out) if out.status.success()
        )
    }

    async fn start_container(&self) -> BridgeResult<()> {
        // A stale container from a previous run would hold the name and port.
        let _ = Command::new("docker")
            .args(["rm", "-f", self.config.container_name.as_str()])
            .output()
            .await;

        let port = format!("{0}:{0}", self.config.port);
        let output = Command::new("docker")
            .args([
                "run",
                "-d",
                "--name",
                self.config.container_name.as_str(),
                "-p",
                port.as_str(),
                "--memory",
                "2g",
                "--cpus",
                "2",
                "--dns",
                "0.0.0.0",
                "--add-host",
                "host.docker.internal:host-gateway",
                self.config.image.as_str(),
            ])
            .output()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("docker run failed: {e}")))?;

        if !output.status.success() {
            return Err(BridgeError::Unavailable(format!(
                "failed to start kernel container: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.wait_healthy().await
    }

    async fn start_bare(&self) -> BridgeResult<Child> {
        let mut parts = self.config.bare_command.iter();
        let program = parts.next().ok_or_else(|| {
            BridgeError::Validation("kernel.bare_command must not be empty".into())
        })?;
        let child = Command::new(program)
            .args(parts)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Unavailable(format!("failed to spawn kernel: {e}")))?;
        self.wait_healthy().await?;
        Ok(child)
    }

    async fn wait_healthy(&self) -> BridgeResult<()> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.client.health().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(BridgeError::Timeout(format!(
            "kernel did not become healthy within {}s",
            START_TIMEOUT.as_secs()
        )))
    }

    async fn run_hooks(&self) {
        let hooks: Vec<RestartHook> = self.hooks.lock().await.clone();
        for hook in hooks {
            if let Err(e) = hook().await {
                warn!(error = %e, "kernel restart hook failed");
            }
        }
    }

    async fn spawn_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_task.lock().await;
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut failures = 0u32;
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if manager.client.health().await {
                    failures = 0;
                    continue;
                }
                failures += 1;
                warn!(failures, "kernel health check failed");
                if failures >= MAX_HEALTH_FAILURES {
                    failures = 0;
                    if let Err(e) = manager.restart().await {
                        warn!(error = %e, "kernel auto-restart failed");
                    }
                }
            }
        }));
    }
}
