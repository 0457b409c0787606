//! Container runtime adapter: spawn, inspect, kill, and clean up minion
//! containers through the `docker` CLI, plus an in-memory stub for tests
//! and `STUB_MODE`.
//!
//! Every operation is conservative on failure: probes that cannot reach
//! the daemon report [`ContainerStatus::Unknown`] rather than pretending a
//! container vanished, and `kill` is fire-and-forget.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OverlordConfig;

/// Container name prefix; doubles as the minion id prefix.
const MINION_PREFIX: &str = "minion-";

/// Observed state of a minion container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    /// The runtime answered and the container does not exist.
    Missing,
    /// The probe itself failed (daemon unreachable); treat as no signal.
    Unknown,
}

/// Port for minion container operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime daemon is reachable.
    async fn available(&self) -> bool;

    /// Create the minion network if it does not exist yet.
    async fn ensure_network(&self) -> Result<()>;

    /// Start a container for one issue and return its minion id. Returning
    /// an id does not guarantee the container is running yet; the first
    /// heartbeat confirms that.
    async fn spawn(&self, repo: &str, issue_number: u64) -> Result<String>;

    async fn status(&self, minion_id: &str) -> ContainerStatus;

    /// Last `tail` lines of container output, if retrievable.
    async fn logs(&self, minion_id: &str, tail: usize) -> Option<String>;

    /// Force-remove the container. Best-effort; errors are logged only.
    async fn kill(&self, minion_id: &str);

    /// All known minion container names, any state.
    async fn list(&self) -> Vec<String>;

    /// Remove exited minion containers; returns how many were removed.
    async fn cleanup_dead(&self) -> usize;
}

/// Generate a fresh minion id (`minion-` + 8 hex chars).
pub fn new_minion_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{MINION_PREFIX}{}", &uuid[..8])
}

// ── Docker CLI adapter ────────────────────────────────────────────────────────

/// Concrete adapter shelling out to the `docker` CLI.
pub struct DockerCli {
    image: String,
    network: String,
    /// Environment injected into every minion container (callback URL,
    /// tokens). `REPO` and `ISSUE_NUMBER` are appended per spawn.
    env: Vec<(String, String)>,
}

impl DockerCli {
    pub fn new(
        image: impl Into<String>,
        network: impl Into<String>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            image: image.into(),
            network: network.into(),
            env,
        }
    }

    /// Build the adapter from the config snapshot: image, the `overlord-net`
    /// network, and the worker environment template.
    pub fn from_config(config: &OverlordConfig) -> Self {
        let mut env = vec![("OVERLORD_CALLBACK_URL".to_string(), config.callback_url())];
        if let Some(token) = &config.github_token {
            env.push(("GITHUB_TOKEN".to_string(), token.clone()));
        }
        if let Some(key) = &config.anthropic_api_key {
            env.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
        }
        if let Some(url) = &config.llm_base_url {
            env.push(("LLM_BASE_URL".to_string(), url.clone()));
        }
        env.push((
            "TIMEOUT_MINUTES".to_string(),
            config.timeout_minutes.to_string(),
        ));
        Self::new(config.minion_image.clone(), "overlord-net", env)
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        Ok(Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?)
    }
}

/// Arguments for `docker run` (pure, for tests).
fn spawn_args(
    name: &str,
    repo: &str,
    issue_number: u64,
    image: &str,
    network: &str,
    env: &[(String, String)],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network".to_string(),
        network.to_string(),
    ];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-e".to_string());
    args.push(format!("REPO={repo}"));
    args.push("-e".to_string());
    args.push(format!("ISSUE_NUMBER={issue_number}"));
    args.push(image.to_string());
    args
}

/// Map `docker inspect -f {{.State.Status}}` output (pure, for tests).
fn parse_inspect(success: bool, stdout: &str, stderr: &str) -> ContainerStatus {
    if success {
        return match stdout.trim() {
            "running" | "created" | "restarting" => ContainerStatus::Running,
            "exited" | "dead" => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        };
    }
    // Inspect distinguishes "no such container" from "daemon unreachable"
    // only through stderr.
    if stderr.contains("No such") {
        ContainerStatus::Missing
    } else {
        ContainerStatus::Unknown
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn available(&self) -> bool {
        match Self::docker(&["info"]).await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    async fn ensure_network(&self) -> Result<()> {
        let inspect = Self::docker(&["network", "inspect", &self.network]).await?;
        if inspect.status.success() {
            return Ok(());
        }
        let create = Self::docker(&["network", "create", &self.network]).await?;
        if !create.status.success() {
            bail!(
                "failed to create network {}: {}",
                self.network,
                String::from_utf8_lossy(&create.stderr).trim()
            );
        }
        Ok(())
    }

    async fn spawn(&self, repo: &str, issue_number: u64) -> Result<String> {
        let name = new_minion_id();
        let args = spawn_args(&name, repo, issue_number, &self.image, &self.network, &self.env);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = Self::docker(&arg_refs).await?;
        if !out.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(name)
    }

    async fn status(&self, minion_id: &str) -> ContainerStatus {
        match Self::docker(&["inspect", "-f", "{{.State.Status}}", minion_id]).await {
            Ok(out) => parse_inspect(
                out.status.success(),
                &String::from_utf8_lossy(&out.stdout),
                &String::from_utf8_lossy(&out.stderr),
            ),
            Err(e) => {
                warn!("docker inspect {minion_id} failed: {e}");
                ContainerStatus::Unknown
            }
        }
    }

    async fn logs(&self, minion_id: &str, tail: usize) -> Option<String> {
        let tail = tail.to_string();
        match Self::docker(&["logs", "--tail", &tail, minion_id]).await {
            Ok(out) if out.status.success() => {
                // Docker writes container stderr to our stderr; keep both.
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                Some(text)
            }
            _ => None,
        }
    }

    async fn kill(&self, minion_id: &str) {
        match Self::docker(&["rm", "-f", minion_id]).await {
            Ok(out) if !out.status.success() => {
                debug!(
                    "docker rm -f {minion_id}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }
            Err(e) => debug!("docker rm -f {minion_id} failed: {e}"),
            _ => {}
        }
    }

    async fn list(&self) -> Vec<String> {
        let filter = format!("name={MINION_PREFIX}");
        match Self::docker(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"]).await {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn cleanup_dead(&self) -> usize {
        let filter = format!("name={MINION_PREFIX}");
        let exited = match Self::docker(&[
            "ps",
            "-a",
            "--filter",
            &filter,
            "--filter",
            "status=exited",
            "--format",
            "{{.Names}}",
        ])
        .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>(),
            _ => return 0,
        };

        let mut removed = 0;
        for name in exited {
            if let Ok(out) = Self::docker(&["rm", "-f", &name]).await {
                if out.status.success() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

// ── Stub runtime ──────────────────────────────────────────────────────────────

/// In-memory runtime for tests and `STUB_MODE`: every operation succeeds
/// without touching a daemon, and `status` tracks a small state machine.
#[derive(Default)]
pub struct StubRuntime {
    containers: Mutex<HashMap<String, ContainerStatus>>,
    killed: Mutex<Vec<String>>,
    available: AtomicBool,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            killed: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Test hook: make `available()` report an outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Test hook: simulate the container exiting on its own.
    pub fn mark_exited(&self, minion_id: &str) {
        if let Some(s) = self.containers.lock().expect("stub lock").get_mut(minion_id) {
            *s = ContainerStatus::Exited;
        }
    }

    /// Test hook: simulate external removal of the container.
    pub fn forget(&self, minion_id: &str) {
        self.containers.lock().expect("stub lock").remove(minion_id);
    }

    /// Ids passed to `kill` so far.
    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().expect("stub lock").clone()
    }

    /// Number of spawns that have happened.
    pub fn spawn_count(&self) -> usize {
        self.containers.lock().expect("stub lock").len() + self.killed().len()
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn ensure_network(&self) -> Result<()> {
        Ok(())
    }

    async fn spawn(&self, _repo: &str, _issue_number: u64) -> Result<String> {
        let id = new_minion_id();
        self.containers
            .lock()
            .expect("stub lock")
            .insert(id.clone(), ContainerStatus::Running);
        Ok(id)
    }

    async fn status(&self, minion_id: &str) -> ContainerStatus {
        self.containers
            .lock()
            .expect("stub lock")
            .get(minion_id)
            .copied()
            .unwrap_or(ContainerStatus::Missing)
    }

    async fn logs(&self, _minion_id: &str, _tail: usize) -> Option<String> {
        None
    }

    async fn kill(&self, minion_id: &str) {
        self.containers.lock().expect("stub lock").remove(minion_id);
        self.killed
            .lock()
            .expect("stub lock")
            .push(minion_id.to_string());
    }

    async fn list(&self) -> Vec<String> {
        self.containers
            .lock()
            .expect("stub lock")
            .keys()
            .cloned()
            .collect()
    }

    async fn cleanup_dead(&self) -> usize {
        let mut containers = self.containers.lock().expect("stub lock");
        let before = containers.len();
        containers.retain(|_, s| *s != ContainerStatus::Exited);
        before - containers.len()
    }
}
