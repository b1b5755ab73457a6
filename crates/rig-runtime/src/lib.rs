//! Container runtime driver for the rignode agent.
//!
//! Thin wrapper over the docker CLI. Every invocation runs under a hard
//! timeout and anything that cannot be proven successful is reported as an
//! error; the driver never swallows a failure.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

// ─── Timeouts & port range ───────────────────────────────────────────────────

const IMAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(45);
const KILL_TIMEOUT: Duration = Duration::from_secs(15);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host ports for tenants come from this reserved range.
pub const PORT_RANGE_START: u16 = 30000;
pub const PORT_RANGE_END: u16 = 39999;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime operation timed out: {0}")]
    Timeout(&'static str),

    #[error("runtime operation failed: {op}: {message}")]
    Command { op: &'static str, message: String },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("no free host port in {PORT_RANGE_START}-{PORT_RANGE_END}")]
    PortExhausted,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ─── Specs & results ─────────────────────────────────────────────────────────

/// Everything needed to start one detached tenant container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub restart_policy: String,
    /// (host port, container port), host side pre-reserved.
    pub port_bindings: Vec<(u16, u16)>,
    pub env: Vec<(String, String)>,
    /// (host path, container path)
    pub volumes: Vec<(String, String)>,
    pub command: Option<String>,
}

/// Build the `docker run` argument vector for a spec. Pure, so the exact
/// invocation is testable.
pub fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
        "--gpus".into(),
        "all".into(),
        "--shm-size=8g".into(),
        "--restart".into(),
        spec.restart_policy.clone(),
    ];
    for (host, container) in &spec.port_bindings {
        args.push("-p".into());
        args.push(format!("{host}:{container}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for (host, container) in &spec.volumes {
        args.push("-v".into());
        args.push(format!("{host}:{container}"));
    }
    args.push(spec.image.clone());
    if let Some(cmd) = &spec.command {
        args.push("bash".into());
        args.push("-c".into());
        args.push(cmd.clone());
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectStatus {
    pub exists: bool,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

// ─── Runtime trait ───────────────────────────────────────────────────────────

/// The seam between the engine and the container runtime. The production
/// implementation shells out to docker; tests substitute a scripted fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;
    /// Returns the new container id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;
    async fn exec(&self, container: &str, cmd: &str) -> Result<ExecOutput>;
    async fn exec_detached(&self, container: &str, cmd: &str) -> Result<()>;
    async fn stop(&self, container: &str) -> Result<()>;
    async fn remove(&self, container: &str) -> Result<()>;
    /// Best-effort removal for compensation; missing containers are fine.
    async fn force_remove(&self, container: &str) -> Result<()>;
    async fn inspect(&self, container: &str) -> Result<InspectStatus>;
    /// Names of all agent-managed containers, running or not.
    async fn list_agent_containers(&self) -> Result<Vec<String>>;
}

// ─── Docker CLI implementation ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn invoke(&self, op: &'static str, args: &[&str], timeout: Duration) -> Result<Output> {
        debug!(op, ?args, "docker invocation");
        tokio::time::timeout(timeout, Command::new(&self.binary).args(args).output())
            .await
            .map_err(|_| RuntimeError::Timeout(op))?
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn invoke_ok(&self, op: &'static str, args: &[&str], timeout: Duration) -> Result<String> {
        let output = self.invoke(op, args, timeout).await?;
        if !output.status.success() {
            return Err(RuntimeError::Command {
                op,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    /// Idempotent: a cached image is a no-op, otherwise pull from the registry.
    async fn pull(&self, image: &str) -> Result<()> {
        let cached = self
            .invoke_ok("image-check", &["images", "-q", image], IMAGE_CHECK_TIMEOUT)
            .await?;
        if !cached.is_empty() {
            debug!(image, "image already cached");
            return Ok(());
        }
        info!(image, "pulling image");
        self.invoke_ok("pull", &["pull", image], PULL_TIMEOUT).await?;
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let args = build_run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = self.invoke_ok("run", &arg_refs, RUN_TIMEOUT).await?;
        info!(name = %spec.name, container = %container_id, "container started");
        Ok(container_id)
    }

    async fn exec(&self, container: &str, cmd: &str) -> Result<ExecOutput> {
        let output = self
            .invoke("exec", &["exec", container, "bash", "-c", cmd], EXEC_TIMEOUT)
            .await?;
        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn exec_detached(&self, container: &str, cmd: &str) -> Result<()> {
        self.invoke_ok(
            "exec-detached",
            &["exec", "-d", container, "bash", "-c", cmd],
            EXEC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Graceful stop with a 30 s in-container deadline, kill as fallback.
    async fn stop(&self, container: &str) -> Result<()> {
        let stopped = self
            .invoke_ok("stop", &["stop", "--time", "30", container], STOP_TIMEOUT)
            .await;
        if let Err(e) = stopped {
            warn!(container, error = %e, "graceful stop failed, killing");
            self.invoke_ok("kill", &["kill", container], KILL_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.invoke_ok("remove", &["rm", container], REMOVE_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn force_remove(&self, container: &str) -> Result<()> {
        match self
            .invoke_ok("force-remove", &["rm", "-f", container], REMOVE_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::Command { message, .. })
                if message.contains("No such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container: &str) -> Result<InspectStatus> {
        let output = self
            .invoke(
                "inspect",
                &["inspect", "-f", "{{.State.Running}}", container],
                INSPECT_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            return Ok(InspectStatus {
                exists: false,
                running: false,
            });
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(InspectStatus {
            exists: true,
            running,
        })
    }

    async fn list_agent_containers(&self) -> Result<Vec<String>> {
        let out = self
            .invoke_ok(
                "list",
                &[
                    "ps",
                    "-a",
                    "--filter",
                    "name=deployment-",
                    "--format",
                    "{{.Names}}",
                ],
                INSPECT_TIMEOUT,
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

// ─── Host port reservation ───────────────────────────────────────────────────

/// Reserve one free host port from the rental range by bind-and-close.
/// Candidates already in `taken` are skipped so one deployment never reserves
/// the same port twice.
pub fn reserve_port(taken: &HashSet<u16>) -> Result<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..512 {
        let candidate = rng.gen_range(PORT_RANGE_START..=PORT_RANGE_END);
        if taken.contains(&candidate) {
            continue;
        }
        if TcpListener::bind(("0.0.0.0", candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(RuntimeError::PortExhausted)
}

/// Reserve `container_ports.len()` distinct host ports, returning
/// (host, container) pairs in the input order.
pub fn reserve_ports(container_ports: &[u16]) -> Result<Vec<(u16, u16)>> {
    let mut taken = HashSet::new();
    let mut bindings = Vec::with_capacity(container_ports.len());
    for container_port in container_ports {
        let host = reserve_port(&taken)?;
        taken.insert(host);
        bindings.push((host, *container_port));
    }
    Ok(bindings)
}

/// Probe whether something is listening on a local port.
pub async fn port_listening(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
