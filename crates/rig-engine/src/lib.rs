//! Deployment engine for the rignode agent.
//!
//! Drives a tenant through `deploying → running → terminating → terminal`,
//! holding the GPU slot for the lifetime of the tenant. Every forward step
//! that creates external state has an inverse; on any failure the
//! compensation path stops and removes the container, marks the deployment
//! `failed`, and releases the slot. The local store is always updated, even
//! when the runtime is broken.

#![forbid(unsafe_code)]

pub mod credentials;

use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rig_client::{ControlPlane, live::LiveSink};
use rig_probe::HardwareProbe;
use rig_proto::{
    AccessInfo, DeploySpec, DeploySuccess, DeploymentStatus, LiveUpdate, TerminatedNotice,
    container_name, validate_deployment_id,
};
use rig_runtime::{ContainerRuntime, RunSpec, RuntimeError, port_listening, reserve_ports};
use rig_store::{DeploymentPatch, NewDeployment, Store, StoreError};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminate reason used by the duration sweep; lands the tenant in
/// `completed` instead of `terminated`.
pub const DURATION_EXPIRED: &str = "duration_expired";
/// Default terminate reason for explicit stop commands.
pub const USER_REQUESTED: &str = "user_requested";

const SSH_CONTAINER_PORT: u16 = 22;
const JUPYTER_CONTAINER_PORT: u16 = 8888;
/// Residual VRAM above this after a terminate suggests a leaked context.
const RESIDUAL_VRAM_LIMIT_MB: i64 = 100;

// ─── Errors & outcomes ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gpu slot is busy or unhealthy")]
    ResourceBusy,

    #[error("deployment '{0}' cancelled")]
    Cancelled(String),

    #[error("deployment '{0}' not found")]
    NotFound(String),

    #[error("invalid deployment id '{0}'")]
    InvalidId(String),

    #[error("health gate failed: {0}")]
    HealthGate(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal engine error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed,
    /// The id is already known; the replay is a no-op.
    Replayed(DeploymentStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated(DeploymentStatus),
    /// Already terminal; nothing changed, the server was still notified.
    AlreadyTerminal(DeploymentStatus),
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub agent_id: String,
    pub slot_id: String,
    pub public_ip: String,
    /// Settling time between container start and the health gates.
    pub gate_grace: Duration,
    /// Gate on every allocated host port actually listening.
    pub verify_ports: bool,
}

pub struct DeploymentEngine {
    store: Store,
    runtime: Arc<dyn ContainerRuntime>,
    server: Arc<dyn ControlPlane>,
    probe: HardwareProbe,
    live: Option<LiveSink>,
    config: EngineConfig,
    /// Deploy and terminate are mutually exclusive per agent.
    serial: tokio::sync::Mutex<()>,
    active_deploy: Mutex<Option<String>>,
    cancel: AtomicBool,
}

impl DeploymentEngine {
    pub fn new(
        store: Store,
        runtime: Arc<dyn ContainerRuntime>,
        server: Arc<dyn ControlPlane>,
        probe: HardwareProbe,
        live: Option<LiveSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            server,
            probe,
            live,
            config,
            serial: tokio::sync::Mutex::new(()),
            active_deploy: Mutex::new(None),
            cancel: AtomicBool::new(false),
        }
    }

    fn live(&self, deployment_id: &str, message: impl Into<String>) {
        if let Some(sink) = &self.live {
            sink.emit(LiveUpdate::new(
                &self.config.agent_id,
                Some(deployment_id),
                message,
            ));
        }
    }

    fn checkpoint(&self, deployment_id: &str) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled(deployment_id.to_string()));
        }
        Ok(())
    }

    // ─── Deploy path ─────────────────────────────────────────────────────────

    /// Run the full deploy sequence for a command. Replays of a known id are
    /// no-ops; any failure after the slot is acquired runs compensation.
    pub async fn deploy(&self, deployment_id: &str, spec: &DeploySpec) -> Result<DeployOutcome> {
        if !validate_deployment_id(deployment_id) {
            return Err(EngineError::InvalidId(deployment_id.to_string()));
        }
        let _serial = self.serial.lock().await;

        if let Some(existing) = self.store.get_deployment(deployment_id).await? {
            info!(
                deployment = %deployment_id,
                status = %existing.status,
                "deployment already known, replay ignored"
            );
            return Ok(DeployOutcome::Replayed(existing.status));
        }

        self.cancel.store(false, Ordering::SeqCst);
        *self.active_deploy.lock() = Some(deployment_id.to_string());
        let forward = AssertUnwindSafe(self.deploy_forward(deployment_id, spec))
            .catch_unwind()
            .await;
        *self.active_deploy.lock() = None;

        match forward {
            Ok(Ok(())) => Ok(DeployOutcome::Deployed),
            // Nothing was mutated; compensation would release another tenant's slot.
            Ok(Err(EngineError::ResourceBusy)) => Err(EngineError::ResourceBusy),
            Ok(Err(e)) => {
                self.compensate(deployment_id, &e.to_string()).await;
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic);
                self.compensate(deployment_id, &message).await;
                Err(EngineError::Internal(message))
            }
        }
    }

    async fn deploy_forward(&self, deployment_id: &str, spec: &DeploySpec) -> Result<()> {
        let slot_id = self.config.slot_id.clone();
        info!(deployment = %deployment_id, "starting deployment");

        // 1. Acquire the slot: available + healthy + unoccupied, atomically.
        match self.store.acquire_slot(&slot_id, deployment_id).await {
            Ok(()) => {}
            Err(StoreError::ResourceBusy(_)) => return Err(EngineError::ResourceBusy),
            Err(e) => return Err(e.into()),
        }
        self.live(deployment_id, "gpu slot acquired");

        // 2. Persist the deployment in `deploying`.
        let image = spec.resolve_image();
        self.store
            .create_deployment(&NewDeployment {
                deployment_id: deployment_id.to_string(),
                slot_id: slot_id.clone(),
                template: spec.template().to_string(),
                image: image.clone(),
                start_time: Utc::now(),
                duration_minutes: spec.duration_minutes,
                user_id: spec.user_id.clone(),
            })
            .await?;
        self.checkpoint(deployment_id)?;

        // 3. Pull the image.
        self.live(deployment_id, "pulling image");
        self.runtime.pull(&image).await?;

        // 4. Mint credentials.
        let ssh_password = credentials::mint_ssh_password();
        let jupyter_token = credentials::mint_jupyter_token();

        // 5. Reserve host ports and start the container. Ssh and jupyter are
        //    always exposed even when the request names neither.
        let mut container_ports = spec.container_ports();
        for required in [SSH_CONTAINER_PORT, JUPYTER_CONTAINER_PORT] {
            if !container_ports.contains(&required) {
                container_ports.push(required);
            }
        }
        let bindings = reserve_ports(&container_ports)?;

        let mut env: Vec<(String, String)> = spec
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.push(("DEPLOYMENT_ID".to_string(), deployment_id.to_string()));
        env.push(("SSH_USERNAME".to_string(), credentials::SSH_USERNAME.to_string()));
        env.push(("SSH_PASSWORD".to_string(), ssh_password.clone()));
        env.push(("JUPYTER_TOKEN".to_string(), jupyter_token.clone()));

        let mut volumes: Vec<(String, String)> = spec
            .volumes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        volumes.sort();

        let run_spec = RunSpec {
            name: container_name(deployment_id),
            image: image.clone(),
            restart_policy: spec
                .restart_policy
                .clone()
                .unwrap_or_else(|| "unless-stopped".to_string()),
            port_bindings: bindings.clone(),
            env,
            volumes,
            command: spec.command.clone(),
        };
        self.live(deployment_id, "starting container");
        let container_id = self.runtime.run(&run_spec).await?;
        self.checkpoint(deployment_id)?;

        // 6. Configure the tenant; failures here are warnings unless the
        //    gates below fail.
        self.configure_container(deployment_id, &ssh_password, &jupyter_token)
            .await;

        // 7. Health gates.
        tokio::time::sleep(self.config.gate_grace).await;
        self.run_gates(deployment_id, &bindings).await?;
        self.checkpoint(deployment_id)?;

        // 8. Persist `running` and notify the server with access info.
        let host_for = |cport: u16| {
            bindings
                .iter()
                .find(|(_, c)| *c == cport)
                .map(|(h, _)| *h)
        };
        let ssh_port = host_for(SSH_CONTAINER_PORT)
            .ok_or_else(|| EngineError::Internal("ssh port missing from bindings".to_string()))?;
        let jupyter_port = host_for(JUPYTER_CONTAINER_PORT)
            .ok_or_else(|| EngineError::Internal("jupyter port missing from bindings".to_string()))?;
        let rental_port_2 = bindings
            .iter()
            .find(|(_, c)| *c != SSH_CONTAINER_PORT && *c != JUPYTER_CONTAINER_PORT)
            .map(|(h, _)| *h);

        self.store
            .patch_deployment(
                deployment_id,
                DeploymentStatus::Running,
                DeploymentPatch {
                    container_id: Some(container_id.clone()),
                    ssh_port: Some(ssh_port),
                    rental_port_1: Some(jupyter_port),
                    rental_port_2,
                    ssh_username: Some(credentials::SSH_USERNAME.to_string()),
                    ssh_password: Some(ssh_password.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let port_mappings: HashMap<u16, u16> =
            bindings.iter().map(|(h, c)| (*c, *h)).collect();
        let payload = DeploySuccess {
            deployment_id: deployment_id.to_string(),
            status: "running".to_string(),
            container_id,
            access_info: AccessInfo::new(
                &self.config.public_ip,
                ssh_port,
                credentials::SSH_USERNAME,
                &ssh_password,
                jupyter_port,
                &jupyter_token,
                port_mappings,
            ),
        };
        if let Err(e) = self.server.notify_deploy_success(&payload).await {
            warn!(deployment = %deployment_id, error = %e, "success notification not delivered");
        }
        self.live(deployment_id, "deployment running");
        info!(deployment = %deployment_id, ssh_port, "deployment running");
        Ok(())
    }

    async fn configure_container(
        &self,
        deployment_id: &str,
        ssh_password: &str,
        jupyter_token: &str,
    ) {
        let name = container_name(deployment_id);
        let user = credentials::SSH_USERNAME;
        let setup = [
            format!("useradd -m -s /bin/bash {user}"),
            format!("echo '{user}:{ssh_password}' | chpasswd"),
            format!("usermod -aG sudo {user}"),
            "service ssh restart".to_string(),
        ];
        for cmd in &setup {
            match self.runtime.exec(&name, cmd).await {
                Ok(out) if !out.success => {
                    warn!(deployment = %deployment_id, cmd = %cmd, stderr = %out.stderr, "setup command failed");
                }
                Err(e) => {
                    warn!(deployment = %deployment_id, cmd = %cmd, error = %e, "setup command failed");
                }
                _ => {}
            }
        }

        let jupyter = format!(
            "su - {user} -c \"jupyter lab --ip=0.0.0.0 --port={JUPYTER_CONTAINER_PORT} \
             --no-browser --allow-root --NotebookApp.token={jupyter_token}\""
        );
        if let Err(e) = self.runtime.exec_detached(&name, &jupyter).await {
            warn!(deployment = %deployment_id, error = %e, "jupyter launch failed");
        }
    }

    /// Post-start gates: the container runs, the GPU is visible inside it,
    /// and every allocated host port is listening.
    async fn run_gates(&self, deployment_id: &str, bindings: &[(u16, u16)]) -> Result<()> {
        let name = container_name(deployment_id);

        let status = self.runtime.inspect(&name).await?;
        if !status.exists || !status.running {
            return Err(EngineError::HealthGate("container is not running".to_string()));
        }

        let smi = self.runtime.exec(&name, "nvidia-smi").await?;
        if !smi.success {
            return Err(EngineError::HealthGate(
                "gpu not accessible in container".to_string(),
            ));
        }

        if self.config.verify_ports {
            for (host, container) in bindings {
                if !port_listening(*host).await {
                    return Err(EngineError::HealthGate(format!(
                        "host port {host} (container {container}) is not listening"
                    )));
                }
            }
        }
        debug!(deployment = %deployment_id, "health gates passed");
        Ok(())
    }

    /// Inverse of every forward step. Idempotent; succeeds against a broken
    /// runtime because the store writes never depend on it.
    async fn compensate(&self, deployment_id: &str, reason: &str) {
        warn!(deployment = %deployment_id, reason, "running compensation");
        let name = container_name(deployment_id);

        if let Err(e) = self.runtime.force_remove(&name).await {
            warn!(deployment = %deployment_id, error = %e, "compensation container removal failed");
        }

        match self
            .store
            .patch_deployment(
                deployment_id,
                DeploymentStatus::Failed,
                DeploymentPatch {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(()) => {}
            // Not persisted yet, or a concurrent path already finished it.
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => warn!(deployment = %deployment_id, error = %e, "compensation store patch failed"),
        }

        if let Err(e) = self.store.release_slot(&self.config.slot_id).await {
            warn!(error = %e, "compensation slot release failed");
        }

        let notice = TerminatedNotice {
            deployment_id: deployment_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.server.notify_deploy_terminated(&notice).await {
            debug!(deployment = %deployment_id, error = %e, "failure notice not delivered");
        }
        self.live(deployment_id, format!("deployment failed: {reason}"));
    }

    // ─── Terminate path ──────────────────────────────────────────────────────

    /// Stop a tenant. Idempotent: a terminal deployment is a no-op that still
    /// notifies the server. `duration_expired` lands in `completed`.
    pub async fn terminate(&self, deployment_id: &str, reason: &str) -> Result<TerminateOutcome> {
        // An in-flight deploy for the same id aborts at its next checkpoint.
        if self.active_deploy.lock().as_deref() == Some(deployment_id) {
            info!(deployment = %deployment_id, "terminate during deploy, cancelling");
            self.cancel.store(true, Ordering::SeqCst);
        }
        let _serial = self.serial.lock().await;

        let forward = AssertUnwindSafe(self.terminate_forward(deployment_id, reason))
            .catch_unwind()
            .await;
        match forward {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                self.compensate(deployment_id, &message).await;
                Err(EngineError::Internal(message))
            }
        }
    }

    async fn terminate_forward(
        &self,
        deployment_id: &str,
        reason: &str,
    ) -> Result<TerminateOutcome> {
        let Some(deployment) = self.store.get_deployment(deployment_id).await? else {
            return Err(EngineError::NotFound(deployment_id.to_string()));
        };

        if deployment.status.is_terminal() {
            debug!(deployment = %deployment_id, status = %deployment.status, "terminate on terminal deployment");
            self.notify_terminated(deployment_id, reason).await;
            return Ok(TerminateOutcome::AlreadyTerminal(deployment.status));
        }

        info!(deployment = %deployment_id, reason, "terminating deployment");
        // A retry after a half-finished terminate is already in `terminating`.
        if deployment.status != DeploymentStatus::Terminating {
            self.store
                .patch_deployment(
                    deployment_id,
                    DeploymentStatus::Terminating,
                    DeploymentPatch::default(),
                )
                .await?;
        }
        self.live(deployment_id, "terminating");

        let name = container_name(deployment_id);
        match self.runtime.inspect(&name).await {
            Ok(status) if status.exists => {
                if let Err(e) = self.runtime.stop(&name).await {
                    warn!(deployment = %deployment_id, error = %e, "graceful stop failed");
                }
                if let Err(e) = self.runtime.remove(&name).await {
                    warn!(deployment = %deployment_id, error = %e, "remove failed, forcing");
                    let _ = self.runtime.force_remove(&name).await;
                }
            }
            Ok(_) => debug!(deployment = %deployment_id, "no container to remove"),
            Err(e) => {
                warn!(deployment = %deployment_id, error = %e, "inspect failed, forcing removal");
                let _ = self.runtime.force_remove(&name).await;
            }
        }

        self.store.release_slot(&self.config.slot_id).await?;

        let final_status = if reason == DURATION_EXPIRED {
            DeploymentStatus::Completed
        } else {
            DeploymentStatus::Terminated
        };
        self.store
            .patch_deployment(
                deployment_id,
                final_status,
                DeploymentPatch {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.residual_vram_check().await;
        self.notify_terminated(deployment_id, reason).await;
        self.live(deployment_id, "terminated");
        info!(deployment = %deployment_id, status = %final_status, "termination complete");
        Ok(TerminateOutcome::Terminated(final_status))
    }

    async fn notify_terminated(&self, deployment_id: &str, reason: &str) {
        let notice = TerminatedNotice {
            deployment_id: deployment_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.server.notify_deploy_terminated(&notice).await {
            debug!(deployment = %deployment_id, error = %e, "terminate notice not delivered");
        }
    }

    /// VRAM should drop back near zero once the tenant is gone; a leaked CUDA
    /// context shows up here.
    async fn residual_vram_check(&self) {
        match self.probe.sample_metrics().await {
            Ok(sample) => {
                if let Some(used) = sample.vram_used_mb {
                    if used > RESIDUAL_VRAM_LIMIT_MB {
                        warn!(vram_used_mb = used, "gpu memory not fully released after terminate");
                    }
                }
            }
            Err(e) => debug!(error = %e, "residual vram check skipped"),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
