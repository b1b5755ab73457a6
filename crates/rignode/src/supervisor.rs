//! Supervisor: startup sequence, orphan reconciliation, loop lifecycle,
//! shutdown.
//!
//! Startup is strictly ordered and any failure aborts the process with a
//! non-zero exit. Once the loops are up, the supervisor parks on the signal
//! handler; SIGINT/SIGTERM cancels every loop at its next suspension point,
//! drains bounded, and closes the store.

use crate::commands::CommandProcessor;
use crate::config::{AgentConfig, mint_agent_id};
use crate::error::{AgentError, AgentResult};
use crate::loops::{AgentContext, LatestTelemetry, spawn_loops};
use crate::{SLOT_ID, exit};
use rig_client::live::LiveSink;
use rig_client::{ClientError, ControlPlane, ServerClient};
use rig_engine::{DeploymentEngine, EngineConfig};
use rig_probe::HardwareProbe;
use rig_proto::{DeploymentStatus, GpuStatus, RegisterRequest, container_name};
use rig_runtime::{ContainerRuntime, DockerCli};
use rig_store::{DeploymentPatch, Store};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Settling time between container start and the deploy health gates.
const GATE_GRACE: Duration = Duration::from_secs(10);
/// How long to wait for each loop to drain at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

// ─── Startup ─────────────────────────────────────────────────────────────────

/// Run the agent to completion. Returns the process exit code; startup
/// failures surface as errors and map to exit code 1 in `main`.
pub async fn run(config_path: &Path) -> AgentResult<i32> {
    // 1. Load & validate config.
    let mut config = AgentConfig::load(config_path)?;
    config.validate()?;
    info!(server = %config.server.url, "config loaded");

    // 2. Network preflight.
    preflight(&config)?;

    // 3. Open the local store.
    let store = Store::open(&config.storage.db_path).await?;

    // 4. Resolve agent identity, persisting a freshly minted id.
    let agent_id = match &config.agent.id {
        Some(id) => id.clone(),
        None => {
            let id = mint_agent_id();
            config.agent.id = Some(id.clone());
            config.save(config_path)?;
            info!(agent = %id, "minted agent identity");
            id
        }
    };

    // 5. Resolve GPU identity: adopt the stored uuid or register.
    let probe = HardwareProbe::default();
    let server: Arc<dyn ControlPlane> = Arc::new(ServerClient::new(
        &config.server.url,
        &config.server.api_key,
        &agent_id,
        config.server_timeout(),
    )?);

    let descriptor = probe.describe_gpu().await?;
    let network = config.network_binding();
    let existing = store.get_gpu(SLOT_ID).await?;
    let (status, healthy) = existing
        .as_ref()
        .map(|slot| (slot.status, slot.healthy))
        .unwrap_or((GpuStatus::Available, true));
    store
        .upsert_gpu(SLOT_ID, &descriptor, &network, status, healthy)
        .await?;

    let gpu_uuid = match existing.and_then(|slot| slot.uuid) {
        Some(uuid) => {
            info!(uuid = %uuid, "adopting stored gpu identity");
            uuid
        }
        None => {
            let request = RegisterRequest {
                agent_id: agent_id.clone(),
                gpu: descriptor.clone(),
                host: rig_probe::host_facts(),
                network: network.clone(),
            };
            let outcome = server.register(&request).await.map_err(|e| match e {
                ClientError::Unauthorized => {
                    AgentError::Registration("server rejected credential".to_string())
                }
                other => AgentError::Registration(other.to_string()),
            })?;
            let uuid = outcome.gpu_uuid().to_string();
            store.set_gpu_uuid(SLOT_ID, &uuid).await?;
            info!(uuid = %uuid, "gpu registered");
            uuid
        }
    };

    // 6. Reconcile orphans left by a previous run.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::default());
    let summary = reconcile_orphans(&store, runtime.as_ref(), SLOT_ID).await?;
    if !summary.adopted.is_empty() || !summary.failed.is_empty() {
        info!(
            adopted = summary.adopted.len(),
            failed = summary.failed.len(),
            "orphan reconciliation complete"
        );
    }

    // 7. Assemble the engine and spawn the loops.
    let live = config.live_update_url.clone().map(LiveSink::connect);
    let engine = Arc::new(DeploymentEngine::new(
        store.clone(),
        runtime.clone(),
        server.clone(),
        probe.clone(),
        live,
        EngineConfig {
            agent_id: agent_id.clone(),
            slot_id: SLOT_ID.to_string(),
            public_ip: config.network.public_ip.clone(),
            gate_grace: GATE_GRACE,
            verify_ports: true,
        },
    ));
    let processor = CommandProcessor::new(engine.clone(), server.clone());
    let ctx = Arc::new(AgentContext {
        agent_id: agent_id.clone(),
        store: store.clone(),
        probe,
        server,
        engine,
        processor,
        telemetry: LatestTelemetry::default(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_loops(ctx, &config.intervals, shutdown_rx);
    info!(agent = %agent_id, uuid = %gpu_uuid, "agent running");

    // 8. Park until signalled, then drain.
    wait_for_signal().await;
    info!("signal received, shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
            warn!("loop did not drain within the shutdown budget");
        }
    }
    store.close().await;
    info!("shutdown complete");
    Ok(exit::SIGNAL)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "sigterm handler unavailable, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

// ─── Preflight ───────────────────────────────────────────────────────────────

/// Confirm the declared ports are still free and sanity-check the public ip.
/// A mismatched ip is a warning, never fatal: NAT setups legitimately differ.
pub fn preflight(config: &AgentConfig) -> AgentResult<()> {
    for port in [
        config.network.ssh_port,
        config.network.rental_port_1,
        config.network.rental_port_2,
    ] {
        TcpListener::bind(("0.0.0.0", port)).map_err(|_| AgentError::PortInUse(port))?;
    }
    if let Some(observed) = observed_local_ip() {
        if observed != config.network.public_ip {
            warn!(
                observed = %observed,
                configured = %config.network.public_ip,
                "configured public ip differs from the host's outbound address"
            );
        }
    }
    Ok(())
}

/// The host's outbound interface address via a connected UDP socket. No
/// packet is sent; this is a local routing-table lookup.
fn observed_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

// ─── Orphan reconciliation ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub adopted: Vec<String>,
    pub failed: Vec<String>,
}

/// Bring the store and the runtime back into agreement after a restart.
/// Running containers are re-adopted untouched; stopped or missing ones fail
/// their deployment. The slot is released unless an adopted tenant remains.
pub async fn reconcile_orphans(
    store: &Store,
    runtime: &dyn ContainerRuntime,
    slot_id: &str,
) -> AgentResult<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for deployment in store.list_nonterminal().await? {
        let id = deployment.deployment_id.clone();
        let name = container_name(&id);
        match runtime.inspect(&name).await {
            Ok(status) if status.running => {
                info!(deployment = %id, "re-adopting running container");
                summary.adopted.push(id);
            }
            Ok(status) if status.exists => {
                warn!(deployment = %id, "container stopped while agent was down");
                if let Err(e) = runtime.force_remove(&name).await {
                    warn!(deployment = %id, error = %e, "orphan removal failed");
                }
                mark_orphan_failed(store, &id, "container stopped while agent was down").await;
                summary.failed.push(id);
            }
            Ok(_) => {
                warn!(deployment = %id, "container missing at startup");
                mark_orphan_failed(store, &id, "container missing at startup").await;
                summary.failed.push(id);
            }
            Err(e) => {
                warn!(deployment = %id, error = %e, "runtime inspect failed during reconciliation");
                mark_orphan_failed(store, &id, "runtime unavailable during reconciliation").await;
                summary.failed.push(id);
            }
        }
    }

    if summary.adopted.is_empty() {
        store.release_slot(slot_id).await?;
    }
    Ok(summary)
}

async fn mark_orphan_failed(store: &Store, deployment_id: &str, reason: &str) {
    let patch = DeploymentPatch {
        reason: Some(reason.to_string()),
        ..Default::default()
    };
    if let Err(e) = store
        .patch_deployment(deployment_id, DeploymentStatus::Failed, patch)
        .await
    {
        warn!(deployment = %deployment_id, error = %e, "failed to mark orphan");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rig_proto::{GpuDescriptor, NetworkBinding};
    use rig_runtime::{ExecOutput, InspectStatus, RunSpec, RuntimeError};
    use rig_store::NewDeployment;
    use std::collections::HashMap;

    /// Containers known to the fake runtime: name → running.
    #[derive(Default)]
    struct FakeRuntime {
        containers: Mutex<HashMap<String, bool>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, _image: &str) -> rig_runtime::Result<()> {
            Ok(())
        }
        async fn run(&self, spec: &RunSpec) -> rig_runtime::Result<String> {
            self.containers.lock().insert(spec.name.clone(), true);
            Ok(format!("cid-{}", spec.name))
        }
        async fn exec(&self, _c: &str, _cmd: &str) -> rig_runtime::Result<ExecOutput> {
            Ok(ExecOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        async fn exec_detached(&self, _c: &str, _cmd: &str) -> rig_runtime::Result<()> {
            Ok(())
        }
        async fn stop(&self, c: &str) -> rig_runtime::Result<()> {
            if let Some(running) = self.containers.lock().get_mut(c) {
                *running = false;
            }
            Ok(())
        }
        async fn remove(&self, c: &str) -> rig_runtime::Result<()> {
            self.containers.lock().remove(c);
            Ok(())
        }
        async fn force_remove(&self, c: &str) -> rig_runtime::Result<()> {
            self.containers.lock().remove(c);
            Ok(())
        }
        async fn inspect(&self, c: &str) -> rig_runtime::Result<InspectStatus> {
            Ok(match self.containers.lock().get(c) {
                Some(running) => InspectStatus {
                    exists: true,
                    running: *running,
                },
                None => InspectStatus {
                    exists: false,
                    running: false,
                },
            })
        }
        async fn list_agent_containers(&self) -> rig_runtime::Result<Vec<String>> {
            Err(RuntimeError::Unavailable("not needed".to_string()))
        }
    }

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        let descriptor = GpuDescriptor {
            hardware_uuid: None,
            name: "RTX 4090".to_string(),
            driver_version: None,
            cuda_version: None,
            compute_capability: None,
            total_vram_mb: Some(24564),
        };
        let network = NetworkBinding {
            public_ip: "203.0.113.5".to_string(),
            ssh_port: 22022,
            rental_port_1: 40001,
            rental_port_2: 40002,
        };
        store
            .upsert_gpu(SLOT_ID, &descriptor, &network, GpuStatus::Available, true)
            .await
            .unwrap();
        store
    }

    async fn seed_running_deployment(store: &Store, id: &str) {
        store
            .create_deployment(&NewDeployment {
                deployment_id: id.to_string(),
                slot_id: SLOT_ID.to_string(),
                template: "cuda".to_string(),
                image: "ubuntu:22.04".to_string(),
                start_time: chrono::Utc::now(),
                duration_minutes: 60,
                user_id: "u-1".to_string(),
            })
            .await
            .unwrap();
        store
            .patch_deployment(id, DeploymentStatus::Running, DeploymentPatch::default())
            .await
            .unwrap();
        store.acquire_slot(SLOT_ID, id).await.unwrap();
    }

    // ── Reconciliation ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_container_fails_deployment_and_releases_slot() {
        let store = seeded_store().await;
        seed_running_deployment(&store, "d3").await;
        let runtime = FakeRuntime::default();

        let summary = reconcile_orphans(&store, &runtime, SLOT_ID).await.unwrap();
        assert_eq!(summary.failed, vec!["d3"]);
        assert!(summary.adopted.is_empty());

        let d = store.get_deployment("d3").await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert!(d.reason.as_deref().unwrap().contains("missing"));

        let slot = store.get_gpu(SLOT_ID).await.unwrap().unwrap();
        assert_eq!(slot.status, GpuStatus::Available);
        assert!(slot.current_deployment_id.is_none());
    }

    #[tokio::test]
    async fn running_container_is_readopted_untouched() {
        let store = seeded_store().await;
        seed_running_deployment(&store, "d1").await;
        let runtime = FakeRuntime::default();
        runtime
            .containers
            .lock()
            .insert("deployment-d1".to_string(), true);

        let summary = reconcile_orphans(&store, &runtime, SLOT_ID).await.unwrap();
        assert_eq!(summary.adopted, vec!["d1"]);
        assert!(summary.failed.is_empty());

        let d = store.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
        // Slot stays busy for the adopted tenant.
        let slot = store.get_gpu(SLOT_ID).await.unwrap().unwrap();
        assert_eq!(slot.status, GpuStatus::Busy);
        assert_eq!(slot.current_deployment_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn stopped_container_is_removed_and_failed() {
        let store = seeded_store().await;
        seed_running_deployment(&store, "d2").await;
        let runtime = FakeRuntime::default();
        runtime
            .containers
            .lock()
            .insert("deployment-d2".to_string(), false);

        let summary = reconcile_orphans(&store, &runtime, SLOT_ID).await.unwrap();
        assert_eq!(summary.failed, vec!["d2"]);
        assert!(!runtime.containers.lock().contains_key("deployment-d2"));

        let d = store.get_deployment("d2").await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        let slot = store.get_gpu(SLOT_ID).await.unwrap().unwrap();
        assert_eq!(slot.status, GpuStatus::Available);
    }

    #[tokio::test]
    async fn clean_store_reconciles_to_nothing() {
        let store = seeded_store().await;
        let runtime = FakeRuntime::default();
        let summary = reconcile_orphans(&store, &runtime, SLOT_ID).await.unwrap();
        assert!(summary.adopted.is_empty());
        assert!(summary.failed.is_empty());
    }

    // ── Preflight ─────────────────────────────────────────────────────────────

    fn preflight_config(ssh: u16, r1: u16, r2: u16) -> AgentConfig {
        let mut config = AgentConfig::sample();
        config.server.api_key = "key-live-1234".to_string();
        config.network.public_ip = "203.0.113.5".to_string();
        config.network.ssh_port = ssh;
        config.network.rental_port_1 = r1;
        config.network.rental_port_2 = r2;
        config
    }

    #[test]
    fn preflight_rejects_bound_port() {
        // Occupy an ephemeral port, then declare it in the config.
        let holder = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();
        let config = preflight_config(taken, taken.wrapping_add(1).max(1024), taken.wrapping_add(2).max(1025));
        let err = preflight(&config).unwrap_err();
        assert!(matches!(err, AgentError::PortInUse(p) if p == taken));
    }

    #[test]
    fn preflight_passes_on_free_ports() {
        // Ports picked from the dynamic range; bind-and-close keeps them free.
        let a = TcpListener::bind(("0.0.0.0", 0)).unwrap().local_addr().unwrap().port();
        let b = TcpListener::bind(("0.0.0.0", 0)).unwrap().local_addr().unwrap().port();
        let c = TcpListener::bind(("0.0.0.0", 0)).unwrap().local_addr().unwrap().port();
        let config = preflight_config(a, b, c);
        preflight(&config).unwrap();
    }
}
