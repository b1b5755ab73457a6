//! End-to-end command and deployment flows across crates:
//! - deploy command → running tenant → duration expiry → completed
//! - deploy failure at image pull → compensation + ack
//! - unknown command types → warn + ack, store untouched
//! - command replay → state-machine guards absorb it, acks stay exact
//! - ack failure → redelivery converges

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rig_client::{ClientError, ControlPlane, RegisterOutcome};
use rig_engine::{DURATION_EXPIRED, DeploymentEngine, EngineConfig};
use rig_probe::HardwareProbe;
use rig_proto::{
    Command, DeploySuccess, DeploymentStatus, GpuDescriptor, GpuStatus, HealthPush, MetricsPush,
    NetworkBinding, RegisterRequest, TerminatedNotice,
};
use rig_runtime::{ContainerRuntime, ExecOutput, InspectStatus, RunSpec, RuntimeError};
use rig_store::{DeploymentPatch, NewDeployment, Store};
use rignode::SLOT_ID;
use rignode::commands::{CommandProcessor, ProcessOutcome};
use rignode::loops::{AgentContext, LatestTelemetry, sweep_tick};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ─── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRuntime {
    fail_pull: AtomicBool,
    containers: Mutex<HashMap<String, bool>>,
    listeners: tokio::sync::Mutex<Vec<tokio::net::TcpListener>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> rig_runtime::Result<()> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RuntimeError::Command {
                op: "pull",
                message: format!("pull access denied for {image}"),
            });
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> rig_runtime::Result<String> {
        let mut listeners = self.listeners.lock().await;
        for (host, _) in &spec.port_bindings {
            if let Ok(l) = tokio::net::TcpListener::bind(("127.0.0.1", *host)).await {
                listeners.push(l);
            }
        }
        self.containers.lock().insert(spec.name.clone(), true);
        Ok(format!("cid-{}", spec.name))
    }

    async fn exec(&self, _container: &str, _cmd: &str) -> rig_runtime::Result<ExecOutput> {
        Ok(ExecOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn exec_detached(&self, _container: &str, _cmd: &str) -> rig_runtime::Result<()> {
        Ok(())
    }

    async fn stop(&self, container: &str) -> rig_runtime::Result<()> {
        if let Some(running) = self.containers.lock().get_mut(container) {
            *running = false;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> rig_runtime::Result<()> {
        self.containers.lock().remove(container);
        Ok(())
    }

    async fn force_remove(&self, container: &str) -> rig_runtime::Result<()> {
        self.containers.lock().remove(container);
        Ok(())
    }

    async fn inspect(&self, container: &str) -> rig_runtime::Result<InspectStatus> {
        Ok(match self.containers.lock().get(container) {
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
        Ok(self.containers.lock().keys().cloned().collect())
    }
}

#[derive(Default)]
struct FakeServer {
    acks: Mutex<Vec<(String, String)>>,
    fail_acks: AtomicBool,
    successes: Mutex<Vec<DeploySuccess>>,
    terminations: Mutex<Vec<TerminatedNotice>>,
    metrics: Mutex<Vec<MetricsPush>>,
    health: Mutex<Vec<HealthPush>>,
}

#[async_trait]
impl ControlPlane for FakeServer {
    async fn register(&self, _request: &RegisterRequest) -> rig_client::Result<RegisterOutcome> {
        Ok(RegisterOutcome::Registered("gpu-abc".to_string()))
    }

    async fn heartbeat(&self) -> rig_client::Result<()> {
        Ok(())
    }

    async fn poll_commands(&self) -> rig_client::Result<Vec<Command>> {
        Ok(vec![])
    }

    async fn ack_command(&self, command_id: &str, status: &str) -> rig_client::Result<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(ClientError::Transient("ack endpoint down".to_string()));
        }
        self.acks
            .lock()
            .push((command_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn push_metrics(&self, payload: &MetricsPush) -> rig_client::Result<()> {
        self.metrics.lock().push(payload.clone());
        Ok(())
    }

    async fn push_health(&self, payload: &HealthPush) -> rig_client::Result<()> {
        self.health.lock().push(payload.clone());
        Ok(())
    }

    async fn notify_deploy_success(&self, payload: &DeploySuccess) -> rig_client::Result<()> {
        self.successes.lock().push(payload.clone());
        Ok(())
    }

    async fn notify_deploy_terminated(&self, payload: &TerminatedNotice) -> rig_client::Result<()> {
        self.terminations.lock().push(payload.clone());
        Ok(())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

struct Agent {
    store: Store,
    runtime: Arc<FakeRuntime>,
    server: Arc<FakeServer>,
    ctx: Arc<AgentContext>,
}

async fn agent() -> Agent {
    agent_with_runtime(FakeRuntime::default()).await
}

async fn agent_with_runtime(runtime: FakeRuntime) -> Agent {
    let store = Store::open_in_memory().await.unwrap();
    store
        .upsert_gpu(
            SLOT_ID,
            &GpuDescriptor {
                hardware_uuid: Some("GPU-1".to_string()),
                name: "RTX 4090".to_string(),
                driver_version: Some("550.54".to_string()),
                cuda_version: None,
                compute_capability: Some("8.9".to_string()),
                total_vram_mb: Some(24564),
            },
            &NetworkBinding {
                public_ip: "203.0.113.5".to_string(),
                ssh_port: 22022,
                rental_port_1: 40001,
                rental_port_2: 40002,
            },
            GpuStatus::Available,
            true,
        )
        .await
        .unwrap();
    store.set_gpu_uuid(SLOT_ID, "gpu-abc").await.unwrap();

    let runtime = Arc::new(runtime);
    let server = Arc::new(FakeServer::default());
    let engine = Arc::new(DeploymentEngine::new(
        store.clone(),
        runtime.clone(),
        server.clone(),
        HardwareProbe::with_binary("definitely-not-nvidia-smi"),
        None,
        EngineConfig {
            agent_id: "agent-test".to_string(),
            slot_id: SLOT_ID.to_string(),
            public_ip: "203.0.113.5".to_string(),
            gate_grace: Duration::ZERO,
            verify_ports: true,
        },
    ));
    let processor = CommandProcessor::new(engine.clone(), server.clone());
    let ctx = Arc::new(AgentContext {
        agent_id: "agent-test".to_string(),
        store: store.clone(),
        probe: HardwareProbe::with_binary("definitely-not-nvidia-smi"),
        server: server.clone(),
        engine,
        processor,
        telemetry: LatestTelemetry::default(),
    });
    Agent {
        store,
        runtime,
        server,
        ctx,
    }
}

fn deploy_command(id: &str) -> Command {
    serde_json::from_value(json!({
        "command_id": id,
        "command_type": "deploy",
        "payload": {
            "image": "ubuntu:22.04",
            "duration_minutes": 1,
            "user_id": "u-1",
            "ports": { "22": "ssh" }
        }
    }))
    .unwrap()
}

// ─── Test 1: deploy command → running → duration expiry → completed ───────────

#[tokio::test]
async fn deploy_then_duration_expiry() {
    let a = agent().await;

    let outcome = a.ctx.processor.process(&deploy_command("d1")).await;
    assert_eq!(outcome, ProcessOutcome::Acked("processed"));

    let d = a.store.get_deployment("d1").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Running);
    let ssh_port = d.ssh_port.unwrap();
    assert!((30000..=39999).contains(&ssh_port));
    assert!(a.runtime.containers.lock().contains_key("deployment-d1"));

    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Busy);

    // The server saw the access info with the allocated ssh port.
    {
        let successes = a.server.successes.lock();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].access_info.ssh.port, ssh_port);
    }

    // Two minutes from now the one-minute budget has elapsed and the sweep
    // query picks the deployment up.
    let expired = a
        .store
        .list_expired(Utc::now() + ChronoDuration::minutes(2))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].deployment_id, "d1");

    // What the sweep then does with it:
    a.ctx
        .engine
        .terminate("d1", DURATION_EXPIRED)
        .await
        .unwrap();

    let d = a.store.get_deployment("d1").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Completed);
    assert_eq!(d.reason.as_deref(), Some(DURATION_EXPIRED));
    assert!(!a.runtime.containers.lock().contains_key("deployment-d1"));
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
}

// ─── Test 2: sweep tick terminates expired deployments ────────────────────────

#[tokio::test]
async fn sweep_tick_completes_expired_deployments() {
    let a = agent().await;

    // A running deployment whose budget elapsed while the agent was busy.
    a.store
        .create_deployment(&NewDeployment {
            deployment_id: "d-old".to_string(),
            slot_id: SLOT_ID.to_string(),
            template: "cuda".to_string(),
            image: "ubuntu:22.04".to_string(),
            start_time: Utc::now() - ChronoDuration::minutes(90),
            duration_minutes: 30,
            user_id: "u-1".to_string(),
        })
        .await
        .unwrap();
    a.store
        .patch_deployment("d-old", DeploymentStatus::Running, DeploymentPatch::default())
        .await
        .unwrap();
    a.store.acquire_slot(SLOT_ID, "d-old").await.unwrap();

    sweep_tick(&a.ctx).await.unwrap();

    let d = a.store.get_deployment("d-old").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Completed);
    assert_eq!(d.reason.as_deref(), Some(DURATION_EXPIRED));
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
    assert_eq!(a.server.terminations.lock().len(), 1);
}

// ─── Test 3: deploy failure at image pull ─────────────────────────────────────

#[tokio::test]
async fn deploy_failure_at_pull_compensates_and_acks() {
    let runtime = FakeRuntime::default();
    runtime.fail_pull.store(true, Ordering::SeqCst);
    let a = agent_with_runtime(runtime).await;

    let outcome = a.ctx.processor.process(&deploy_command("d2")).await;
    assert_eq!(outcome, ProcessOutcome::Acked("failed"));

    let d = a.store.get_deployment("d2").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert!(d.reason.as_deref().unwrap().contains("pull"));

    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
    assert!(!a.runtime.containers.lock().contains_key("deployment-d2"));

    // Exactly one ack for d2, and no success notification.
    let acks = a.server.acks.lock();
    assert_eq!(acks.iter().filter(|(id, _)| id == "d2").count(), 1);
    assert!(a.server.successes.lock().is_empty());
}

// ─── Test 4: unknown command type ─────────────────────────────────────────────

#[tokio::test]
async fn unknown_command_is_acked_and_ignored() {
    let a = agent().await;
    let command: Command = serde_json::from_value(json!({
        "command_id": "x1",
        "command_type": "reboot"
    }))
    .unwrap();

    let outcome = a.ctx.processor.process(&command).await;
    assert_eq!(outcome, ProcessOutcome::Acked("ignored"));

    // Store untouched.
    assert!(a.store.list_nonterminal().await.unwrap().is_empty());
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);

    let acks = a.server.acks.lock();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, "x1");
}

// ─── Test 5: command replay ───────────────────────────────────────────────────

#[tokio::test]
async fn replayed_command_is_skipped_within_a_run() {
    let a = agent().await;

    let first = a.ctx.processor.process(&deploy_command("d1")).await;
    assert_eq!(first, ProcessOutcome::Acked("processed"));

    // Server redelivers the same id on a later poll.
    let second = a.ctx.processor.process(&deploy_command("d1")).await;
    assert_eq!(second, ProcessOutcome::Skipped);

    // One deployment, one success notification, one ack.
    assert_eq!(a.store.list_nonterminal().await.unwrap().len(), 1);
    assert_eq!(a.server.successes.lock().len(), 1);
    assert_eq!(a.server.acks.lock().len(), 1);
}

#[tokio::test]
async fn redelivery_after_failed_ack_converges() {
    let a = agent().await;
    a.server.fail_acks.store(true, Ordering::SeqCst);

    // Dispatch succeeds, ack fails: the server will redeliver.
    let first = a.ctx.processor.process(&deploy_command("d1")).await;
    assert_eq!(first, ProcessOutcome::AckFailed("processed"));
    assert_eq!(
        a.store.get_deployment("d1").await.unwrap().unwrap().status,
        DeploymentStatus::Running
    );

    // Redelivery: the engine's replay guard makes the dispatch a no-op and
    // this time the ack lands.
    a.server.fail_acks.store(false, Ordering::SeqCst);
    let second = a.ctx.processor.process(&deploy_command("d1")).await;
    assert_eq!(second, ProcessOutcome::Acked("processed"));

    assert_eq!(a.server.successes.lock().len(), 1);
    let acks = a.server.acks.lock();
    assert_eq!(acks.iter().filter(|(id, _)| id == "d1").count(), 1);
}

// ─── Test 6: terminate command via processor ──────────────────────────────────

#[tokio::test]
async fn terminate_command_round_trip() {
    let a = agent().await;
    a.ctx.processor.process(&deploy_command("d1")).await;

    let terminate: Command = serde_json::from_value(json!({
        "command_id": "t1",
        "command_type": "terminate",
        "payload": { "deployment_id": "d1" }
    }))
    .unwrap();
    let outcome = a.ctx.processor.process(&terminate).await;
    assert_eq!(outcome, ProcessOutcome::Acked("processed"));

    let d = a.store.get_deployment("d1").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Terminated);
    assert_eq!(d.reason.as_deref(), Some("user_requested"));
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
}

#[tokio::test]
async fn terminate_for_unknown_deployment_still_acks() {
    let a = agent().await;
    let terminate: Command = serde_json::from_value(json!({
        "command_id": "t9",
        "command_type": "terminate",
        "payload": { "deployment_id": "ghost" }
    }))
    .unwrap();
    let outcome = a.ctx.processor.process(&terminate).await;
    assert_eq!(outcome, ProcessOutcome::Acked("failed"));
}

// ─── Invariants ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn busy_slot_iff_nonterminal_deployment() {
    let a = agent().await;

    // Available ⇒ no link.
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
    assert!(slot.current_deployment_id.is_none());

    a.ctx.processor.process(&deploy_command("d1")).await;
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Busy);
    let linked = slot.current_deployment_id.clone().unwrap();
    let d = a.store.get_deployment(&linked).await.unwrap().unwrap();
    assert!(!d.status.is_terminal());

    a.ctx
        .engine
        .terminate(&linked, "user_requested")
        .await
        .unwrap();
    let slot = a.store.get_gpu(SLOT_ID).await.unwrap().unwrap();
    assert_eq!(slot.status, GpuStatus::Available);
    assert!(slot.current_deployment_id.is_none());
}

#[tokio::test]
async fn running_deployments_always_carry_access_material() {
    let a = agent().await;
    a.ctx.processor.process(&deploy_command("d1")).await;

    let d = a.store.get_deployment("d1").await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Running);
    assert!(d.container_id.is_some());
    assert!(d.ssh_username.is_some());
    assert!(d.ssh_password.is_some());
    assert!(d.ssh_port.is_some());
    assert!(d.rental_port_1.is_some());
}
