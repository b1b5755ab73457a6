//! Periodic loops.
//!
//! Six telemetry/maintenance loops plus the command loop, all cooperatively
//! scheduled on the runtime. A loop iteration may fail or panic; the loop
//! itself never dies before shutdown is signalled. Telemetry loops only ever
//! patch telemetry and health fields, never `status` or the deployment link.

use crate::SLOT_ID;
use crate::commands::CommandProcessor;
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::RwLock;
use rig_client::ControlPlane;
use rig_engine::{DURATION_EXPIRED, DeploymentEngine, TerminateOutcome};
use rig_probe::{HardwareProbe, gpu_performance_score, system_stability_score, system_snapshot};
use rig_proto::{HealthPush, HealthRecord, MetricSample, MetricsPush};
use rig_store::{GpuPatch, Store};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ─── Shared in-process telemetry ─────────────────────────────────────────────

/// Latest sample and health record, shared between the collecting loops and
/// the push loops so a push never has to re-probe the hardware.
#[derive(Default)]
pub struct LatestTelemetry {
    sample: RwLock<Option<MetricSample>>,
    health: RwLock<Option<HealthRecord>>,
}

impl LatestTelemetry {
    pub fn record_sample(&self, sample: MetricSample) {
        *self.sample.write() = Some(sample);
    }

    pub fn record_health(&self, record: HealthRecord) {
        *self.health.write() = Some(record);
    }

    pub fn sample(&self) -> Option<MetricSample> {
        self.sample.read().clone()
    }

    pub fn health(&self) -> Option<HealthRecord> {
        self.health.read().clone()
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Everything a loop iteration needs, shared behind one Arc.
pub struct AgentContext {
    pub agent_id: String,
    pub store: Store,
    pub probe: HardwareProbe,
    pub server: Arc<dyn ControlPlane>,
    pub engine: Arc<DeploymentEngine>,
    pub processor: CommandProcessor,
    pub telemetry: LatestTelemetry,
}

// ─── Loop runner ─────────────────────────────────────────────────────────────

/// Drive one periodic loop until shutdown. Iteration errors are logged and
/// swallowed; panics are caught at the boundary and the loop resumes on the
/// next tick.
pub async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(task = name, period_secs = period.as_secs(), "loop started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match AssertUnwindSafe(tick()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(task = name, error = %e, "loop iteration failed"),
                    Err(_) => error!(task = name, "loop iteration panicked"),
                }
            }
        }
    }
    info!(task = name, "loop stopped");
}

/// Spawn the six periodic loops plus the command loop.
pub fn spawn_loops(
    ctx: Arc<AgentContext>,
    intervals: &crate::config::IntervalsSection,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "sample",
        Duration::from_secs(intervals.sample_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { sample_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "health",
        Duration::from_secs(intervals.health_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { health_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "heartbeat",
        Duration::from_secs(intervals.heartbeat_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { heartbeat_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "metrics-push",
        Duration::from_secs(intervals.metrics_push_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { metrics_push_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "health-push",
        Duration::from_secs(intervals.health_push_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { health_push_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "duration-sweep",
        Duration::from_secs(intervals.duration_sweep_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { sweep_tick(&c).await }
        },
    )));

    let c = ctx.clone();
    handles.push(tokio::spawn(run_loop(
        "command-poll",
        Duration::from_secs(intervals.command_poll_secs),
        shutdown,
        move || {
            let c = c.clone();
            async move { command_tick(&c).await }
        },
    )));

    handles
}

// ─── Tick bodies ─────────────────────────────────────────────────────────────

/// Sample loop: probe the GPU, append to history, mirror onto the slot row.
pub async fn sample_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let sample = ctx.probe.sample_metrics().await?;
    let deployment_id = ctx
        .store
        .get_gpu(SLOT_ID)
        .await?
        .and_then(|slot| slot.current_deployment_id);
    ctx.store
        .append_metric(SLOT_ID, &sample, deployment_id.as_deref())
        .await?;
    ctx.store
        .patch_gpu(
            SLOT_ID,
            GpuPatch {
                gpu_utilization: sample.gpu_utilization,
                vram_used_mb: sample.vram_used_mb,
                temperature_c: sample.temperature_c,
                power_draw_w: sample.power_draw_w,
                fan_speed_pct: sample.fan_speed_pct,
                ..Default::default()
            },
        )
        .await?;
    ctx.telemetry.record_sample(sample);
    Ok(())
}

/// Health loop: run the probes, append the record, maintain the failure
/// counter (reset on the first healthy pass, +1 otherwise).
pub async fn health_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let record = ctx.probe.check_health().await;
    ctx.store.append_health(SLOT_ID, &record).await?;

    let healthy = record.overall == rig_proto::HealthGrade::Healthy;
    let failures = if healthy {
        0
    } else {
        let previous = ctx
            .store
            .get_gpu(SLOT_ID)
            .await?
            .map(|slot| slot.consecutive_failures)
            .unwrap_or(0);
        previous + 1
    };
    ctx.store
        .patch_gpu(
            SLOT_ID,
            GpuPatch {
                healthy: Some(healthy),
                last_health_check: Some(record.ts),
                consecutive_failures: Some(failures),
                ..Default::default()
            },
        )
        .await?;
    if !healthy {
        warn!(
            grade = %record.overall,
            failures,
            error = record.error_message.as_deref().unwrap_or(""),
            "gpu health degraded"
        );
    }
    ctx.telemetry.record_health(record);
    Ok(())
}

/// Heartbeat loop: failure is logged, nothing else changes.
pub async fn heartbeat_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    ctx.server.heartbeat().await?;
    debug!("heartbeat sent");
    Ok(())
}

/// Metrics push loop: latest sample + host snapshot + derived scores.
pub async fn metrics_push_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let Some(sample) = ctx.telemetry.sample() else {
        debug!("no sample collected yet, skipping metrics push");
        return Ok(());
    };
    let health = ctx.telemetry.health();
    let fan_operational = health
        .as_ref()
        .map(|h| h.checks.fan_operational)
        .unwrap_or(true);
    let gpu_uuid = ctx.store.get_gpu(SLOT_ID).await?.and_then(|s| s.uuid);

    let payload = MetricsPush {
        agent_id: ctx.agent_id.clone(),
        gpu_uuid,
        gpu_performance: gpu_performance_score(sample.temperature_c, fan_operational),
        system_stability: health
            .as_ref()
            .map(|h| system_stability_score(h.error_count, h.overall))
            .unwrap_or(100),
        sample,
        system: system_snapshot(),
        timestamp: Utc::now(),
    };
    ctx.server.push_metrics(&payload).await?;
    debug!("metrics pushed");
    Ok(())
}

/// Health push loop: latest record + derived scores.
pub async fn health_push_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let Some(record) = ctx.telemetry.health() else {
        debug!("no health record yet, skipping health push");
        return Ok(());
    };
    let slot = ctx.store.get_gpu(SLOT_ID).await?;
    let sample = ctx.telemetry.sample();

    let payload = HealthPush {
        agent_id: ctx.agent_id.clone(),
        gpu_uuid: slot.as_ref().and_then(|s| s.uuid.clone()),
        status: slot
            .map(|s| s.status.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        gpu_performance: gpu_performance_score(
            sample.and_then(|s| s.temperature_c),
            record.checks.fan_operational,
        ),
        system_stability: system_stability_score(record.error_count, record.overall),
        record,
        timestamp: Utc::now(),
    };
    ctx.server.push_health(&payload).await?;
    debug!("health pushed");
    Ok(())
}

/// Duration sweep: terminate every deployment past its rental budget.
pub async fn sweep_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let expired = ctx.store.list_expired(Utc::now()).await?;
    if expired.is_empty() {
        return Ok(());
    }
    info!(count = expired.len(), "expired deployments found");
    for deployment in expired {
        match ctx
            .engine
            .terminate(&deployment.deployment_id, DURATION_EXPIRED)
            .await
        {
            Ok(TerminateOutcome::Terminated(status)) => {
                info!(deployment = %deployment.deployment_id, status = %status, "expired deployment terminated");
            }
            Ok(TerminateOutcome::AlreadyTerminal(_)) => {}
            Err(e) => {
                warn!(deployment = %deployment.deployment_id, error = %e, "expiry termination failed");
            }
        }
    }
    Ok(())
}

/// Command loop: poll, dispatch in server order, acknowledge.
pub async fn command_tick(ctx: &AgentContext) -> anyhow::Result<()> {
    let commands = ctx.server.poll_commands().await?;
    if commands.is_empty() {
        return Ok(());
    }
    info!(count = commands.len(), "commands received");
    for command in &commands {
        ctx.processor.process(command).await;
    }
    Ok(())
}
