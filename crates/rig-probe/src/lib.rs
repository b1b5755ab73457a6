//! GPU hardware probe for the rignode agent.
//!
//! Shells out to `nvidia-smi` with hard per-call timeouts and parses the CSV
//! output. `N/A`-style fields become `None`, never an error: a partially
//! readable GPU still produces a usable record.

#![forbid(unsafe_code)]

use chrono::Utc;
use rig_proto::{
    GpuDescriptor, HealthChecks, HealthGrade, HealthRecord, HostFacts, MetricSample,
    SystemSnapshot,
};
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, warn};

// ─── Thresholds & timeouts ───────────────────────────────────────────────────

/// Above this the temperature check fails.
pub const TEMP_LIMIT_C: f64 = 85.0;
/// Above this the power check fails.
pub const POWER_LIMIT_W: f64 = 500.0;

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out: {0}")]
    Timeout(&'static str),

    #[error("vendor tool failed: {0}")]
    Tool(String),

    #[error("vendor tool unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

// ─── Probe ───────────────────────────────────────────────────────────────────

/// Snapshots GPU identity, live metrics, and health from the vendor tool.
#[derive(Debug, Clone)]
pub struct HardwareProbe {
    binary: String,
}

impl Default for HardwareProbe {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl HardwareProbe {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn query(&self, op: &'static str, args: &[&str], timeout: Duration) -> Result<String> {
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| ProbeError::Timeout(op))?
        .map_err(|e| ProbeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProbeError::Tool(format!("{op}: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Static GPU identity. One call, 10 s budget.
    pub async fn describe_gpu(&self) -> Result<GpuDescriptor> {
        let out = self
            .query(
                "describe",
                &[
                    "--query-gpu=uuid,name,driver_version,compute_cap,memory.total",
                    "--format=csv,noheader,nounits",
                ],
                DESCRIBE_TIMEOUT,
            )
            .await?;
        let line = out
            .lines()
            .next()
            .ok_or_else(|| ProbeError::Tool("describe: empty output".to_string()))?;
        Ok(parse_describe(line))
    }

    /// One metrics sample. 5 s budget.
    pub async fn sample_metrics(&self) -> Result<MetricSample> {
        let out = self
            .query(
                "sample",
                &[
                    "--query-gpu=utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw,fan.speed",
                    "--format=csv,noheader,nounits",
                ],
                SAMPLE_TIMEOUT,
            )
            .await?;
        let line = out
            .lines()
            .next()
            .ok_or_else(|| ProbeError::Tool("sample: empty output".to_string()))?;
        Ok(parse_sample(line))
    }

    /// Run the five health probes and grade the result. Never errors: a dead
    /// driver produces an unhealthy record, not a failure.
    pub async fn check_health(&self) -> HealthRecord {
        let driver_responsive = self
            .query("driver", &["-L"], HEALTH_PROBE_TIMEOUT)
            .await
            .is_ok();

        if !driver_responsive {
            warn!("driver probe failed, grading gpu unhealthy");
            let checks = HealthChecks {
                driver_responsive: false,
                temperature_normal: false,
                power_normal: false,
                no_ecc_errors: false,
                fan_operational: false,
            };
            return HealthRecord {
                ts: Utc::now(),
                overall: HealthGrade::Unhealthy,
                checks,
                error_count: checks.failing(),
                error_message: Some("driver not responsive".to_string()),
            };
        }

        let readings = self
            .query(
                "health-sample",
                &[
                    "--query-gpu=temperature.gpu,power.draw,fan.speed",
                    "--format=csv,noheader,nounits",
                ],
                HEALTH_PROBE_TIMEOUT,
            )
            .await
            .ok();
        let (temp, power, fan) = match readings.as_deref().and_then(|o| o.lines().next()) {
            Some(line) => {
                let cols: Vec<&str> = line.split(',').collect();
                (
                    parse_f64(cols.first().copied().unwrap_or("")),
                    parse_f64(cols.get(1).copied().unwrap_or("")),
                    parse_f64(cols.get(2).copied().unwrap_or("")),
                )
            }
            None => (None, None, None),
        };

        let ecc_errors = self
            .query(
                "ecc",
                &[
                    "--query-gpu=ecc.errors.corrected.volatile.total",
                    "--format=csv,noheader,nounits",
                ],
                HEALTH_PROBE_TIMEOUT,
            )
            .await
            .ok()
            .and_then(|o| parse_i64(o.lines().next().unwrap_or("")));

        let checks = evaluate_checks(temp, power, fan, ecc_errors);
        let error_count = checks.failing();
        let overall = checks.grade();
        let error_message = (error_count > 0).then(|| describe_failures(&checks));

        debug!(overall = %overall, failing = error_count, "health check complete");
        HealthRecord {
            ts: Utc::now(),
            overall,
            checks,
            error_count,
            error_message,
        }
    }
}

/// Apply the fixed thresholds to one set of readings. Unknown temperature and
/// power pass (present-but-unknown is not a fault); a missing fan reading
/// fails, since even passive boards report 0 RPM. ECC counts as clean when
/// the counter is zero or the probe is unsupported.
pub fn evaluate_checks(
    temp: Option<f64>,
    power: Option<f64>,
    fan: Option<f64>,
    ecc_errors: Option<i64>,
) -> HealthChecks {
    HealthChecks {
        driver_responsive: true,
        temperature_normal: temp.is_none_or(|t| t < TEMP_LIMIT_C),
        power_normal: power.is_none_or(|p| p < POWER_LIMIT_W),
        no_ecc_errors: ecc_errors.is_none_or(|n| n == 0),
        fan_operational: fan.is_some(),
    }
}

fn describe_failures(checks: &HealthChecks) -> String {
    let mut failed = Vec::new();
    if !checks.driver_responsive {
        failed.push("driver not responsive");
    }
    if !checks.temperature_normal {
        failed.push("temperature above limit");
    }
    if !checks.power_normal {
        failed.push("power draw above limit");
    }
    if !checks.no_ecc_errors {
        failed.push("corrected ecc errors present");
    }
    if !checks.fan_operational {
        failed.push("no fan reading");
    }
    failed.join("; ")
}

// ─── CSV parsing ─────────────────────────────────────────────────────────────

/// Normalize one CSV field. `N/A`, `[N/A]`, and `[Not Supported]` are
/// present-but-unknown.
fn field(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    match trimmed {
        "" | "N/A" | "[N/A]" | "[Not Supported]" | "[Unknown Error]" => None,
        _ => Some(trimmed),
    }
}

fn parse_f64(raw: &str) -> Option<f64> {
    field(raw)?.parse().ok()
}

fn parse_i64(raw: &str) -> Option<i64> {
    field(raw)?.parse().ok()
}

/// Parse `uuid,name,driver_version,compute_cap,memory.total`.
pub fn parse_describe(line: &str) -> GpuDescriptor {
    let cols: Vec<&str> = line.split(',').collect();
    GpuDescriptor {
        hardware_uuid: cols.first().and_then(|c| field(c)).map(str::to_string),
        name: cols
            .get(1)
            .and_then(|c| field(c))
            .unwrap_or("unknown")
            .to_string(),
        driver_version: cols.get(2).and_then(|c| field(c)).map(str::to_string),
        cuda_version: None,
        compute_capability: cols.get(3).and_then(|c| field(c)).map(str::to_string),
        total_vram_mb: cols.get(4).map(|c| parse_i64(c)).unwrap_or(None),
    }
}

/// Parse `utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw,fan.speed`.
pub fn parse_sample(line: &str) -> MetricSample {
    let cols: Vec<&str> = line.split(',').collect();
    MetricSample {
        ts: Utc::now(),
        gpu_utilization: cols.first().map(|c| parse_f64(c)).unwrap_or(None),
        vram_used_mb: cols.get(1).map(|c| parse_i64(c)).unwrap_or(None),
        vram_total_mb: cols.get(2).map(|c| parse_i64(c)).unwrap_or(None),
        temperature_c: cols.get(3).map(|c| parse_f64(c)).unwrap_or(None),
        power_draw_w: cols.get(4).map(|c| parse_f64(c)).unwrap_or(None),
        fan_speed_pct: cols.get(5).map(|c| parse_f64(c)).unwrap_or(None),
        container_status: None,
        uptime_secs: None,
    }
}

// ─── Performance scoring ─────────────────────────────────────────────────────

/// `100 − 2·max(0, temp−80) − 10·[temp>85] − 20·[fan not operational]`,
/// clamped to 0..=100. Derived, never persisted.
pub fn gpu_performance_score(temperature_c: Option<f64>, fan_operational: bool) -> u8 {
    let mut score = 100.0;
    if let Some(temp) = temperature_c {
        score -= 2.0 * (temp - 80.0).max(0.0);
        if temp > TEMP_LIMIT_C {
            score -= 10.0;
        }
    }
    if !fan_operational {
        score -= 20.0;
    }
    score.clamp(0.0, 100.0) as u8
}

/// `100 − 15·error_count − (30 unhealthy | 15 warning | 0)`, clamped.
pub fn system_stability_score(error_count: u32, grade: HealthGrade) -> u8 {
    let mut score: i64 = 100 - 15 * i64::from(error_count);
    score -= match grade {
        HealthGrade::Healthy => 0,
        HealthGrade::Warning => 15,
        HealthGrade::Unhealthy => 30,
    };
    score.clamp(0, 100) as u8
}

// ─── Host facts ──────────────────────────────────────────────────────────────

/// Static host identity for the registration payload.
pub fn host_facts() -> HostFacts {
    let mut sys = System::new_all();
    sys.refresh_all();

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    HostFacts {
        hostname,
        os: System::name().unwrap_or_default(),
        os_version: System::os_version().unwrap_or_default(),
        kernel: System::kernel_version().unwrap_or_default(),
        cpu_count: sys.cpus().len(),
        mem_total_mb: sys.total_memory() / 1024 / 1024,
    }
}

/// Rolling host snapshot attached to metrics pushes.
pub fn system_snapshot() -> SystemSnapshot {
    let mut sys = System::new_all();
    sys.refresh_all();

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let (disk_total, disk_used) = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .map(|d| (d.total_space(), d.total_space() - d.available_space()))
        .unwrap_or((0, 0));

    SystemSnapshot {
        cpu_usage_pct: sys.global_cpu_usage(),
        mem_used_mb: sys.used_memory() / 1024 / 1024,
        mem_total_mb: sys.total_memory() / 1024 / 1024,
        disk_used_gb: disk_used / 1024 / 1024 / 1024,
        disk_total_gb: disk_total / 1024 / 1024 / 1024,
        uptime_secs: System::uptime(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
