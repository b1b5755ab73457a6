//! Protocol types for the rignode GPU host agent.
//!
//! Defines the domain model (GPU slot, deployment, telemetry records) and the
//! wire payloads exchanged with the orchestration server.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ─── GPU slot status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuStatus {
    Available,
    Busy,
    Quarantined,
    Offline,
}

impl GpuStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Quarantined => "quarantined",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "busy" => Some(Self::Busy),
            "quarantined" => Some(Self::Quarantined),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Deployment status ───────────────────────────────────────────────────────

/// Tenant lifecycle states.
///
/// `Completed` is the terminal state for duration expiry, `Terminated` for an
/// explicit stop, `Failed` for any error path. Terminal states are write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Deploying,
    Running,
    Terminating,
    Terminated,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploying" => Some(Self::Deploying),
            "running" => Some(Self::Running),
            "terminating" => Some(Self::Terminating),
            "terminated" => Some(Self::Terminated),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Completed | Self::Failed)
    }

    /// Allowed forward transitions. Everything else is rejected by the store.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match self {
            Deploying => matches!(next, Running | Terminating | Failed),
            Running => matches!(next, Terminating | Failed),
            Terminating => matches!(next, Terminated | Completed | Failed),
            Terminated | Completed | Failed => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Health grade ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    Healthy,
    Warning,
    Unhealthy,
}

impl HealthGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "warning" => Some(Self::Warning),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    /// 0 failing checks = healthy, 1-2 = warning, 3+ = unhealthy.
    pub fn from_failing_checks(failing: u32) -> Self {
        match failing {
            0 => Self::Healthy,
            1 | 2 => Self::Warning,
            _ => Self::Unhealthy,
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Hardware descriptor & network binding ───────────────────────────────────

/// Static GPU identity as reported by the vendor tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDescriptor {
    /// Vendor-reported board UUID (distinct from the server-assigned uuid).
    pub hardware_uuid: Option<String>,
    pub name: String,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
    pub compute_capability: Option<String>,
    pub total_vram_mb: Option<i64>,
}

/// How tenants on this host are reachable from outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub public_ip: String,
    pub ssh_port: u16,
    pub rental_port_1: u16,
    pub rental_port_2: u16,
}

// ─── GPU slot ────────────────────────────────────────────────────────────────

/// The one GPU resource this agent manages, mirroring the `gpu_status` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSlot {
    pub slot_id: String,
    /// Server-assigned identity; never changes once set.
    pub uuid: Option<String>,
    pub name: String,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
    pub compute_capability: Option<String>,
    pub total_vram_mb: Option<i64>,
    pub public_ip: String,
    pub ssh_port: u16,
    pub rental_port_1: u16,
    pub rental_port_2: u16,
    pub status: GpuStatus,
    pub healthy: bool,
    pub gpu_utilization: Option<f64>,
    pub vram_used_mb: Option<i64>,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub fan_speed_pct: Option<f64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub current_deployment_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ─── Deployment ──────────────────────────────────────────────────────────────

/// One tenant on the GPU slot. The id equals the originating command id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub slot_id: String,
    pub template: String,
    pub image: String,
    pub container_id: Option<String>,
    pub status: DeploymentStatus,
    pub reason: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub user_id: String,
    pub ssh_port: Option<u16>,
    pub rental_port_1: Option<u16>,
    pub rental_port_2: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.start_time + Duration::minutes(self.duration_minutes)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Deterministic container name for a deployment.
pub fn container_name(deployment_id: &str) -> String {
    format!("deployment-{deployment_id}")
}

// ─── Telemetry records ───────────────────────────────────────────────────────

/// One GPU metrics sample. Unknown fields stay `None`; samples are
/// append-only and never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub ts: DateTime<Utc>,
    pub gpu_utilization: Option<f64>,
    pub vram_used_mb: Option<i64>,
    pub vram_total_mb: Option<i64>,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub fan_speed_pct: Option<f64>,
    pub container_status: Option<String>,
    pub uptime_secs: Option<i64>,
}

/// Per-probe pass/fail booleans from one health check pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthChecks {
    pub driver_responsive: bool,
    pub temperature_normal: bool,
    pub power_normal: bool,
    pub no_ecc_errors: bool,
    pub fan_operational: bool,
}

impl HealthChecks {
    pub fn failing(&self) -> u32 {
        [
            self.driver_responsive,
            self.temperature_normal,
            self.power_normal,
            self.no_ecc_errors,
            self.fan_operational,
        ]
        .iter()
        .filter(|ok| !**ok)
        .count() as u32
    }

    pub fn grade(&self) -> HealthGrade {
        HealthGrade::from_failing_checks(self.failing())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub ts: DateTime<Utc>,
    pub overall: HealthGrade,
    pub checks: HealthChecks,
    pub error_count: u32,
    pub error_message: Option<String>,
}

// ─── Commands ────────────────────────────────────────────────────────────────

/// A command as delivered by the server. `command_type` stays a raw string so
/// unknown types survive parsing and can still be acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Deploy,
    Terminate,
    Unknown,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self.command_type.as_str() {
            "deploy" => CommandKind::Deploy,
            "terminate" => CommandKind::Terminate,
            _ => CommandKind::Unknown,
        }
    }
}

/// Payload of a `deploy` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, alias = "template_type")]
    pub template_id: Option<String>,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: i64,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// container port → label; only the keys matter for allocation.
    #[serde(default)]
    pub ports: HashMap<String, Value>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// host path → container path.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
}

fn default_duration_minutes() -> i64 {
    60
}

fn default_user_id() -> String {
    "unknown".to_string()
}

impl DeploySpec {
    /// The image to run: explicit image wins, otherwise the template catalog.
    pub fn resolve_image(&self) -> String {
        if let Some(image) = &self.image {
            return image.clone();
        }
        template_image(self.template_id.as_deref().unwrap_or("cuda")).to_string()
    }

    pub fn template(&self) -> &str {
        self.template_id.as_deref().unwrap_or("custom")
    }

    /// Requested container ports, numeric keys only, sorted for determinism.
    pub fn container_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .keys()
            .filter_map(|k| k.parse::<u16>().ok())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

/// Default image per template family.
pub fn template_image(template: &str) -> &'static str {
    match template {
        "ubuntu" => "voltbay/ubuntu-template:latest",
        "pytorch" => "voltbay/pytorch-template:latest",
        "tensorflow" => "voltbay/tensorflow-template:latest",
        _ => "voltbay/cuda-template:latest",
    }
}

/// Payload of a `terminate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateSpec {
    pub deployment_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// ─── Wire payloads: agent → server ───────────────────────────────────────────

/// Host facts gathered at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub kernel: String,
    pub cpu_count: usize,
    pub mem_total_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub gpu: GpuDescriptor,
    pub host: HostFacts,
    pub network: NetworkBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub gpu_uuid: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolling system snapshot attached to every metrics push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub cpu_usage_pct: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    pub disk_used_gb: u64,
    pub disk_total_gb: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPush {
    pub agent_id: String,
    pub gpu_uuid: Option<String>,
    pub sample: MetricSample,
    pub system: SystemSnapshot,
    pub gpu_performance: u8,
    pub system_stability: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPush {
    pub agent_id: String,
    pub gpu_uuid: Option<String>,
    pub status: String,
    pub record: HealthRecord,
    pub gpu_performance: u8,
    pub system_stability: u8,
    pub timestamp: DateTime<Utc>,
}

// ─── Deploy outcome notifications ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshAccess {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupyterAccess {
    pub port: u16,
    pub url: String,
    pub token: String,
    pub full_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessInfo {
    pub public_ip: String,
    pub ssh: SshAccess,
    /// container port → allocated host port.
    pub port_mappings: HashMap<u16, u16>,
    pub jupyter: JupyterAccess,
}

impl AccessInfo {
    pub fn new(
        public_ip: &str,
        ssh_port: u16,
        username: &str,
        password: &str,
        jupyter_port: u16,
        jupyter_token: &str,
        port_mappings: HashMap<u16, u16>,
    ) -> Self {
        Self {
            public_ip: public_ip.to_string(),
            ssh: SshAccess {
                host: public_ip.to_string(),
                port: ssh_port,
                username: username.to_string(),
                password: password.to_string(),
                command: format!("ssh {username}@{public_ip} -p {ssh_port}"),
            },
            port_mappings,
            jupyter: JupyterAccess {
                port: jupyter_port,
                url: format!("http://{public_ip}:{jupyter_port}"),
                token: jupyter_token.to_string(),
                full_url: format!("http://{public_ip}:{jupyter_port}/?token={jupyter_token}"),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySuccess {
    pub deployment_id: String,
    pub status: String,
    pub container_id: String,
    pub access_info: AccessInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedNotice {
    pub deployment_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Best-effort progress frame for the optional live-update sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub status: String,
    pub agent_id: String,
    pub deployment_id: Option<String>,
    pub message: String,
}

impl LiveUpdate {
    pub fn new(agent_id: &str, deployment_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: "live_update".to_string(),
            agent_id: agent_id.to_string(),
            deployment_id: deployment_id.map(|d| d.to_string()),
            message: message.into(),
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Deployment / command ids travel in URLs and container names.
pub fn validate_deployment_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
