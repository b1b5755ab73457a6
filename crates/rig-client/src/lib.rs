//! HTTP client for the orchestration server.
//!
//! Every call carries the agent's bearer credential and the fixed timeout
//! from configuration. Connection failures, timeouts, and 5xx responses are
//! classified `Transient` so callers can retry on their next tick; 401 is
//! terminal for the affected call.

#![forbid(unsafe_code)]

pub mod live;

use async_trait::async_trait;
use chrono::Utc;
use rig_proto::{
    AckRequest, Command, CommandsResponse, DeploySuccess, HealthPush, HeartbeatRequest,
    MetricsPush, RegisterRequest, RegisterResponse, TerminatedNotice,
};
use std::time::Duration;
use tracing::{debug, warn};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Timeout, connection refused, or a 5xx — retry on the next tick.
    #[error("transient server error: {0}")]
    Transient(String),

    #[error("server rejected credential")]
    Unauthorized,

    #[error("server rejected payload: {0}")]
    BadRequest(String),

    #[error("unexpected server response: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Registration outcome; a 409 replay hands back the existing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(String),
    AlreadyRegistered(String),
}

impl RegisterOutcome {
    pub fn gpu_uuid(&self) -> &str {
        match self {
            Self::Registered(uuid) | Self::AlreadyRegistered(uuid) => uuid,
        }
    }
}

// ─── Control-plane trait ─────────────────────────────────────────────────────

/// The seam between the agent and the server. Production uses [`ServerClient`];
/// tests substitute a recording fake.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterOutcome>;
    async fn heartbeat(&self) -> Result<()>;
    async fn poll_commands(&self) -> Result<Vec<Command>>;
    /// Must be called exactly once per dispatched command id.
    async fn ack_command(&self, command_id: &str, status: &str) -> Result<()>;
    async fn push_metrics(&self, payload: &MetricsPush) -> Result<()>;
    async fn push_health(&self, payload: &HealthPush) -> Result<()>;
    async fn notify_deploy_success(&self, payload: &DeploySuccess) -> Result<()>;
    async fn notify_deploy_terminated(&self, payload: &TerminatedNotice) -> Result<()>;
}

// ─── Status classification ───────────────────────────────────────────────────

/// Map an HTTP status to the error taxonomy. `None` means success.
pub fn classify_status(status: u16, body: &str) -> Option<ClientError> {
    match status {
        200..=299 => None,
        401 => Some(ClientError::Unauthorized),
        422 => Some(ClientError::BadRequest(body.to_string())),
        500..=599 => Some(ClientError::Transient(format!("server returned {status}"))),
        other => Some(ClientError::Protocol(format!(
            "unexpected status {other}: {body}"
        ))),
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() || e.is_connect() {
        ClientError::Transient(e.to_string())
    } else {
        ClientError::Protocol(e.to_string())
    }
}

/// Join a base url and a path without double slashes.
pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ─── Server client ───────────────────────────────────────────────────────────

pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    agent_id: String,
}

impl ServerClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        agent_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            agent_id: agent_id.into(),
        })
    }

    async fn post<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(u16, String)> {
        let url = endpoint(&self.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    async fn post_checked<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let (status, text) = self.post(path, body).await?;
        match classify_status(status, &text) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[async_trait]
impl ControlPlane for ServerClient {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterOutcome> {
        let (status, text) = self.post("api/host-agents/register", request).await?;
        match status {
            200 => {
                let parsed: RegisterResponse = serde_json::from_str(&text)
                    .map_err(|e| ClientError::Protocol(format!("register body: {e}")))?;
                Ok(RegisterOutcome::Registered(parsed.gpu_uuid))
            }
            409 => {
                let parsed: RegisterResponse = serde_json::from_str(&text)
                    .map_err(|e| ClientError::Protocol(format!("register body: {e}")))?;
                debug!(uuid = %parsed.gpu_uuid, "already registered");
                Ok(RegisterOutcome::AlreadyRegistered(parsed.gpu_uuid))
            }
            _ => Err(classify_status(status, &text)
                .unwrap_or_else(|| ClientError::Protocol(format!("register status {status}")))),
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        let payload = HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            status: "online".to_string(),
        };
        self.post_checked(
            &format!("api/host-agents/{}/heartbeat", self.agent_id),
            &payload,
        )
        .await
    }

    async fn poll_commands(&self) -> Result<Vec<Command>> {
        let url = endpoint(
            &self.base_url,
            &format!("api/host-agents/{}/commands", self.agent_id),
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if let Some(err) = classify_status(status, &text) {
            return Err(err);
        }
        let parsed: CommandsResponse = serde_json::from_str(&text)
            .map_err(|e| ClientError::Protocol(format!("commands body: {e}")))?;
        Ok(parsed.commands)
    }

    async fn ack_command(&self, command_id: &str, status: &str) -> Result<()> {
        let payload = AckRequest {
            status: status.to_string(),
            timestamp: Utc::now(),
        };
        self.post_checked(
            &format!(
                "api/host-agents/{}/commands/{}/ack",
                self.agent_id, command_id
            ),
            &payload,
        )
        .await
    }

    async fn push_metrics(&self, payload: &MetricsPush) -> Result<()> {
        self.post_checked("api/host-agents/metrics", payload).await
    }

    async fn push_health(&self, payload: &HealthPush) -> Result<()> {
        self.post_checked("api/host-agents/health", payload).await
    }

    async fn notify_deploy_success(&self, payload: &DeploySuccess) -> Result<()> {
        self.post_checked(
            &format!("api/deployments/{}/success", payload.deployment_id),
            payload,
        )
        .await
    }

    async fn notify_deploy_terminated(&self, payload: &TerminatedNotice) -> Result<()> {
        let result = self
            .post_checked(
                &format!("api/deployments/{}/terminated", payload.deployment_id),
                payload,
            )
            .await;
        if let Err(e) = &result {
            warn!(deployment = %payload.deployment_id, error = %e, "terminate notice not delivered");
        }
        result
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
