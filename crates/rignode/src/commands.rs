//! Command dispatch.
//!
//! Commands arrive from the server in order; each dispatched command id is
//! acknowledged exactly once per agent run, on every exit path, including
//! unknown types and dispatch failures.

use parking_lot::Mutex;
use rig_client::ControlPlane;
use rig_engine::{DeploymentEngine, EngineError, USER_REQUESTED};
use rig_proto::{Command, CommandKind, DeploySpec, TerminateSpec};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What `process` did with a command; surfaced for tests and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Dispatched and acknowledged with the given status.
    Acked(&'static str),
    /// Acknowledged but the ack call failed; the server will redeliver and
    /// the state-machine guards absorb the replay.
    AckFailed(&'static str),
    /// Already fully handled earlier in this run.
    Skipped,
}

pub struct CommandProcessor {
    engine: Arc<DeploymentEngine>,
    server: Arc<dyn ControlPlane>,
    /// Ids acknowledged during this agent run.
    acked: Mutex<HashSet<String>>,
}

impl CommandProcessor {
    pub fn new(engine: Arc<DeploymentEngine>, server: Arc<dyn ControlPlane>) -> Self {
        Self {
            engine,
            server,
            acked: Mutex::new(HashSet::new()),
        }
    }

    /// Handle one command end to end. Dispatch failures never prevent the ack.
    pub async fn process(&self, command: &Command) -> ProcessOutcome {
        info!(
            command_id = %command.command_id,
            raw = %serde_json::to_string(command).unwrap_or_else(|_| "<unserializable>".into()),
            "command received"
        );

        if self.acked.lock().contains(&command.command_id) {
            debug!(command_id = %command.command_id, "command already handled this run");
            return ProcessOutcome::Skipped;
        }

        let status = self.dispatch(command).await;

        match self.server.ack_command(&command.command_id, status).await {
            Ok(()) => {
                self.acked.lock().insert(command.command_id.clone());
                ProcessOutcome::Acked(status)
            }
            Err(e) => {
                warn!(command_id = %command.command_id, error = %e, "ack failed, server will redeliver");
                ProcessOutcome::AckFailed(status)
            }
        }
    }

    async fn dispatch(&self, command: &Command) -> &'static str {
        match command.kind() {
            CommandKind::Deploy => {
                let spec: DeploySpec = match serde_json::from_value(command.payload.clone()) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!(command_id = %command.command_id, error = %e, "malformed deploy payload");
                        return "failed";
                    }
                };
                match self.engine.deploy(&command.command_id, &spec).await {
                    Ok(_) => "processed",
                    Err(EngineError::ResourceBusy) => {
                        warn!(command_id = %command.command_id, "deploy rejected, slot busy");
                        "failed"
                    }
                    Err(e) => {
                        error!(command_id = %command.command_id, error = %e, "deploy failed");
                        "failed"
                    }
                }
            }
            CommandKind::Terminate => {
                let spec: TerminateSpec = match serde_json::from_value(command.payload.clone()) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!(command_id = %command.command_id, error = %e, "malformed terminate payload");
                        return "failed";
                    }
                };
                let reason = spec.reason.as_deref().unwrap_or(USER_REQUESTED);
                match self.engine.terminate(&spec.deployment_id, reason).await {
                    Ok(_) => "processed",
                    Err(EngineError::NotFound(_)) => {
                        warn!(deployment = %spec.deployment_id, "terminate for unknown deployment");
                        "failed"
                    }
                    Err(e) => {
                        error!(deployment = %spec.deployment_id, error = %e, "terminate failed");
                        "failed"
                    }
                }
            }
            CommandKind::Unknown => {
                warn!(
                    command_id = %command.command_id,
                    command_type = %command.command_type,
                    "unknown command type, acknowledging anyway"
                );
                "ignored"
            }
        }
    }
}
