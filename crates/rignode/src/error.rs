//! Agent error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("port {0} is already bound locally")]
    PortInUse(u16),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("probe error: {0}")]
    Probe(#[from] rig_probe::ProbeError),

    #[error("store error: {0}")]
    Store(#[from] rig_store::StoreError),

    #[error("server error: {0}")]
    Client(#[from] rig_client::ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;
