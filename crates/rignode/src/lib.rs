//! rignode — GPU host agent.
//!
//! Turns a GPU machine into a rentable compute node: registers with the
//! orchestration server, pulls deploy/terminate commands, runs tenant
//! containers, enforces rental durations, and reports telemetry.

#![forbid(unsafe_code)]

pub mod commands;
pub mod config;
pub mod error;
pub mod loops;
pub mod supervisor;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};

/// The single GPU slot this agent manages.
pub const SLOT_ID: &str = "gpu-0";

/// Process exit codes.
pub mod exit {
    pub const CLEAN: i32 = 0;
    pub const STARTUP_FAILURE: i32 = 1;
    pub const FATAL: i32 = 2;
    pub const SIGNAL: i32 = 130;
}
