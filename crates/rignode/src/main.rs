//! rignode — GPU host agent
//!
//! Registers this machine with the orchestration server, serves deploy and
//! terminate commands, and reports GPU telemetry until signalled.

use clap::{Parser, Subcommand};
use rignode::config::AgentConfig;
use rignode::{exit, supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "rignode")]
#[command(about = "GPU host agent for rentable compute nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (register, serve commands, report telemetry)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/rignode/config.yaml")]
        config: PathBuf,
    },

    /// Show GPU and host information for this machine
    Info,

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/rignode/config.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rignode=info")),
        )
        .init();

    match cli.command {
        Commands::Run { config } => match supervisor::run(&config).await {
            Ok(code) => ExitCode::from(code as u8),
            Err(e) => {
                error!(error = %e, "startup failed");
                ExitCode::from(exit::STARTUP_FAILURE as u8)
            }
        },
        Commands::Info => match info().await {
            Ok(()) => ExitCode::from(exit::CLEAN as u8),
            Err(e) => {
                error!(error = %e, "info failed");
                ExitCode::from(exit::FATAL as u8)
            }
        },
        Commands::InitConfig { output } => match init_config(&output) {
            Ok(()) => ExitCode::from(exit::CLEAN as u8),
            Err(e) => {
                error!(error = %e, "init-config failed");
                ExitCode::from(exit::FATAL as u8)
            }
        },
    }
}

// ─── Info ─────────────────────────────────────────────────────────────────────

async fn info() -> anyhow::Result<()> {
    let facts = rig_probe::host_facts();

    println!("Host Information:");
    println!();
    println!("  Hostname:  {}", facts.hostname);
    println!("  OS:        {} {}", facts.os, facts.os_version);
    println!("  Kernel:    {}", facts.kernel);
    println!("  CPUs:      {}", facts.cpu_count);
    println!("  Memory:    {} MB", facts.mem_total_mb);
    println!();

    let probe = rig_probe::HardwareProbe::default();
    match probe.describe_gpu().await {
        Ok(gpu) => {
            println!("GPU:");
            println!();
            println!("  Name:      {}", gpu.name);
            println!(
                "  Driver:    {}",
                gpu.driver_version.as_deref().unwrap_or("unknown")
            );
            println!(
                "  Compute:   {}",
                gpu.compute_capability.as_deref().unwrap_or("unknown")
            );
            if let Some(vram) = gpu.total_vram_mb {
                println!("  VRAM:      {vram} MB");
            }
        }
        Err(e) => {
            println!("GPU:         unavailable ({e})");
        }
    }
    println!();
    println!("  Agent:     rignode v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

// ─── InitConfig ───────────────────────────────────────────────────────────────

fn init_config(output: &PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::sample();
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to set your api key and public ip, then run:");
    println!("  rignode run --config {}", output.display());
    Ok(())
}
