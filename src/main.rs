//! `kernelhub` - multi-tenant compute kernel orchestrator
//!
//! This binary provides a small CLI around the kernel manager: a `run`
//! command that executes code on a fresh kernel and prints the event stream,
//! and the hidden `worker` subcommand that isolated-mode kernels re-enter.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use kernelhub_core::kernel::worker::runtime;
use kernelhub_core::EngineRegistry;

use crate::cli::{Cli, Commands};

mod cli;

/// Main entry point for the kernel orchestrator CLI
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr: in worker mode stdout carries the wire protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Worker => {
            let registry = Arc::new(EngineRegistry::with_defaults());
            runtime::run_stdio(registry).await?;
            Ok(())
        }
        Commands::Run(args) => cli::run(args).await,
    }
}
