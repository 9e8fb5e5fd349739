//! CLI surface
//!
//! Argument definitions and the `run` command: create a kernel, stream one
//! execution, print events, tear everything down.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;

use kernelhub_core::{
    EventPayload, ExecuteStreamItem, KernelLanguage, KernelManager, KernelMode, KernelOptions,
    KernelTypeSpec, ManagerConfig, StreamName,
};

#[derive(Parser)]
#[command(name = "kernelhub", version, about = "Multi-tenant compute kernel orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute code on a fresh kernel and print its event stream
    Run(RunArgs),
    /// Worker-process entry point (spawned by the manager, not by hand)
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
pub struct RunArgs {
    /// Code to execute; reads stdin when omitted
    pub code: Option<String>,

    /// Scheduling mode: worker (isolated process) or in-process
    #[arg(long, default_value = "worker")]
    pub mode: String,

    /// Kernel language
    #[arg(long, default_value = "python")]
    pub language: String,

    /// Per-execution deadline in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub max_execution_time_ms: u64,
}

fn parse_mode(mode: &str) -> Result<KernelMode> {
    match mode {
        "worker" => Ok(KernelMode::Worker),
        "in-process" | "in_process" => Ok(KernelMode::InProcess),
        other => bail!("unknown mode {:?} (expected worker or in-process)", other),
    }
}

fn parse_language(language: &str) -> KernelLanguage {
    match language {
        "python" => KernelLanguage::Python,
        "typescript" => KernelLanguage::TypeScript,
        other => KernelLanguage::Other(other.to_string()),
    }
}

/// Run one execution end to end and print what the kernel emits
pub async fn run(args: RunArgs) -> Result<()> {
    let code = match args.code {
        Some(code) => code,
        None => {
            use std::io::Read;
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read code from stdin")?;
            buffer
        }
    };

    let mode = parse_mode(&args.mode)?;
    let language = parse_language(&args.language);

    let config = ManagerConfig {
        allowed_kernel_types: vec![KernelTypeSpec::new(mode, language.clone())],
        ..Default::default()
    };
    let manager = KernelManager::new(config);

    let options = KernelOptions {
        mode,
        language,
        max_execution_time_ms: args.max_execution_time_ms,
        ..Default::default()
    };
    let kernel_id = manager
        .create(options)
        .await
        .context("failed to create kernel")?;

    let mut stream = manager.execute_stream(&kernel_id, &code, None);
    let mut failed = false;
    while let Some(item) = stream.next().await {
        match item {
            ExecuteStreamItem::Event(event) => print_event(&event.payload),
            ExecuteStreamItem::Completed(outcome) => {
                if let Some(result) = outcome.result {
                    println!("=> {}", result);
                }
                failed = !outcome.success;
            }
            ExecuteStreamItem::Failed(err) => {
                eprintln!("error: {}", err);
                failed = true;
            }
        }
    }

    manager.shutdown().await.context("shutdown failed")?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(payload: &EventPayload) {
    match payload {
        EventPayload::Stream { name, text } => match name {
            StreamName::Stdout => println!("{}", text),
            StreamName::Stderr => eprintln!("{}", text),
        },
        EventPayload::DisplayData(data) | EventPayload::UpdateDisplayData(data) => {
            if let Some(text) = data.data.get("text/plain") {
                println!("[display] {}", text);
            }
        }
        EventPayload::ExecuteResult(data) => {
            if let Some(text) = data.data.get("text/plain") {
                println!("[result] {}", text);
            }
        }
        EventPayload::ExecuteError(err) => {
            eprintln!("{}: {}", err.ename, err.evalue);
        }
        EventPayload::ExecutionStalled {
            max_execution_time_ms,
            ..
        } => {
            eprintln!("[stalled] execution exceeded {}ms", max_execution_time_ms);
        }
        other => {
            eprintln!("[event] {:?}", other);
        }
    }
}
