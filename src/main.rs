use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod controller;
mod manifest;
mod resources;
mod runtime;
mod state;
mod store;
mod templates;

use manifest::MANIFEST_FILE;
use runtime::RuntimeKind;

#[derive(Parser)]
#[command(name = "agent-sandbox")]
#[command(
    author,
    version,
    about = "Warm pools of pod-backed sandboxes, bound to claims on demand"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "AGENT_SANDBOX_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write sample agent-sandbox.toml and manifest.toml files
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Apply the manifest and run the controller
    Run {
        /// Manifest declaring templates, pools and claims
        #[arg(short, long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,

        /// Pod runtime (overrides agent-sandbox.toml)
        #[arg(long)]
        runtime: Option<RuntimeKind>,

        /// Number of reconcile workers (overrides agent-sandbox.toml)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Re-apply the manifest whenever it changes
        #[arg(long)]
        watch: bool,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Show pools, claims and sandboxes from the last snapshot
    Status,

    /// Check a manifest and print template hashes
    Validate {
        /// Manifest to check
        #[arg(short, long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,
    },

    /// Remove the state snapshot
    Clean {
        /// Also remove agent-sandbox.toml and manifest.toml
        #[arg(long)]
        all: bool,
    },
}

/// Installs the global subscriber. The returned guard flushes file logs
/// on drop and must live until exit.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = if cli.verbose {
        EnvFilter::new("agent_sandbox=debug")
    } else {
        EnvFilter::new("agent_sandbox=info")
    };

    let (writer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(cli.log_file.is_none());
    let layer = match cli.log_format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run {
            manifest,
            runtime,
            workers,
            watch,
            duration_secs,
        } => {
            commands::run::run(commands::run::RunOptions {
                manifest,
                runtime,
                workers,
                watch,
                duration: duration_secs.map(Duration::from_secs),
            })
            .await?;
        }
        Commands::Status => {
            commands::status::run()?;
        }
        Commands::Validate { manifest } => {
            commands::validate::run(&manifest)?;
        }
        Commands::Clean { all } => {
            commands::clean::run(all)?;
        }
    }

    Ok(())
}
