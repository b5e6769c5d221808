//! `bcp-export` -- command-line front end for the bcp export orchestrator.
//!
//! Connection settings come from the environment (a `.env` file is loaded
//! if present); see [`ExporterConfig::from_env`] for the variables.
//! Per-invocation flags override the environment.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bcpw_core::{ExportOutcome, ExportRequest, Exporter, ExporterConfig, OutputLine, ProcessPriority, StreamKind};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};

#[derive(Parser)]
#[command(name = "bcp-export", version, about = "Run bcp exports with timeout and abort control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: Overrides,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Args)]
struct Overrides {
    /// Kill the tool after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Process priority (idle, below-normal, normal, above-normal, high, real-time)
    #[arg(long, global = true)]
    priority: Option<ProcessPriority>,

    /// Directory containing the bcp executable
    #[arg(long, global = true)]
    tool_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export to a file the tool writes itself
    File {
        /// Destination path handed to the tool
        destination: String,
        /// Query template with {0}, {1}, ... placeholders
        query: String,
        /// Positional query arguments
        args: Vec<String>,
    },
    /// Export through a named pipe handed to the tool as its destination
    Pipe {
        query: String,
        args: Vec<String>,
        /// Write the export here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Export through the tool's standard streams
    Stream {
        query: String,
        args: Vec<String>,
        /// Destination argument handed to the tool
        #[arg(long, default_value = "/dev/stdout")]
        destination: String,
        /// Feed this file to the tool's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Write the tool's stdout here instead of our stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_json);

    let config = apply_overrides(
        ExporterConfig::from_env().context("Failed to load exporter configuration")?,
        cli.overrides,
    );
    tracing::debug!(?config, "Loaded exporter configuration");

    let exporter = Arc::new(Exporter::new(config));
    let (done_tx, done_rx) = oneshot::channel();
    let forwarder = tokio::spawn(forward_lines(exporter.subscribe(), done_rx));
    let interrupt = {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, aborting export");
                exporter.abort();
            }
        })
    };

    let result = run_command(&exporter, cli.command).await;

    interrupt.abort();
    let _ = done_tx.send(());
    let _ = forwarder.await;

    match result {
        Ok(outcome) => {
            eprintln!("{}", serde_json::to_string(&outcome)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            match e.downcast_ref::<bcpw_core::ExportError>() {
                Some(export_err) => {
                    tracing::error!(code = export_err.code(), error = %export_err, "Export failed")
                }
                None => tracing::error!(error = %format!("{e:#}"), "Export failed"),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn apply_overrides(mut config: ExporterConfig, overrides: Overrides) -> ExporterConfig {
    if let Some(secs) = overrides.timeout_secs {
        config.execution_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(priority) = overrides.priority {
        config.priority = priority;
    }
    if let Some(tool_path) = overrides.tool_path {
        config.tool_path = tool_path;
    }
    config
}

async fn run_command(exporter: &Exporter, command: Commands) -> anyhow::Result<ExportOutcome> {
    match command {
        Commands::File {
            destination,
            query,
            args,
        } => {
            let request = ExportRequest::new(destination).query(query).args(args);
            Ok(exporter.run(request).await?)
        }
        Commands::Pipe { query, args, out } => match out {
            Some(path) => {
                let mut file = create_output(&path).await?;
                let outcome = exporter.run_to_pipe(&mut file, query, args).await?;
                file.flush().await?;
                Ok(outcome)
            }
            None => {
                let mut buffer = std::io::Cursor::new(Vec::new());
                let outcome = exporter.run_to_pipe(&mut buffer, query, args).await?;
                let mut stdout = tokio::io::stdout();
                stdout.write_all(buffer.get_ref()).await?;
                stdout.flush().await?;
                Ok(outcome)
            }
        },
        Commands::Stream {
            query,
            args,
            destination,
            input,
            out,
        } => {
            let mut input = match input {
                Some(path) => Some(
                    tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open input {}", path.display()))?,
                ),
                None => None,
            };
            let mut file = match &out {
                Some(path) => Some(create_output(path).await?),
                None => None,
            };
            let mut stdout = tokio::io::stdout();

            let mut request = ExportRequest::new(destination).query(query).args(args);
            if let Some(input) = input.as_mut() {
                request = request.input(input);
            }
            request = match file.as_mut() {
                Some(file) => request.output(file),
                None => request.output(&mut stdout),
            };
            Ok(exporter.run(request).await?)
        }
    }
}

async fn create_output(path: &Path) -> anyhow::Result<tokio::fs::File> {
    tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create output {}", path.display()))
}

/// Log tool output lines until told to stop, then drain what is queued.
async fn forward_lines(mut rx: broadcast::Receiver<OutputLine>, mut done: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Ok(line) => log_line(&line),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped tool output lines");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut done => {
                while let Ok(line) = rx.try_recv() {
                    log_line(&line);
                }
                break;
            }
        }
    }
}

fn log_line(event: &OutputLine) {
    match event.stream {
        StreamKind::Stderr => tracing::info!(target: "bcp_export::tool", "{}", event.line),
        StreamKind::Stdout => tracing::debug!(target: "bcp_export::tool", "{}", event.line),
    }
}
