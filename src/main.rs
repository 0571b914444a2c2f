#![forbid(unsafe_code)]

//! `tunnel-session` binary.
//!
//! Loads a session file, checks the required tools, then brings the stages
//! up in order and holds them until one exits or the operator interrupts.
//! Teardown always runs before the process exits.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use tunnel_session::orchestrator::{plan, signals, ContextOptions, SessionContext};
use tunnel_session::{preflight, AppError, Result, SessionConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "tunnel-session",
    about = "Ordered process stages with guaranteed teardown",
    version,
    long_about = None
)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the session up and hold it until a stage exits or a signal arrives.
    Run {
        /// Path to the TOML session file.
        #[arg(long)]
        session: PathBuf,
    },
    /// Validate the session file and check required tools, then exit.
    Check {
        /// Path to the TOML session file.
        #[arg(long)]
        session: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args.command))
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Check { session } => {
            let config = SessionConfig::load_from_path(&session)?;
            preflight::check_required_tools(&config.required_tools)?;
            info!(
                session = config.name,
                stages = config.stages.len(),
                "session file ok"
            );
            Ok(())
        }
        Command::Run { session } => {
            let config = SessionConfig::load_from_path(&session)?;
            info!(session = config.name, stages = config.stages.len(), "configuration loaded");

            let ctx = SessionContext::new(ContextOptions {
                cleanup_grace: config.timing.cleanup_grace(),
                correlation_timeout: config.timing.correlation_timeout(),
                ..ContextOptions::default()
            });
            signals::bind(ctx.cleanup())?;

            let orchestrator = match preflight::check_required_tools(&config.required_tools)
                .and_then(|()| plan::prepare(&ctx, &config))
            {
                Ok(orchestrator) => orchestrator,
                Err(err) => {
                    error!(kind = ?err.kind(), %err, "session aborted before start");
                    ctx.cleanup().run_all(err.exit_code()).await;
                    return Err(err);
                }
            };

            let report = orchestrator.run().await;
            match report.fault {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
