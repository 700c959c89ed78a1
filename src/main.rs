#![forbid(unsafe_code)]

//! `docflow`: operator CLI for the document pipeline engine.
//!
//! Inspects persisted sessions, lists their checkpoints, runs a retention
//! pass and validates configuration files.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use docflow::config::GlobalConfig;
use docflow::models::phase::Phase;
use docflow::orchestrator::{CheckpointManager, StatusSnapshot};
use docflow::persistence::{db, retention, SqliteCheckpointStore};
use docflow::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "docflow", about = "Document pipeline orchestration engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore a session from its latest checkpoint and print its status.
    Inspect {
        /// Session identifier.
        session_id: String,
    },
    /// List every checkpoint recorded for a session.
    History {
        /// Session identifier.
        session_id: String,
    },
    /// Run one retention pass over the checkpoint database.
    Purge,
    /// Validate the configuration and summarize phases and agents.
    CheckConfig,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(path = %args.config.display(), "configuration loaded");

    match args.command {
        Command::CheckConfig => {
            print_json(&config_summary(&config))?;
        }
        Command::Inspect { session_id } => {
            let manager = open_manager(&config).await?;
            let session = manager.restore(&session_id).await?;
            print_json(&StatusSnapshot::from_session(&session))?;
        }
        Command::History { session_id } => {
            let manager = open_manager(&config).await?;
            let history = manager.history(&session_id).await?;
            let rows: Vec<serde_json::Value> = history
                .iter()
                .map(|cp| {
                    serde_json::json!({
                        "sequence": cp.sequence,
                        "reason": cp.reason,
                        "phase": cp.phase,
                        "digest": cp.digest,
                        "created_at": cp.created_at,
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        Command::Purge => {
            let pool = db::connect(require_db_path(&config)?).await?;
            let deleted = retention::purge(&pool, config.retention_days).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
    }
    Ok(())
}

fn require_db_path(config: &GlobalConfig) -> Result<&std::path::Path> {
    config
        .db_path
        .as_deref()
        .ok_or_else(|| AppError::Config("db_path is not configured".into()))
}

async fn open_manager(config: &GlobalConfig) -> Result<CheckpointManager> {
    let pool = db::connect(require_db_path(config)?).await?;
    let store = SqliteCheckpointStore::new(Arc::new(pool));
    Ok(CheckpointManager::new(Arc::new(store)))
}

fn config_summary(config: &GlobalConfig) -> serde_json::Value {
    let phases: Vec<serde_json::Value> = Phase::ALL
        .into_iter()
        .map(|phase| {
            let tasks: Vec<&str> = config
                .phase(phase)
                .map(|cfg| cfg.tasks.iter().map(|t| t.id.as_str()).collect())
                .unwrap_or_default();
            serde_json::json!({
                "phase": phase,
                "requires_approval": config.requires_approval(phase),
                "tasks": tasks,
            })
        })
        .collect();
    let agents: serde_json::Map<String, serde_json::Value> = config
        .agents
        .iter()
        .map(|(name, agent)| (name.clone(), serde_json::json!(agent.max_concurrency)))
        .collect();

    serde_json::json!({
        "db_path": config.db_path,
        "retention_days": config.retention_days,
        "max_retries": config.max_retries,
        "default_agent_concurrency": config.default_agent_concurrency,
        "agents": agents,
        "phases": phases,
    })
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
