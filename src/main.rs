// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! change-replicator CLI.

use anyhow::{Context, Result};
use change_replicator::{
    CheckpointStore, LogFormat, RedisStreamSource, ReplicationConfig, ReplicationError, Replicator,
    ShutdownHandle, SqliteCheckpointStore, SqliteSink, StartFrom,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Process exit codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    /// Invalid or unreadable configuration
    ConfigError = 1,
    /// Checkpoint could not be read or written
    CheckpointError = 2,
    /// Change feed unavailable or unusable
    SourceError = 3,
    /// Target store rejected writes
    TargetError = 4,
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its `ReplicationError` kind, if any.
    fn from_error(error: &anyhow::Error) -> Self {
        let Some(replication) = error.chain().find_map(|e| e.downcast_ref::<ReplicationError>()) else {
            return ExitCode::RuntimeError;
        };

        match replication {
            ReplicationError::Config(_) => ExitCode::ConfigError,
            ReplicationError::CheckpointPersistence { .. } => ExitCode::CheckpointError,
            ReplicationError::TransientFeed { .. } | ReplicationError::StreamTrimmed { .. } => {
                ExitCode::SourceError
            }
            ReplicationError::TransientSink { .. } | ReplicationError::Sink { .. } => ExitCode::TargetError,
            _ => ExitCode::RuntimeError,
        }
    }
}

#[derive(Parser)]
#[command(name = "change-replicator")]
#[command(about = "Replicate a change feed into a target store with durable checkpoints", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "replicator.toml")]
    config: PathBuf,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replicator until interrupted or the feed ends
    Run {
        /// Override the Redis URL of the change feed
        #[arg(long)]
        redis_url: Option<String>,

        /// Override the stream key
        #[arg(long)]
        stream_key: Option<String>,

        /// Override the target database path
        #[arg(long)]
        target: Option<String>,

        /// Override the startup policy
        #[arg(long, value_enum)]
        start_from: Option<StartFrom>,

        /// Override the log format
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },

    /// Print the stored checkpoint
    Status,

    /// Delete the stored checkpoint so the next run starts from `origin`
    Reset,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Config is loaded once up front for the log format; errors surface from
    // the command itself.
    let loaded = ReplicationConfig::load(&cli.config);
    let log_format = match (&cli.command, &loaded) {
        (Commands::Run { log_format: Some(f), .. }, _) => *f,
        (_, Ok(config)) => config.log_format,
        (_, Err(_)) => LogFormat::Text,
    };
    init_tracing(cli.verbose, log_format);

    match execute_command(cli, loaded).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            let code = ExitCode::from_error(&e);
            error!(error = %format!("{:#}", e), exit_code = code as i32, "Command failed");
            code
        }
    }
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

async fn execute_command(cli: Cli, loaded: change_replicator::Result<ReplicationConfig>) -> Result<()> {
    let mut config =
        loaded.with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            redis_url,
            stream_key,
            target,
            start_from,
            log_format: _,
        } => {
            if let Some(url) = redis_url {
                config.source.redis_url = url;
            }
            if let Some(key) = stream_key {
                config.source.stream_key = key;
            }
            if let Some(path) = target {
                config.target.sqlite_path = path;
            }
            if let Some(policy) = start_from {
                config.start_from = policy;
            }
            config.validate()?;
            run(config).await?;
        }

        Commands::Status => {
            config.validate()?;
            let store = open_checkpoints(&config).await?;
            match store.read().await? {
                Some(record) => {
                    let stored_at = chrono::DateTime::from_timestamp_millis(record.timestamp)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| record.timestamp.to_string());
                    println!("replication id: {}", store.replication_id());
                    println!("checkpoint:     {}", record.position);
                    println!("event time:     {}", stored_at);
                }
                None => {
                    println!("replication id: {}", store.replication_id());
                    println!("checkpoint:     none (next run starts from {:?})", config.origin);
                }
            }
            store.close().await;
        }

        Commands::Reset => {
            config.validate()?;
            let store = open_checkpoints(&config).await?;
            store.reset().await?;
            println!("Checkpoint for {} deleted", store.replication_id());
            store.close().await;
        }

        Commands::Validate => {
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

async fn open_checkpoints(config: &ReplicationConfig) -> Result<SqliteCheckpointStore> {
    let store = SqliteCheckpointStore::open_with(
        &config.checkpoint.sqlite_path,
        config.replication_id(),
        config.checkpoint.wal_mode,
    )
    .await?;
    Ok(store)
}

async fn run(config: ReplicationConfig) -> Result<()> {
    let source = RedisStreamSource::new(config.source_config());
    let sink = Arc::new(SqliteSink::open(&config.target.sqlite_path).await?);
    let checkpoints = Arc::new(open_checkpoints(&config).await?);

    let mut replicator = Replicator::new(config, source, Arc::clone(&sink), Arc::clone(&checkpoints))?;
    spawn_signal_handler(replicator.shutdown_handle());

    let result = replicator.run().await;

    checkpoints.close().await;
    sink.close().await;

    let stats = replicator.stats();
    info!(
        events = stats.events_accepted,
        malformed = stats.events_malformed,
        dropped = stats.events_dropped,
        flushes = stats.flushes,
        checkpoints = stats.checkpoints,
        reconnects = stats.reconnects,
        "Replicator exited"
    );

    result?;
    Ok(())
}

/// Trigger graceful shutdown on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, draining"),
                        _ = sigterm.recv() => info!("Received SIGTERM, draining"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot install SIGTERM handler, listening for Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT, draining");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, draining");
        }
        shutdown.shutdown();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_replication_error() {
        let cases = [
            (ReplicationError::Config("bad".into()), ExitCode::ConfigError),
            (
                ReplicationError::checkpoint_msg("advance", "disk full"),
                ExitCode::CheckpointError,
            ),
            (ReplicationError::feed_msg("xread", "refused"), ExitCode::SourceError),
            (
                ReplicationError::Sink {
                    destination: "db.c".into(),
                    message: "unauthorized".into(),
                },
                ExitCode::TargetError,
            ),
            (ReplicationError::Internal("bug".into()), ExitCode::RuntimeError),
        ];

        for (err, expected) in cases {
            let err = anyhow::Error::new(err);
            assert_eq!(ExitCode::from_error(&err), expected);
        }
    }

    #[test]
    fn test_exit_code_through_context() {
        let err = anyhow::Error::new(ReplicationError::Config("missing".into())).context("loading");
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);
    }

    #[test]
    fn test_exit_code_foreign_error() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "change-replicator",
            "-c",
            "x.toml",
            "-vv",
            "run",
            "--start-from",
            "earliest",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Run {
                start_from,
                log_format,
                ..
            } => {
                assert_eq!(start_from, Some(StartFrom::Earliest));
                assert_eq!(log_format, Some(LogFormat::Json));
            }
            _ => panic!("expected run"),
        }
    }
}
