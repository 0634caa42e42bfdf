// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `bisync` - diagnostics and runner for mongo-bisync.
//!
//! Configuration comes from the environment (`LOCAL_MONGODB_URI`,
//! `MONGODB_ATLAS_URI`, `SYNC_*`); see [`SyncConfig::from_env`].

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mongo_bisync::config::SyncConfig;
use mongo_bisync::coordinator::{BidirectionalSync, CoordinatorState};
use mongo_bisync::diagnostics;
use mongo_bisync::origin::OriginTracker;
use mongo_bisync::preflight::{self, PreflightReport};
use mongo_bisync::reconcile::{ReconcileDirection, ReconciliationJob};
use mongo_bisync::resilience::RetryConfig;
use mongo_bisync::store::Side;
use mongo_bisync::{MongoStore, SyncError};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How often `run` retries directions that went down.
const DEGRADED_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bisync", version)]
#[command(about = "Bidirectional MongoDB change-stream sync", long_about = None)]
struct Cli {
    /// Log filter (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the local database is a replica set that can serve
    /// change streams.
    Preflight {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a marker locally and wait for it to appear remotely.
    Roundtrip {
        #[arg(long, default_value = "bills")]
        collection: String,

        /// How long to wait for the marker, e.g. `5s`.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        wait: Duration,

        /// Run a coordinator in this process for the duration of the test.
        #[arg(long)]
        with_engine: bool,
    },

    /// Copy documents missing on one side from the other, once.
    Reconcile {
        #[arg(long, default_value = "both")]
        direction: ReconcileDirection,
    },

    /// Run the sync until Ctrl-C.
    Run,
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("bisync failed: {e:#}");
            if let Some(SyncError::Connection { category, .. }) = e.downcast_ref::<SyncError>() {
                eprintln!("hint: {}", category.suggested_fix());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    let config = SyncConfig::from_env().context("loading configuration")?;

    match command {
        Command::Preflight { json } => {
            let report = preflight::check_replica_set(&config.local_uri, &config.connection).await;
            print_preflight(&report, json)?;
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Roundtrip {
            collection,
            wait,
            with_engine,
        } => roundtrip(config, &collection, wait, with_engine).await,
        Command::Reconcile { direction } => reconcile(config, direction).await,
        Command::Run => run_sync(config).await,
    }
}

fn print_preflight(report: &PreflightReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("status:  {}", report.status);
    if let Some(ref set) = report.replica_set {
        println!("replica set: {}", set);
    }
    println!("details: {}", report.details);
    if !report.remediation.is_empty() {
        println!("remediation:");
        for (i, step) in report.remediation.iter().enumerate() {
            println!("  {}. {}", i + 1, step);
        }
    }
    Ok(())
}

async fn connect_both(config: &SyncConfig) -> Result<(Arc<MongoStore>, Arc<MongoStore>)> {
    config.validate()?;
    let retry = RetryConfig::startup();
    let database = config.database.as_deref();
    let local = MongoStore::connect(
        Side::Local,
        &config.local_uri,
        database,
        &config.connection,
        &retry,
    )
    .await
    .context("connecting to local MongoDB")?;
    let remote = MongoStore::connect(
        Side::Remote,
        &config.remote_uri,
        database,
        &config.connection,
        &retry,
    )
    .await
    .context("connecting to remote MongoDB")?;
    Ok((Arc::new(local), Arc::new(remote)))
}

async fn roundtrip(
    config: SyncConfig,
    collection: &str,
    wait: Duration,
    with_engine: bool,
) -> Result<ExitCode> {
    let (local, remote) = connect_both(&config).await?;
    for (side, store) in [(Side::Local, &local), (Side::Remote, &remote)] {
        let latency = store.ping().await?;
        info!(%side, latency_ms = latency.as_millis() as u64, "Ping ok");
    }

    let engine = if with_engine {
        let sync = BidirectionalSync::new(config, Arc::clone(&local), Arc::clone(&remote));
        sync.start().await.context("starting in-process sync")?;
        Some(sync)
    } else {
        None
    };

    let report = diagnostics::roundtrip(&*local, &*remote, collection, wait).await;

    if let Some(sync) = engine {
        sync.stop().await;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn reconcile(config: SyncConfig, direction: ReconcileDirection) -> Result<ExitCode> {
    let (local, remote) = connect_both(&config).await?;
    let job = ReconciliationJob::new(
        local,
        remote,
        config.scope.clone(),
        Arc::new(OriginTracker::new(config.origin.freshness_ttl_duration())),
        config.reconcile.clone(),
    );

    let report = job.run(direction).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_sync(config: SyncConfig) -> Result<ExitCode> {
    if !config.enabled {
        info!("Sync disabled (SYNC_ENABLED=false), nothing to run");
        return Ok(ExitCode::SUCCESS);
    }

    let report = preflight::check_replica_set(&config.local_uri, &config.connection).await;
    if !report.ok {
        print_preflight(&report, false)?;
        bail!("preflight failed: {}", report.status);
    }

    let sync = BidirectionalSync::connect(config).await?;
    match sync.start().await {
        Ok(started) => info!(
            started = ?started.started,
            resumed = ?started.resumed,
            "Sync started"
        ),
        Err(SyncError::PartialStart { failed }) => {
            warn!(?failed, "Sync running degraded, retrying failed directions");
        }
        Err(e) => {
            sync.close().await;
            return Err(e.into());
        }
    }

    let mut retry_tick = tokio::time::interval(DEGRADED_RETRY_INTERVAL);
    retry_tick.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("waiting for Ctrl-C")?;
                break;
            }
            _ = retry_tick.tick() => {
                if sync.state() == CoordinatorState::Degraded {
                    match sync.start().await {
                        Ok(report) => {
                            info!(started = ?report.started, "Recovered failed directions")
                        }
                        Err(e) => warn!(error = %e, "Failed directions still down"),
                    }
                }
            }
        }
    }
    info!("Shutdown requested");

    let status = sync.status();
    info!(
        applied_l2r = status.local_to_remote.events_applied,
        applied_r2l = status.remote_to_local.events_applied,
        "Final sync counters"
    );
    sync.close().await;
    Ok(ExitCode::SUCCESS)
}
