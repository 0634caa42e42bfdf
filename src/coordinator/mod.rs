// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bidirectional sync coordinator.
//!
//! Ties together:
//! - Two [`SyncWorker`]s, one per direction, over the same collection scope
//! - One shared [`OriginTracker`] so neither worker echoes the other's writes
//! - Optional resume-token persistence via [`ResumeTokenStore`]
//! - Bulk reconciliation via [`ReconciliationJob`], on demand or periodic
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────── local→remote worker ───────────┐
//!   local  ───┤                                            ├──→  remote
//!   (replica  └──────────── remote→local worker ←──────────┘     (Atlas)
//!    set)                         │
//!                         OriginTracker (shared)
//! ```
//!
//! With `bidirectional = false` only the local→remote worker runs.

pub mod apply;
mod types;
pub mod worker;

pub use apply::{ApplyOutcome, EventApplier};
pub use types::{CoordinatorState, Direction, StartReport, SyncStatus, WorkerHealth, WorkerState};
pub use worker::SyncWorker;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::mongo::MongoStore;
use crate::origin::OriginTracker;
use crate::reconcile::{self, ReconcileDirection, ReconcileReport, ReconciliationJob};
use crate::resilience::RetryConfig;
use crate::resume::ResumeTokenStore;
use crate::store::{DocumentStore, Side};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Background tasks owned by a started coordinator.
#[derive(Default)]
struct Background {
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// Keeps a local replica set and a remote cluster in sync in both directions.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct BidirectionalSync<S: DocumentStore = MongoStore> {
    config: SyncConfig,
    local: Arc<S>,
    remote: Arc<S>,
    origin: Arc<OriginTracker>,
    resume: Option<Arc<ResumeTokenStore>>,
    local_to_remote: SyncWorker<S>,
    /// `None` when bidirectional sync is off.
    remote_to_local: Option<SyncWorker<S>>,
    job: Arc<ReconciliationJob<S>>,
    state_tx: watch::Sender<CoordinatorState>,
    background: tokio::sync::Mutex<Background>,
}

impl BidirectionalSync<MongoStore> {
    /// Connect to both sides (and the resume store, if configured) and build
    /// the coordinator. Does not start syncing.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
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
        .await?;
        let remote = MongoStore::connect(
            Side::Remote,
            &config.remote_uri,
            database,
            &config.connection,
            &retry,
        )
        .await?;

        let resume = match config.resume.sqlite_path {
            Some(ref path) => Some(Arc::new(ResumeTokenStore::open(path).await?)),
            None => None,
        };

        Ok(Self::with_resume_store(
            config,
            Arc::new(local),
            Arc::new(remote),
            resume,
        ))
    }
}

impl<S: DocumentStore> BidirectionalSync<S> {
    /// Build a coordinator over two stores without resume persistence.
    pub fn new(config: SyncConfig, local: Arc<S>, remote: Arc<S>) -> Self {
        Self::with_resume_store(config, local, remote, None)
    }

    pub fn with_resume_store(
        config: SyncConfig,
        local: Arc<S>,
        remote: Arc<S>,
        resume: Option<Arc<ResumeTokenStore>>,
    ) -> Self {
        let origin = Arc::new(OriginTracker::new(config.origin.freshness_ttl_duration()));
        let open_timeout = config.connection.stream_open_timeout_duration();

        let worker = |direction: Direction| {
            let (source, target) = match direction {
                Direction::LocalToRemote => (Arc::clone(&local), Arc::clone(&remote)),
                Direction::RemoteToLocal => (Arc::clone(&remote), Arc::clone(&local)),
            };
            SyncWorker::new(
                direction,
                source,
                target,
                config.scope.clone(),
                Arc::clone(&origin),
                resume.clone(),
                config.worker.clone(),
                open_timeout,
            )
        };
        let local_to_remote = worker(Direction::LocalToRemote);
        let remote_to_local = config
            .bidirectional
            .then(|| worker(Direction::RemoteToLocal));

        let job = Arc::new(ReconciliationJob::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            config.scope.clone(),
            Arc::clone(&origin),
            config.reconcile.clone(),
        ));

        let (state_tx, _) = watch::channel(CoordinatorState::Created);

        Self {
            config,
            local,
            remote,
            origin,
            resume,
            local_to_remote,
            remote_to_local,
            job,
            state_tx,
            background: tokio::sync::Mutex::new(Background::default()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<S> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<S> {
        &self.remote
    }

    pub fn origin(&self) -> &Arc<OriginTracker> {
        &self.origin
    }

    /// Enabled workers.
    fn workers(&self) -> impl Iterator<Item = &SyncWorker<S>> {
        std::iter::once(&self.local_to_remote).chain(self.remote_to_local.as_ref())
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state_tx.send_replace(state);
        metrics::set_coordinator_state(&state.to_string());
    }

    /// Current state. A running coordinator whose worker has since failed
    /// reports `Degraded`.
    pub fn state(&self) -> CoordinatorState {
        let state = *self.state_tx.borrow();
        if state == CoordinatorState::Running
            && self.workers().any(|w| w.state() == WorkerState::Failed)
        {
            return CoordinatorState::Degraded;
        }
        state
    }

    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Start both workers and the background tasks.
    ///
    /// Calling this while running is a no-op that reports
    /// `already_running`. Calling it while `Degraded` retries the
    /// directions that are down.
    ///
    /// # Errors
    ///
    /// - [`SyncError::PartialStart`] when only some directions came up; the
    ///   coordinator is left `Degraded` with the others running.
    /// - The first worker's error when nothing came up (`Failed`).
    pub async fn start(&self) -> Result<StartReport> {
        let mut background = self.background.lock().await;

        if !self.config.enabled {
            info!("Sync disabled in configuration, not starting");
            self.set_state(CoordinatorState::Disabled);
            return Ok(StartReport {
                started: Vec::new(),
                resumed: Vec::new(),
                already_running: false,
            });
        }

        if self.state() == CoordinatorState::Running {
            warn!("Sync already running, ignoring start");
            return Ok(StartReport {
                started: Vec::new(),
                resumed: Vec::new(),
                already_running: true,
            });
        }

        info!(
            bidirectional = self.config.bidirectional,
            collections = ?self.config.scope.effective(),
            "Starting bidirectional sync"
        );
        self.set_state(CoordinatorState::Starting);

        let mut started = Vec::new();
        let mut resumed = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        let mut still_running = 0;

        for worker in self.workers() {
            let direction = worker.direction();
            // Retrying after a partial start only touches the down directions.
            if worker.state().is_active() {
                still_running += 1;
                continue;
            }
            match worker.start().await {
                Ok(true) => {
                    started.push(direction);
                    resumed.push(direction);
                }
                Ok(false) => started.push(direction),
                Err(e) => {
                    error!(%direction, error = %e, "Sync worker failed to start");
                    failed.push(direction);
                    first_error.get_or_insert(e);
                }
            }
        }

        if started.is_empty() && still_running == 0 {
            self.set_state(CoordinatorState::Failed);
            self.stop_background(&mut background).await;
            return Err(first_error
                .unwrap_or_else(|| SyncError::Internal("no sync direction configured".into())));
        }

        if background.shutdown_tx.is_none() {
            self.spawn_background(&mut background);
        }

        if !failed.is_empty() {
            warn!(?started, ?failed, "Sync only partially started");
            self.set_state(CoordinatorState::Degraded);
            return Err(SyncError::PartialStart { failed });
        }

        self.set_state(CoordinatorState::Running);
        info!(?started, ?resumed, "Bidirectional sync running");

        Ok(StartReport {
            started,
            resumed,
            already_running: false,
        })
    }

    fn spawn_background(&self, background: &mut Background) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Origin tracker purge.
        {
            let origin = Arc::clone(&self.origin);
            let interval = self.config.origin.purge_interval_duration();
            let mut shutdown_rx = shutdown_rx.clone();
            background.handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            let purged = origin.purge_expired();
                            if purged > 0 {
                                debug!(purged, "Purged stale origin entries");
                            }
                            metrics::set_origin_pending(origin.len());
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }));
        }

        // Debounced resume-token flush.
        if let Some(ref store) = self.resume {
            let store = Arc::clone(store);
            let interval = self.config.resume.flush_interval_duration();
            let mut shutdown_rx = shutdown_rx.clone();
            background.handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            if let Err(e) = store.flush_dirty().await {
                                warn!(error = %e, "Failed to flush resume tokens");
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            debug!("Resume flush task stopping");
                            break;
                        }
                    }
                }
            }));
        }

        if self.config.reconcile.on_startup {
            let job = Arc::clone(&self.job);
            let mut shutdown_rx = shutdown_rx.clone();
            background.handles.push(tokio::spawn(async move {
                tokio::select! {
                    report = job.run(ReconcileDirection::Both) => {
                        info!(
                            inserted = report.inserted,
                            errors = report.errors,
                            "Startup reconciliation complete"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        warn!("Startup reconciliation interrupted by shutdown");
                    }
                }
            }));
        }

        if let Some(interval) = self.config.reconcile.interval() {
            let job = Arc::clone(&self.job);
            background.handles.push(tokio::spawn(reconcile::run_periodic(
                job,
                interval,
                shutdown_rx.clone(),
            )));
        }

        debug!(tasks = background.handles.len(), "Spawned background tasks");
        background.shutdown_tx = Some(shutdown_tx);
    }

    async fn stop_background(&self, background: &mut Background) {
        if let Some(tx) = background.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        let drain = self.config.worker.drain_timeout_duration();
        for (i, mut handle) in std::mem::take(&mut background.handles).into_iter().enumerate() {
            match tokio::time::timeout(drain, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Background task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Background task panicked"),
                Err(_) => {
                    warn!(task = i + 1, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }

    /// Stop both workers and all background tasks. Idempotent.
    ///
    /// Resume tokens are flushed; the store stays open so the coordinator
    /// can be started again.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        let state = *self.state_tx.borrow();
        if matches!(
            state,
            CoordinatorState::Created | CoordinatorState::Stopped | CoordinatorState::Disabled
        ) {
            debug!(%state, "Sync not running, nothing to stop");
            return;
        }

        info!("Stopping bidirectional sync");
        futures::future::join_all(self.workers().map(|w| w.stop())).await;
        self.stop_background(&mut background).await;

        if let Some(ref store) = self.resume {
            if let Err(e) = store.flush_dirty().await {
                warn!(error = %e, "Failed to flush resume tokens on stop");
            }
        }

        self.set_state(CoordinatorState::Stopped);
        info!("Bidirectional sync stopped");
    }

    /// Stop and release the resume store. The coordinator cannot be
    /// restarted afterwards.
    pub async fn close(&self) {
        self.stop().await;
        if let Some(ref store) = self.resume {
            store.close().await;
        }
    }

    /// Running with every enabled worker running.
    pub fn is_healthy(&self) -> bool {
        self.state() == CoordinatorState::Running && self.workers().all(|w| w.is_healthy())
    }

    /// Snapshot for health endpoints. No I/O.
    pub fn status(&self) -> SyncStatus {
        let remote_to_local = match self.remote_to_local {
            Some(ref worker) => worker.health(),
            None => WorkerHealth::disabled(Direction::RemoteToLocal),
        };
        SyncStatus {
            state: self.state(),
            local_to_remote: self.local_to_remote.health(),
            remote_to_local,
            healthy: self.is_healthy(),
            origin_pending: self.origin.len(),
        }
    }

    /// Run the reconciliation job now. Works whether or not the workers are
    /// running.
    pub async fn reconcile(&self, direction: ReconcileDirection) -> ReconcileReport {
        self.job.run(direction).await
    }
}
