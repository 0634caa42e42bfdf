// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync worker: one direction of the link.
//!
//! Each worker owns one change stream on its source side and applies every
//! event, in order, to its target side through an [`EventApplier`].
//!
//! # Lifecycle
//!
//! `start()` opens the stream before returning, so a source that cannot be
//! watched fails the call. The stream is then driven by a spawned task:
//!
//! ```text
//! loop {
//!     select! (biased) {
//!         shutdown        → exit
//!         next event      → apply (runs to completion), advance resume token
//!         stream error    → reopen with backoff, resuming after the last
//!                           applied token; Failed once restarts run out
//!                           (the budget refills only after a stream has
//!                           stayed up for `max_retry_interval`)
//!     }
//! }
//! ```
//!
//! # Graceful Shutdown
//!
//! `stop()` signals the task and waits up to the drain timeout. The shutdown
//! signal is only observed between events, so an apply that has started
//! always finishes. A worker waiting on an open circuit gives up the event
//! on shutdown without advancing the resume token.
//!
//! # Failure Semantics
//!
//! Per-event failures are logged with operation and document id, counted
//! and skipped. Delivery is at least once: replays after a restart are
//! absorbed by the "already current" check.

use super::apply::EventApplier;
use super::types::{Direction, WorkerHealth, WorkerState};
use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::config::{CollectionScope, WorkerConfig};
use crate::error::{Result, SyncError};
use crate::feed::{ChangeEvent, ChangeFeedReader, ResumeToken};
use crate::metrics;
use crate::origin::OriginTracker;
use crate::resume::ResumeTokenStore;
use crate::store::DocumentStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Default)]
struct WorkerStats {
    received: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    restarts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the worker handle and its stream task.
struct Shared<S: DocumentStore> {
    direction: Direction,
    source: Arc<S>,
    scope: CollectionScope,
    applier: EventApplier<S>,
    resume: Option<Arc<ResumeTokenStore>>,
    config: WorkerConfig,
    open_timeout: Duration,
    state_tx: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl<S: DocumentStore> Shared<S> {
    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
        metrics::set_worker_state(self.direction.label(), &state.to_string());
    }

    fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }
}

/// One sync direction.
pub struct SyncWorker<S: DocumentStore> {
    shared: Arc<Shared<S>>,
    task: tokio::sync::Mutex<Option<RunningTask>>,
}

impl<S: DocumentStore> SyncWorker<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        source: Arc<S>,
        target: Arc<S>,
        scope: CollectionScope,
        origin: Arc<OriginTracker>,
        resume: Option<Arc<ResumeTokenStore>>,
        config: WorkerConfig,
        open_timeout: Duration,
    ) -> Self {
        let circuit = CircuitBreaker::new(
            format!("{}_writes", direction.label()),
            CircuitConfig::from_worker(&config),
        );
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        let mut applier = EventApplier::new(direction, target, origin, circuit);
        if direction.source() == config.conflict_winner_side() {
            applier = applier.settling_conflicts_from(Arc::clone(&source));
        }

        Self {
            shared: Arc::new(Shared {
                direction,
                source,
                scope,
                applier,
                resume,
                config,
                open_timeout,
                state_tx,
                stats: WorkerStats::default(),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<WorkerState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn health(&self) -> WorkerHealth {
        let stats = &self.shared.stats;
        let state = self.state();
        WorkerHealth {
            direction: self.shared.direction,
            state,
            enabled: true,
            healthy: state == WorkerState::Running,
            events_received: stats.received.load(Ordering::Relaxed),
            events_applied: stats.applied.load(Ordering::Relaxed),
            events_skipped: stats.skipped.load(Ordering::Relaxed),
            apply_errors: stats.errors.load(Ordering::Relaxed),
            restarts: stats.restarts.load(Ordering::Relaxed),
            last_error: stats.last_error.lock().clone(),
        }
    }

    /// Open the change stream and start applying events.
    ///
    /// Idempotent: while the worker is Starting or Running this logs a
    /// warning and returns `Ok(())`. Returns whether a stored resume token
    /// was used.
    pub async fn start(&self) -> Result<bool> {
        let mut task = self.task.lock().await;
        let shared = &self.shared;
        let direction = shared.direction;

        if shared.state().is_active() {
            warn!(%direction, "Sync worker already running, ignoring start");
            return Ok(false);
        }

        // A Failed worker's task has already exited.
        if let Some(old) = task.take() {
            let _ = old.shutdown_tx.send(true);
            let _ = old.handle.await;
        }

        shared.set_state(WorkerState::Starting);
        info!(%direction, collections = ?shared.scope.effective(), "Starting sync worker");

        let stored = match shared.resume {
            Some(ref store) => store.get(direction).await,
            None => None,
        };

        let mut reader = ChangeFeedReader::new(
            direction.source(),
            shared.scope.clone(),
            shared.open_timeout,
        );
        let resume_from = match open_stream(shared, &mut reader, stored).await {
            Ok(resume_from) => resume_from,
            Err(e) => {
                error!(%direction, error = %e, "Failed to open change stream");
                shared.stats.set_error(e.to_string());
                shared.set_state(WorkerState::Failed);
                return Err(e);
            }
        };

        shared.set_state(WorkerState::Running);
        let resumed = resume_from.is_some();
        info!(%direction, resumed, "Sync worker running");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("sync_worker", direction = %direction);
        let handle = tokio::spawn(
            run_stream(Arc::clone(shared), reader, resume_from, shutdown_rx).instrument(span),
        );
        *task = Some(RunningTask {
            shutdown_tx,
            handle,
        });

        Ok(resumed)
    }

    /// Stop the worker. The in-flight apply finishes first.
    ///
    /// Safe to call repeatedly.
    pub async fn stop(&self) {
        let direction = self.shared.direction;
        let running = self.task.lock().await.take();

        if let Some(RunningTask {
            shutdown_tx,
            mut handle,
        }) = running
        {
            let _ = shutdown_tx.send(true);
            let drain = self.shared.config.drain_timeout_duration();
            match tokio::time::timeout(drain, &mut handle).await {
                Ok(Ok(())) => debug!(%direction, "Sync worker task finished"),
                Ok(Err(e)) => warn!(%direction, error = %e, "Sync worker task panicked"),
                Err(_) => {
                    warn!(
                        %direction,
                        timeout_ms = drain.as_millis() as u64,
                        "Sync worker did not drain in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        if self.state() != WorkerState::Stopped {
            self.shared.set_state(WorkerState::Stopped);
            info!(%direction, "Sync worker stopped");
        }
    }
}

/// Open `reader`, falling back to a fresh stream if the server rejects the
/// stored token. Returns the token the stream resumed after, if any.
async fn open_stream<S: DocumentStore>(
    shared: &Shared<S>,
    reader: &mut ChangeFeedReader,
    resume_after: Option<ResumeToken>,
) -> Result<Option<ResumeToken>> {
    let direction = shared.direction;
    match reader.open(&*shared.source, resume_after.clone()).await {
        Ok(()) => Ok(resume_after),
        Err(SyncError::ResumeTokenRejected { message, .. }) if resume_after.is_some() => {
            warn!(
                %direction,
                error = %message,
                "Stored resume token rejected; changes since then may be missing until the next reconciliation"
            );
            metrics::record_resume_token_rejected(direction.label());
            if let Some(ref store) = shared.resume {
                if let Err(e) = store.clear(direction).await {
                    warn!(%direction, error = %e, "Failed to clear rejected resume token");
                }
            }
            reader.open(&*shared.source, None).await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

enum Reopen {
    Reopened,
    Shutdown,
    Exhausted,
}

async fn run_stream<S: DocumentStore>(
    shared: Arc<Shared<S>>,
    mut reader: ChangeFeedReader,
    mut resume_from: Option<ResumeToken>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let direction = shared.direction;
    let label = direction.label();
    let stable_after = shared.config.stability_window();
    // Restart budget, spent across reopens until a stream stays up.
    let mut restart_attempt = 0;
    let mut opened_at = Instant::now();
    let mut exhausted = false;

    loop {
        let item = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received");
                break;
            }

            item = reader.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                if !apply_with_circuit_wait(&shared, &event, &mut shutdown_rx).await {
                    break;
                }
                if let Some(token) = event.resume_token {
                    if let Some(ref store) = shared.resume {
                        store.set(direction, token.clone()).await;
                    }
                    resume_from = Some(token);
                }
            }
            other => {
                let message = match other {
                    Some(Err(e)) => e.to_string(),
                    _ => "change stream ended".to_string(),
                };
                warn!(error = %message, "Change stream failed");
                metrics::record_stream_error(label);
                shared.stats.set_error(message);

                if opened_at.elapsed() >= stable_after {
                    restart_attempt = 0;
                }
                let outcome = reopen(
                    &shared,
                    &mut reader,
                    &mut resume_from,
                    &mut restart_attempt,
                    &mut shutdown_rx,
                )
                .await;
                match outcome {
                    Reopen::Reopened => opened_at = Instant::now(),
                    Reopen::Shutdown => break,
                    Reopen::Exhausted => {
                        exhausted = true;
                        break;
                    }
                }
            }
        }
    }

    reader.close();
    info!(events_read = reader.events_read(), exhausted, "Sync worker loop exited");
    if exhausted {
        shared.set_state(WorkerState::Failed);
    }
}

/// Apply one event, waiting out an open circuit.
///
/// Returns `false` if shutdown arrived while waiting (event not applied).
async fn apply_with_circuit_wait<S: DocumentStore>(
    shared: &Shared<S>,
    event: &ChangeEvent,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let label = shared.direction.label();
    let op = event.operation.as_str();
    shared.stats.received.fetch_add(1, Ordering::Relaxed);
    metrics::record_event_received(label, op);

    loop {
        let started = Instant::now();
        match shared.applier.apply(event).await {
            Ok(outcome) => {
                metrics::record_apply_latency(label, started.elapsed());
                metrics::record_event_outcome(label, outcome.as_str());
                if outcome.wrote() {
                    shared.stats.applied.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    collection = %event.collection,
                    document_id = %event.document_id,
                    op,
                    outcome = outcome.as_str(),
                    "Applied change event"
                );
                return true;
            }
            Err(SyncError::CircuitOpen { circuit }) => {
                debug!(%circuit, "Target circuit open, waiting before retrying event");
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => return false,
                    _ = tokio::time::sleep(shared.config.circuit_wait_duration()) => {}
                }
            }
            Err(e) => {
                shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                shared.stats.set_error(e.to_string());
                metrics::record_apply_error(label, op);
                error!(
                    collection = %event.collection,
                    document_id = %event.document_id,
                    op,
                    error = %e,
                    "Failed to apply change event"
                );
                return true;
            }
        }
    }
}

/// Reopen the stream with backoff.
///
/// `attempt` carries over between calls so a stream that keeps failing
/// shortly after each reopen still runs out of restarts.
async fn reopen<S: DocumentStore>(
    shared: &Shared<S>,
    reader: &mut ChangeFeedReader,
    resume_from: &mut Option<ResumeToken>,
    attempt: &mut usize,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Reopen {
    let policy = shared.config.restart_policy();
    let label = shared.direction.label();

    loop {
        *attempt += 1;
        let current = *attempt;
        if !policy.allows(current) {
            error!(
                max_restarts = policy.max_attempts,
                "Change stream restarts exhausted, sync worker failed"
            );
            return Reopen::Exhausted;
        }

        let delay = policy.delay_for_attempt(current);
        info!(attempt = current, delay_ms = delay.as_millis() as u64, "Reopening change stream");
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Reopen::Shutdown,
            _ = tokio::time::sleep(delay) => {}
        }

        shared.stats.restarts.fetch_add(1, Ordering::Relaxed);
        metrics::record_stream_restart(label);

        match open_stream(shared, reader, resume_from.clone()).await {
            Ok(resumed_after) => {
                *resume_from = resumed_after;
                info!(attempt = current, "Change stream reopened");
                return Reopen::Reopened;
            }
            Err(e) => {
                warn!(attempt = current, error = %e, "Failed to reopen change stream");
                shared.stats.set_error(e.to_string());
            }
        }
    }
}
