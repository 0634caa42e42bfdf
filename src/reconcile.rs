// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk reconciliation: backfill documents the change streams never carried.
//!
//! Covers data written before sync started, during downtime, or after a
//! resume token was lost. Runs alongside the live workers.
//!
//! # Algorithm
//!
//! For each collection in scope:
//!
//! 1. Stream every `_id` from the source side
//! 2. In batches of `batch_size`, ask the target which ids it already has
//! 3. Fetch the missing documents from the source
//! 4. Record them in the origin tracker, then insert (unordered)
//!
//! Existing target documents are never overwritten, which makes a run
//! idempotent and means a document deleted on the target is only brought
//! back if it still exists on the source.

use crate::config::{CollectionScope, ReconcileConfig};
use crate::coordinator::Direction;
use crate::error::Result;
use crate::feed::id_key;
use crate::metrics;
use crate::origin::{Fingerprint, OriginTracker};
use crate::resilience::RateLimiter;
use crate::store::DocumentStore;
use futures::StreamExt;
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Which way(s) a reconciliation run copies documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileDirection {
    LocalToRemote,
    RemoteToLocal,
    Both,
}

impl ReconcileDirection {
    pub fn directions(&self) -> Vec<Direction> {
        match self {
            ReconcileDirection::LocalToRemote => vec![Direction::LocalToRemote],
            ReconcileDirection::RemoteToLocal => vec![Direction::RemoteToLocal],
            ReconcileDirection::Both => Direction::BOTH.to_vec(),
        }
    }
}

impl From<Direction> for ReconcileDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::LocalToRemote => ReconcileDirection::LocalToRemote,
            Direction::RemoteToLocal => ReconcileDirection::RemoteToLocal,
        }
    }
}

impl FromStr for ReconcileDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "both" => Ok(ReconcileDirection::Both),
            "local-to-remote" | "push" => Ok(ReconcileDirection::LocalToRemote),
            "remote-to-local" | "pull" => Ok(ReconcileDirection::RemoteToLocal),
            other => Err(format!(
                "unknown direction '{}' (expected both, local-to-remote or remote-to-local)",
                other
            )),
        }
    }
}

/// Counts for one collection in one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub direction: Option<Direction>,
    /// Source documents examined.
    pub processed: u64,
    pub inserted: u64,
    /// Already present on the target, or gone from the source mid-run.
    pub skipped: u64,
    pub errors: u64,
}

/// Outcome of a reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub collections: Vec<CollectionReport>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ReconcileReport {
    fn absorb(&mut self, collection: CollectionReport) {
        self.processed += collection.processed;
        self.inserted += collection.inserted;
        self.skipped += collection.skipped;
        self.errors += collection.errors;
        self.collections.push(collection);
    }

    /// Stats for one collection, summed over directions.
    pub fn collection(&self, name: &str) -> CollectionReport {
        self.collections
            .iter()
            .filter(|c| c.collection == name)
            .fold(
                CollectionReport {
                    collection: name.to_string(),
                    ..Default::default()
                },
                |mut acc, c| {
                    acc.processed += c.processed;
                    acc.inserted += c.inserted;
                    acc.skipped += c.skipped;
                    acc.errors += c.errors;
                    acc
                },
            )
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Copies source-only documents to the target side.
pub struct ReconciliationJob<S: DocumentStore> {
    local: Arc<S>,
    remote: Arc<S>,
    scope: CollectionScope,
    origin: Arc<OriginTracker>,
    config: ReconcileConfig,
    rate_limiter: Option<RateLimiter>,
}

impl<S: DocumentStore> ReconciliationJob<S> {
    pub fn new(
        local: Arc<S>,
        remote: Arc<S>,
        scope: CollectionScope,
        origin: Arc<OriginTracker>,
        config: ReconcileConfig,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                "Rate limiting enabled for reconciliation"
            );
            RateLimiter::new(cfg)
        });

        Self {
            local,
            remote,
            scope,
            origin,
            config,
            rate_limiter,
        }
    }

    fn stores(&self, direction: Direction) -> (&S, &S) {
        match direction {
            Direction::LocalToRemote => (&*self.local, &*self.remote),
            Direction::RemoteToLocal => (&*self.remote, &*self.local),
        }
    }

    /// Run once. Failures are counted in the report, never raised.
    pub async fn run(&self, which: ReconcileDirection) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        for direction in which.directions() {
            let dir_started = Instant::now();
            let mut dir_report = ReconcileReport::default();

            let span = info_span!("reconcile", direction = %direction);
            async {
                info!(collections = ?self.scope.effective(), "Starting reconciliation");
                for collection in self.scope.effective() {
                    let stats = self.reconcile_collection(direction, &collection).await;
                    dir_report.absorb(stats);
                }
                info!(
                    processed = dir_report.processed,
                    inserted = dir_report.inserted,
                    skipped = dir_report.skipped,
                    errors = dir_report.errors,
                    duration_ms = dir_started.elapsed().as_millis() as u64,
                    "Reconciliation finished"
                );
            }
            .instrument(span)
            .await;

            metrics::record_reconcile_run(
                direction.label(),
                dir_report.processed,
                dir_report.inserted,
                dir_report.skipped,
                dir_report.errors,
                dir_started.elapsed(),
            );
            for collection in dir_report.collections {
                report.absorb(collection);
            }
        }

        report.duration = started.elapsed();
        report
    }

    async fn reconcile_collection(
        &self,
        direction: Direction,
        collection: &str,
    ) -> CollectionReport {
        let mut stats = CollectionReport {
            collection: collection.to_string(),
            direction: Some(direction),
            ..Default::default()
        };
        let (source, _) = self.stores(direction);

        let mut ids = match source.scan_ids(collection).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(%collection, error = %e, "Failed to list source ids");
                stats.errors += 1;
                return stats;
            }
        };

        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        while let Some(item) = ids.next().await {
            match item {
                Ok(id) => {
                    batch.push(id);
                    if batch.len() >= batch_size {
                        let ids = std::mem::take(&mut batch);
                        self.reconcile_batch(direction, collection, ids, &mut stats).await;
                    }
                }
                Err(e) => {
                    error!(%collection, error = %e, "Source id scan failed");
                    stats.errors += 1;
                    break;
                }
            }
        }
        if !batch.is_empty() {
            self.reconcile_batch(direction, collection, batch, &mut stats).await;
        }

        debug!(
            %collection,
            processed = stats.processed,
            inserted = stats.inserted,
            "Collection reconciled"
        );
        stats
    }

    async fn reconcile_batch(
        &self,
        direction: Direction,
        collection: &str,
        ids: Vec<Bson>,
        stats: &mut CollectionReport,
    ) {
        stats.processed += ids.len() as u64;
        if let Err(e) = self.copy_missing(direction, collection, &ids, stats).await {
            warn!(%collection, batch = ids.len(), error = %e, "Reconciliation batch failed");
            stats.errors += ids.len() as u64;
        }
    }

    async fn copy_missing(
        &self,
        direction: Direction,
        collection: &str,
        ids: &[Bson],
        stats: &mut CollectionReport,
    ) -> Result<()> {
        let (source, target) = self.stores(direction);

        let present: HashSet<String> = target
            .existing_ids(collection, ids)
            .await?
            .iter()
            .map(id_key)
            .collect();
        let missing: Vec<Bson> = ids
            .iter()
            .filter(|id| !present.contains(&id_key(id)))
            .cloned()
            .collect();
        stats.skipped += (ids.len() - missing.len()) as u64;
        if missing.is_empty() {
            return Ok(());
        }

        let documents = source.find_by_ids(collection, &missing).await?;
        // Deleted on the source since the scan.
        stats.skipped += missing.len().saturating_sub(documents.len()) as u64;
        if documents.is_empty() {
            return Ok(());
        }

        if let Some(ref limiter) = self.rate_limiter {
            limiter.acquire_many(documents.len() as u32).await;
        }

        let recorded = self.record_origin(direction, collection, &documents);
        let outcome = target.insert_many(collection, documents).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.forget_origin(direction, collection, &recorded);
                return Err(e);
            }
        };

        stats.inserted += outcome.inserted;
        stats.skipped += outcome.duplicates;
        stats.errors += outcome.failed.len() as u64;

        if !outcome.failed.is_empty() {
            let failed: HashSet<String> = outcome.failed.iter().map(|(id, _)| id_key(id)).collect();
            for (id, message) in &outcome.failed {
                warn!(
                    %collection,
                    document_id = %id,
                    error = %message,
                    "Failed to insert document"
                );
            }
            let failed_entries: Vec<_> = recorded
                .into_iter()
                .filter(|(key, _)| failed.contains(key))
                .collect();
            self.forget_origin(direction, collection, &failed_entries);
        }
        Ok(())
    }

    /// Pre-register the inserts so the target side's worker skips their echo.
    fn record_origin(
        &self,
        direction: Direction,
        collection: &str,
        documents: &[Document],
    ) -> Vec<(String, Fingerprint)> {
        let side = direction.target();
        documents
            .iter()
            .filter_map(|doc| {
                let key = id_key(doc.get("_id")?);
                let fp = Fingerprint::of(doc);
                self.origin.record(side, collection, &key, fp.clone());
                Some((key, fp))
            })
            .collect()
    }

    fn forget_origin(
        &self,
        direction: Direction,
        collection: &str,
        entries: &[(String, Fingerprint)],
    ) {
        let side = direction.target();
        for (key, fp) in entries {
            self.origin.forget(side, collection, key, fp);
        }
    }
}

/// Run reconciliation every `interval` until shutdown.
pub async fn run_periodic<S: DocumentStore>(
    job: Arc<ReconciliationJob<S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = shutdown_rx.borrow_and_update();
    info!(interval_secs = interval.as_secs(), "Starting periodic reconciliation");

    let mut timer = tokio::time::interval(interval);
    // The first tick fires immediately; startup reconciliation is separate.
    timer.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("Periodic reconciliation stopping");
                break;
            }
            _ = timer.tick() => {
                let report = job.run(ReconcileDirection::Both).await;
                if report.errors > 0 {
                    warn!(
                        errors = report.errors,
                        inserted = report.inserted,
                        "Periodic reconciliation had errors"
                    );
                }
            }
        }
    }
}
