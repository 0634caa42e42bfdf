//! Per-event apply logic.
//!
//! One [`EventApplier`] per direction. For each change event from the source
//! side it decides what, if anything, to do on the target:
//!
//! | Event | Target action | Outcomes |
//! |-------|---------------|----------|
//! | insert | insert if absent | `Inserted`, `AlreadyPresent`, `AlreadyCurrent` |
//! | update / replace | replace by `_id`, upsert | `Upserted`, `AlreadyCurrent` |
//! | delete | delete by `_id` | `Deleted`, `Absent` |
//! | any, echo of our own write | nothing | `Loopback` |
//! | echo, sides differ, source wins | copy source's document | `ConflictSettled` |
//! | insert/update/replace without post-image | nothing | `MissingDocument` |
//!
//! The echo check runs first and consults the shared [`OriginTracker`]. Every
//! write is announced to the tracker before it is issued and withdrawn if it
//! fails or turns out to be a no-op. All target I/O goes through the
//! direction's circuit breaker.
//!
//! Crossed edits: local sets `qty: 2` while remote sets `qty: 3`. Each worker
//! carries its side's edit over, then drops the other's echo, leaving the
//! values swapped. Only the direction reading from the winning side looks
//! past the echo: when its source and target disagree it copies the source's
//! current document across. The losing direction never writes on an echo,
//! so the exchange stops after one extra write.

use super::types::Direction;
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::{Result, SyncError};
use crate::feed::{ChangeEvent, OperationType};
use crate::origin::{Fingerprint, OriginTracker};
use crate::store::DocumentStore;
use mongodb::bson::Document;
use std::sync::Arc;
use tracing::{debug, trace};

/// How one event was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    /// Insert skipped: the target already has a document with this `_id`.
    AlreadyPresent,
    Upserted,
    Deleted,
    /// Delete skipped: nothing to delete on the target.
    Absent,
    /// The event is the echo of a write this engine made.
    Loopback,
    /// The target already holds an identical document.
    AlreadyCurrent,
    /// No post-image (document deleted before the lookup ran).
    MissingDocument,
    /// Echo of a crossed edit; the winning side's document was copied over.
    ConflictSettled,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::AlreadyPresent => "already_present",
            ApplyOutcome::Upserted => "upserted",
            ApplyOutcome::Deleted => "deleted",
            ApplyOutcome::Absent => "absent",
            ApplyOutcome::Loopback => "loopback",
            ApplyOutcome::AlreadyCurrent => "already_current",
            ApplyOutcome::MissingDocument => "missing_document",
            ApplyOutcome::ConflictSettled => "conflict_settled",
        }
    }

    /// The target was modified.
    pub fn wrote(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted
                | ApplyOutcome::Upserted
                | ApplyOutcome::Deleted
                | ApplyOutcome::ConflictSettled
        )
    }
}

/// Applies one direction's events to its target store.
pub struct EventApplier<S: DocumentStore> {
    direction: Direction,
    target: Arc<S>,
    origin: Arc<OriginTracker>,
    circuit: CircuitBreaker,
    /// Set when this direction's source wins crossed edits.
    winning_source: Option<Arc<S>>,
}

impl<S: DocumentStore> EventApplier<S> {
    pub fn new(
        direction: Direction,
        target: Arc<S>,
        origin: Arc<OriginTracker>,
        circuit: CircuitBreaker,
    ) -> Self {
        Self {
            direction,
            target,
            origin,
            circuit,
            winning_source: None,
        }
    }

    /// Settle crossed edits in favour of `source`, this direction's source.
    pub fn settling_conflicts_from(mut self, source: Arc<S>) -> Self {
        self.winning_source = Some(source);
        self
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Apply one event.
    ///
    /// Returns [`SyncError::CircuitOpen`] when the circuit rejected the
    /// attempt (nothing was written; retry later) and [`SyncError::Apply`]
    /// when the target operation failed.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let Some(fp) = Fingerprint::of_event(event) else {
            debug!(
                direction = %self.direction,
                collection = %event.collection,
                document_id = %event.document_id,
                op = %event.operation,
                "Event has no post-image, skipping"
            );
            return Ok(ApplyOutcome::MissingDocument);
        };

        let id_key = event.id_key();
        if self
            .origin
            .take_echo(self.direction.source(), &event.collection, &id_key, &fp)
        {
            trace!(
                direction = %self.direction,
                collection = %event.collection,
                document_id = %event.document_id,
                "Suppressed echo of sync write"
            );
            let Some(source) = &self.winning_source else {
                return Ok(ApplyOutcome::Loopback);
            };
            let result = self
                .circuit
                .call(|| self.settle_conflict(source, event, &id_key))
                .await;
            return self.map_circuit(event, result);
        }

        let result = self
            .circuit
            .call(|| self.write_to_target(event, &id_key, fp))
            .await;
        self.map_circuit(event, result)
    }

    fn map_circuit(
        &self,
        event: &ChangeEvent,
        result: std::result::Result<ApplyOutcome, CircuitError<SyncError>>,
    ) -> Result<ApplyOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(CircuitError::Rejected) => Err(SyncError::CircuitOpen {
                circuit: self.circuit.name().to_string(),
            }),
            Err(CircuitError::Inner(e)) => Err(SyncError::Apply {
                operation: event.operation.to_string(),
                document_id: event.document_id.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Copy the winning source's current document over a target that holds
    /// something else. Both sides agreeing means the echo was a plain echo.
    async fn settle_conflict(
        &self,
        source: &S,
        event: &ChangeEvent,
        id_key: &str,
    ) -> Result<ApplyOutcome> {
        let target_side = self.direction.target();
        let collection = event.collection.as_str();
        let id = &event.document_id;

        let winner = source.find_by_id(collection, id).await?;
        let current = self.target.find_by_id(collection, id).await?;
        if winner == current {
            return Ok(ApplyOutcome::Loopback);
        }

        let fp = winner.as_ref().map_or(Fingerprint::Deleted, Fingerprint::of);
        self.origin.record(target_side, collection, id_key, fp.clone());
        let written = match winner {
            Some(document) => self.target.replace_by_id(collection, id, document).await,
            None => self.target.delete_by_id(collection, id).await.map(|_| ()),
        };
        if let Err(e) = written {
            self.origin.forget(target_side, collection, id_key, &fp);
            return Err(e);
        }

        debug!(
            direction = %self.direction,
            collection,
            document_id = %id,
            winner = %self.direction.source(),
            "Settled crossed edit"
        );
        Ok(ApplyOutcome::ConflictSettled)
    }

    async fn write_to_target(
        &self,
        event: &ChangeEvent,
        id_key: &str,
        fp: Fingerprint,
    ) -> Result<ApplyOutcome> {
        let target_side = self.direction.target();
        let collection = event.collection.as_str();
        let id = &event.document_id;

        let document: &Document = match (&event.operation, &event.full_document) {
            (OperationType::Delete, _) => {
                self.origin.record(target_side, collection, id_key, fp.clone());
                return match self.target.delete_by_id(collection, id).await {
                    Ok(true) => Ok(ApplyOutcome::Deleted),
                    Ok(false) => {
                        self.origin.forget(target_side, collection, id_key, &fp);
                        Ok(ApplyOutcome::Absent)
                    }
                    Err(e) => {
                        self.origin.forget(target_side, collection, id_key, &fp);
                        Err(e)
                    }
                };
            }
            (_, Some(document)) => document,
            (_, None) => return Ok(ApplyOutcome::MissingDocument),
        };

        let current = self.target.find_by_id(collection, id).await?;
        match (&event.operation, current) {
            (_, Some(ref existing)) if existing == document => {
                return Ok(ApplyOutcome::AlreadyCurrent);
            }
            (OperationType::Insert, Some(_)) => return Ok(ApplyOutcome::AlreadyPresent),
            _ => {}
        }

        self.origin.record(target_side, collection, id_key, fp.clone());

        let written = if event.operation == OperationType::Insert {
            self.target
                .insert_if_absent(collection, document.clone())
                .await
                .map(|inserted| {
                    if inserted {
                        ApplyOutcome::Inserted
                    } else {
                        ApplyOutcome::AlreadyPresent
                    }
                })
        } else {
            self.target
                .replace_by_id(collection, id, document.clone())
                .await
                .map(|_| ApplyOutcome::Upserted)
        };

        match written {
            Ok(outcome) => {
                if !outcome.wrote() {
                    self.origin.forget(target_side, collection, id_key, &fp);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.origin.forget(target_side, collection, id_key, &fp);
                Err(e)
            }
        }
    }
}
