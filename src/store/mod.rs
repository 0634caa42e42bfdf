// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store abstraction.
//!
//! Everything the sync engine needs from one side of the link goes through
//! [`DocumentStore`]: open a change stream, point reads and writes by `_id`,
//! and the batch operations bulk reconciliation uses. The production
//! implementation is [`MongoStore`](crate::mongo::MongoStore). The in-process
//! `MemoryStore` double used by the tests is compiled only for tests or with
//! the `test-util` feature.

use crate::config::CollectionScope;
use crate::error::Result;
use crate::feed::{ChangeEvent, ResumeToken};
use futures::stream::Stream;
use mongodb::bson::{Bson, Document};
use std::future::Future;
use std::pin::Pin;

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;

/// Which end of the sync link a store represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// On-premises replica set.
    Local,
    /// Cloud cluster (Atlas).
    Remote,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Side::Local),
            "remote" => Ok(Side::Remote),
            other => Err(format!("unknown side {:?} (expected local or remote)", other)),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boxed future returned by [`DocumentStore`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// An open change stream.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// A stream of `_id` values.
pub type IdStream = Pin<Box<dyn Stream<Item = Result<Bson>> + Send>>;

/// Result of an unordered multi-document insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertManyOutcome {
    pub inserted: u64,
    /// Documents skipped because the `_id` already existed.
    pub duplicates: u64,
    /// Documents that failed for any other reason: `(_id, message)`.
    pub failed: Vec<(Bson, String)>,
}

/// One side of the sync link.
///
/// All writes are keyed by `_id`. Implementations must be cheap to share
/// behind an `Arc` across the workers and the reconciliation job.
pub trait DocumentStore: Send + Sync + 'static {
    fn side(&self) -> Side;

    /// Open a change stream over the scope's collections.
    ///
    /// The stream carries insert/update/replace/delete events with the
    /// post-image looked up, in commit order. With `resume_after`, it starts
    /// right after that position or fails with
    /// [`SyncError::ResumeTokenRejected`](crate::error::SyncError::ResumeTokenRejected).
    fn watch(
        &self,
        scope: &CollectionScope,
        resume_after: Option<ResumeToken>,
    ) -> BoxFuture<'_, ChangeFeed>;

    fn find_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, Option<Document>>;

    /// Insert unless a document with the same `_id` exists.
    /// Returns `false` when it already existed.
    fn insert_if_absent(&self, collection: &str, document: Document) -> BoxFuture<'_, bool>;

    /// Replace the document with this `_id`, inserting it if missing.
    fn replace_by_id(&self, collection: &str, id: &Bson, document: Document)
        -> BoxFuture<'_, ()>;

    /// Returns `false` when nothing was deleted.
    fn delete_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, bool>;

    /// Every `_id` in the collection, in `_id` order.
    fn scan_ids(&self, collection: &str) -> BoxFuture<'_, IdStream>;

    /// The subset of `ids` present in the collection.
    fn existing_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Bson>>;

    fn find_by_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Document>>;

    /// Unordered insert; duplicate keys are counted, not raised.
    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> BoxFuture<'_, InsertManyOutcome>;

    fn count(&self, collection: &str) -> BoxFuture<'_, u64>;
}
