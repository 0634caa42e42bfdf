// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events and the change feed reader.
//!
//! A [`ChangeFeedReader`] wraps one change stream opened by a
//! [`DocumentStore`](crate::store::DocumentStore), restricted to the synced
//! collections and to the four data-changing operation types.
//!
//! # Stream Semantics
//!
//! ```text
//! open() ──► next() ──► next() ──► ... ──► Some(Err(..)) / None
//!                                              │
//!                                      stream is closed;
//!                                      the owning worker decides
//!                                      whether to open a new one
//! ```
//!
//! - Push based, no polling. Events arrive in source commit order.
//! - Every event carries the post-image for insert/update/replace (the
//!   stream is always opened with full-document lookup).
//! - Any error or end-of-stream is terminal for that reader instance.
//!
//! # Fingerprints
//!
//! [`fingerprint`] hashes a document's BSON bytes with SHA-256. Two
//! documents with identical fields in identical order share a fingerprint,
//! which is what loop prevention and the "already current" check compare.

use crate::config::CollectionScope;
use crate::error::{Result, SyncError};
use crate::store::{ChangeFeed, DocumentStore, Side};
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, trace};

/// Operation types the engine propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Replace,
        OperationType::Delete,
    ];

    /// Name as it appears in a change event's `operationType`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "replace" => Some(Self::Replace),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque stream position.
///
/// For MongoDB this is the BSON encoding of the server's resume token
/// document; the in-memory store uses its log sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        let hex = hex::encode(&self.0);
        hex.chars().take(16).collect()
    }
}

/// One change observed on a source database.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub collection: String,
    /// `_id` taken from the event's documentKey.
    pub document_id: Bson,
    /// Post-image. Present for insert/update/replace, absent for delete.
    pub full_document: Option<Document>,
    pub resume_token: Option<ResumeToken>,
}

impl ChangeEvent {
    pub fn new(
        operation: OperationType,
        collection: impl Into<String>,
        document_id: Bson,
        full_document: Option<Document>,
    ) -> Self {
        Self {
            operation,
            collection: collection.into(),
            document_id,
            full_document,
            resume_token: None,
        }
    }

    #[must_use]
    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Canonical string form of the document id.
    pub fn id_key(&self) -> String {
        id_key(&self.document_id)
    }
}

/// Canonical extended-JSON form of an `_id`, usable as a map key.
///
/// Distinguishes numeric types (`1` vs `1.0` vs `NumberLong(1)`), as the
/// server does.
pub fn id_key(id: &Bson) -> String {
    id.clone().into_canonical_extjson().to_string()
}

/// SHA-256 hex digest of a document's BSON encoding.
pub fn fingerprint(document: &Document) -> String {
    let mut hasher = Sha256::new();
    match bson::to_vec(document) {
        Ok(bytes) => hasher.update(&bytes),
        // Unencodable documents (oversized keys etc.) still get a stable digest.
        Err(_) => hasher.update(document.to_string().as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Aggregation pipeline restricting a database-level change stream to the
/// scope's collections and the propagated operation types.
pub fn collection_filter_pipeline(scope: &CollectionScope) -> Vec<Document> {
    let collections: Vec<Bson> = scope.effective().into_iter().map(Bson::String).collect();
    let operations: Vec<Bson> = OperationType::ALL
        .iter()
        .map(|op| Bson::String(op.as_str().to_string()))
        .collect();

    vec![doc! {
        "$match": {
            "ns.coll": { "$in": collections },
            "operationType": { "$in": operations },
        }
    }]
}

/// Reads one change stream for a worker.
pub struct ChangeFeedReader {
    source: Side,
    scope: CollectionScope,
    open_timeout: Duration,
    feed: Option<ChangeFeed>,
    last_token: Option<ResumeToken>,
    events_read: u64,
}

impl ChangeFeedReader {
    pub fn new(source: Side, scope: CollectionScope, open_timeout: Duration) -> Self {
        Self {
            source,
            scope,
            open_timeout,
            feed: None,
            last_token: None,
            events_read: 0,
        }
    }

    /// Open the stream, optionally resuming after `resume_after`.
    ///
    /// Replaces any stream this reader already holds.
    pub async fn open<S: DocumentStore + ?Sized>(
        &mut self,
        store: &S,
        resume_after: Option<ResumeToken>,
    ) -> Result<()> {
        self.close();

        let resuming = resume_after.is_some();
        let feed = tokio::time::timeout(self.open_timeout, store.watch(&self.scope, resume_after))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: format!("open {} change stream", self.source),
                after: self.open_timeout,
            })??;

        debug!(
            source = %self.source,
            collections = ?self.scope.effective(),
            resuming,
            "Change stream opened"
        );

        self.feed = Some(feed);
        Ok(())
    }

    /// Next in-scope event.
    ///
    /// `None` once the stream has ended or was never opened. An error closes
    /// the stream.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            let feed = self.feed.as_mut()?;
            match feed.next().await {
                None => {
                    debug!(source = %self.source, "Change stream ended");
                    self.feed = None;
                    return None;
                }
                Some(Err(e)) => {
                    self.feed = None;
                    return Some(Err(e));
                }
                Some(Ok(event)) => {
                    if !self.scope.contains(&event.collection) {
                        trace!(collection = %event.collection, "Ignoring out-of-scope event");
                        continue;
                    }
                    if let Some(ref token) = event.resume_token {
                        self.last_token = Some(token.clone());
                    }
                    self.events_read += 1;
                    return Some(Ok(event));
                }
            }
        }
    }

    /// Drop the underlying stream (closes the server cursor).
    pub fn close(&mut self) {
        if self.feed.take().is_some() {
            debug!(source = %self.source, "Change stream closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.feed.is_some()
    }

    /// Token of the last event handed out.
    pub fn last_token(&self) -> Option<&ResumeToken> {
        self.last_token.as_ref()
    }

    pub fn events_read(&self) -> u64 {
        self.events_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use mongodb::bson::oid::ObjectId;

    #[test]
    fn test_operation_type_roundtrip_names() {
        for op in OperationType::ALL {
            assert_eq!(OperationType::parse(op.as_str()), Some(op));
        }
        assert_eq!(OperationType::parse("drop"), None);
        assert_eq!(OperationType::Replace.to_string(), "replace");
    }

    #[test]
    fn test_fingerprint_is_stable_and_order_sensitive() {
        let a = doc! { "_id": 1, "tableNumber": "T1", "total": 12.5 };
        let b = doc! { "_id": 1, "tableNumber": "T1", "total": 12.5 };
        let c = doc! { "_id": 1, "total": 12.5, "tableNumber": "T1" };

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = doc! { "_id": "x", "status": "open" };
        let b = doc! { "_id": "x", "status": "paid" };
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_id_key_distinguishes_types() {
        assert_ne!(id_key(&Bson::Int32(1)), id_key(&Bson::Int64(1)));
        assert_ne!(id_key(&Bson::Int32(1)), id_key(&Bson::String("1".into())));

        let oid = ObjectId::new();
        assert_eq!(id_key(&Bson::ObjectId(oid)), id_key(&Bson::ObjectId(oid)));
        assert!(id_key(&Bson::ObjectId(oid)).contains(&oid.to_hex()));
    }

    #[test]
    fn test_collection_filter_pipeline() {
        let scope = CollectionScope::new(["bills", "orders", "users"]).excluding(["orders"]);
        let pipeline = collection_filter_pipeline(&scope);

        assert_eq!(pipeline.len(), 1);
        let matcher = pipeline[0].get_document("$match").unwrap();

        let colls = matcher
            .get_document("ns.coll")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(colls, &vec![Bson::from("bills"), Bson::from("users")]);

        let ops = matcher
            .get_document("operationType")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(ops.len(), 4);
        assert!(ops.contains(&Bson::from("delete")));
    }

    #[test]
    fn test_resume_token_short() {
        let token = ResumeToken::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(token.short(), "deadbeef");
        assert_eq!(token.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[tokio::test]
    async fn test_reader_filters_out_of_scope_and_tracks_token() {
        let store = MemoryStore::new(Side::Local);
        let scope = CollectionScope::new(["bills"]);
        let mut reader = ChangeFeedReader::new(Side::Local, scope, Duration::from_secs(1));

        assert!(reader.next().await.is_none());

        reader.open(&store, None).await.unwrap();
        assert!(reader.is_open());

        store.insert_raw("payroll", doc! { "_id": 1, "amount": 10 });
        store.insert_raw("bills", doc! { "_id": 2, "tableNumber": "T1" });

        let event = reader.next().await.unwrap().unwrap();
        assert_eq!(event.collection, "bills");
        assert_eq!(event.operation, OperationType::Insert);
        assert_eq!(event.document_id, Bson::Int32(2));
        assert!(reader.last_token().is_some());
        assert_eq!(reader.events_read(), 1);

        reader.close();
        assert!(!reader.is_open());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_error_is_terminal() {
        let store = MemoryStore::new(Side::Remote);
        let mut reader = ChangeFeedReader::new(
            Side::Remote,
            CollectionScope::default(),
            Duration::from_secs(1),
        );
        reader.open(&store, None).await.unwrap();

        store.break_feeds();

        let item = reader.next().await.unwrap();
        assert!(matches!(item, Err(SyncError::Stream { .. })));
        assert!(!reader.is_open());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_open_failure() {
        let store = MemoryStore::new(Side::Local);
        store.set_fail_watch(true);
        let mut reader = ChangeFeedReader::new(
            Side::Local,
            CollectionScope::default(),
            Duration::from_secs(1),
        );
        assert!(reader.open(&store, None).await.is_err());
        assert!(!reader.is_open());
    }
}
