//! In-process [`DocumentStore`] with change streams and fault injection.
//!
//! ```text
//! write ──► collections (BTreeMap per collection, keyed by canonical _id)
//!   │
//!   └────► event log (bounded, seq numbered) ──► broadcast ──► open feeds
//! ```
//!
//! Mutation, log append and broadcast happen under one lock, and feeds
//! subscribe under the same lock, so a feed opened with a resume token sees
//! every later event exactly once. Resume tokens are big-endian sequence
//! numbers; a token older than the retained log is rejected the way a server
//! rejects a token that fell off the oplog.

use super::{BoxFuture, ChangeFeed, DocumentStore, IdStream, InsertManyOutcome, Side};
use crate::config::CollectionScope;
use crate::error::{Result, SyncError};
use crate::feed::{id_key, ChangeEvent, OperationType, ResumeToken};
use futures::stream::{self, StreamExt};
use mongodb::bson::{oid::ObjectId, Bson, Document};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

const LOG_CAPACITY: usize = 10_000;
const FEED_CAPACITY: usize = 4_096;

#[derive(Debug, Clone)]
enum FeedSignal {
    Event(ChangeEvent),
    /// Fail every open feed (simulated stepdown / network drop).
    Break,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    log: VecDeque<(u64, ChangeEvent)>,
    next_seq: u64,
    /// `(collection, id_key)` pairs whose writes fail.
    poisoned: HashSet<(String, String)>,
}

/// In-process [`DocumentStore`] with change streams and fault injection.
pub struct MemoryStore {
    side: Side,
    state: Mutex<MemoryState>,
    feed_tx: broadcast::Sender<FeedSignal>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_watch: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(side: Side) -> Self {
        let (feed_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            side,
            state: Mutex::new(MemoryState {
                next_seq: 1,
                ..Default::default()
            }),
            feed_tx,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Every write fails while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every read fails while set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// `watch()` fails while set.
    pub fn set_fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// Writes touching this document fail until cleared.
    pub fn poison(&self, collection: &str, id: &Bson) {
        self.state
            .lock()
            .poisoned
            .insert((collection.to_string(), id_key(id)));
    }

    pub fn clear_poison(&self) {
        self.state.lock().poisoned.clear();
    }

    /// Fail every currently open change stream.
    pub fn break_feeds(&self) {
        let _ = self.feed_tx.send(FeedSignal::Break);
    }

    /// Drop the retained event log; older resume tokens become invalid.
    pub fn truncate_history(&self) {
        self.state.lock().log.clear();
    }

    // -------------------------------------------------------------------------
    // Direct (application-side) writes
    // -------------------------------------------------------------------------

    /// Insert or overwrite a document as an application would, emitting the
    /// matching change event. A missing `_id` gets a fresh ObjectId.
    pub fn insert_raw(&self, collection: &str, document: Document) -> Bson {
        let document = ensure_id(document);
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        let mut state = self.state.lock();
        let existed = state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id_key(&id), document.clone())
            .is_some();
        let op = if existed {
            OperationType::Replace
        } else {
            OperationType::Insert
        };
        self.emit(&mut state, op, collection, id.clone(), Some(document));
        id
    }

    /// `$set` the given fields, emitting an update event with the post-image.
    /// Returns `false` if the document does not exist.
    pub fn update_fields(&self, collection: &str, id: &Bson, fields: Document) -> bool {
        let mut state = self.state.lock();
        let Some(current) = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(&id_key(id)))
        else {
            return false;
        };
        for (k, v) in fields {
            current.insert(k, v);
        }
        let post_image = current.clone();
        self.emit(
            &mut state,
            OperationType::Update,
            collection,
            id.clone(),
            Some(post_image),
        );
        true
    }

    /// Delete as an application would.
    pub fn delete_raw(&self, collection: &str, id: &Bson) -> bool {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, collection, id)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn get(&self, collection: &str, id: &Bson) -> Option<Document> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(&id_key(id)).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Successful writes made through the [`DocumentStore`] interface.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Change streams currently open on this store.
    pub fn open_feeds(&self) -> usize {
        self.feed_tx.receiver_count()
    }

    /// Number of change events emitted so far.
    pub fn events_emitted(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn emit(
        &self,
        state: &mut MemoryState,
        operation: OperationType,
        collection: &str,
        id: Bson,
        full_document: Option<Document>,
    ) {
        let seq = state.next_seq;
        state.next_seq += 1;
        let event = ChangeEvent::new(operation, collection, id, full_document)
            .with_resume_token(ResumeToken::from_bytes(seq.to_be_bytes().to_vec()));
        if state.log.len() >= LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back((seq, event.clone()));
        // No receivers is fine.
        let _ = self.feed_tx.send(FeedSignal::Event(event));
    }

    fn remove_locked(&self, state: &mut MemoryState, collection: &str, id: &Bson) -> bool {
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(&id_key(id)))
            .is_some();
        if removed {
            self.emit(state, OperationType::Delete, collection, id.clone(), None);
        }
        removed
    }

    fn check_write(
        &self,
        state: &MemoryState,
        operation: &str,
        collection: &str,
        id: &Bson,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst)
            || state
                .poisoned
                .contains(&(collection.to_string(), id_key(id)))
        {
            return Err(SyncError::database_msg(
                operation,
                format!("injected write failure on {}.{}", collection, id),
            ));
        }
        Ok(())
    }

    fn check_read(&self, operation: &str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::database_msg(operation, "injected read failure"));
        }
        Ok(())
    }

    fn replay_after(&self, state: &MemoryState, token: &ResumeToken) -> Result<Vec<ChangeEvent>> {
        let bytes: [u8; 8] = token.as_bytes().try_into().map_err(|_| {
            SyncError::ResumeTokenRejected {
                side: self.side,
                message: format!("malformed resume token {}", token.short()),
            }
        })?;
        let after = u64::from_be_bytes(bytes);

        let oldest = state.log.front().map_or(state.next_seq, |(seq, _)| *seq);
        if after + 1 < oldest {
            return Err(SyncError::ResumeTokenRejected {
                side: self.side,
                message: "resume point is no longer in the change history".to_string(),
            });
        }

        Ok(state
            .log
            .iter()
            .filter(|(seq, _)| *seq > after)
            .map(|(_, event)| event.clone())
            .collect())
    }
}

fn ensure_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = Document::new();
    with_id.insert("_id", ObjectId::new());
    for (k, v) in document {
        with_id.insert(k, v);
    }
    with_id
}

/// Force `_id` to `id`, keeping it as the first field.
fn with_id(id: &Bson, document: Document) -> Document {
    if document.get("_id") == Some(id) {
        return document;
    }
    let mut out = Document::new();
    out.insert("_id", id.clone());
    for (k, v) in document {
        if k != "_id" {
            out.insert(k, v);
        }
    }
    out
}

impl DocumentStore for MemoryStore {
    fn side(&self) -> Side {
        self.side
    }

    fn watch(
        &self,
        scope: &CollectionScope,
        resume_after: Option<ResumeToken>,
    ) -> BoxFuture<'_, ChangeFeed> {
        let scope = scope.clone();
        Box::pin(async move {
            if self.fail_watch.load(Ordering::SeqCst) {
                return Err(SyncError::stream(self.side, "injected watch failure"));
            }

            let (replay, rx) = {
                let state = self.state.lock();
                let replay = match resume_after {
                    Some(ref token) => self.replay_after(&state, token)?,
                    None => Vec::new(),
                };
                (replay, self.feed_tx.subscribe())
            };

            let side = self.side;
            let live = stream::unfold(Some(rx), move |rx| async move {
                let mut rx = rx?;
                match rx.recv().await {
                    Ok(FeedSignal::Event(event)) => Some((Ok(event), Some(rx))),
                    Ok(FeedSignal::Break) => Some((
                        Err(SyncError::stream(side, "change stream interrupted")),
                        None,
                    )),
                    Err(broadcast::error::RecvError::Lagged(n)) => Some((
                        Err(SyncError::stream(
                            side,
                            format!("change stream fell behind by {} events", n),
                        )),
                        None,
                    )),
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            });

            let feed = stream::iter(replay.into_iter().map(Ok))
                .chain(live)
                .filter(move |item| {
                    let keep = match item {
                        Ok(event) => scope.contains(&event.collection),
                        Err(_) => true,
                    };
                    futures::future::ready(keep)
                })
                .boxed();

            Ok(feed)
        })
    }

    fn find_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, Option<Document>> {
        let collection = collection.to_string();
        let id = id.clone();
        Box::pin(async move {
            self.check_read("find_by_id")?;
            Ok(self.get(&collection, &id))
        })
    }

    fn insert_if_absent(&self, collection: &str, document: Document) -> BoxFuture<'_, bool> {
        let collection = collection.to_string();
        Box::pin(async move {
            let document = ensure_id(document);
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            let mut state = self.state.lock();
            self.check_write(&state, "insert_one", &collection, &id)?;

            let key = id_key(&id);
            let coll = state.collections.entry(collection.clone()).or_default();
            if coll.contains_key(&key) {
                return Ok(false);
            }
            coll.insert(key, document.clone());
            self.emit(&mut state, OperationType::Insert, &collection, id, Some(document));
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }

    fn replace_by_id(
        &self,
        collection: &str,
        id: &Bson,
        document: Document,
    ) -> BoxFuture<'_, ()> {
        let collection = collection.to_string();
        let id = id.clone();
        Box::pin(async move {
            let document = with_id(&id, document);
            let mut state = self.state.lock();
            self.check_write(&state, "replace_one", &collection, &id)?;

            let existed = state
                .collections
                .entry(collection.clone())
                .or_default()
                .insert(id_key(&id), document.clone())
                .is_some();
            let op = if existed {
                OperationType::Replace
            } else {
                OperationType::Insert
            };
            self.emit(&mut state, op, &collection, id, Some(document));
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, bool> {
        let collection = collection.to_string();
        let id = id.clone();
        Box::pin(async move {
            let mut state = self.state.lock();
            self.check_write(&state, "delete_one", &collection, &id)?;
            let removed = self.remove_locked(&mut state, &collection, &id);
            if removed {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(removed)
        })
    }

    fn scan_ids(&self, collection: &str) -> BoxFuture<'_, IdStream> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.check_read("scan_ids")?;
            let ids: Vec<Bson> = self
                .state
                .lock()
                .collections
                .get(&collection)
                .map(|c| c.values().filter_map(|d| d.get("_id").cloned()).collect())
                .unwrap_or_default();
            Ok(stream::iter(ids.into_iter().map(Ok)).boxed())
        })
    }

    fn existing_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Bson>> {
        let collection = collection.to_string();
        let ids = ids.to_vec();
        Box::pin(async move {
            self.check_read("existing_ids")?;
            let state = self.state.lock();
            let Some(coll) = state.collections.get(&collection) else {
                return Ok(Vec::new());
            };
            Ok(ids
                .into_iter()
                .filter(|id| coll.contains_key(&id_key(id)))
                .collect())
        })
    }

    fn find_by_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Document>> {
        let collection = collection.to_string();
        let ids = ids.to_vec();
        Box::pin(async move {
            self.check_read("find_by_ids")?;
            let state = self.state.lock();
            let Some(coll) = state.collections.get(&collection) else {
                return Ok(Vec::new());
            };
            Ok(ids
                .iter()
                .filter_map(|id| coll.get(&id_key(id)).cloned())
                .collect())
        })
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> BoxFuture<'_, InsertManyOutcome> {
        let collection = collection.to_string();
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SyncError::database_msg(
                    "insert_many",
                    "injected write failure",
                ));
            }

            let mut outcome = InsertManyOutcome::default();
            let mut state = self.state.lock();
            for document in documents {
                let document = ensure_id(document);
                let id = document.get("_id").cloned().unwrap_or(Bson::Null);
                let key = id_key(&id);

                if state.poisoned.contains(&(collection.clone(), key.clone())) {
                    outcome
                        .failed
                        .push((id, "injected write failure".to_string()));
                    continue;
                }

                let coll = state.collections.entry(collection.clone()).or_default();
                if coll.contains_key(&key) {
                    outcome.duplicates += 1;
                    continue;
                }
                coll.insert(key, document.clone());
                self.emit(&mut state, OperationType::Insert, &collection, id, Some(document));
                self.writes.fetch_add(1, Ordering::SeqCst);
                outcome.inserted += 1;
            }
            Ok(outcome)
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, u64> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.check_read("count")?;
            Ok(self.len(&collection) as u64)
        })
    }
}
