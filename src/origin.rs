//! Origin tracking for loop prevention.
//!
//! Every write a sync worker makes to a target produces a change event on
//! that target, which the opposite worker will observe. Before writing, the
//! worker records what it is about to write under `(target side,
//! collection, _id)`. When the opposite worker sees an event for that key
//! whose content matches a fresh record, the event is our own echo and is
//! dropped.
//!
//! ```text
//! L→R worker                     remote                     R→L worker
//!    │ record(Remote, bills, 7, fp)  │                          │
//!    │ replace bills/7 ─────────────►│ change event ───────────►│
//!    │                               │   take_echo(Remote, bills, 7, fp) == true
//!    │                               │                          └─ skip
//! ```
//!
//! A matching entry is consumed together with every older entry for the
//! same key: the echo of write N proves writes before N were observed (or
//! superseded). Entries older than the freshness window are ignored and
//! purged periodically, so a missed echo cannot suppress a later genuine
//! change forever.

use crate::feed::{fingerprint, ChangeEvent};
use crate::store::Side;
use mongodb::bson::Document;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;

/// Per-key cap; older entries are dropped first.
const MAX_ENTRIES_PER_KEY: usize = 16;

/// What a sync write left behind on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// SHA-256 of the document written.
    Content(String),
    /// The document was deleted.
    Deleted,
}

impl Fingerprint {
    pub fn of(document: &Document) -> Self {
        Fingerprint::Content(fingerprint(document))
    }

    /// Fingerprint of the state an event leaves behind.
    pub fn of_event(event: &ChangeEvent) -> Option<Self> {
        if event.is_delete() {
            return Some(Fingerprint::Deleted);
        }
        event.full_document.as_ref().map(Self::of)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OriginKey {
    side: Side,
    collection: String,
    id: String,
}

/// Shared record of recent sync writes, consulted by both workers.
pub struct OriginTracker {
    ttl: Duration,
    entries: Mutex<HashMap<OriginKey, VecDeque<(Fingerprint, Instant)>>>,
}

impl OriginTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Note that a sync write with this fingerprint is about to land on `side`.
    pub fn record(&self, side: Side, collection: &str, id_key: &str, fp: Fingerprint) {
        let key = OriginKey {
            side,
            collection: collection.to_string(),
            id: id_key.to_string(),
        };
        let mut entries = self.entries.lock();
        let queue = entries.entry(key).or_default();
        if queue.len() >= MAX_ENTRIES_PER_KEY {
            queue.pop_front();
        }
        queue.push_back((fp, Instant::now()));
    }

    /// True when an event on `side` is the echo of a recorded sync write.
    ///
    /// Consumes the matched entry and every older one for the key.
    pub fn take_echo(&self, side: Side, collection: &str, id_key: &str, fp: &Fingerprint) -> bool {
        let key = OriginKey {
            side,
            collection: collection.to_string(),
            id: id_key.to_string(),
        };
        let mut entries = self.entries.lock();
        let Some(queue) = entries.get_mut(&key) else {
            return false;
        };

        let now = Instant::now();
        let matched = queue
            .iter()
            .rposition(|(recorded, at)| recorded == fp && now.duration_since(*at) <= self.ttl);

        let Some(index) = matched else {
            return false;
        };
        queue.drain(..=index);
        if queue.is_empty() {
            entries.remove(&key);
        }
        trace!(%side, collection, id = id_key, "Matched echo of sync write");
        true
    }

    /// Withdraw the newest matching record after the write it announced failed.
    pub fn forget(&self, side: Side, collection: &str, id_key: &str, fp: &Fingerprint) {
        let key = OriginKey {
            side,
            collection: collection.to_string(),
            id: id_key.to_string(),
        };
        let mut entries = self.entries.lock();
        if let Some(queue) = entries.get_mut(&key) {
            if let Some(index) = queue.iter().rposition(|(recorded, _)| recorded == fp) {
                queue.remove(index);
            }
            if queue.is_empty() {
                entries.remove(&key);
            }
        }
    }

    /// Drop entries older than the freshness window. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut entries = self.entries.lock();
        entries.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|(_, at)| now.duration_since(*at) <= self.ttl);
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    /// Pending entries across all keys.
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
