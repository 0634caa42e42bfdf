//! MongoDB-backed [`DocumentStore`].
//!
//! One [`MongoStore`] per side. Connecting validates the connection string,
//! applies bounded timeouts and pings the target database with the startup
//! retry policy, so an unreachable host surfaces as a classified
//! [`SyncError::Connection`] instead of hanging.
//!
//! Change streams are opened on the database with a `$match` on the synced
//! collections and `fullDocument: updateLookup`, so update events carry the
//! post-image.

use crate::config::{CollectionScope, ConnectionConfig};
use crate::error::{Result, SyncError};
use crate::feed::{collection_filter_pipeline, ChangeEvent, OperationType, ResumeToken};
use crate::resilience::RetryConfig;
use crate::store::{BoxFuture, ChangeFeed, DocumentStore, IdStream, InsertManyOutcome, Side};
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{
    ChangeStreamEvent, OperationType as MongoOperationType, ResumeToken as MongoResumeToken,
};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FullDocumentType};
use mongodb::{Client, Collection, Database};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

const DUPLICATE_KEY: i32 = 11000;
/// Resume point fell off the oplog.
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;
const CHANGE_STREAM_FATAL: i32 = 280;
const CAPPED_POSITION_LOST: i32 = 136;

/// Application name reported to the server.
pub const APP_NAME: &str = "mongo-bisync";

/// A connected MongoDB database on one side of the link.
#[derive(Clone)]
pub struct MongoStore {
    side: Side,
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect and ping, retrying per `retry`.
    ///
    /// The whole attempt loop ends within [`RetryConfig::total_budget`]: each
    /// ping gets at most `connection_timeout` and never more than what is
    /// left of the budget. `database` overrides the default database in the
    /// URI.
    pub async fn connect(
        side: Side,
        uri: &str,
        database: Option<&str>,
        connection: &ConnectionConfig,
        retry: &RetryConfig,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await.map_err(|e| {
            SyncError::Config(format!("invalid {} connection string: {}", side, e))
        })?;
        options.connect_timeout = Some(connection.connect_timeout_duration());
        options.server_selection_timeout = Some(connection.server_selection_timeout_duration());
        options.app_name = Some(APP_NAME.to_string());

        let db_name = database
            .map(str::to_string)
            .or_else(|| options.default_database.clone())
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "no database name for {}: set SYNC_DATABASE or add one to the connection string",
                    side
                ))
            })?;

        let client = Client::with_options(options)
            .map_err(|e| SyncError::connection(side, e.to_string()))?;
        let store = Self {
            side,
            db: client.database(&db_name),
            client,
        };

        info!(%side, database = %db_name, "Connecting to MongoDB");

        let deadline = Instant::now() + retry.total_budget();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ping_cap = retry
                .connection_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let err = match timeout(ping_cap, store.ping()).await {
                Ok(Ok(latency)) => {
                    info!(
                        %side,
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "Connected to MongoDB"
                    );
                    return Ok(store);
                }
                Ok(Err(e)) => e,
                Err(_) => SyncError::connection(
                    side,
                    format!("ping timed out after {}ms", ping_cap.as_millis()),
                ),
            };

            let delay = retry.delay_for_attempt(attempt);
            let out_of_time = Instant::now() + delay >= deadline;
            if !err.is_retryable() || !retry.allows(attempt + 1) || out_of_time {
                error!(%side, attempt, error = %err, "Failed to connect to MongoDB");
                if let SyncError::Connection { category, .. } = &err {
                    error!(%side, hint = category.suggested_fix(), "Connection hint");
                }
                return Err(err);
            }

            warn!(
                %side,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wrap an already-configured client.
    pub fn from_client(side: Side, client: Client, database: &str) -> Self {
        Self {
            side,
            db: client.database(database),
            client,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn database_name(&self) -> &str {
        self.db.name()
    }

    /// Round trip to the server.
    pub async fn ping(&self) -> Result<Duration> {
        let start = std::time::Instant::now();
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| SyncError::connection(self.side, e.to_string()))?;
        Ok(start.elapsed())
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    fn watch_error(&self, e: MongoError, resuming: bool) -> SyncError {
        match command_code(&e) {
            Some(CHANGE_STREAM_HISTORY_LOST | CHANGE_STREAM_FATAL | CAPPED_POSITION_LOST)
                if resuming =>
            {
                SyncError::ResumeTokenRejected {
                    side: self.side,
                    message: e.to_string(),
                }
            }
            _ => SyncError::stream(self.side, format!("failed to open change stream: {}", e)),
        }
    }
}

/// Server error code of a command failure, if any.
pub fn command_code(e: &MongoError) -> Option<i32> {
    match e.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code),
        _ => None,
    }
}

/// True for E11000 duplicate key failures.
pub fn is_duplicate_key(e: &MongoError) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(c) => c.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Map a driver change event to ours.
///
/// Returns `Ok(None)` for events the engine ignores (DDL, events without a
/// collection or `_id`). An `invalidate` ends the stream.
pub fn convert_event(
    side: Side,
    event: ChangeStreamEvent<Document>,
) -> Result<Option<ChangeEvent>> {
    let operation = match event.operation_type {
        MongoOperationType::Insert => OperationType::Insert,
        MongoOperationType::Update => OperationType::Update,
        MongoOperationType::Replace => OperationType::Replace,
        MongoOperationType::Delete => OperationType::Delete,
        MongoOperationType::Invalidate => {
            return Err(SyncError::stream(side, "change stream invalidated"));
        }
        _ => return Ok(None),
    };

    let Some(collection) = event.ns.and_then(|ns| ns.coll) else {
        return Ok(None);
    };
    let Some(document_id) = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .cloned()
    else {
        warn!(%side, collection = %collection, "Change event without documentKey._id");
        return Ok(None);
    };

    let mut converted = ChangeEvent::new(operation, collection, document_id, event.full_document);
    match bson::to_vec(&event.id) {
        Ok(bytes) => converted = converted.with_resume_token(ResumeToken::from_bytes(bytes)),
        Err(e) => warn!(%side, error = %e, "Could not encode resume token"),
    }
    Ok(Some(converted))
}

impl DocumentStore for MongoStore {
    fn side(&self) -> Side {
        self.side
    }

    fn watch(
        &self,
        scope: &CollectionScope,
        resume_after: Option<ResumeToken>,
    ) -> BoxFuture<'_, ChangeFeed> {
        let pipeline = collection_filter_pipeline(scope);
        Box::pin(async move {
            let resuming = resume_after.is_some();
            let mut watch = self
                .db
                .watch()
                .pipeline(pipeline)
                .full_document(FullDocumentType::UpdateLookup);

            if let Some(token) = resume_after {
                let token: MongoResumeToken = bson::from_slice(token.as_bytes()).map_err(|e| {
                    SyncError::ResumeTokenRejected {
                        side: self.side,
                        message: format!("undecodable resume token: {}", e),
                    }
                })?;
                watch = watch.resume_after(token);
            }

            let stream = watch.await.map_err(|e| self.watch_error(e, resuming))?;

            let side = self.side;
            let feed = stream
                .filter_map(move |item| async move {
                    match item {
                        Ok(event) => convert_event(side, event).transpose(),
                        Err(e) => Some(Err(SyncError::stream(side, e.to_string()))),
                    }
                })
                .boxed();
            Ok(feed)
        })
    }

    fn find_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, Option<Document>> {
        let coll = self.collection(collection);
        let id = id.clone();
        Box::pin(async move {
            coll.find_one(doc! { "_id": id })
                .await
                .map_err(|e| SyncError::database("find_one", e))
        })
    }

    fn insert_if_absent(&self, collection: &str, document: Document) -> BoxFuture<'_, bool> {
        let coll = self.collection(collection);
        Box::pin(async move {
            match coll.insert_one(document).await {
                Ok(_) => Ok(true),
                Err(e) if is_duplicate_key(&e) => Ok(false),
                Err(e) => Err(SyncError::database("insert_one", e)),
            }
        })
    }

    fn replace_by_id(
        &self,
        collection: &str,
        id: &Bson,
        document: Document,
    ) -> BoxFuture<'_, ()> {
        let coll = self.collection(collection);
        let id = id.clone();
        Box::pin(async move {
            coll.replace_one(doc! { "_id": id }, document)
                .upsert(true)
                .await
                .map(|_| ())
                .map_err(|e| SyncError::database("replace_one", e))
        })
    }

    fn delete_by_id(&self, collection: &str, id: &Bson) -> BoxFuture<'_, bool> {
        let coll = self.collection(collection);
        let id = id.clone();
        Box::pin(async move {
            coll.delete_one(doc! { "_id": id })
                .await
                .map(|r| r.deleted_count > 0)
                .map_err(|e| SyncError::database("delete_one", e))
        })
    }

    fn scan_ids(&self, collection: &str) -> BoxFuture<'_, IdStream> {
        let coll = self.collection(collection);
        Box::pin(async move {
            let cursor = coll
                .find(doc! {})
                .projection(doc! { "_id": 1 })
                .sort(doc! { "_id": 1 })
                .await
                .map_err(|e| SyncError::database("find", e))?;

            let ids = cursor
                .map(|item| {
                    let document = item.map_err(|e| SyncError::database("find", e))?;
                    document
                        .get("_id")
                        .cloned()
                        .ok_or_else(|| SyncError::database_msg("find", "document without _id"))
                })
                .boxed();
            Ok(ids)
        })
    }

    fn existing_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Bson>> {
        let coll = self.collection(collection);
        let ids = ids.to_vec();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let found: Vec<Document> = coll
                .find(doc! { "_id": { "$in": ids } })
                .projection(doc! { "_id": 1 })
                .await
                .map_err(|e| SyncError::database("find", e))?
                .try_collect()
                .await
                .map_err(|e| SyncError::database("find", e))?;
            Ok(found
                .into_iter()
                .filter_map(|mut d| d.remove("_id"))
                .collect())
        })
    }

    fn find_by_ids(&self, collection: &str, ids: &[Bson]) -> BoxFuture<'_, Vec<Document>> {
        let coll = self.collection(collection);
        let ids = ids.to_vec();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            coll.find(doc! { "_id": { "$in": ids } })
                .await
                .map_err(|e| SyncError::database("find", e))?
                .try_collect()
                .await
                .map_err(|e| SyncError::database("find", e))
        })
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> BoxFuture<'_, InsertManyOutcome> {
        let coll = self.collection(collection);
        Box::pin(async move {
            if documents.is_empty() {
                return Ok(InsertManyOutcome::default());
            }
            let ids: Vec<Bson> = documents
                .iter()
                .map(|d| d.get("_id").cloned().unwrap_or(Bson::Null))
                .collect();
            let total = documents.len() as u64;

            match coll.insert_many(documents).ordered(false).await {
                Ok(result) => Ok(InsertManyOutcome {
                    inserted: result.inserted_ids.len() as u64,
                    ..Default::default()
                }),
                Err(e) => match e.kind.as_ref() {
                    ErrorKind::InsertMany(failure) if failure.write_concern_error.is_none() => {
                        let mut outcome = InsertManyOutcome::default();
                        let write_errors = failure.write_errors.as_deref().unwrap_or_default();
                        for we in write_errors {
                            if we.code == DUPLICATE_KEY {
                                outcome.duplicates += 1;
                            } else {
                                let id = ids.get(we.index).cloned().unwrap_or(Bson::Null);
                                outcome.failed.push((id, we.message.clone()));
                            }
                        }
                        outcome.inserted = total.saturating_sub(write_errors.len() as u64);
                        Ok(outcome)
                    }
                    _ => Err(SyncError::database("insert_many", e)),
                },
            }
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, u64> {
        let coll = self.collection(collection);
        Box::pin(async move {
            coll.count_documents(doc! {})
                .await
                .map_err(|e| SyncError::database("count_documents", e))
        })
    }
}
