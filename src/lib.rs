//! # mongo-bisync
//!
//! Bidirectional MongoDB sync between a local replica set and a remote
//! cluster (typically Atlas), built on change streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            BidirectionalSync                              │
//! │                                                                           │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌────────────────────────┐   │
//! │  │ local store  │───►│ SyncWorker (l→r) │───►│ EventApplier → remote  │   │
//! │  │ (watch)      │    │ ChangeFeedReader │    │ (echo + content check) │   │
//! │  └──────────────┘    └──────────────────┘    └────────────────────────┘   │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌────────────────────────┐   │
//! │  │ remote store │───►│ SyncWorker (r→l) │───►│ EventApplier → local   │   │
//! │  └──────────────┘    └──────────────────┘    └────────────────────────┘   │
//! │         │                      │                         │                │
//! │         ▼                      ▼                         ▼                │
//! │  ┌─────────────────┐  ┌──────────────────┐   ┌───────────────────────┐    │
//! │  │ ResumeTokenStore│  │  OriginTracker   │   │ ReconciliationJob     │    │
//! │  │ (SQLite, opt.)  │  │  (shared)        │   │ (bulk backfill)       │    │
//! │  └─────────────────┘  └──────────────────┘   └───────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Loop Prevention
//!
//! Every write a worker makes is recorded in the shared [`OriginTracker`]
//! before it happens. When the change stream on the written side reports it
//! back, the opposite worker finds the record and drops the event. A target
//! that already holds identical content is never rewritten either, so
//! replays after a restart are harmless.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mongo_bisync::{BidirectionalSync, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> mongo_bisync::Result<()> {
//!     let config = SyncConfig::from_env()?;
//!     let sync = BidirectionalSync::connect(config).await?;
//!     sync.start().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     sync.close().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod mongo;
pub mod origin;
pub mod preflight;
pub mod reconcile;
pub mod resilience;
pub mod resume;
pub mod store;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{CollectionScope, SyncConfig, WorkerConfig};
pub use coordinator::{
    BidirectionalSync, CoordinatorState, Direction, StartReport, SyncStatus, SyncWorker,
    WorkerHealth, WorkerState,
};
pub use error::{Result, SyncError};
pub use feed::{ChangeEvent, ChangeFeedReader, OperationType, ResumeToken};
pub use mongo::MongoStore;
pub use origin::OriginTracker;
pub use preflight::{check_replica_set, PreflightReport, PreflightStatus};
pub use reconcile::{ReconcileDirection, ReconcileReport, ReconciliationJob};
pub use resume::ResumeTokenStore;
pub use store::{DocumentStore, Side};

#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
