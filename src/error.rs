// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by where they occur (configuration, connection,
//! change stream, per-event apply, resume-token store) and carry enough
//! context for an operator to act on them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Missing connection string, replica set not configured |
//! | `Connection` | Mostly | Timeout, DNS, auth, IP access list, refused |
//! | `Database` | Yes | A single MongoDB call failed |
//! | `Stream` | Yes | Change stream invalidated or dropped (terminal for that stream) |
//! | `ResumeTokenRejected` | Yes | Stored stream position is gone; reopen from "now" |
//! | `Apply` | No | One change event could not be applied (never escalated) |
//! | `CircuitOpen` | Yes | Target writes are being rejected by the circuit breaker |
//! | `PartialStart` | No | Only some sync directions started |
//! | `ResumeStore` | No | Local SQLite errors (needs operator attention) |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Timeout` | Yes | A bounded wait elapsed |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Connection Categories
//!
//! Connection failures are classified from the driver's message with
//! [`ConnectionCategory::classify`] so that logs and the CLI can print a
//! suggested fix next to the raw error.

use crate::coordinator::Direction;
use crate::store::Side;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Broad cause of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCategory {
    /// Server selection or connect timed out.
    Timeout,
    /// Host name or SRV record could not be resolved.
    Dns,
    /// Credentials rejected.
    Auth,
    /// Client address not on the cluster's IP access list.
    NetworkAccess,
    /// Nothing listening on the target port.
    Refused,
    /// Anything else.
    Other,
}

impl ConnectionCategory {
    /// Classify a driver error message.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("authentication failed")
            || msg.contains("auth error")
            || msg.contains("bad auth")
            || msg.contains("scram")
        {
            Self::Auth
        } else if msg.contains("whitelist")
            || msg.contains("access list")
            || msg.contains("not allowed to access")
        {
            Self::NetworkAccess
        } else if msg.contains("dns")
            || msg.contains("failed to lookup")
            || msg.contains("no such host")
            || msg.contains("name resolution")
            || msg.contains("srv")
        {
            Self::Dns
        } else if msg.contains("connection refused") {
            Self::Refused
        } else if msg.contains("timed out") || msg.contains("timeout") {
            Self::Timeout
        } else {
            Self::Other
        }
    }

    /// Operator-facing hint for this category.
    pub fn suggested_fix(&self) -> &'static str {
        match self {
            Self::Timeout => {
                "check network reachability and, for Atlas, that this host's IP is on the access list"
            }
            Self::Dns => "check the host name in the connection string and DNS/SRV resolution",
            Self::Auth => "check the username, password and authSource in the connection string",
            Self::NetworkAccess => "add this host's public IP to the cluster's IP access list",
            Self::Refused => "check that mongod is running and listening on the configured port",
            Self::Other => "inspect the error message and the server logs",
        }
    }
}

impl std::fmt::Display for ConnectionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Dns => write!(f, "dns"),
            Self::Auth => write!(f, "auth"),
            Self::NetworkAccess => write!(f, "network_access"),
            Self::Refused => write!(f, "refused"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Errors that can occur while syncing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or missing configuration.
    ///
    /// Fatal to starting the coordinator. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not establish a connection to one side.
    #[error("Connection error ({side}, {category}): {message}")]
    Connection {
        side: Side,
        category: ConnectionCategory,
        message: String,
    },

    /// A MongoDB operation failed.
    #[error("Database error ({operation}): {message}")]
    Database {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// The change stream failed or ended.
    ///
    /// Terminal for the stream instance; the worker supervisor decides
    /// whether to reopen it.
    #[error("Change stream error ({side}): {message}")]
    Stream { side: Side, message: String },

    /// The server no longer has the stream position we asked to resume from.
    ///
    /// Events between the stored token and now are lost to the stream;
    /// reconciliation has to cover them.
    #[error("Resume token rejected ({side}): {message}")]
    ResumeTokenRejected { side: Side, message: String },

    /// A single change event could not be applied to the target.
    #[error("Apply error ({operation} {document_id}): {message}")]
    Apply {
        operation: String,
        document_id: String,
        message: String,
    },

    /// The target write circuit is open.
    #[error("Circuit open: {circuit}")]
    CircuitOpen { circuit: String },

    /// The coordinator could not start every direction.
    #[error("Partial start: failed to start {}", format_directions(.failed))]
    PartialStart { failed: Vec<Direction> },

    /// SQLite error in the resume-token store.
    #[error("Resume store error: {0}")]
    ResumeStore(#[from] sqlx::Error),

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A bounded wait elapsed.
    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_directions(directions: &[Direction]) -> String {
    directions
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl SyncError {
    /// Wrap a driver error for a named operation.
    pub fn database(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Database error without a driver source (in-memory store, injected faults).
    pub fn database_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Connection error, classified from its message.
    pub fn connection(side: Side, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Connection {
            side,
            category: ConnectionCategory::classify(&message),
            message,
        }
    }

    pub fn stream(side: Side, message: impl Into<String>) -> Self {
        Self::Stream {
            side,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { category, .. } => {
                !matches!(category, ConnectionCategory::Auth | ConnectionCategory::Dns)
            }
            Self::Database { .. } => true,
            Self::Stream { .. } => true,
            Self::ResumeTokenRejected { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::Timeout { .. } => true,
            Self::Config(_) => false,
            Self::Apply { .. } => false,
            Self::PartialStart { .. } => false,
            Self::ResumeStore(_) => false, // Local DB issues need attention
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Database { .. } => "database",
            Self::Stream { .. } => "stream",
            Self::ResumeTokenRejected { .. } => "resume_token_rejected",
            Self::Apply { .. } => "apply",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PartialStart { .. } => "partial_start",
            Self::ResumeStore(_) => "resume_store",
            Self::InvalidState { .. } => "invalid_state",
            Self::Timeout { .. } => "timeout",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
