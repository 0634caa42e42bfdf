//! Coordinator and worker state types.
//!
//! # Coordinator States
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                            │
//!    │ (sync disabled)            ├── both workers up ──────→ Running
//!    ↓                            ├── one worker failed ────→ Degraded
//! Disabled                        └── both workers failed ──→ Failed
//!
//! Running / Degraded / Failed ── stop() ──→ Stopped ── start() ──→ Starting
//! ```
//!
//! # Worker States
//!
//! ```text
//! Stopped ── start() ──→ Starting ── stream open ──→ Running
//!    ↑                      │                          │ stream error
//!    │                      │ open failed              ↓
//!    │                      └──────→ Failed ←── restarts exhausted
//!    └──────────── stop() (from any state) ────────────┘
//! ```

use crate::store::Side;
use serde::Serialize;

/// State of the bidirectional sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// Created, `start()` not called yet.
    Created,
    /// Starting the workers.
    Starting,
    /// Both configured directions are running.
    Running,
    /// Some direction failed to start or failed later.
    Degraded,
    /// Stopped cleanly. `start()` may be called again.
    Stopped,
    /// No direction could start.
    Failed,
    /// Sync is disabled in configuration; nothing runs.
    Disabled,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoordinatorState::Created => "Created",
            CoordinatorState::Starting => "Starting",
            CoordinatorState::Running => "Running",
            CoordinatorState::Degraded => "Degraded",
            CoordinatorState::Stopped => "Stopped",
            CoordinatorState::Failed => "Failed",
            CoordinatorState::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

/// State of one sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl WorkerState {
    /// Starting or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Direction of a sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::LocalToRemote, Direction::RemoteToLocal];

    /// Side whose change stream the worker reads.
    pub fn source(&self) -> Side {
        match self {
            Direction::LocalToRemote => Side::Local,
            Direction::RemoteToLocal => Side::Remote,
        }
    }

    /// Side the worker writes to.
    pub fn target(&self) -> Side {
        self.source().opposite()
    }

    pub fn reverse(&self) -> Direction {
        match self {
            Direction::LocalToRemote => Direction::RemoteToLocal,
            Direction::RemoteToLocal => Direction::LocalToRemote,
        }
    }

    /// Stable label used in logs, metrics and the resume-token table.
    pub fn label(&self) -> &'static str {
        match self {
            Direction::LocalToRemote => "local_to_remote",
            Direction::RemoteToLocal => "remote_to_local",
        }
    }

    pub fn from_label(label: &str) -> Option<Direction> {
        match label {
            "local_to_remote" => Some(Direction::LocalToRemote),
            "remote_to_local" => Some(Direction::RemoteToLocal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub direction: Direction,
    pub state: WorkerState,
    /// False when this direction is turned off (`SYNC_BIDIRECTIONAL=false`).
    pub enabled: bool,
    pub healthy: bool,
    pub events_received: u64,
    pub events_applied: u64,
    /// Loopback, already-current and missing-document skips.
    pub events_skipped: u64,
    pub apply_errors: u64,
    pub restarts: u64,
    pub last_error: Option<String>,
}

impl WorkerHealth {
    /// Health entry for a direction that is not configured to run.
    pub fn disabled(direction: Direction) -> Self {
        Self {
            direction,
            state: WorkerState::Stopped,
            enabled: false,
            healthy: true,
            events_received: 0,
            events_applied: 0,
            events_skipped: 0,
            apply_errors: 0,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Coordinator status for health endpoints and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: CoordinatorState,
    pub local_to_remote: WorkerHealth,
    pub remote_to_local: WorkerHealth,
    /// Coordinator running and every enabled worker running.
    pub healthy: bool,
    /// Pending origin-tracker entries.
    pub origin_pending: usize,
}

/// What `start()` brought up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub started: Vec<Direction>,
    /// Directions that resumed from a stored token.
    pub resumed: Vec<Direction>,
    /// True when the call found the coordinator already running.
    pub already_running: bool,
}
