//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!                                   │
//!                                   │ (stores open, tailer spawned)
//!                                   ↓
//!                               Running
//!                                   │
//!                         shutdown()│
//!                                   ↓
//!                             ShuttingDown ──→ Stopped
//!
//! Connecting ──(store or client setup fails)──→ Failed
//! ```
//!
//! - **Created**: after `ReplicationEngine::new()`. Nothing spawned yet.
//! - **Connecting**: `start()` called; checkpoint store, push clients and
//!   dispatch lanes are being set up.
//! - **Running**: tailer, consumer and cluster lanes are live.
//! - **ShuttingDown**: tailer stopped, queued jobs draining.
//! - **Stopped**: all tasks joined and stores closed. Safe to drop.
//! - **Failed**: setup error; check logs.

use crate::tailer::TailerState;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Push statistics of one remote cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    pub name: String,
    /// Jobs waiting in the cluster's lane.
    pub queued: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Failed jobs since the last success.
    pub consecutive_failures: u64,
    /// `None` until a job succeeds.
    pub millis_since_success: Option<u64>,
}

impl ClusterHealth {
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }
}

/// Snapshot for health endpoints. Built from cached state, no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    pub tailer_state: TailerState,
    /// Engine running and tailer receiving entries.
    pub ready: bool,
    /// Ready and no cluster is failing.
    pub healthy: bool,
    pub clusters_total: usize,
    pub clusters_failing: usize,
    pub pushes_in_flight: usize,
    pub clusters: Vec<ClusterHealth>,
}
