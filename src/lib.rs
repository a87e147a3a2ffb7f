//! # Artifact Replication
//!
//! Real-time replication of repository artifacts from a local cluster to
//! remote clusters, driven by a tailed operation log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         artifact-replication                              │
//! │                                                                           │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌──────────────────────────┐  │
//! │  │ OperationLog │───►│ ChangeLogTailer │───►│ NodeEventConsumer        │  │
//! │  │ (XREAD)      │    │ (supervised)    │    │ (task match, path rules) │  │
//! │  └──────────────┘    └─────────────────┘    └──────────────────────────┘  │
//! │                              │                           │                │
//! │                              ▼                           ▼                │
//! │                     ┌─────────────────┐    ┌──────────────────────────┐   │
//! │                     │ CheckpointStore │    │ Dispatcher (lane/cluster)│   │
//! │                     │ (SQLite)        │    │ Helm · Maven · OCI · ... │   │
//! │                     └─────────────────┘    └──────────────────────────┘   │
//! │                                                          │                │
//! │                                                          ▼                │
//! │                                            ┌──────────────────────────┐   │
//! │                                            │ TaskStore (records)      │   │
//! │                                            └──────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are delivered at least once: a crash between push and commit
//! replays the entry on restart.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use artifact_replication::{InMemoryDataManager, ReplicationConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> artifact_replication::Result<()> {
//!     let config = ReplicationConfig::from_json_file("replication.json")?;
//!     let data = Arc::new(InMemoryDataManager::new());
//!
//!     let mut engine = ReplicationEngine::connect(config, data).await?;
//!     engine.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod local_data;
pub mod metrics;
pub mod oplog;
pub mod proxy_sync;
pub mod push;
pub mod resilience;
pub(crate) mod sqlite;
pub mod stream;
pub mod tailer;
pub mod task;
pub mod task_store;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, DeliveryTracker};
pub use config::{ClusterConfig, ReplicationConfig, ReplicationSettings};
pub use consumer::{NodeEvent, NodeEventConsumer, PushJob};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine};
pub use error::{ReplicationError, Result};
pub use local_data::{InMemoryDataManager, LocalDataManager, NodeDetail};
pub use oplog::{MemoryOperationLog, OperationLog, OperationLogEntry};
pub use proxy_sync::{ProxySyncVisitor, SyncReport};
pub use push::{PushClient, PushClientRegistry, RemoteState, RepositoryType};
pub use stream::RedisOperationLog;
pub use tailer::{ChangeLogTailer, TailerState};
pub use task::{ReplicaAction, ReplicaTask, ReplicaTaskRegistry};
pub use task_store::TaskStore;
