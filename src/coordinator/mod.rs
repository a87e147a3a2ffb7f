// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The composition root that ties together:
//! - Operation log tailing via [`crate::tailer::ChangeLogTailer`]
//! - Event decoding and task matching via [`crate::consumer::NodeEventConsumer`]
//! - Per-cluster push lanes via [`Dispatcher`]
//! - Task bookkeeping via [`crate::task_store::TaskStore`]
//! - The optional edge cache walk via [`crate::proxy_sync::ProxySyncVisitor`]
//!
//! # Architecture
//!
//! ```text
//! OperationLog ──→ tailer ──mpsc──→ consumer ──→ Dispatcher lanes ──→ PushClient
//!                     │                 │                  │
//!                     ↑                 │ track              │ complete
//!                checkpoints ←──── DeliveryTracker ←─────────────┘
//! ```
//!
//! The checkpoint only moves past an entry once every job it produced has
//! stored its [`crate::task::ReplicaRecord`].
//!
//! Shutdown runs front to back: the tailer stops first, the consumer drains
//! what was already read, lanes drain queued jobs, then the stores close.
//! Jobs cut off by the drain timeout replay on the next start.

mod dispatch;
mod types;

pub use dispatch::Dispatcher;
pub use types::{ClusterHealth, EngineState, HealthCheck};

use crate::checkpoint::{CheckpointStore, DeliveryTracker};
use crate::config::ReplicationConfig;
use crate::consumer::NodeEventConsumer;
use crate::error::{ReplicationError, Result};
use crate::local_data::LocalDataManager;
use crate::metrics;
use crate::oplog::{OperationLog, OperationLogEntry};
use crate::proxy_sync::ProxySyncVisitor;
use crate::push::PushClientRegistry;
use crate::stream::RedisOperationLog;
use crate::tailer::{ChangeLogTailer, TailerState};
use crate::task::ReplicaTaskRegistry;
use crate::task_store::TaskStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

const CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The main replication engine.
///
/// Owns the tailer, the consumer task and the dispatcher. The operation log,
/// data manager and task store are handed in so embedders (and tests) can
/// swap them.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    log: Arc<dyn OperationLog>,

    data: Arc<dyn LocalDataManager>,

    tasks: Arc<TaskStore>,

    /// Replaces the default push clients when set
    push_clients: Option<Arc<PushClientRegistry>>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    tailer: Option<ChangeLogTailer>,

    dispatcher: Option<Arc<Dispatcher>>,

    checkpoints: Option<Arc<CheckpointStore>>,

    delivery: Option<Arc<DeliveryTracker>>,

    /// Consumer task, joined before the lanes close
    consumer_handle: Option<JoinHandle<()>>,

    /// Shutdown signal for the background tasks below
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Checkpoint flush and cache walk tasks
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create an engine over explicit collaborators.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin tailing.
    pub fn new(
        config: ReplicationConfig,
        log: Arc<dyn OperationLog>,
        data: Arc<dyn LocalDataManager>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            log,
            data,
            tasks,
            push_clients: None,
            state_tx,
            state_rx,
            tailer: None,
            dispatcher: None,
            checkpoints: None,
            delivery: None,
            consumer_handle: None,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Create an engine tailing Redis and storing tasks in the configured SQLite file.
    pub async fn connect(config: ReplicationConfig, data: Arc<dyn LocalDataManager>) -> Result<Self> {
        config.validate()?;
        let log = RedisOperationLog::from_config(&config.settings.tailer)?;
        let tasks = TaskStore::open(&config.task_store).await?;
        Ok(Self::new(config, Arc::new(log), data, Arc::new(tasks)))
    }

    /// Use these push clients instead of the built-in ones.
    pub fn with_push_clients(mut self, registry: PushClientRegistry) -> Self {
        self.push_clients = Some(Arc::new(registry));
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Task registry, for registering and inspecting tasks.
    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn local_cluster(&self) -> &str {
        &self.config.local_cluster
    }

    /// Newest log entry whose jobs, and those of every earlier entry, are recorded.
    pub async fn committed_position(&self) -> Option<String> {
        match &self.delivery {
            Some(delivery) => delivery.delivered().await,
            None => None,
        }
    }

    /// Health snapshot for monitoring endpoints.
    ///
    /// **Performance**: no network I/O. Everything comes from atomics and
    /// watch channels.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let tailer_state = self
            .tailer
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(TailerState::Stopped);

        let (clusters, pushes_in_flight) = match &self.dispatcher {
            Some(dispatcher) => (dispatcher.cluster_health().await, dispatcher.in_flight()),
            None => (Vec::new(), 0),
        };
        let clusters_failing = clusters.iter().filter(|c| c.is_failing()).count();

        let tailing = !self.config.settings.tailer.enabled || tailer_state == TailerState::Running;
        let ready = state == EngineState::Running && tailing;

        HealthCheck {
            state,
            tailer_state,
            ready,
            healthy: ready && clusters_failing == 0,
            clusters_total: self.config.clusters.len(),
            clusters_failing,
            pushes_in_flight,
            clusters,
        }
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the replication engine.
    ///
    /// 1. Opens the checkpoint table (if resume is enabled)
    /// 2. Builds push clients and spawns one lane per cluster
    /// 3. Starts the tailer and the consumer task
    /// 4. Spawns the cache walk (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            local_cluster = %self.config.local_cluster,
            clusters = self.config.clusters.len(),
            log = %self.log.name(),
            "Starting replication engine"
        );
        self.set_state(EngineState::Connecting);

        if let Err(e) = self.start_inner().await {
            error!(error = %e, "Replication engine failed to start");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        info!(clusters = self.config.clusters.len(), "Replication engine running");
        Ok(())
    }

    async fn start_inner(&mut self) -> Result<()> {
        // Fallible setup first so a failure leaves nothing running
        let checkpoints = if self.config.settings.tailer.resume_from_checkpoint {
            let store = CheckpointStore::new(self.tasks.pool().clone()).await?;
            Some(Arc::new(store))
        } else {
            None
        };

        let clients = match &self.push_clients {
            Some(registry) => Arc::clone(registry),
            None => Arc::new(PushClientRegistry::with_defaults(
                Arc::clone(&self.data),
                &self.config.settings.push,
            )?),
        };

        let cache_walk = if self.config.proxy_sync.enabled {
            let visitor = ProxySyncVisitor::from_config(&self.config.proxy_sync, &self.config.settings.push)?;
            Some(visitor)
        } else {
            None
        };

        let delivery = Arc::new(DeliveryTracker::new(self.log.name(), checkpoints.clone()));
        delivery.anchor(chrono::Utc::now()).await;
        self.delivery = Some(Arc::clone(&delivery));

        let registry: Arc<dyn ReplicaTaskRegistry> = self.tasks.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            &self.config.clusters,
            &self.config.settings.dispatch,
            clients,
            Arc::clone(&registry),
            Arc::clone(&delivery),
        ));
        self.dispatcher = Some(Arc::clone(&dispatcher));

        if self.config.settings.tailer.enabled {
            let mut tailer = ChangeLogTailer::new(Arc::clone(&self.log), self.config.settings.tailer.clone());
            if let Some(store) = &checkpoints {
                tailer = tailer.with_checkpoint(Arc::clone(store));
            }
            let (tx, rx) = mpsc::channel(self.config.settings.tailer.channel_capacity.max(1));
            tailer.start(tx).await?;
            self.tailer = Some(tailer);

            let consumer = NodeEventConsumer::new(registry);
            let span = info_span!("consumer", local_cluster = %self.config.local_cluster);
            self.consumer_handle = Some(tokio::spawn(
                run_consumer(consumer, rx, dispatcher, delivery).instrument(span),
            ));
        } else {
            warn!("Tailer disabled, no operation log entries will be replicated");
        }

        if let Some(store) = &checkpoints {
            self.spawn_checkpoint_flush_task(Arc::clone(store)).await;
        }
        self.checkpoints = checkpoints;

        if let Some(visitor) = cache_walk {
            self.spawn_cache_walk_task(visitor).await;
        }
        Ok(())
    }

    /// Periodically flushes dirty checkpoints to SQLite.
    async fn spawn_checkpoint_flush_task(&self, store: Arc<CheckpointStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(CHECKPOINT_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned checkpoint flush task");
        self.handles.write().await.push(handle);
    }

    async fn spawn_cache_walk_task(&self, visitor: ProxySyncVisitor) {
        let root = PathBuf::from(&self.config.proxy_sync.cache_root);
        let period = self.config.proxy_sync.interval_duration();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let span = info_span!("cache_walk", root = %root.display());

        let handle = tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(period);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = timer.tick() => {
                            if let Err(e) = visitor.walk(&root).await {
                                warn!(error = %e, "Cache walk failed");
                            }
                        }
                    }
                }
                info!("Cache walk task stopped");
            }
            .instrument(span),
        );

        info!(interval = ?period, "Spawned cache walk task");
        self.handles.write().await.push(handle);
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Stop the tailer (cursor released, no new entries)
    /// 2. Let the consumer hand already-read entries to the lanes
    /// 3. Drain lanes within `dispatch.drain_timeout`
    /// 4. Stop background tasks, flush checkpoints, close the task store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let drain_timeout = self.config.settings.dispatch.drain_timeout_duration();

        if let Some(tailer) = &self.tailer {
            tailer.stop().await;
        }

        if let Some(mut handle) = self.consumer_handle.take() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Consumer drained"),
                Ok(Err(e)) => warn!(error = %e, "Consumer panicked during shutdown"),
                Err(_) => {
                    warn!("Consumer timed out during shutdown (undelivered entries replay after restart)");
                    handle.abort();
                }
            }
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close(drain_timeout).await;
        }

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(checkpoints) = self.checkpoints.take() {
            checkpoints.close().await;
        }
        self.tasks.close().await;

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}

/// Turn log entries into jobs and queue them on the cluster lanes.
///
/// Every entry is tracked before its jobs are queued, so lanes can only
/// acknowledge jobs the tracker already expects. Ends when the tailer drops
/// its sender.
async fn run_consumer(
    consumer: NodeEventConsumer,
    mut rx: mpsc::Receiver<OperationLogEntry>,
    dispatcher: Arc<Dispatcher>,
    delivery: Arc<DeliveryTracker>,
) {
    info!("Consumer started");
    while let Some(entry) = rx.recv().await {
        let jobs = consumer.dispatch(&entry).await;
        delivery.track(&entry.id, jobs.len()).await;
        if jobs.is_empty() {
            continue;
        }
        debug!(entry_id = %entry.id, jobs = jobs.len(), "Entry matched replication tasks");
        for job in jobs {
            metrics::record_jobs_enqueued(&job.cluster, 1);
            if let Err(e) = dispatcher.submit(job).await {
                warn!(entry_id = %entry.id, error = %e, "Dispatcher closed, dropping remaining jobs");
                return;
            }
        }
    }
    info!("Consumer stopped");
}
