//! Per-cluster push dispatch.
//!
//! Every configured cluster gets a lane: a bounded queue drained by one
//! worker, so jobs for a cluster run in the order they were submitted.
//! Lanes run independently of each other, and a shared [`Bulkhead`] caps
//! how many pushes are in flight across all of them.
//!
//! ```text
//! submit(job) ──→ lane[bj] ──→ worker ─┐
//!             ──→ lane[sh] ──→ worker ─┼─→ bulkhead permit → PushClient
//!             ──→ lane[gz] ──→ worker ─┘
//! ```
//!
//! Each executed job produces exactly one [`ReplicaRecord`]. Once that record
//! is stored the job is acknowledged to the [`DeliveryTracker`]; a job that is
//! aborted or whose record cannot be stored is never acknowledged, so its
//! entry replays after a restart.

use super::types::ClusterHealth;
use crate::checkpoint::DeliveryTracker;
use crate::config::{ClusterConfig, DispatchConfig};
use crate::consumer::PushJob;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::push::{PushClient, PushClientRegistry, PushContext, RemoteState};
use crate::resilience::Bulkhead;
use crate::task::{ConflictStrategy, RecordOutcome, ReplicaAction, ReplicaRecord, ReplicaTaskRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counters for one cluster, shared between its worker and health checks.
#[derive(Debug, Default)]
struct ClusterStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    consecutive_failures: AtomicU64,
    /// Unix millis of the last success, 0 if none.
    last_success_ms: AtomicI64,
}

impl ClusterStats {
    fn record(&self, cluster: &str, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.last_success_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
            RecordOutcome::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::set_cluster_failures(cluster, self.consecutive_failures.load(Ordering::Relaxed));
    }
}

/// What a job amounted to when it did not error.
enum JobResult {
    Done,
    Skipped(String),
    Incomplete(String),
}

struct Lane {
    tx: mpsc::Sender<PushJob>,
}

/// Executes jobs for one cluster.
struct LaneWorker {
    cluster: ClusterConfig,
    clients: Arc<PushClientRegistry>,
    tasks: Arc<dyn ReplicaTaskRegistry>,
    bulkhead: Arc<Bulkhead>,
    stats: Arc<ClusterStats>,
    delivery: Arc<DeliveryTracker>,
}

impl LaneWorker {
    async fn run(self, mut rx: mpsc::Receiver<PushJob>) {
        info!("Cluster lane started");
        while let Some(job) = rx.recv().await {
            let permit = match self.bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(error = %e, "Push pool closed, abandoning queued jobs");
                    break;
                }
            };
            self.run_job(job).await;
            drop(permit);
        }
        info!("Cluster lane stopped");
    }

    async fn run_job(&self, job: PushJob) {
        let cluster = self.cluster.name.as_str();
        let started_at = Utc::now();
        let timer = Instant::now();

        if let Err(e) = self.tasks.begin_execution(&job.task_key).await {
            warn!(task_key = %job.task_key, error = %e, "Failed to mark task replicating");
        }

        let (outcome, message) = match self.execute(&job).await {
            Ok(JobResult::Done) => (RecordOutcome::Success, None),
            Ok(JobResult::Skipped(reason)) => {
                debug!(task_key = %job.task_key, path = %job.action.full_path(), reason = %reason, "Push skipped");
                (RecordOutcome::Skipped, Some(reason))
            }
            Ok(JobResult::Incomplete(reason)) => {
                metrics::record_error(cluster, "incomplete");
                (RecordOutcome::Failed, Some(reason))
            }
            Err(e) => {
                error!(
                    task_key = %job.task_key,
                    entry_id = %job.entry_id,
                    action = job.action.kind(),
                    path = %job.action.full_path(),
                    error = %e,
                    "Push failed"
                );
                metrics::record_error(cluster, error_type(&e));
                (RecordOutcome::Failed, Some(e.to_string()))
            }
        };

        metrics::record_push(cluster, job.object.repo_type.as_str(), outcome.as_str(), timer.elapsed());
        self.stats.record(cluster, outcome);

        let record = ReplicaRecord {
            task_key: job.task_key.clone(),
            cluster: cluster.to_string(),
            action: job.action.clone(),
            outcome,
            message,
            entry_id: Some(job.entry_id.clone()),
            started_at,
            finished_at: Utc::now(),
        };
        match self.tasks.complete_execution(&record).await {
            Ok(()) => self.delivery.complete(&job.entry_id).await,
            Err(e) => error!(
                task_key = %job.task_key,
                entry_id = %job.entry_id,
                error = %e,
                "Failed to persist replica record, entry will replay after restart"
            ),
        }
    }

    async fn execute(&self, job: &PushJob) -> Result<JobResult> {
        let client = self.clients.get(job.object.repo_type)?;
        let ctx = PushContext {
            cluster: self.cluster.clone(),
            task_key: job.task_key.clone(),
            local_project: job.project_id.clone(),
            local_repo: job.object.local_repo_name.clone(),
            remote_project: job.remote_project().to_string(),
            remote_repo: job.remote_repo().to_string(),
            concurrency: job.setting.concurrency,
        };

        match &job.action {
            ReplicaAction::Push { full_path } => self.push(client.as_ref(), &ctx, job, full_path).await,
            ReplicaAction::Remove { full_path } => {
                let name = client
                    .resolve_package(full_path)
                    .map(|p| p.name)
                    .unwrap_or_else(|| full_path.clone());
                let token = client.get_authorization_details(&ctx, &name).await?;
                if client.remove_artifact(&ctx, full_path, token.as_deref()).await? {
                    Ok(JobResult::Done)
                } else {
                    Ok(JobResult::Skipped(format!(
                        "remote removal not supported for {}",
                        client.repository_type()
                    )))
                }
            }
        }
    }

    async fn push(
        &self,
        client: &dyn PushClient,
        ctx: &PushContext,
        job: &PushJob,
        full_path: &str,
    ) -> Result<JobResult> {
        let Some(package) = client.resolve_package(full_path) else {
            return Ok(JobResult::Skipped(format!("{} does not start a push", full_path)));
        };
        let nodes = client
            .query_sync_node_list(&package.name, &package.version, &ctx.local_project, &ctx.local_repo)
            .await?;
        if nodes.is_empty() {
            return Ok(JobResult::Skipped(format!("nothing to upload for {}", package)));
        }
        let token = client.get_authorization_details(ctx, &package.name).await?;

        let strategy = job.setting.conflict_strategy;
        if strategy != ConflictStrategy::Overwrite {
            match client.remote_state(ctx, &package, &nodes, token.as_deref()).await? {
                RemoteState::Absent => {}
                RemoteState::Identical => {
                    return Ok(JobResult::Skipped(format!("{} is already identical remotely", package)));
                }
                // Skip only avoids re-sending identical content
                RemoteState::Different if strategy == ConflictStrategy::Skip => {}
                RemoteState::Different => {
                    return Err(ReplicationError::Conflict {
                        cluster: ctx.cluster.name.clone(),
                        artifact: package.to_string(),
                    });
                }
            }
        }

        let uploaded = client
            .process_to_upload_artifact(ctx, &nodes, &package.name, &package.version, token.as_deref())
            .await?;
        if uploaded {
            info!(
                task_key = %job.task_key,
                package = %package,
                files = nodes.len(),
                "Artifact replicated"
            );
            Ok(JobResult::Done)
        } else {
            Ok(JobResult::Incomplete(format!("upload of {} incomplete", package)))
        }
    }
}

fn error_type(e: &ReplicationError) -> &'static str {
    match e {
        ReplicationError::Http { .. } => "http",
        ReplicationError::Remote { .. } => "remote",
        ReplicationError::Auth { .. } => "auth",
        ReplicationError::NodeNotFound { .. } => "node_not_found",
        ReplicationError::Storage(_) => "storage",
        ReplicationError::Conflict { .. } => "conflict",
        ReplicationError::UnsupportedRepositoryType(_) => "unsupported_type",
        _ => "other",
    }
}

/// Routes jobs to cluster lanes.
pub struct Dispatcher {
    lanes: RwLock<HashMap<String, Lane>>,
    stats: HashMap<String, Arc<ClusterStats>>,
    lane_capacity: usize,
    tasks: Arc<dyn ReplicaTaskRegistry>,
    delivery: Arc<DeliveryTracker>,
    bulkhead: Arc<Bulkhead>,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn one lane per cluster. Must be called inside a runtime.
    pub fn new(
        clusters: &[ClusterConfig],
        config: &DispatchConfig,
        clients: Arc<PushClientRegistry>,
        tasks: Arc<dyn ReplicaTaskRegistry>,
        delivery: Arc<DeliveryTracker>,
    ) -> Self {
        let bulkhead = Arc::new(Bulkhead::new(config.max_concurrent_pushes.max(1)));
        let lane_capacity = config.lane_capacity.max(1);
        let mut lanes = HashMap::new();
        let mut stats = HashMap::new();
        let mut handles = Vec::new();

        for cluster in clusters {
            let (tx, rx) = mpsc::channel(lane_capacity);
            let cluster_stats = Arc::new(ClusterStats::default());
            let worker = LaneWorker {
                cluster: cluster.clone(),
                clients: Arc::clone(&clients),
                tasks: Arc::clone(&tasks),
                bulkhead: Arc::clone(&bulkhead),
                stats: Arc::clone(&cluster_stats),
                delivery: Arc::clone(&delivery),
            };
            let span = info_span!("cluster_lane", cluster = %cluster.name);
            handles.push(tokio::spawn(worker.run(rx).instrument(span)));
            lanes.insert(cluster.name.clone(), Lane { tx });
            stats.insert(cluster.name.clone(), cluster_stats);
        }

        info!(
            clusters = clusters.len(),
            max_concurrent = bulkhead.max_concurrent(),
            "Push dispatcher started"
        );

        Self {
            lanes: RwLock::new(lanes),
            stats,
            lane_capacity,
            tasks,
            delivery,
            bulkhead,
            handles: RwLock::new(handles),
        }
    }

    /// Queue a job on its cluster's lane, waiting if the lane is full.
    ///
    /// A job for an unknown cluster is recorded as failed immediately.
    pub async fn submit(&self, job: PushJob) -> Result<()> {
        let tx = self.lanes.read().await.get(&job.cluster).map(|lane| lane.tx.clone());
        match tx {
            Some(tx) => tx.send(job).await.map_err(|_| ReplicationError::Shutdown),
            // Lanes are cleared on close
            None if self.stats.contains_key(&job.cluster) => Err(ReplicationError::Shutdown),
            None => {
                self.reject_unknown_cluster(&job).await;
                Ok(())
            }
        }
    }

    async fn reject_unknown_cluster(&self, job: &PushJob) {
        warn!(cluster = %job.cluster, task_key = %job.task_key, "Job targets an unconfigured cluster");
        metrics::record_error(&job.cluster, "unknown_cluster");
        let now = Utc::now();
        let record = ReplicaRecord {
            task_key: job.task_key.clone(),
            cluster: job.cluster.clone(),
            action: job.action.clone(),
            outcome: RecordOutcome::Failed,
            message: Some(format!("cluster {} is not configured", job.cluster)),
            entry_id: Some(job.entry_id.clone()),
            started_at: now,
            finished_at: now,
        };
        match self.tasks.complete_execution(&record).await {
            Ok(()) => self.delivery.complete(&job.entry_id).await,
            Err(e) => error!(task_key = %job.task_key, error = %e, "Failed to persist replica record"),
        }
    }

    /// Pushes currently holding a pool permit.
    pub fn in_flight(&self) -> usize {
        self.bulkhead.max_concurrent() - self.bulkhead.available()
    }

    pub async fn cluster_health(&self) -> Vec<ClusterHealth> {
        let lanes = self.lanes.read().await;
        let now_ms = Utc::now().timestamp_millis();
        let mut health: Vec<ClusterHealth> = self
            .stats
            .iter()
            .map(|(name, stats)| {
                let queued = lanes
                    .get(name)
                    .map(|l| self.lane_capacity.saturating_sub(l.tx.capacity()))
                    .unwrap_or(0);
                let last = stats.last_success_ms.load(Ordering::Relaxed);
                ClusterHealth {
                    name: name.clone(),
                    queued,
                    succeeded: stats.succeeded.load(Ordering::Relaxed),
                    failed: stats.failed.load(Ordering::Relaxed),
                    skipped: stats.skipped.load(Ordering::Relaxed),
                    consecutive_failures: stats.consecutive_failures.load(Ordering::Relaxed),
                    millis_since_success: (last > 0).then(|| (now_ms - last).max(0) as u64),
                }
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Stop accepting jobs and let lanes drain queued work.
    ///
    /// Workers still busy after `timeout` are aborted. Their jobs were never
    /// acknowledged, so the checkpoint stays before their entries.
    pub async fn close(&self, timeout: Duration) {
        self.lanes.write().await.clear();

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        let deadline = tokio::time::Instant::now() + timeout;
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown (unfinished jobs replay after restart)");
                    handle.abort();
                }
            }
        }
        self.bulkhead.close();
        info!("Push dispatcher stopped");
    }
}
