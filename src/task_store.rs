//! SQLite-backed replica task registry.
//!
//! Tasks are kept in an in-memory cache (the consumer looks them up for every
//! log entry) and written through to SQLite. Status bookkeeping for a task
//! and the record of the push that caused it commit in one transaction.
//!
//! # Status
//!
//! A task's status sums up every lane working on it, whatever order the
//! lanes finish in:
//!
//! - `REPLICATING` while any of its jobs has begun and not completed
//! - `FAILED` while the latest record for some (cluster, path) failed
//! - `SUCCESS` otherwise
//!
//! Open failures are rebuilt from `replica_records` on open.
//!
//! # Tables
//!
//! ```text
//! replica_tasks    key PK, project_id, replica_type, enabled, status,
//!                  execution_times, next_execution_time, definition (JSON)
//! replica_records  id PK, task_key, cluster, action, full_path, outcome,
//!                  message, entry_id, started_at, finished_at
//! ```

use crate::config::TaskStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::oplog::datetime_from_millis;
use crate::sqlite::{execute_with_retry, open_pool, wal_checkpoint};
use crate::task::{
    RecordOutcome, ReplicaAction, ReplicaRecord, ReplicaTask, ReplicaTaskRegistry, ReplicationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Jobs of one task that are running or left a failure behind.
#[derive(Debug, Default)]
struct TaskProgress {
    in_flight: usize,
    /// (cluster, full_path) whose latest record failed.
    failed: HashSet<(String, String)>,
}

impl TaskProgress {
    fn complete(&mut self, record: &ReplicaRecord) -> ReplicationStatus {
        self.in_flight = self.in_flight.saturating_sub(1);
        let key = (record.cluster.clone(), record.action.full_path().to_string());
        match record.outcome {
            RecordOutcome::Failed => {
                self.failed.insert(key);
            }
            RecordOutcome::Success | RecordOutcome::Skipped => {
                self.failed.remove(&key);
            }
        }
        if self.in_flight > 0 {
            ReplicationStatus::Replicating
        } else if !self.failed.is_empty() {
            ReplicationStatus::Failed
        } else {
            ReplicationStatus::Success
        }
    }
}

/// Persistent task registry.
pub struct TaskStore {
    pool: SqlitePool,
    /// Write lock doubles as the per-registry mutation lock.
    cache: RwLock<HashMap<String, ReplicaTask>>,
    /// Taken after `cache` when both are needed.
    progress: Mutex<HashMap<String, TaskProgress>>,
}

fn encode_task(task: &ReplicaTask) -> Result<String> {
    serde_json::to_string(task).map_err(|e| ReplicationError::Internal(format!("task encode: {}", e)))
}

impl TaskStore {
    /// Open the store described by `config`.
    pub async fn open(config: &TaskStoreConfig) -> Result<Self> {
        let pool = open_pool(&config.sqlite_path, config.wal_mode).await?;
        Self::new(pool).await
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&TaskStoreConfig::in_memory()).await
    }

    /// Create tables on `pool` and load every task into the cache.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_tasks (
                key TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                replica_type TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                status TEXT NOT NULL,
                execution_times INTEGER NOT NULL,
                next_execution_time INTEGER,
                definition TEXT NOT NULL,
                last_modified_date INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_key TEXT NOT NULL,
                cluster TEXT NOT NULL,
                action TEXT NOT NULL,
                full_path TEXT NOT NULL,
                outcome TEXT NOT NULL,
                message TEXT,
                entry_id TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replica_records_task ON replica_records (task_key)")
            .execute(&pool)
            .await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, definition FROM replica_tasks")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (key, definition) in rows {
            match serde_json::from_str::<ReplicaTask>(&definition) {
                Ok(task) => {
                    cache.insert(key, task);
                }
                Err(e) => warn!(task_key = %key, error = %e, "Skipping unreadable task definition"),
            }
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Loaded replica tasks");
        }

        let failures: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT r.task_key, r.cluster, r.full_path FROM replica_records r
            JOIN (SELECT MAX(id) AS id FROM replica_records GROUP BY task_key, cluster, full_path) latest
                ON r.id = latest.id
            WHERE r.outcome = ?
            "#,
        )
        .bind(RecordOutcome::Failed.as_str())
        .fetch_all(&pool)
        .await?;

        let mut progress: HashMap<String, TaskProgress> = HashMap::new();
        for (task_key, cluster, full_path) in failures {
            progress.entry(task_key).or_default().failed.insert((cluster, full_path));
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            progress: Mutex::new(progress),
        })
    }

    /// The underlying pool (shared with the checkpoint store).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a new task. Keys are unique.
    pub async fn register(&self, task: ReplicaTask) -> Result<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&task.key) {
            return Err(ReplicationError::DuplicateTask(task.key));
        }

        let definition = encode_task(&task)?;
        let pool = &self.pool;
        let result = execute_with_retry("register_task", || async {
            sqlx::query(
                r#"
                INSERT INTO replica_tasks
                    (key, project_id, replica_type, enabled, status, execution_times,
                     next_execution_time, definition, last_modified_date)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.key)
            .bind(&task.project_id)
            .bind(format!("{:?}", task.replica_type))
            .bind(task.enabled)
            .bind(task.status.as_str())
            .bind(task.execution_times as i64)
            .bind(task.next_execution_time.map(|t| t.timestamp_millis()))
            .bind(&definition)
            .bind(task.last_modified_date.timestamp_millis())
            .execute(pool)
            .await
        })
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(ReplicationError::DuplicateTask(task.key));
            }
            Err(e) => return Err(e.into()),
        }

        info!(task_key = %task.key, project = %task.project_id, clusters = ?task.remote_clusters, "Registered replica task");
        cache.insert(task.key.clone(), task);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<ReplicaTask> {
        self.cache.read().await.get(key).cloned()
    }

    /// All tasks, ordered by key.
    pub async fn list(&self) -> Vec<ReplicaTask> {
        let mut tasks: Vec<ReplicaTask> = self.cache.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }

    /// Enable or disable a task.
    pub async fn set_enabled(&self, key: &str, enabled: bool, operator: &str) -> Result<ReplicaTask> {
        self.modify("set_enabled", key, |task| {
            task.enabled = enabled;
            task.last_modified_by = operator.to_string();
        })
        .await
    }

    /// Overwrite a task's status (e.g. pause).
    pub async fn update_status(&self, key: &str, status: ReplicationStatus) -> Result<ReplicaTask> {
        self.modify("update_status", key, |task| task.status = status).await
    }

    /// Set when a scheduled task runs next.
    pub async fn update_schedule(&self, key: &str, next: Option<DateTime<Utc>>) -> Result<ReplicaTask> {
        self.modify("update_schedule", key, |task| task.next_execution_time = next).await
    }

    /// Delete a disabled task and its records.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        let task = cache
            .get(key)
            .ok_or_else(|| ReplicationError::TaskNotFound(key.to_string()))?;
        if task.enabled {
            return Err(ReplicationError::TaskEnabled(key.to_string()));
        }

        let pool = &self.pool;
        execute_with_retry("remove_task", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM replica_records WHERE task_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM replica_tasks WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;

        cache.remove(key);
        self.progress.lock().await.remove(key);
        info!(task_key = %key, "Removed replica task");
        Ok(())
    }

    /// Records for a task, oldest first.
    pub async fn records(&self, key: &str) -> Result<Vec<ReplicaRecord>> {
        type Row = (String, String, String, String, String, Option<String>, Option<String>, i64, i64);
        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT task_key, cluster, action, full_path, outcome, message, entry_id, started_at, finished_at
            FROM replica_records WHERE task_key = ? ORDER BY id
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(task_key, cluster, action, full_path, outcome, message, entry_id, started, finished)| {
                let action = match action.as_str() {
                    "push" => ReplicaAction::Push { full_path },
                    "remove" => ReplicaAction::Remove { full_path },
                    other => {
                        return Err(ReplicationError::Internal(format!("unknown record action {}", other)))
                    }
                };
                let outcome = RecordOutcome::parse(&outcome)
                    .ok_or_else(|| ReplicationError::Internal(format!("unknown record outcome {}", outcome)))?;
                Ok(ReplicaRecord {
                    task_key,
                    cluster,
                    action,
                    outcome,
                    message,
                    entry_id,
                    started_at: datetime_from_millis(started),
                    finished_at: datetime_from_millis(finished),
                })
            })
            .collect()
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = wal_checkpoint(&self.pool).await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Task store closed");
    }

    /// Apply `f` to a cached task and write the result through.
    async fn modify<F>(&self, operation: &str, key: &str, f: F) -> Result<ReplicaTask>
    where
        F: FnOnce(&mut ReplicaTask),
    {
        let mut cache = self.cache.write().await;
        let mut updated = cache
            .get(key)
            .cloned()
            .ok_or_else(|| ReplicationError::TaskNotFound(key.to_string()))?;
        f(&mut updated);
        updated.last_modified_date = Utc::now();

        let definition = encode_task(&updated)?;
        let pool = &self.pool;
        let task = &updated;
        execute_with_retry(operation, || async {
            sqlx::query(
                r#"
                UPDATE replica_tasks SET
                    enabled = ?, status = ?, execution_times = ?, next_execution_time = ?,
                    definition = ?, last_modified_date = ?
                WHERE key = ?
                "#,
            )
            .bind(task.enabled)
            .bind(task.status.as_str())
            .bind(task.execution_times as i64)
            .bind(task.next_execution_time.map(|t| t.timestamp_millis()))
            .bind(&definition)
            .bind(task.last_modified_date.timestamp_millis())
            .bind(&task.key)
            .execute(pool)
            .await
        })
        .await?;

        debug!(task_key = %key, operation, status = %updated.status, "Task updated");
        cache.insert(key.to_string(), updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl ReplicaTaskRegistry for TaskStore {
    async fn find_active_real_time(&self, project_id: &str, repo_name: &str) -> Result<Vec<ReplicaTask>> {
        let cache = self.cache.read().await;
        let mut tasks: Vec<ReplicaTask> = cache
            .values()
            .filter(|t| t.is_real_time_active() && t.object_for(project_id, repo_name).is_some())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tasks)
    }

    async fn begin_execution(&self, task_key: &str) -> Result<()> {
        if !self.cache.read().await.contains_key(task_key) {
            return Err(ReplicationError::TaskNotFound(task_key.to_string()));
        }
        self.progress
            .lock()
            .await
            .entry(task_key.to_string())
            .or_default()
            .in_flight += 1;

        if let Some(task) = self.cache.read().await.get(task_key) {
            if task.status == ReplicationStatus::Replicating {
                return Ok(());
            }
        }
        self.modify("begin_execution", task_key, |task| {
            task.status = ReplicationStatus::Replicating;
        })
        .await?;
        Ok(())
    }

    async fn complete_execution(&self, record: &ReplicaRecord) -> Result<()> {
        let mut cache = self.cache.write().await;
        let mut updated = cache
            .get(&record.task_key)
            .cloned()
            .ok_or_else(|| ReplicationError::TaskNotFound(record.task_key.clone()))?;
        // The job is over whether or not the write below lands
        updated.status = self
            .progress
            .lock()
            .await
            .entry(record.task_key.clone())
            .or_default()
            .complete(record);
        updated.execution_times += 1;
        updated.last_modified_date = record.finished_at;

        let definition = encode_task(&updated)?;
        let pool = &self.pool;
        let task = &updated;
        execute_with_retry("complete_execution", || async {
            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO replica_records
                    (task_key, cluster, action, full_path, outcome, message, entry_id, started_at, finished_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.task_key)
            .bind(&record.cluster)
            .bind(record.action.kind())
            .bind(record.action.full_path())
            .bind(record.outcome.as_str())
            .bind(record.message.as_deref())
            .bind(record.entry_id.as_deref())
            .bind(record.started_at.timestamp_millis())
            .bind(record.finished_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                UPDATE replica_tasks SET
                    status = ?, execution_times = ?, definition = ?, last_modified_date = ?
                WHERE key = ?
                "#,
            )
            .bind(task.status.as_str())
            .bind(task.execution_times as i64)
            .bind(&definition)
            .bind(task.last_modified_date.timestamp_millis())
            .bind(&task.key)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        })
        .await?;

        crate::metrics::record_task_execution(&record.task_key, record.outcome.as_str());
        cache.insert(record.task_key.clone(), updated);
        Ok(())
    }
}
