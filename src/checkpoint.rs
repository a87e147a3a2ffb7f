// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tail position persistence.
//!
//! Stores the last delivered operation log id per log in SQLite so a process
//! restart can resume where the previous run stopped instead of at "now".
//! Only persisted when `tailer.resume_from_checkpoint` is enabled.
//!
//! # Delivery
//!
//! An entry counts as delivered once every job it produced has written its
//! replica record. [`DeliveryTracker`] keeps the entries still in flight in
//! log order and moves the checkpoint past the longest delivered prefix, so
//! jobs lost to a crash or an aborted drain replay on the next start.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the entry dirty
//! - `flush_dirty()` persists all dirty entries in a batch
//! - The engine flushes periodically and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` replays up to one flush
//! interval of entries (at-least-once delivery).
//!
//! ```text
//! track 1233 (2 jobs), track 1234 (1 job)
//! complete 1234          → nothing moves, 1233 still outstanding
//! complete 1233 (x2)     → set 1234 → (flush) persist 1234
//! ```

use crate::error::{ReplicationError, Result};
use crate::oplog::LogPosition;
use crate::sqlite::{execute_with_retry, wal_checkpoint};
use crate::stream::start_id;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, String>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
}

impl CheckpointStore {
    /// Create the table on `pool` and load existing checkpoints.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tail_checkpoints (
                log_name TEXT PRIMARY KEY,
                entry_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT log_name, entry_id FROM tail_checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (log_name, entry_id) in rows {
            debug!(log = %log_name, entry_id = %entry_id, "Loaded checkpoint from disk");
            cache.insert(log_name, entry_id);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored tail checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Open a standalone checkpoint database.
    pub async fn open(path: &str, wal_mode: bool) -> Result<Self> {
        let pool = crate::sqlite::open_pool(path, wal_mode).await?;
        Self::new(pool).await
    }

    pub async fn get(&self, log_name: &str) -> Option<String> {
        self.cache.read().await.get(log_name).cloned()
    }

    /// Record a committed position (debounced).
    pub async fn set(&self, log_name: &str, entry_id: &str) {
        self.cache
            .write()
            .await
            .insert(log_name.to_string(), entry_id.to_string());
        self.dirty.write().await.insert(log_name.to_string());
    }

    /// Flush all dirty checkpoints to disk. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_logs: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_logs.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, String)> = {
            let cache = self.cache.read().await;
            dirty_logs
                .iter()
                .filter_map(|name| cache.get(name).map(|id| (name.clone(), id.clone())))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (log_name, entry_id) in &snapshot {
            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO tail_checkpoints (log_name, entry_id, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(log_name) DO UPDATE SET
                        entry_id = excluded.entry_id,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(log_name)
                .bind(entry_id)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(log = %log_name, error = %e, "Failed to flush checkpoint");
                    // Retry on the next flush
                    self.dirty.write().await.insert(log_name.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} checkpoints",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a log's checkpoint.
    pub async fn delete(&self, log_name: &str) -> Result<()> {
        self.cache.write().await.remove(log_name);
        self.dirty.write().await.remove(log_name);

        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM tail_checkpoints WHERE log_name = ?")
                .bind(log_name)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Flush pending writes and checkpoint the WAL. The pool stays open.
    pub async fn close(&self) {
        match self.flush_dirty().await {
            Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
        }
        if let Err(e) = wal_checkpoint(&self.pool).await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
    }
}

struct PendingEntry {
    entry_id: String,
    outstanding: usize,
}

/// Moves a log's checkpoint only past entries whose jobs all finished.
///
/// The consumer calls [`track`](Self::track) for every entry it reads, in
/// log order, before submitting that entry's jobs. Lanes call
/// [`complete`](Self::complete) once per job after its record is stored.
pub struct DeliveryTracker {
    log_name: String,
    store: Option<Arc<CheckpointStore>>,
    pending: Mutex<VecDeque<PendingEntry>>,
    delivered: RwLock<Option<String>>,
}

impl DeliveryTracker {
    pub fn new(log_name: impl Into<String>, store: Option<Arc<CheckpointStore>>) -> Self {
        Self {
            log_name: log_name.into(),
            store,
            pending: Mutex::new(VecDeque::new()),
            delivered: RwLock::new(None),
        }
    }

    /// Give a never-checkpointed log a starting position at `since`.
    ///
    /// Without it, entries read but not delivered before the first restart
    /// would fall behind the next run's start instant.
    pub async fn anchor(&self, since: DateTime<Utc>) {
        let Some(store) = &self.store else { return };
        if store.get(&self.log_name).await.is_none() {
            let id = start_id(&LogPosition::Since(since));
            debug!(log = %self.log_name, entry_id = %id, "Anchored new checkpoint");
            store.set(&self.log_name, &id).await;
        }
    }

    /// Register an entry that produced `jobs` jobs. Zero jobs delivers it at once.
    pub async fn track(&self, entry_id: &str, jobs: usize) {
        let mut pending = self.pending.lock().await;
        pending.push_back(PendingEntry {
            entry_id: entry_id.to_string(),
            outstanding: jobs,
        });
        self.advance(&mut pending).await;
    }

    /// One job of `entry_id` has written its record.
    pub async fn complete(&self, entry_id: &str) {
        let mut pending = self.pending.lock().await;
        match pending
            .iter_mut()
            .find(|p| p.entry_id == entry_id && p.outstanding > 0)
        {
            Some(entry) => entry.outstanding -= 1,
            None => {
                warn!(entry_id, "Completion for an entry that is not in flight");
                return;
            }
        }
        self.advance(&mut pending).await;
    }

    async fn advance(&self, pending: &mut VecDeque<PendingEntry>) {
        let mut last = None;
        while pending.front().is_some_and(|p| p.outstanding == 0) {
            last = pending.pop_front().map(|p| p.entry_id);
        }
        let Some(id) = last else { return };
        if let Some(store) = &self.store {
            store.set(&self.log_name, &id).await;
        }
        *self.delivered.write().await = Some(id);
    }

    /// Newest entry whose jobs, and all earlier entries' jobs, are recorded.
    pub async fn delivered(&self) -> Option<String> {
        self.delivered.read().await.clone()
    }

    /// Entries read but not yet delivered.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }
}
