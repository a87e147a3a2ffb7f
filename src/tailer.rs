//! Operation log tailer.
//!
//! A single supervisor task owns the log cursor and forwards node entries,
//! in log order, into a bounded channel read by the consumer.
//!
//! # State Machine
//!
//! ```text
//!          start()        cursor open
//! Stopped ────────→ Starting ─────────→ Running
//!    ↑                 ↑  │                │
//!    │                 │  │ open fails     │ read fails / forced restart
//!    │    retry wait   │  ↓                │
//!    │                 └─ Failed ←─────────┘
//!    │
//!    └──────────── stop() (from any state)
//! ```
//!
//! # Resume
//!
//! The first cursor starts at the instant `start()` was called, so entries
//! created while the startup delay runs are not lost. After every forwarded
//! entry the committed position advances; a reopened cursor starts strictly
//! after it, so no committed entry is delivered twice. The committed
//! position lives only as long as the process. With a [`CheckpointStore`]
//! attached, the first cursor starts after the stored checkpoint instead,
//! which the engine advances as jobs finish rather than as entries leave
//! the tailer.
//!
//! # Liveness
//!
//! A liveness task checks every `liveness_interval` that the tailer reports
//! Running and that the log answers a ping. A failed ping is logged at
//! error level and forces the supervisor to reopen its cursor.

use crate::checkpoint::CheckpointStore;
use crate::config::TailerConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::{LogCursor, LogPosition, OperationLog, OperationLogEntry, ResourceType, TailRequest};
use crate::resilience::RetryConfig;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for TailerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TailerState::Stopped => write!(f, "Stopped"),
            TailerState::Starting => write!(f, "Starting"),
            TailerState::Running => write!(f, "Running"),
            TailerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why the pump loop returned without an error.
enum PumpExit {
    Shutdown,
    Restart,
    SinkClosed,
}

/// State shared by the supervisor, the liveness task and the handle.
struct Shared {
    log: Arc<dyn OperationLog>,
    config: TailerConfig,
    retry: RetryConfig,
    state_tx: Arc<watch::Sender<TailerState>>,
    restart: Notify,
    committed: RwLock<Option<String>>,
    checkpoints: Option<Arc<CheckpointStore>>,
}

impl Shared {
    fn state(&self) -> TailerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: TailerState) {
        self.state_tx.send_replace(state);
        metrics::set_tailer_state(&state.to_string());
    }

    async fn resume_position(&self, started_at: DateTime<Utc>) -> LogPosition {
        if let Some(id) = self.committed.read().await.clone() {
            return LogPosition::After(id);
        }
        if let Some(checkpoints) = &self.checkpoints {
            if let Some(id) = checkpoints.get(self.log.name()).await {
                info!(entry_id = %id, "Resuming from checkpoint");
                return LogPosition::After(id);
            }
        }
        LogPosition::Since(started_at)
    }

    async fn commit(&self, entry_id: &str) {
        *self.committed.write().await = Some(entry_id.to_string());
    }

    async fn check_liveness(&self) -> bool {
        let state = self.state();
        if state != TailerState::Running {
            error!(state = %state, "Liveness check: tailer is not running");
            metrics::record_liveness_check(false);
            return false;
        }

        let ping = tokio::time::timeout(self.retry.attempt_timeout, self.log.ping()).await;
        match ping {
            Ok(Ok(())) => {
                debug!("Liveness check passed");
                metrics::record_liveness_check(true);
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Liveness check failed, forcing tailer restart");
                metrics::record_liveness_check(false);
                self.restart.notify_one();
                false
            }
            Err(_) => {
                error!("Liveness check timed out, forcing tailer restart");
                metrics::record_liveness_check(false);
                self.restart.notify_one();
                false
            }
        }
    }
}

/// Supervised tail of an [`OperationLog`].
pub struct ChangeLogTailer {
    log: Arc<dyn OperationLog>,
    config: TailerConfig,
    retry: RetryConfig,
    checkpoints: Option<Arc<CheckpointStore>>,
    shared: Option<Arc<Shared>>,
    state_tx: Arc<watch::Sender<TailerState>>,
    state_rx: watch::Receiver<TailerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ChangeLogTailer {
    pub fn new(log: Arc<dyn OperationLog>, config: TailerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(TailerState::Stopped);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let retry = config.retry_config();
        Self {
            log,
            config,
            retry,
            checkpoints: None,
            shared: None,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Override the supervisor's retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Start after the checkpoint stored for this log, when there is one.
    pub fn with_checkpoint(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn state(&self) -> TailerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<TailerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TailerState::Running
    }

    /// Last entry forwarded to the consumer.
    pub async fn committed_position(&self) -> Option<String> {
        match &self.shared {
            Some(shared) => shared.committed.read().await.clone(),
            None => None,
        }
    }

    /// Run the liveness check once (the liveness task does this periodically).
    pub async fn check_liveness(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.check_liveness().await,
            None => {
                error!("Liveness check: tailer was never started");
                false
            }
        }
    }

    /// Spawn the supervisor and the liveness check. Entries go to `sink`.
    pub async fn start(&mut self, sink: mpsc::Sender<OperationLogEntry>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReplicationError::InvalidState {
                expected: "Stopped".to_string(),
                actual: self.state().to_string(),
            });
        }
        if *self.shutdown_rx.borrow() {
            return Err(ReplicationError::Shutdown);
        }

        let shared = Arc::new(Shared {
            log: Arc::clone(&self.log),
            config: self.config.clone(),
            retry: self.retry.clone(),
            state_tx: Arc::clone(&self.state_tx),
            restart: Notify::new(),
            committed: RwLock::new(None),
            checkpoints: self.checkpoints.clone(),
        });
        self.shared = Some(Arc::clone(&shared));

        let started_at = Utc::now();
        let span = info_span!("tailer", log = %self.log.name());
        let supervisor = tokio::spawn(
            run_supervisor(Arc::clone(&shared), sink, self.shutdown_rx.clone(), started_at).instrument(span),
        );

        let liveness_span = info_span!("liveness", log = %self.log.name());
        let liveness = tokio::spawn(run_liveness(shared, self.shutdown_rx.clone()).instrument(liveness_span));

        let mut handles = self.handles.write().await;
        handles.push(supervisor);
        handles.push(liveness);
        info!(
            log = %self.log.name(),
            startup_delay = ?self.config.startup_delay_duration(),
            "Tailer started"
        );
        Ok(())
    }

    /// Stop tailing and release the cursor. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if self.state() != TailerState::Stopped {
            self.state_tx.send_replace(TailerState::Stopped);
            metrics::set_tailer_state("Stopped");
        }
    }
}

async fn run_supervisor(
    shared: Arc<Shared>,
    sink: mpsc::Sender<OperationLogEntry>,
    mut shutdown_rx: watch::Receiver<bool>,
    started_at: DateTime<Utc>,
) {
    shared.set_state(TailerState::Starting);

    let delay = shared.config.startup_delay_duration();
    if !delay.is_zero() {
        info!(delay_secs = delay.as_secs(), "Waiting before opening the log cursor");
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                shared.set_state(TailerState::Stopped);
                info!("Tailer stopped during startup delay");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut failures = 0usize;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let position = shared.resume_position(started_at).await;
        shared.set_state(TailerState::Starting);
        let request = TailRequest {
            position: position.clone(),
            resource_type: ResourceType::Node,
            batch_size: shared.config.batch_size,
            block_timeout: shared.config.block_timeout_duration(),
        };

        let result = match shared.log.open_cursor(request).await {
            Ok(cursor) => {
                metrics::record_cursor_open(true);
                if failures > 0 {
                    info!(failures, "Log cursor reopened after failures");
                }
                failures = 0;
                info!(position = %position, "Log cursor registered");
                shared.set_state(TailerState::Running);
                pump(&shared, cursor, &sink, &mut shutdown_rx).await
            }
            Err(e) => {
                metrics::record_cursor_open(false);
                Err(e)
            }
        };

        match result {
            Ok(PumpExit::Shutdown) => break,
            Ok(PumpExit::SinkClosed) => {
                info!("Consumer channel closed, stopping tailer");
                break;
            }
            Ok(PumpExit::Restart) => {
                warn!("Forced restart, reopening log cursor");
                metrics::record_tailer_restart("liveness");
            }
            Err(e) => {
                failures += 1;
                shared.set_state(TailerState::Failed);
                metrics::record_tailer_restart("error");
                if !shared.retry.should_retry(failures) {
                    error!(error = %e, failures, "Tailer failed, retries exhausted");
                    return;
                }
                let wait = shared.retry.delay_for_attempt(failures);
                error!(
                    error = %e,
                    failures,
                    retry_in_ms = wait.as_millis() as u64,
                    "Tailer failed, will reopen cursor"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    shared.set_state(TailerState::Stopped);
    info!("Tailer supervisor stopped");
}

/// Forward batches until shutdown, a forced restart, or a read error.
/// The cursor is dropped on return.
async fn pump(
    shared: &Shared,
    mut cursor: Box<dyn LogCursor>,
    sink: &mpsc::Sender<OperationLogEntry>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<PumpExit> {
    loop {
        let read_start = Instant::now();
        let batch = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Ok(PumpExit::Shutdown),
            _ = shared.restart.notified() => return Ok(PumpExit::Restart),
            batch = cursor.next_batch() => batch?,
        };
        if batch.is_empty() {
            continue;
        }
        metrics::record_log_read(batch.len(), read_start.elapsed());

        let mut last_id = None;
        for entry in batch {
            let entry_id = entry.id.clone();
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return Ok(PumpExit::Shutdown),
                sent = sink.send(entry) => {
                    if sent.is_err() {
                        return Ok(PumpExit::SinkClosed);
                    }
                }
            }
            shared.commit(&entry_id).await;
            last_id = Some(entry_id);
        }

        if let Some(id) = last_id {
            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            if let Some(lag) = crate::stream::lag_ms_since(&id, now_ms) {
                metrics::record_log_lag_ms(lag);
            }
            debug!(entry_id = %id, "Committed position advanced");
        }
    }
}

async fn run_liveness(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = shared.config.liveness_interval_duration();
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = timer.tick() => {
                shared.check_liveness().await;
            }
        }
    }
    debug!("Liveness check stopped");
}
