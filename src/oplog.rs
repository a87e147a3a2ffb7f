//! Operation log model and tailing seam.
//!
//! Every mutation in the artifact store appends an [`OperationLogEntry`] to a
//! shared, append-only log. The tailer opens a [`LogCursor`] on that log and
//! reads entries in insertion order.
//!
//! Two implementations exist:
//! - [`RedisOperationLog`](crate::stream::RedisOperationLog): a Redis stream (production)
//! - [`MemoryOperationLog`]: in-process, used by tests and embedded setups
//!
//! # Positions
//!
//! ```text
//! LogPosition::Since(t)   entries with created_date >= t   (first open)
//! LogPosition::After(id)  entries strictly after id        (resume)
//! ```

use crate::error::{ReplicationError, Result};
use crate::stream::compare_stream_ids;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// Kind of mutation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperateType {
    Create,
    Update,
    Rename,
    Copy,
    Move,
    Delete,
}

impl OperateType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "RENAME" => Some(Self::Rename),
            "COPY" => Some(Self::Copy),
            "MOVE" => Some(Self::Move),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Rename => "RENAME",
            Self::Copy => "COPY",
            Self::Move => "MOVE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of resource an entry refers to. Only `Node` drives replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Node,
    Repository,
    Project,
    Package,
    Metadata,
}

impl ResourceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NODE" => Some(Self::Node),
            "REPOSITORY" => Some(Self::Repository),
            "PROJECT" => Some(Self::Project),
            "PACKAGE" => Some(Self::Package),
            "METADATA" => Some(Self::Metadata),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "NODE",
            Self::Repository => "REPOSITORY",
            Self::Project => "PROJECT",
            Self::Package => "PACKAGE",
            Self::Metadata => "METADATA",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    /// Log-assigned id, `{millis}-{sequence}`. Empty until appended.
    pub id: String,
    pub operate_type: OperateType,
    pub resource_type: ResourceType,
    /// Operation-specific payload (see [`crate::consumer`] for node shapes).
    pub description: serde_json::Value,
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl OperationLogEntry {
    /// A node entry created now, ready to append.
    pub fn node(operate_type: OperateType, description: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            operate_type,
            resource_type: ResourceType::Node,
            description,
            created_date: Utc::now(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_created_date(mut self, created_date: DateTime<Utc>) -> Self {
        self.created_date = created_date;
        self
    }
}

/// Where a cursor starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPosition {
    /// Entries created at or after this instant.
    Since(DateTime<Utc>),
    /// Entries strictly after this log id.
    After(String),
}

impl LogPosition {
    pub fn now() -> Self {
        Self::Since(Utc::now())
    }

    /// Whether an entry lies at or beyond this position.
    pub fn admits(&self, entry: &OperationLogEntry) -> bool {
        match self {
            Self::Since(ts) => entry.created_date >= *ts,
            Self::After(id) => compare_stream_ids(&entry.id, id) == Ordering::Greater,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Since(ts) => write!(f, "since {}", ts.to_rfc3339()),
            Self::After(id) => write!(f, "after {}", id),
        }
    }
}

/// Parameters for opening a cursor.
#[derive(Debug, Clone)]
pub struct TailRequest {
    pub position: LogPosition,
    /// Only entries of this resource type are returned.
    pub resource_type: ResourceType,
    pub batch_size: usize,
    /// How long `next_batch` waits for new entries before returning empty.
    pub block_timeout: Duration,
}

impl TailRequest {
    /// Node entries from `position` on.
    pub fn nodes(position: LogPosition) -> Self {
        Self {
            position,
            resource_type: ResourceType::Node,
            batch_size: 100,
            block_timeout: Duration::from_secs(5),
        }
    }

    pub fn accepts(&self, entry: &OperationLogEntry) -> bool {
        entry.resource_type == self.resource_type && self.position.admits(entry)
    }
}

/// An append-only operation log that can be tailed.
#[async_trait]
pub trait OperationLog: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Register a cursor. Failures here are what the tailer supervisor retries.
    async fn open_cursor(&self, request: TailRequest) -> Result<Box<dyn LogCursor>>;

    /// Append an entry, returning its assigned id. `entry.id` is ignored.
    async fn append(&self, entry: &OperationLogEntry) -> Result<String>;

    /// Cheap reachability check for the liveness check.
    async fn ping(&self) -> Result<()>;
}

/// A registered cursor over an [`OperationLog`].
#[async_trait]
pub trait LogCursor: Send {
    /// Next entries in log order, filtered by the request.
    ///
    /// Returns an empty batch when the block timeout elapses. An error
    /// means the cursor is dead and must be reopened.
    async fn next_batch(&mut self) -> Result<Vec<OperationLogEntry>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory log
// ═══════════════════════════════════════════════════════════════════════════════

struct MemoryLogState {
    entries: VecDeque<OperationLogEntry>,
    last_ms: i64,
    last_seq: u64,
}

struct MemoryLogShared {
    state: RwLock<MemoryLogState>,
    appended: Notify,
    max_len: Option<usize>,
    // Failure injection
    fail_opens: AtomicUsize,
    fail_reads: AtomicUsize,
    ping_fails: AtomicBool,
    opens: AtomicUsize,
}

/// In-process operation log with Redis-style ids.
///
/// Clones share the same log. Supports failure injection so tailer restart
/// behaviour can be exercised without a Redis server.
#[derive(Clone)]
pub struct MemoryOperationLog {
    name: String,
    shared: Arc<MemoryLogShared>,
}

impl Default for MemoryOperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::with_max_len(None)
    }

    /// A capped log that drops its oldest entries beyond `max_len`.
    pub fn with_max_len(max_len: Option<usize>) -> Self {
        Self {
            name: "memory".to_string(),
            shared: Arc::new(MemoryLogShared {
                state: RwLock::new(MemoryLogState {
                    entries: VecDeque::new(),
                    last_ms: 0,
                    last_seq: 0,
                }),
                appended: Notify::new(),
                max_len,
                fail_opens: AtomicUsize::new(0),
                fail_reads: AtomicUsize::new(0),
                ping_fails: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `n` cursor registrations fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.shared.fail_opens.store(n, AtomicOrdering::SeqCst);
    }

    /// Make the next `n` reads (across all cursors) fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.shared.fail_reads.store(n, AtomicOrdering::SeqCst);
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.shared.ping_fails.store(failing, AtomicOrdering::SeqCst);
    }

    /// Number of successful cursor registrations so far.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(AtomicOrdering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.shared.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entries(&self) -> Vec<OperationLogEntry> {
        self.shared.state.read().await.entries.iter().cloned().collect()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OperationLog for MemoryOperationLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_cursor(&self, request: TailRequest) -> Result<Box<dyn LogCursor>> {
        if take_one(&self.shared.fail_opens) {
            return Err(ReplicationError::redis_msg("OPEN", "injected cursor registration failure"));
        }
        self.shared.opens.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemoryCursor {
            shared: Arc::clone(&self.shared),
            request,
        }))
    }

    async fn append(&self, entry: &OperationLogEntry) -> Result<String> {
        let mut state = self.shared.state.write().await;

        // Ids stay monotonic even if the caller's clock goes backwards.
        let ms = entry.created_date.timestamp_millis().max(state.last_ms);
        let seq = if ms == state.last_ms { state.last_seq + 1 } else { 0 };
        state.last_ms = ms;
        state.last_seq = seq;

        let mut stored = entry.clone();
        stored.id = format!("{}-{}", ms, seq);
        let id = stored.id.clone();
        state.entries.push_back(stored);

        if let Some(max_len) = self.shared.max_len {
            while state.entries.len() > max_len {
                state.entries.pop_front();
            }
        }
        drop(state);

        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        if self.shared.ping_fails.load(AtomicOrdering::SeqCst) {
            return Err(ReplicationError::redis_msg("PING", "injected ping failure"));
        }
        Ok(())
    }
}

struct MemoryCursor {
    shared: Arc<MemoryLogShared>,
    request: TailRequest,
}

impl MemoryCursor {
    /// Collect the next batch and advance past everything scanned.
    async fn collect(&mut self) -> Vec<OperationLogEntry> {
        let state = self.shared.state.read().await;
        let mut batch = Vec::new();
        let mut last_scanned: Option<String> = None;

        for entry in state.entries.iter() {
            if !self.request.position.admits(entry) {
                continue;
            }
            last_scanned = Some(entry.id.clone());
            if entry.resource_type == self.request.resource_type {
                batch.push(entry.clone());
                if batch.len() >= self.request.batch_size.max(1) {
                    break;
                }
            }
        }
        drop(state);

        if let Some(id) = last_scanned {
            self.request.position = LogPosition::After(id);
        }
        batch
    }
}

#[async_trait]
impl LogCursor for MemoryCursor {
    async fn next_batch(&mut self) -> Result<Vec<OperationLogEntry>> {
        if take_one(&self.shared.fail_reads) {
            return Err(ReplicationError::redis_msg("XREAD", "injected read failure"));
        }

        // Register interest before scanning so an append in between is not missed.
        let shared = Arc::clone(&self.shared);
        let notified = shared.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = self.collect().await;
        if !batch.is_empty() {
            return Ok(batch);
        }

        if tokio::time::timeout(self.request.block_timeout, notified).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.collect().await)
    }
}

/// Millisecond timestamp → UTC datetime, clamped to the epoch on overflow.
pub(crate) fn datetime_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(op: OperateType, path: &str) -> OperationLogEntry {
        OperationLogEntry::node(
            op,
            json!({ "projectId": "p", "repoName": "r", "fullPath": path }),
        )
    }

    #[test]
    fn test_operate_type_parse() {
        assert_eq!(OperateType::parse("create"), Some(OperateType::Create));
        assert_eq!(OperateType::parse("MOVE"), Some(OperateType::Move));
        assert_eq!(OperateType::parse("Delete"), Some(OperateType::Delete));
        assert_eq!(OperateType::parse("purge"), None);
        assert_eq!(OperateType::Rename.to_string(), "RENAME");
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!(ResourceType::parse("node"), Some(ResourceType::Node));
        assert_eq!(ResourceType::parse("REPOSITORY"), Some(ResourceType::Repository));
        assert_eq!(ResourceType::parse(""), None);
    }

    #[test]
    fn test_entry_json_uses_uppercase_enums() {
        let entry = node(OperateType::Create, "/a.txt");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["operate_type"], "CREATE");
        assert_eq!(json["resource_type"], "NODE");
    }

    #[test]
    fn test_position_since_is_inclusive() {
        let t = Utc::now();
        let entry = node(OperateType::Create, "/a").with_created_date(t);
        assert!(LogPosition::Since(t).admits(&entry));
        assert!(!LogPosition::Since(t + chrono::Duration::milliseconds(1)).admits(&entry));
    }

    #[test]
    fn test_position_after_is_exclusive() {
        let mut entry = node(OperateType::Create, "/a");
        entry.id = "100-2".to_string();
        assert!(!LogPosition::After("100-2".into()).admits(&entry));
        assert!(LogPosition::After("100-1".into()).admits(&entry));
        assert!(LogPosition::After("99-9".into()).admits(&entry));
    }

    #[test]
    fn test_datetime_from_millis() {
        assert_eq!(datetime_from_millis(0), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(datetime_from_millis(1_500).timestamp_millis(), 1_500);
    }

    #[tokio::test]
    async fn test_memory_append_assigns_monotonic_ids() {
        let log = MemoryOperationLog::new();
        let t = Utc::now();
        let a = log.append(&node(OperateType::Create, "/a").with_created_date(t)).await.unwrap();
        let b = log.append(&node(OperateType::Create, "/b").with_created_date(t)).await.unwrap();
        // Older timestamp still sorts after
        let c = log
            .append(&node(OperateType::Create, "/c").with_created_date(t - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        assert_eq!(compare_stream_ids(&a, &b), Ordering::Less);
        assert_eq!(compare_stream_ids(&b, &c), Ordering::Less);
    }

    #[tokio::test]
    async fn test_memory_cursor_filters_old_and_non_node() {
        let log = MemoryOperationLog::new();
        let start = Utc::now();
        log.append(&node(OperateType::Create, "/old").with_created_date(start - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let mut repo_entry = node(OperateType::Create, "/repo");
        repo_entry.resource_type = ResourceType::Repository;
        log.append(&repo_entry.with_created_date(start)).await.unwrap();
        log.append(&node(OperateType::Create, "/new").with_created_date(start)).await.unwrap();

        let mut request = TailRequest::nodes(LogPosition::Since(start));
        request.block_timeout = Duration::from_millis(10);
        let mut cursor = log.open_cursor(request).await.unwrap();
        let batch = cursor.next_batch().await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].description["fullPath"], "/new");
        assert!(cursor.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_cursor_wakes_on_append() {
        let log = MemoryOperationLog::new();
        let mut request = TailRequest::nodes(LogPosition::now());
        request.block_timeout = Duration::from_secs(5);
        let mut cursor = log.open_cursor(request).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(&node(OperateType::Delete, "/x")).await.unwrap();
        });

        let batch = cursor.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operate_type, OperateType::Delete);
    }

    #[tokio::test]
    async fn test_memory_cursor_batch_size() {
        let log = MemoryOperationLog::new();
        let start = Utc::now();
        for i in 0..5 {
            log.append(&node(OperateType::Create, &format!("/{}", i)).with_created_date(start))
                .await
                .unwrap();
        }
        let mut request = TailRequest::nodes(LogPosition::Since(start));
        request.batch_size = 2;
        let mut cursor = log.open_cursor(request).await.unwrap();

        let sizes = [
            cursor.next_batch().await.unwrap().len(),
            cursor.next_batch().await.unwrap().len(),
            cursor.next_batch().await.unwrap().len(),
        ];
        assert_eq!(sizes, [2, 2, 1]);
    }

    #[tokio::test]
    async fn test_memory_max_len_trims_front() {
        let log = MemoryOperationLog::with_max_len(Some(2));
        for i in 0..4 {
            log.append(&node(OperateType::Create, &format!("/{}", i))).await.unwrap();
        }
        let entries = log.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].description["fullPath"], "/2");
    }

    #[tokio::test]
    async fn test_memory_failure_injection() {
        let log = MemoryOperationLog::new();
        log.fail_next_opens(1);
        assert!(log.open_cursor(TailRequest::nodes(LogPosition::now())).await.is_err());
        let mut cursor = log.open_cursor(TailRequest::nodes(LogPosition::now())).await.unwrap();
        assert_eq!(log.open_count(), 1);

        log.fail_next_reads(1);
        assert!(cursor.next_batch().await.is_err());

        log.set_ping_failing(true);
        assert!(log.ping().await.is_err());
        log.set_ping_failing(false);
        assert!(log.ping().await.is_ok());
    }
}
