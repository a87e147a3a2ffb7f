//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use artifact_replication::config::{ClusterConfig, ReplicationConfig};
//!
//! let config = ReplicationConfig {
//!     local_cluster: "center".into(),
//!     clusters: vec![ClusterConfig::for_testing("edge-sh", "http://edge-sh:25901")],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_cluster: String          # This cluster's name
//! ├── settings: ReplicationSettings
//! │   ├── tailer: TailerConfig       # operation log tailing
//! │   ├── dispatch: DispatchConfig   # per-cluster lanes + worker pool
//! │   └── push: PushConfig           # remote HTTP timeouts, mismatch tables
//! ├── clusters: Vec<ClusterConfig>   # remote clusters we push to
//! ├── task_store: TaskStoreConfig    # SQLite task registry
//! └── proxy_sync: ProxySyncConfig    # edge cache synchronizer
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_cluster": "center",
//!   "settings": {
//!     "tailer": { "startup_delay": "40s", "retry_interval": "30s" },
//!     "push": { "fallback_statuses": { "helm": [404, 405] } }
//!   },
//!   "clusters": [
//!     { "name": "charts", "url": "https://charts.example.com/api/charts", "username": "ci", "password": "secret" }
//!   ],
//!   "task_store": { "sqlite_path": "/var/lib/replication/tasks.db" }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::push::RepositoryType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of the cluster this engine runs in (for logging).
    pub local_cluster: String,

    /// Tunables for tailing, dispatch and pushing.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Remote clusters referenced by replica tasks.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Task registry persistence.
    #[serde(default)]
    pub task_store: TaskStoreConfig,

    /// Edge cache synchronizer. Disabled unless configured.
    #[serde(default)]
    pub proxy_sync: ProxySyncConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_cluster: "local.dev.cluster.default".to_string(),
            settings: ReplicationSettings::default(),
            clusters: Vec::new(),
            task_store: TaskStoreConfig::default(),
            proxy_sync: ProxySyncConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    ///
    /// No startup delay, short retry interval, in-memory task store.
    pub fn for_testing(local_cluster: &str) -> Self {
        Self {
            local_cluster: local_cluster.to_string(),
            settings: ReplicationSettings {
                tailer: TailerConfig::for_testing(),
                ..Default::default()
            },
            clusters: Vec::new(),
            task_store: TaskStoreConfig::in_memory(),
            proxy_sync: ProxySyncConfig::default(),
        }
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ReplicationError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if cluster.url.trim().is_empty() {
                return Err(ReplicationError::Config(format!(
                    "cluster '{}' has no url",
                    cluster.name
                )));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "duplicate cluster name '{}'",
                    cluster.name
                )));
            }
        }
        if self.settings.dispatch.max_concurrent_pushes == 0 {
            return Err(ReplicationError::Config(
                "dispatch.max_concurrent_pushes must be at least 1".to_string(),
            ));
        }
        if self.proxy_sync.enabled && self.proxy_sync.gateway.trim().is_empty() {
            return Err(ReplicationError::Config(
                "proxy_sync.gateway is required when proxy_sync is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Find a cluster by name.
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// General settings for the replication logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub push: PushConfig,
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailerConfig: operation log tailing
// ═══════════════════════════════════════════════════════════════════════════════

/// Operation log tailing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    /// Whether real-time tailing is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redis URL of the operation log.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Name of the operation log stream.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Delay before the first cursor is opened (e.g. "40s").
    #[serde(default = "default_startup_delay")]
    pub startup_delay: String,

    /// Fixed wait between failed cursor registrations (e.g. "30s").
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,

    /// Liveness check period (e.g. "30m").
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval: String,

    /// XREAD block timeout.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the tailer → consumer channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Persist the committed position and resume from it after a process
    /// restart instead of starting at "now".
    #[serde(default = "default_false")]
    pub resume_from_checkpoint: bool,

    /// Approximate cap on log length applied when appending (`XADD MAXLEN ~`).
    #[serde(default)]
    pub max_len: Option<usize>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_key() -> String {
    "operation_log".to_string()
}

fn default_startup_delay() -> String {
    "40s".to_string()
}

fn default_retry_interval() -> String {
    "30s".to_string()
}

fn default_liveness_interval() -> String {
    "30m".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: default_redis_url(),
            stream_key: default_stream_key(),
            startup_delay: default_startup_delay(),
            retry_interval: default_retry_interval(),
            liveness_interval: default_liveness_interval(),
            block_timeout: default_block_timeout(),
            batch_size: 100,
            channel_capacity: 1024,
            resume_from_checkpoint: false,
            max_len: None,
        }
    }
}

impl TailerConfig {
    /// Fast settings for tests: no startup delay, short waits.
    pub fn for_testing() -> Self {
        Self {
            startup_delay: "0s".to_string(),
            retry_interval: "50ms".to_string(),
            liveness_interval: "1s".to_string(),
            block_timeout: "50ms".to_string(),
            ..Default::default()
        }
    }

    pub fn startup_delay_duration(&self) -> Duration {
        parse_duration_or(&self.startup_delay, Duration::from_secs(40))
    }

    pub fn retry_interval_duration(&self) -> Duration {
        parse_duration_or(&self.retry_interval, Duration::from_secs(30))
    }

    pub fn liveness_interval_duration(&self) -> Duration {
        parse_duration_or(&self.liveness_interval, Duration::from_secs(30 * 60))
    }

    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }

    /// Retry policy for the supervisor: unbounded attempts, fixed interval.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig::fixed_interval(self.retry_interval_duration())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig: per-cluster lanes on a bounded pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Push dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum pushes in flight across all clusters.
    #[serde(default = "default_max_concurrent_pushes")]
    pub max_concurrent_pushes: usize,

    /// Queue capacity per cluster lane.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// How long shutdown waits for queued pushes to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_max_concurrent_pushes() -> usize {
    8
}

fn default_lane_capacity() -> usize {
    1024
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pushes: 8,
            lane_capacity: 1024,
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PushConfig: remote HTTP behaviour
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote push configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Whole-request timeout (covers body upload and response read).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Statuses that mean "this remote speaks the other upload convention",
    /// keyed by lowercase repository type. Types without an entry never fall back.
    #[serde(default = "default_fallback_statuses")]
    pub fallback_statuses: BTreeMap<String, Vec<u16>>,
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_request_timeout() -> String {
    "300s".to_string()
}

fn default_fallback_statuses() -> BTreeMap<String, Vec<u16>> {
    let mut table = BTreeMap::new();
    table.insert("helm".to_string(), vec![404, 405]);
    table
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            fallback_statuses: default_fallback_statuses(),
        }
    }
}

impl PushConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(10))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(300))
    }

    /// Mismatch statuses configured for a repository type.
    pub fn fallback_statuses_for(&self, repo_type: RepositoryType) -> Vec<u16> {
        self.fallback_statuses
            .get(&repo_type.to_string().to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: one entry per remote cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// A remote cluster that replica tasks push to.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name, referenced by `ReplicaTask::remote_clusters`.
    pub name: String,

    /// Base URL of the remote repository endpoint.
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Static bearer token; takes precedence over username/password.
    #[serde(default)]
    pub token: Option<String>,
}

// Credentials stay out of logs.
impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ClusterConfig {
    /// Create an anonymous cluster config for testing.
    pub fn for_testing(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            username: None,
            password: None,
            token: None,
        }
    }

    /// Same cluster with basic credentials.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TaskStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Task registry persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_tasks.db".to_string(),
            wal_mode: true,
        }
    }
}

impl TaskStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProxySyncConfig: edge cache synchronizer
// ═══════════════════════════════════════════════════════════════════════════════

/// Edge/proxy cache synchronizer configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxySyncConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Root of the local cache tree.
    #[serde(default)]
    pub cache_root: String,

    /// Upstream gateway base URL.
    #[serde(default)]
    pub gateway: String,

    /// Upload rate limit in bytes/sec; 0 disables limiting.
    #[serde(default)]
    pub rate_bytes_per_sec: u64,

    /// Unmarked files not accessed for this many days are evicted.
    #[serde(default = "default_cache_expire_days")]
    pub cache_expire_days: u32,

    /// How often the cache tree is walked.
    #[serde(default = "default_walk_interval")]
    pub interval: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_cache_expire_days() -> u32 {
    7
}

fn default_walk_interval() -> String {
    "1h".to_string()
}

impl Default for ProxySyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_root: String::new(),
            gateway: String::new(),
            rate_bytes_per_sec: 0,
            cache_expire_days: default_cache_expire_days(),
            interval: default_walk_interval(),
            username: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for ProxySyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySyncConfig")
            .field("enabled", &self.enabled)
            .field("cache_root", &self.cache_root)
            .field("gateway", &self.gateway)
            .field("rate_bytes_per_sec", &self.rate_bytes_per_sec)
            .field("cache_expire_days", &self.cache_expire_days)
            .field("interval", &self.interval)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProxySyncConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(3600))
    }

    pub fn cache_expire_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_expire_days) * 24 * 3600)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
