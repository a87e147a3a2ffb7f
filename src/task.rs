//! Replication task model.
//!
//! A [`ReplicaTask`] says "replicate these local repositories of a project
//! to these remote clusters". Real-time tasks are driven by the operation
//! log; every push they produce is recorded as a [`ReplicaRecord`].

use crate::error::Result;
use crate::push::RepositoryType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How a task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaType {
    RealTime,
    Scheduled,
    RunOnce,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationStatus {
    Waiting,
    Replicating,
    Paused,
    Success,
    Failed,
    Completed,
}

impl ReplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Replicating => "REPLICATING",
            Self::Paused => "PAUSED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the artifact already exists remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Leave the remote copy alone and record a skip.
    #[default]
    Skip,
    /// Upload anyway.
    Overwrite,
    /// Record a failure.
    FastFail,
}

/// Include/exclude path prefixes. Exclusions win; no includes means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRules {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl PathRules {
    pub fn matches(&self, full_path: &str) -> bool {
        if self.exclude.iter().any(|p| path_has_prefix(full_path, p)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| path_has_prefix(full_path, p))
    }
}

// "/a" covers "/a" and "/a/b" but not "/ab".
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetting {
    /// Parallel uploads within one push (e.g. Maven version folder files).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub path_rules: PathRules,
}

fn default_concurrency() -> usize {
    2
}

impl Default for ReplicaSetting {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            conflict_strategy: ConflictStrategy::default(),
            path_rules: PathRules::default(),
        }
    }
}

/// One local repository covered by a task and where it lands remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaObject {
    pub local_repo_name: String,
    pub repo_type: RepositoryType,
    /// Defaults to the task's project.
    #[serde(default)]
    pub remote_project_id: Option<String>,
    /// Defaults to the local repository name.
    #[serde(default)]
    pub remote_repo_name: Option<String>,
}

impl ReplicaObject {
    pub fn new(local_repo_name: &str, repo_type: RepositoryType) -> Self {
        Self {
            local_repo_name: local_repo_name.to_string(),
            repo_type,
            remote_project_id: None,
            remote_repo_name: None,
        }
    }

    pub fn with_remote(mut self, project_id: &str, repo_name: &str) -> Self {
        self.remote_project_id = Some(project_id.to_string());
        self.remote_repo_name = Some(repo_name.to_string());
        self
    }
}

/// A configured replication task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaTask {
    pub key: String,
    pub name: String,
    pub project_id: String,
    pub replica_type: ReplicaType,
    pub setting: ReplicaSetting,
    pub objects: Vec<ReplicaObject>,
    pub remote_clusters: BTreeSet<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ReplicationStatus,
    #[serde(default)]
    pub next_execution_time: Option<DateTime<Utc>>,
    pub execution_times: u64,
    pub enabled: bool,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub last_modified_by: String,
    pub last_modified_date: DateTime<Utc>,
}

impl ReplicaTask {
    /// An enabled real-time task in WAITING state.
    pub fn real_time(
        key: &str,
        project_id: &str,
        objects: Vec<ReplicaObject>,
        remote_clusters: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            name: key.to_string(),
            project_id: project_id.to_string(),
            replica_type: ReplicaType::RealTime,
            setting: ReplicaSetting::default(),
            objects,
            remote_clusters: remote_clusters.into_iter().map(Into::into).collect(),
            description: None,
            status: ReplicationStatus::Waiting,
            next_execution_time: None,
            execution_times: 0,
            enabled: true,
            created_by: "system".to_string(),
            created_date: now,
            last_modified_by: "system".to_string(),
            last_modified_date: now,
        }
    }

    pub fn with_setting(mut self, setting: ReplicaSetting) -> Self {
        self.setting = setting;
        self
    }

    /// Enabled and triggered by the operation log.
    pub fn is_real_time_active(&self) -> bool {
        self.enabled && self.replica_type == ReplicaType::RealTime
    }

    /// The object covering `project_id/repo_name`, if any.
    pub fn object_for(&self, project_id: &str, repo_name: &str) -> Option<&ReplicaObject> {
        if self.project_id != project_id {
            return None;
        }
        self.objects.iter().find(|o| o.local_repo_name == repo_name)
    }
}

/// What a push job does on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReplicaAction {
    /// Upload the artifact the path belongs to.
    Push { full_path: String },
    /// Remove the artifact at the path.
    Remove { full_path: String },
}

impl ReplicaAction {
    pub fn full_path(&self) -> &str {
        match self {
            Self::Push { full_path } | Self::Remove { full_path } => full_path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordOutcome {
    Success,
    Failed,
    Skipped,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One executed push job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub task_key: String,
    pub cluster: String,
    pub action: ReplicaAction,
    pub outcome: RecordOutcome,
    pub message: Option<String>,
    /// Operation log entry that produced the job.
    pub entry_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Task lookup and status bookkeeping used by the consumer and dispatcher.
#[async_trait]
pub trait ReplicaTaskRegistry: Send + Sync + 'static {
    /// Enabled real-time tasks with an object covering `project_id/repo_name`.
    async fn find_active_real_time(&self, project_id: &str, repo_name: &str) -> Result<Vec<ReplicaTask>>;

    /// Mark a task REPLICATING before a job runs.
    async fn begin_execution(&self, task_key: &str) -> Result<()>;

    /// Persist the record and the task's resulting status atomically.
    async fn complete_execution(&self, record: &ReplicaRecord) -> Result<()>;
}
