//! Node event consumer.
//!
//! Turns operation log entries into push jobs. Each node mutation is decoded
//! into a [`NodeEvent`], which expands into one or two replica actions:
//!
//! | Event | Actions |
//! |-------|---------|
//! | create, update | push path |
//! | copy | push dest |
//! | rename | push new path, then remove old path |
//! | move | push dest, then remove src |
//! | delete | remove path |
//!
//! Every action is matched against enabled real-time tasks covering the
//! affected repository and becomes one [`PushJob`] per remote cluster.
//! Entries that cannot be decoded are logged and skipped.
//!
//! # Node description payloads
//!
//! ```text
//! CREATE/UPDATE/DELETE  {projectId, repoName, fullPath}
//! RENAME                {projectId, repoName, fullPath, newFullPath}
//! COPY/MOVE             {srcProjectId, srcRepoName, srcFullPath,
//!                        destProjectId?, destRepoName?, destFullPath}
//! ```

use crate::error::{ReplicationError, Result};
use crate::oplog::{OperateType, OperationLogEntry, ResourceType};
use crate::task::{ReplicaAction, ReplicaObject, ReplicaSetting, ReplicaTaskRegistry};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// A node in a specific project/repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub project_id: String,
    pub repo_name: String,
    pub full_path: String,
}

impl NodeRef {
    fn at(&self, full_path: &str) -> Self {
        Self {
            full_path: full_path.to_string(),
            ..self.clone()
        }
    }
}

/// A decoded node mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Created(NodeRef),
    Updated(NodeRef),
    Deleted(NodeRef),
    Renamed { node: NodeRef, new_full_path: String },
    Copied { src: NodeRef, dest: NodeRef },
    Moved { src: NodeRef, dest: NodeRef },
}

impl NodeEvent {
    /// Replica actions in execution order, each with the node whose
    /// repository selects the tasks.
    pub fn actions(&self) -> Vec<(NodeRef, ReplicaAction)> {
        let push = |n: &NodeRef| ReplicaAction::Push {
            full_path: n.full_path.clone(),
        };
        let remove = |n: &NodeRef| ReplicaAction::Remove {
            full_path: n.full_path.clone(),
        };
        match self {
            Self::Created(n) | Self::Updated(n) => vec![(n.clone(), push(n))],
            Self::Deleted(n) => vec![(n.clone(), remove(n))],
            Self::Renamed { node, new_full_path } => {
                let renamed = node.at(new_full_path);
                vec![(renamed.clone(), push(&renamed)), (node.clone(), remove(node))]
            }
            Self::Copied { dest, .. } => vec![(dest.clone(), push(dest))],
            Self::Moved { src, dest } => vec![(dest.clone(), push(dest)), (src.clone(), remove(src))],
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodePayload {
    project_id: String,
    repo_name: String,
    full_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenamePayload {
    project_id: String,
    repo_name: String,
    full_path: String,
    new_full_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferPayload {
    src_project_id: String,
    src_repo_name: String,
    src_full_path: String,
    #[serde(default)]
    dest_project_id: Option<String>,
    #[serde(default)]
    dest_repo_name: Option<String>,
    dest_full_path: String,
}

impl TransferPayload {
    fn into_refs(self) -> (NodeRef, NodeRef) {
        let dest = NodeRef {
            project_id: self.dest_project_id.unwrap_or_else(|| self.src_project_id.clone()),
            repo_name: self.dest_repo_name.unwrap_or_else(|| self.src_repo_name.clone()),
            full_path: self.dest_full_path,
        };
        let src = NodeRef {
            project_id: self.src_project_id,
            repo_name: self.src_repo_name,
            full_path: self.src_full_path,
        };
        (src, dest)
    }
}

impl From<NodePayload> for NodeRef {
    fn from(p: NodePayload) -> Self {
        Self {
            project_id: p.project_id,
            repo_name: p.repo_name,
            full_path: p.full_path,
        }
    }
}

fn payload<T: DeserializeOwned>(entry: &OperationLogEntry) -> Result<T> {
    serde_json::from_value(entry.description.clone()).map_err(|e| {
        ReplicationError::LogParse(format!(
            "{} entry {}: {}",
            entry.operate_type, entry.id, e
        ))
    })
}

/// One unit of work for a remote cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct PushJob {
    pub task_key: String,
    /// Local project the action applies to.
    pub project_id: String,
    pub object: ReplicaObject,
    pub setting: ReplicaSetting,
    pub cluster: String,
    pub action: ReplicaAction,
    /// Log entry that produced the job.
    pub entry_id: String,
}

impl PushJob {
    pub fn remote_project(&self) -> &str {
        self.object.remote_project_id.as_deref().unwrap_or(&self.project_id)
    }

    pub fn remote_repo(&self) -> &str {
        self.object
            .remote_repo_name
            .as_deref()
            .unwrap_or(&self.object.local_repo_name)
    }
}

/// Maps log entries to push jobs using the task registry.
pub struct NodeEventConsumer {
    tasks: Arc<dyn ReplicaTaskRegistry>,
}

impl NodeEventConsumer {
    pub fn new(tasks: Arc<dyn ReplicaTaskRegistry>) -> Self {
        Self { tasks }
    }

    /// Decode a node entry into a typed event.
    pub fn decode(entry: &OperationLogEntry) -> Result<NodeEvent> {
        if entry.resource_type != ResourceType::Node {
            return Err(ReplicationError::LogParse(format!(
                "entry {} is a {} entry",
                entry.id, entry.resource_type
            )));
        }
        let event = match entry.operate_type {
            OperateType::Create => NodeEvent::Created(payload::<NodePayload>(entry)?.into()),
            OperateType::Update => NodeEvent::Updated(payload::<NodePayload>(entry)?.into()),
            OperateType::Delete => NodeEvent::Deleted(payload::<NodePayload>(entry)?.into()),
            OperateType::Rename => {
                let p: RenamePayload = payload(entry)?;
                NodeEvent::Renamed {
                    node: NodeRef {
                        project_id: p.project_id,
                        repo_name: p.repo_name,
                        full_path: p.full_path,
                    },
                    new_full_path: p.new_full_path,
                }
            }
            OperateType::Copy => {
                let (src, dest) = payload::<TransferPayload>(entry)?.into_refs();
                NodeEvent::Copied { src, dest }
            }
            OperateType::Move => {
                let (src, dest) = payload::<TransferPayload>(entry)?.into_refs();
                NodeEvent::Moved { src, dest }
            }
        };
        Ok(event)
    }

    /// Jobs for one entry, in the order they must run per cluster.
    ///
    /// Never fails: undecodable entries and registry errors are logged and
    /// yield no jobs.
    pub async fn dispatch(&self, entry: &OperationLogEntry) -> Vec<PushJob> {
        let event = match Self::decode(entry) {
            Ok(event) => event,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Skipping undecodable log entry");
                crate::metrics::record_log_entry_skipped("undecodable");
                return Vec::new();
            }
        };

        let mut jobs = Vec::new();
        for (node, action) in event.actions() {
            let tasks = match self
                .tasks
                .find_active_real_time(&node.project_id, &node.repo_name)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(
                        entry_id = %entry.id,
                        project = %node.project_id,
                        repo = %node.repo_name,
                        error = %e,
                        "Task lookup failed, skipping action"
                    );
                    continue;
                }
            };

            for task in tasks {
                let Some(object) = task.object_for(&node.project_id, &node.repo_name) else {
                    continue;
                };
                if !task.setting.path_rules.matches(action.full_path()) {
                    debug!(task_key = %task.key, path = %action.full_path(), "Path excluded by task rules");
                    continue;
                }
                for cluster in &task.remote_clusters {
                    jobs.push(PushJob {
                        task_key: task.key.clone(),
                        project_id: node.project_id.clone(),
                        object: object.clone(),
                        setting: task.setting.clone(),
                        cluster: cluster.clone(),
                        action: action.clone(),
                        entry_id: entry.id.clone(),
                    });
                }
            }
        }

        if jobs.is_empty() {
            debug!(entry_id = %entry.id, operate_type = %entry.operate_type, "No replica task covers entry");
        }
        jobs
    }
}
