//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - An in-process remote cluster that records pushes
//! - Operation log entry and task builders

#![allow(dead_code)]

pub mod containers;
pub mod mock_remote;

pub use containers::*;
pub use mock_remote::*;

use artifact_replication::oplog::OperateType;
use artifact_replication::task::ReplicaObject;
use artifact_replication::{OperationLogEntry, RepositoryType, ReplicaTask};
use serde_json::json;

/// Install a subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn node_entry(op: OperateType, project: &str, repo: &str, full_path: &str) -> OperationLogEntry {
    OperationLogEntry::node(
        op,
        json!({ "projectId": project, "repoName": repo, "fullPath": full_path }),
    )
}

pub fn rename_entry(project: &str, repo: &str, from: &str, to: &str) -> OperationLogEntry {
    OperationLogEntry::node(
        OperateType::Rename,
        json!({ "projectId": project, "repoName": repo, "fullPath": from, "newFullPath": to }),
    )
}

pub fn move_entry(project: &str, repo: &str, from: &str, to: &str) -> OperationLogEntry {
    OperationLogEntry::node(
        OperateType::Move,
        json!({
            "srcProjectId": project,
            "srcRepoName": repo,
            "srcFullPath": from,
            "destFullPath": to,
        }),
    )
}

/// Real-time task replicating one repository to `clusters`.
pub fn task(key: &str, project: &str, repo: &str, repo_type: RepositoryType, clusters: &[&str]) -> ReplicaTask {
    ReplicaTask::real_time(
        key,
        project,
        vec![ReplicaObject::new(repo, repo_type).with_remote("remote-proj", "remote-repo")],
        clusters.iter().copied(),
    )
}
