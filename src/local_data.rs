// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local artifact store seam.
//!
//! Push clients read node metadata and content through [`LocalDataManager`].
//! The host process provides an implementation backed by its metadata
//! service and blob storage; [`InMemoryDataManager`] serves tests and demos.
//!
//! # Example
//!
//! ```rust,no_run
//! use artifact_replication::local_data::{BoxFuture, ByteStream, LocalDataManager, NodeDetail};
//!
//! struct Backend;
//!
//! impl LocalDataManager for Backend {
//!     fn find_node_detail<'a>(&'a self, _project_id: &'a str, _repo_name: &'a str, _full_path: &'a str)
//!         -> BoxFuture<'a, Option<NodeDetail>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn list_node_details<'a>(&'a self, _project_id: &'a str, _repo_name: &'a str, _folder: &'a str)
//!         -> BoxFuture<'a, Vec<NodeDetail>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn load_input_stream<'a>(&'a self, _sha256: &'a str, _size: u64, _project_id: &'a str, _repo_name: &'a str)
//!         -> BoxFuture<'a, ByteStream> {
//!         Box::pin(async move { Ok(artifact_replication::local_data::bytes_stream(bytes::Bytes::new(), 1)) })
//!     }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Artifact content as a stream of chunks.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Default chunk size for streamed content.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Metadata for one stored file or folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetail {
    pub project_id: String,
    pub repo_name: String,
    pub full_path: String,
    pub folder: bool,
    /// Hex sha256 of the content. Empty for folders.
    pub sha256: String,
    pub size: u64,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl NodeDetail {
    /// Last path segment.
    pub fn name(&self) -> &str {
        self.full_path.rsplit('/').next().unwrap_or(&self.full_path)
    }

    /// Parent folder path ("/" for root-level nodes).
    pub fn parent(&self) -> &str {
        match self.full_path.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &self.full_path[..i],
        }
    }
}

/// What push clients need from local storage.
pub trait LocalDataManager: Send + Sync + 'static {
    /// Metadata for one node, `None` if it does not exist.
    fn find_node_detail<'a>(
        &'a self,
        project_id: &'a str,
        repo_name: &'a str,
        full_path: &'a str,
    ) -> BoxFuture<'a, Option<NodeDetail>>;

    /// Direct children of `folder` (files and folders).
    fn list_node_details<'a>(
        &'a self,
        project_id: &'a str,
        repo_name: &'a str,
        folder: &'a str,
    ) -> BoxFuture<'a, Vec<NodeDetail>>;

    /// Content addressed by sha256.
    fn load_input_stream<'a>(
        &'a self,
        sha256: &'a str,
        size: u64,
        project_id: &'a str,
        repo_name: &'a str,
    ) -> BoxFuture<'a, ByteStream>;
}

/// Like `find_node_detail`, but a missing node is an error.
pub async fn require_node_detail(
    data: &dyn LocalDataManager,
    project_id: &str,
    repo_name: &str,
    full_path: &str,
) -> Result<NodeDetail> {
    data.find_node_detail(project_id, repo_name, full_path)
        .await?
        .ok_or_else(|| ReplicationError::NodeNotFound {
            project_id: project_id.to_string(),
            repo_name: repo_name.to_string(),
            full_path: full_path.to_string(),
        })
}

/// Drain a stream into memory (multipart bodies need the whole part).
pub async fn read_fully(stream: ByteStream) -> Result<Bytes> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(buf.freeze())
}

/// Split an in-memory buffer into a chunked stream.
pub fn bytes_stream(content: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(content.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < content.len() {
        let end = (offset + chunk_size).min(content.len());
        chunks.push(content.slice(offset..end));
        offset = end;
    }
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════════════

type NodeKey = (String, String, String);

/// Local store held in memory.
#[derive(Default)]
pub struct InMemoryDataManager {
    nodes: RwLock<BTreeMap<NodeKey, NodeDetail>>,
    blobs: RwLock<HashMap<String, Bytes>>,
    chunk_size: Option<usize>,
}

impl InMemoryDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream content in chunks of `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Default::default()
        }
    }

    /// Store a file, creating parent folders. Returns the stored node.
    pub async fn put_file(
        &self,
        project_id: &str,
        repo_name: &str,
        full_path: &str,
        content: impl Into<Bytes>,
    ) -> NodeDetail {
        let content = content.into();
        let full_path = normalize_path(full_path);
        let now = Utc::now();
        let node = NodeDetail {
            project_id: project_id.to_string(),
            repo_name: repo_name.to_string(),
            full_path: full_path.clone(),
            folder: false,
            sha256: sha256_hex(&content),
            size: content.len() as u64,
            created_date: now,
            last_modified_date: now,
        };

        let mut nodes = self.nodes.write().await;
        let mut folder = node.parent().to_string();
        while folder != "/" {
            let key = (project_id.to_string(), repo_name.to_string(), folder.clone());
            nodes.entry(key).or_insert_with(|| NodeDetail {
                project_id: project_id.to_string(),
                repo_name: repo_name.to_string(),
                full_path: folder.clone(),
                folder: true,
                sha256: String::new(),
                size: 0,
                created_date: now,
                last_modified_date: now,
            });
            folder = match folder.rfind('/') {
                Some(0) | None => "/".to_string(),
                Some(i) => folder[..i].to_string(),
            };
        }
        nodes.insert(
            (project_id.to_string(), repo_name.to_string(), full_path),
            node.clone(),
        );
        drop(nodes);

        self.blobs.write().await.insert(node.sha256.clone(), content);
        node
    }

    /// Remove a node's metadata. Content stays (it may be shared).
    pub async fn remove(&self, project_id: &str, repo_name: &str, full_path: &str) -> bool {
        self.nodes
            .write()
            .await
            .remove(&(project_id.to_string(), repo_name.to_string(), normalize_path(full_path)))
            .is_some()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl LocalDataManager for InMemoryDataManager {
    fn find_node_detail<'a>(
        &'a self,
        project_id: &'a str,
        repo_name: &'a str,
        full_path: &'a str,
    ) -> BoxFuture<'a, Option<NodeDetail>> {
        Box::pin(async move {
            let key = (project_id.to_string(), repo_name.to_string(), normalize_path(full_path));
            Ok(self.nodes.read().await.get(&key).cloned())
        })
    }

    fn list_node_details<'a>(
        &'a self,
        project_id: &'a str,
        repo_name: &'a str,
        folder: &'a str,
    ) -> BoxFuture<'a, Vec<NodeDetail>> {
        Box::pin(async move {
            let folder = normalize_path(folder);
            let nodes = self.nodes.read().await;
            Ok(nodes
                .values()
                .filter(|n| n.project_id == project_id && n.repo_name == repo_name)
                .filter(|n| n.parent() == folder && n.full_path != folder)
                .cloned()
                .collect())
        })
    }

    fn load_input_stream<'a>(
        &'a self,
        sha256: &'a str,
        _size: u64,
        project_id: &'a str,
        repo_name: &'a str,
    ) -> BoxFuture<'a, ByteStream> {
        Box::pin(async move {
            let content = self.blobs.read().await.get(sha256).cloned().ok_or_else(|| {
                ReplicationError::Storage(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("blob {} missing for {}/{}", sha256, project_id, repo_name),
                ))
            })?;
            Ok(bytes_stream(content, self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)))
        })
    }
}
