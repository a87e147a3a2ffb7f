//! Protocol-specific artifact upload to remote clusters.
//!
//! Every repository type has a [`PushClient`] that knows how a remote
//! registry of that type expects artifacts to arrive. The dispatcher looks
//! clients up in a [`PushClientRegistry`] and drives them the same way:
//!
//! ```text
//! resolve_package(path) → query_sync_node_list → get_authorization_details
//!                       → [remote_state] → process_to_upload_artifact
//! ```
//!
//! Clients never retry on their own. A failed upload becomes a FAILED
//! replica record and the next log entry for the artifact tries again.

pub mod generic;
pub mod handler;
pub mod helm;
pub mod maven;
pub mod oci;

use crate::config::{ClusterConfig, PushConfig};
use crate::error::{ReplicationError, Result};
use crate::local_data::{LocalDataManager, NodeDetail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use generic::GenericPushClient;
pub use handler::{MismatchTable, RemoteHttp, UploadOutcome};
pub use helm::HelmPushClient;
pub use maven::MavenPushClient;
pub use oci::OciPushClient;

/// Repository formats a task object can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepositoryType {
    Generic,
    Helm,
    Maven,
    Oci,
    Npm,
    Pypi,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "GENERIC",
            Self::Helm => "HELM",
            Self::Maven => "MAVEN",
            Self::Oci => "OCI",
            Self::Npm => "NPM",
            Self::Pypi => "PYPI",
        }
    }

    /// Case-insensitive; "docker" is an alias for OCI.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GENERIC" => Some(Self::Generic),
            "HELM" => Some(Self::Helm),
            "MAVEN" => Some(Self::Maven),
            "OCI" | "DOCKER" => Some(Self::Oci),
            "NPM" => Some(Self::Npm),
            "PYPI" => Some(Self::Pypi),
            _ => None,
        }
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package name and version an artifact path belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageCoordinate {
    pub name: String,
    pub version: String,
}

impl PackageCoordinate {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}:{}", self.name, self.version)
        }
    }
}

/// The remote copy of a package relative to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Absent,
    /// Same sha256 as the local content.
    Identical,
    Different,
}

/// Where one push goes and where it comes from.
#[derive(Debug, Clone)]
pub struct PushContext {
    pub cluster: ClusterConfig,
    pub task_key: String,
    pub local_project: String,
    pub local_repo: String,
    pub remote_project: String,
    pub remote_repo: String,
    /// Parallel uploads allowed within this push.
    pub concurrency: usize,
}

/// Uploads artifacts of one repository type to a remote cluster.
#[async_trait]
pub trait PushClient: Send + Sync + 'static {
    fn repository_type(&self) -> RepositoryType;

    /// Map a changed node path to the package it belongs to.
    ///
    /// `None` means the path does not trigger a push (e.g. Maven jars, which
    /// travel with their pom).
    fn resolve_package(&self, full_path: &str) -> Option<PackageCoordinate>;

    /// Local nodes that make up `name`/`version`.
    async fn query_sync_node_list(
        &self,
        name: &str,
        version: &str,
        project_id: &str,
        repo_name: &str,
    ) -> Result<Vec<NodeDetail>>;

    /// Authorization header value for the remote, if it needs one.
    async fn get_authorization_details(&self, ctx: &PushContext, name: &str) -> Result<Option<String>>;

    /// Upload `nodes`. Returns true only if every node was accepted.
    async fn process_to_upload_artifact(
        &self,
        ctx: &PushContext,
        nodes: &[NodeDetail],
        name: &str,
        version: &str,
        token: Option<&str>,
    ) -> Result<bool>;

    /// Compare what the remote holds for the package with `nodes`.
    ///
    /// Only consulted by the Skip and FastFail conflict strategies.
    async fn remote_state(
        &self,
        _ctx: &PushContext,
        _package: &PackageCoordinate,
        _nodes: &[NodeDetail],
        _token: Option<&str>,
    ) -> Result<RemoteState> {
        Ok(RemoteState::Absent)
    }

    /// Delete the artifact at `full_path` remotely. False means unsupported.
    async fn remove_artifact(&self, _ctx: &PushContext, _full_path: &str, _token: Option<&str>) -> Result<bool> {
        Ok(false)
    }
}

/// Push clients keyed by repository type.
#[derive(Default, Clone)]
pub struct PushClientRegistry {
    clients: HashMap<RepositoryType, Arc<dyn PushClient>>,
}

impl PushClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generic, Helm, Maven and OCI clients sharing one HTTP client.
    pub fn with_defaults(data: Arc<dyn LocalDataManager>, config: &PushConfig) -> Result<Self> {
        let http = RemoteHttp::new(config)?;
        let mut registry = Self::new();
        registry.register(Arc::new(GenericPushClient::new(
            data.clone(),
            http.clone(),
            MismatchTable::new(config.fallback_statuses_for(RepositoryType::Generic)),
        )));
        registry.register(Arc::new(HelmPushClient::new(
            data.clone(),
            http.clone(),
            MismatchTable::new(config.fallback_statuses_for(RepositoryType::Helm)),
        )));
        registry.register(Arc::new(MavenPushClient::new(
            data.clone(),
            http.clone(),
            MismatchTable::new(config.fallback_statuses_for(RepositoryType::Maven)),
        )));
        registry.register(Arc::new(OciPushClient::new(
            data,
            http,
            MismatchTable::new(config.fallback_statuses_for(RepositoryType::Oci)),
        )));
        Ok(registry)
    }

    /// Add or replace the client for its repository type.
    pub fn register(&mut self, client: Arc<dyn PushClient>) {
        self.clients.insert(client.repository_type(), client);
    }

    pub fn get(&self, repo_type: RepositoryType) -> Result<Arc<dyn PushClient>> {
        self.clients
            .get(&repo_type)
            .cloned()
            .ok_or_else(|| ReplicationError::UnsupportedRepositoryType(repo_type.to_string()))
    }

    pub fn types(&self) -> Vec<RepositoryType> {
        let mut types: Vec<RepositoryType> = self.clients.keys().copied().collect();
        types.sort();
        types
    }
}
