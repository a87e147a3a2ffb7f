//! Maven push.
//!
//! A version is pushed when its pom changes: every file of the version
//! folder (jar, sources, checksums, pom) goes up with a plain PUT. The pom
//! is uploaded last so a remote that indexes on pom arrival sees the whole
//! version. `maven-metadata.xml` files are regenerated remotely and never
//! pushed.

use super::handler::{cluster_authorization, join_url, MismatchTable, RemoteHttp};
use super::{PackageCoordinate, PushClient, PushContext, RemoteState, RepositoryType};
use crate::error::{ReplicationError, Result};
use crate::local_data::{LocalDataManager, NodeDetail};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, StatusCode};
use std::sync::Arc;
use tracing::{debug, error};

const METADATA_PREFIX: &str = "maven-metadata";
const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// `com.acme:lib` → `/com/acme/lib/{version}`.
pub fn version_folder(name: &str, version: &str) -> Option<String> {
    let (group, artifact) = name.split_once(':')?;
    if group.is_empty() || artifact.is_empty() {
        return None;
    }
    Some(format!("/{}/{}/{}", group.replace('.', "/"), artifact, version))
}

/// Recognize `/{group path}/{artifact}/{version}/{artifact}-{version}.pom`.
pub fn parse_pom_path(full_path: &str) -> Option<PackageCoordinate> {
    let segments: Vec<&str> = full_path.trim_start_matches('/').split('/').collect();
    if segments.len() < 4 {
        return None;
    }
    let n = segments.len();
    let (file, version, artifact) = (segments[n - 1], segments[n - 2], segments[n - 3]);
    if file != format!("{}-{}.pom", artifact, version) {
        return None;
    }
    let group = segments[..n - 3].join(".");
    Some(PackageCoordinate::new(format!("{}:{}", group, artifact), version))
}

pub struct MavenPushClient {
    data: Arc<dyn LocalDataManager>,
    http: RemoteHttp,
    mismatch: MismatchTable,
}

impl MavenPushClient {
    pub fn new(data: Arc<dyn LocalDataManager>, http: RemoteHttp, mismatch: MismatchTable) -> Self {
        Self { data, http, mismatch }
    }

    async fn upload_file(&self, ctx: &PushContext, node: &NodeDetail, token: Option<&str>) -> Result<()> {
        let cluster = ctx.cluster.name.as_str();
        let stream = self
            .data
            .load_input_stream(&node.sha256, node.size, &node.project_id, &node.repo_name)
            .await?;
        let request = self
            .http
            .client()
            .put(join_url(&ctx.cluster.url, &node.full_path))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream));
        self.http
            .execute(cluster, RemoteHttp::authorize(request, token), &self.mismatch)
            .await?
            .into_result(cluster)?;
        crate::metrics::record_push_bytes(cluster, node.size);
        debug!(cluster = %cluster, path = %node.full_path, "Uploaded maven file");
        Ok(())
    }

    async fn upload_logged(&self, ctx: &PushContext, node: &NodeDetail, token: Option<&str>) -> bool {
        match self.upload_file(ctx, node, token).await {
            Ok(()) => true,
            Err(e) => {
                error!(cluster = %ctx.cluster.name, path = %node.full_path, error = %e, "Maven file upload failed");
                false
            }
        }
    }
}

fn is_pom(node: &NodeDetail) -> bool {
    node.name().ends_with(".pom")
}

#[async_trait]
impl PushClient for MavenPushClient {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Maven
    }

    fn resolve_package(&self, full_path: &str) -> Option<PackageCoordinate> {
        parse_pom_path(full_path)
    }

    async fn query_sync_node_list(
        &self,
        name: &str,
        version: &str,
        project_id: &str,
        repo_name: &str,
    ) -> Result<Vec<NodeDetail>> {
        let folder = version_folder(name, version)
            .ok_or_else(|| ReplicationError::Internal(format!("not a maven coordinate: {}", name)))?;
        let nodes: Vec<NodeDetail> = self
            .data
            .list_node_details(project_id, repo_name, &folder)
            .await?
            .into_iter()
            .filter(|n| !n.folder && !n.name().starts_with(METADATA_PREFIX))
            .collect();
        if !nodes.iter().any(is_pom) {
            return Err(ReplicationError::NodeNotFound {
                project_id: project_id.to_string(),
                repo_name: repo_name.to_string(),
                full_path: folder,
            });
        }
        Ok(nodes)
    }

    async fn get_authorization_details(&self, ctx: &PushContext, _name: &str) -> Result<Option<String>> {
        Ok(cluster_authorization(&ctx.cluster))
    }

    async fn process_to_upload_artifact(
        &self,
        ctx: &PushContext,
        nodes: &[NodeDetail],
        _name: &str,
        _version: &str,
        token: Option<&str>,
    ) -> Result<bool> {
        let (poms, files): (Vec<&NodeDetail>, Vec<&NodeDetail>) = nodes.iter().partition(|n| is_pom(n));

        let uploads: Vec<_> = files
            .into_iter()
            .map(|node| self.upload_logged(ctx, node, token))
            .collect();
        let results: Vec<bool> = stream::iter(uploads)
            .buffer_unordered(ctx.concurrency.max(1))
            .collect()
            .await;
        let mut all_ok = results.into_iter().all(|ok| ok);

        for pom in poms {
            all_ok &= self.upload_logged(ctx, pom, token).await;
        }
        Ok(all_ok)
    }

    /// Compared on the pom. Release versions without a digest header count as identical.
    async fn remote_state(
        &self,
        ctx: &PushContext,
        package: &PackageCoordinate,
        nodes: &[NodeDetail],
        token: Option<&str>,
    ) -> Result<RemoteState> {
        let Some(pom) = nodes.iter().find(|n| is_pom(n)) else {
            return Ok(RemoteState::Absent);
        };
        let undigested = if package.version.ends_with(SNAPSHOT_SUFFIX) {
            RemoteState::Different
        } else {
            RemoteState::Identical
        };
        let request = RemoteHttp::authorize(self.http.client().head(join_url(&ctx.cluster.url, &pom.full_path)), token);
        self.http
            .remote_state(&ctx.cluster.name, request, &pom.sha256, undigested)
            .await
    }

    async fn remove_artifact(&self, ctx: &PushContext, full_path: &str, token: Option<&str>) -> Result<bool> {
        let request = RemoteHttp::authorize(self.http.client().delete(join_url(&ctx.cluster.url, full_path)), token);
        let response = self.http.send(&ctx.cluster.name, request).await?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(true),
            s => Err(ReplicationError::remote(&ctx.cluster.name, s.as_u16(), "maven delete failed")),
        }
    }
}
