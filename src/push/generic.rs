//! Generic file push.
//!
//! Every file is its own package. Files land at the same path in the
//! remote project/repository through the generic artifact API.

use super::handler::{cluster_authorization, join_url, MismatchTable, RemoteHttp};
use super::{PackageCoordinate, PushClient, PushContext, RemoteState, RepositoryType};
use crate::error::{ReplicationError, Result};
use crate::local_data::{require_node_detail, LocalDataManager, NodeDetail};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, StatusCode};
use std::sync::Arc;
use tracing::{debug, error};

pub const OVERWRITE_HEADER: &str = "X-BKREPO-OVERWRITE";
pub const SHA256_HEADER: &str = "X-BKREPO-SHA256";

pub struct GenericPushClient {
    data: Arc<dyn LocalDataManager>,
    http: RemoteHttp,
    mismatch: MismatchTable,
}

impl GenericPushClient {
    pub fn new(data: Arc<dyn LocalDataManager>, http: RemoteHttp, mismatch: MismatchTable) -> Self {
        Self { data, http, mismatch }
    }

    fn artifact_url(ctx: &PushContext, full_path: &str) -> String {
        join_url(
            &ctx.cluster.url,
            &format!("generic/{}/{}{}", ctx.remote_project, ctx.remote_repo, full_path),
        )
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
            .put(Self::artifact_url(ctx, &node.full_path))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(OVERWRITE_HEADER, "true")
            .header(SHA256_HEADER, node.sha256.as_str())
            .body(Body::wrap_stream(stream));
        self.http
            .execute(cluster, RemoteHttp::authorize(request, token), &self.mismatch)
            .await?
            .into_result(cluster)?;
        crate::metrics::record_push_bytes(cluster, node.size);
        debug!(cluster = %cluster, path = %node.full_path, size = node.size, "Uploaded file");
        Ok(())
    }
}

#[async_trait]
impl PushClient for GenericPushClient {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Generic
    }

    fn resolve_package(&self, full_path: &str) -> Option<PackageCoordinate> {
        if full_path.is_empty() || full_path == "/" {
            return None;
        }
        Some(PackageCoordinate::new(full_path, ""))
    }

    /// The file itself; folders have nothing to upload.
    async fn query_sync_node_list(
        &self,
        name: &str,
        _version: &str,
        project_id: &str,
        repo_name: &str,
    ) -> Result<Vec<NodeDetail>> {
        let node = require_node_detail(self.data.as_ref(), project_id, repo_name, name).await?;
        if node.folder {
            return Ok(Vec::new());
        }
        Ok(vec![node])
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
        let mut all_ok = true;
        for node in nodes {
            if let Err(e) = self.upload_file(ctx, node, token).await {
                error!(cluster = %ctx.cluster.name, path = %node.full_path, error = %e, "File upload failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Files are mutable, so a remote without a digest header is treated as different.
    async fn remote_state(
        &self,
        ctx: &PushContext,
        package: &PackageCoordinate,
        nodes: &[NodeDetail],
        token: Option<&str>,
    ) -> Result<RemoteState> {
        let Some(node) = nodes.first() else {
            return Ok(RemoteState::Absent);
        };
        let request = RemoteHttp::authorize(self.http.client().head(Self::artifact_url(ctx, &package.name)), token);
        self.http
            .remote_state(&ctx.cluster.name, request, &node.sha256, RemoteState::Different)
            .await
    }

    async fn remove_artifact(&self, ctx: &PushContext, full_path: &str, token: Option<&str>) -> Result<bool> {
        let request = RemoteHttp::authorize(self.http.client().delete(Self::artifact_url(ctx, full_path)), token);
        let response = self.http.send(&ctx.cluster.name, request).await?;
        match response.status() {
            // Already gone counts as removed.
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(true),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ReplicationError::remote(&ctx.cluster.name, s.as_u16(), body))
            }
        }
    }
}
