//! Helm chart push.
//!
//! Charts live at the repository root as `{name}-{version}.tgz`. Remotes
//! disagree on how they accept them: Artifactory-style registries take a
//! PUT of the archive, ChartMuseum wants a multipart POST to its base URL.
//! The PUT goes first; only a status in the mismatch table (404/405 by
//! default) triggers the multipart fallback.

use super::handler::{cluster_authorization, join_url, MismatchTable, RemoteHttp, UploadOutcome};
use super::{PackageCoordinate, PushClient, PushContext, RemoteState, RepositoryType};
use crate::error::{ReplicationError, Result};
use crate::local_data::{read_fully, LocalDataManager, NodeDetail};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::sync::Arc;
use tracing::{error, info};

const CHART_PART: &str = "chart";
const OCTET_STREAM: &str = "application/octet-stream";

pub fn chart_file_name(name: &str, version: &str) -> String {
    format!("{}-{}.tgz", name, version)
}

/// Split `nginx-ingress-1.2.3.tgz` into `nginx-ingress` / `1.2.3`.
///
/// The version starts at the first `-` followed by a digit.
pub fn parse_chart_file_name(file_name: &str) -> Option<PackageCoordinate> {
    let stem = file_name.strip_suffix(".tgz")?;
    let bytes = stem.as_bytes();
    let split = (1..bytes.len().saturating_sub(1))
        .find(|&i| bytes[i] == b'-' && bytes[i + 1].is_ascii_digit())?;
    Some(PackageCoordinate::new(&stem[..split], &stem[split + 1..]))
}

pub struct HelmPushClient {
    data: Arc<dyn LocalDataManager>,
    http: RemoteHttp,
    mismatch: MismatchTable,
}

impl HelmPushClient {
    pub fn new(data: Arc<dyn LocalDataManager>, http: RemoteHttp, mismatch: MismatchTable) -> Self {
        Self { data, http, mismatch }
    }

    async fn upload_chart(
        &self,
        ctx: &PushContext,
        node: &NodeDetail,
        file_name: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let cluster = ctx.cluster.name.as_str();
        let stream = self
            .data
            .load_input_stream(&node.sha256, node.size, &node.project_id, &node.repo_name)
            .await?;
        let request = self
            .http
            .client()
            .put(join_url(&ctx.cluster.url, file_name))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(Body::wrap_stream(stream));

        let outcome = match self
            .http
            .execute(cluster, RemoteHttp::authorize(request, token), &self.mismatch)
            .await?
        {
            UploadOutcome::ProtocolMismatch(status) => {
                info!(
                    cluster = %cluster,
                    chart = %file_name,
                    status,
                    "Chart PUT not accepted, retrying as multipart upload"
                );
                crate::metrics::record_push_fallback(cluster, "helm", status);
                self.upload_multipart(ctx, node, file_name, token).await?
            }
            other => other,
        };

        outcome.into_result(cluster)?;
        crate::metrics::record_push_bytes(cluster, node.size);
        Ok(())
    }

    async fn upload_multipart(
        &self,
        ctx: &PushContext,
        node: &NodeDetail,
        file_name: &str,
        token: Option<&str>,
    ) -> Result<UploadOutcome> {
        let cluster = ctx.cluster.name.as_str();
        let stream = self
            .data
            .load_input_stream(&node.sha256, node.size, &node.project_id, &node.repo_name)
            .await?;
        let content = read_fully(stream).await?;
        let part = Part::bytes(content.to_vec())
            .file_name(file_name.to_string())
            .mime_str(OCTET_STREAM)
            .map_err(|e| ReplicationError::http(cluster, e))?;
        let form = Form::new().part(CHART_PART, part).text("force", "true");

        let request = self.http.client().post(&ctx.cluster.url).multipart(form);
        // A second mismatch is a plain failure.
        self.http
            .execute(cluster, RemoteHttp::authorize(request, token), &MismatchTable::none())
            .await
    }
}

#[async_trait]
impl PushClient for HelmPushClient {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Helm
    }

    fn resolve_package(&self, full_path: &str) -> Option<PackageCoordinate> {
        let file_name = full_path.strip_prefix('/')?;
        if file_name.contains('/') {
            return None;
        }
        parse_chart_file_name(file_name)
    }

    async fn query_sync_node_list(
        &self,
        name: &str,
        version: &str,
        project_id: &str,
        repo_name: &str,
    ) -> Result<Vec<NodeDetail>> {
        let chart_path = format!("/{}", chart_file_name(name, version));
        let node =
            crate::local_data::require_node_detail(self.data.as_ref(), project_id, repo_name, &chart_path)
                .await?;
        Ok(vec![node])
    }

    async fn get_authorization_details(&self, ctx: &PushContext, _name: &str) -> Result<Option<String>> {
        Ok(cluster_authorization(&ctx.cluster))
    }

    async fn process_to_upload_artifact(
        &self,
        ctx: &PushContext,
        nodes: &[NodeDetail],
        name: &str,
        version: &str,
        token: Option<&str>,
    ) -> Result<bool> {
        let file_name = chart_file_name(name, version);
        let mut all_ok = true;
        for node in nodes {
            if let Err(e) = self.upload_chart(ctx, node, &file_name, token).await {
                error!(
                    cluster = %ctx.cluster.name,
                    chart = %file_name,
                    error = %e,
                    "Chart upload failed"
                );
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Chart versions are immutable, so a chart without a digest header counts as identical.
    async fn remote_state(
        &self,
        ctx: &PushContext,
        package: &PackageCoordinate,
        nodes: &[NodeDetail],
        token: Option<&str>,
    ) -> Result<RemoteState> {
        let Some(chart) = nodes.first() else {
            return Ok(RemoteState::Absent);
        };
        let url = join_url(&ctx.cluster.url, &chart_file_name(&package.name, &package.version));
        let request = RemoteHttp::authorize(self.http.client().head(url), token);
        self.http
            .remote_state(&ctx.cluster.name, request, &chart.sha256, RemoteState::Identical)
            .await
    }
}
