//! OCI / Docker registry push.
//!
//! Local layout of an image tag:
//!
//! ```text
//! /{image}/{tag}/manifest.json
//! /{image}/{tag}/sha256__{hex}     one per config/layer blob
//! ```
//!
//! Remote side speaks the distribution API: each blob is checked with HEAD,
//! uploaded through a POST session and a PUT with `?digest=`, and the
//! manifest is PUT last so the tag never points at missing blobs.
//!
//! Registries that hand out bearer tokens answer `GET /v2/` with
//! `WWW-Authenticate: Bearer realm="…",service="…"`; the token is fetched
//! from the realm with the cluster's basic credentials.

use super::handler::{basic_auth, join_url, MismatchTable, RemoteHttp};
use super::{PackageCoordinate, PushClient, PushContext, RemoteState, RepositoryType};
use crate::error::{ReplicationError, Result};
use crate::local_data::{read_fully, require_node_detail, LocalDataManager, NodeDetail};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const BLOB_PREFIX: &str = "sha256__";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// `sha256:abcd` → `sha256__abcd`.
pub fn blob_file_name(digest: &str) -> Option<String> {
    digest.strip_prefix("sha256:").map(|hex| format!("{}{}", BLOB_PREFIX, hex))
}

/// Parameters of a `Bearer` challenge; `None` for other schemes.
pub fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim();
    if rest.len() < 7 || !rest[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let mut params = HashMap::new();
    let mut input = &rest[7..];
    loop {
        input = input.trim_start_matches(|c| c == ' ' || c == ',');
        let Some(eq) = input.find('=') else { break };
        let key = input[..eq].trim().to_ascii_lowercase();
        let after = &input[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.trim().to_string());
        input = remaining;
    }
    Some(params)
}

pub struct OciPushClient {
    data: Arc<dyn LocalDataManager>,
    http: RemoteHttp,
    mismatch: MismatchTable,
}

impl OciPushClient {
    pub fn new(data: Arc<dyn LocalDataManager>, http: RemoteHttp, mismatch: MismatchTable) -> Self {
        Self { data, http, mismatch }
    }

    fn remote_repository(ctx: &PushContext, image: &str) -> String {
        format!("{}/{}/{}", ctx.remote_project, ctx.remote_repo, image)
    }

    async fn load(&self, node: &NodeDetail) -> Result<Bytes> {
        let stream = self
            .data
            .load_input_stream(&node.sha256, node.size, &node.project_id, &node.repo_name)
            .await?;
        read_fully(stream).await
    }

    async fn fetch_token(
        &self,
        ctx: &PushContext,
        challenge: &HashMap<String, String>,
        repository: &str,
    ) -> Result<String> {
        let cluster = ctx.cluster.name.as_str();
        let auth_error = |message: String| ReplicationError::Auth {
            cluster: cluster.to_string(),
            message,
        };
        let realm = challenge
            .get("realm")
            .ok_or_else(|| auth_error("challenge without realm".to_string()))?;

        let mut query = vec![("scope".to_string(), format!("repository:{}:push,pull", repository))];
        if let Some(service) = challenge.get("service") {
            query.push(("service".to_string(), service.clone()));
        }
        let mut request = self.http.client().get(realm.as_str()).query(&query);
        if let Some(user) = &ctx.cluster.username {
            let password = ctx.cluster.password.as_deref().unwrap_or_default();
            request = request.header(reqwest::header::AUTHORIZATION, basic_auth(user, password));
        }

        let response = self.http.send(cluster, request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(auth_error(format!("token endpoint answered {}", status.as_u16())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(format!("unreadable token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(|t| format!("Bearer {}", t))
            .ok_or_else(|| auth_error("token response without token".to_string()))
    }

    async fn push_blob(
        &self,
        ctx: &PushContext,
        repository: &str,
        node: &NodeDetail,
        token: Option<&str>,
    ) -> Result<()> {
        let cluster = ctx.cluster.name.as_str();
        let digest = format!("sha256:{}", node.sha256);
        let blob_url = join_url(&ctx.cluster.url, &format!("v2/{}/blobs/{}", repository, digest));

        let head = RemoteHttp::authorize(self.http.client().head(&blob_url), token);
        if self.http.send(cluster, head).await?.status().is_success() {
            debug!(cluster = %cluster, digest = %digest, "Blob already present");
            return Ok(());
        }

        let uploads_url = join_url(&ctx.cluster.url, &format!("v2/{}/blobs/uploads/", repository));
        let start = RemoteHttp::authorize(self.http.client().post(&uploads_url), token);
        let response = self.http.send(cluster, start).await?;
        let status = response.status();

        let stream = self
            .data
            .load_input_stream(&node.sha256, node.size, &node.project_id, &node.repo_name)
            .await?;

        let request = if status.is_success() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ReplicationError::remote(cluster, status.as_u16(), "upload session without Location"))?;
            let location = if location.starts_with("http://") || location.starts_with("https://") {
                location.to_string()
            } else {
                join_url(&ctx.cluster.url, location)
            };
            self.http.client().put(location)
        } else if self.mismatch.contains(status.as_u16()) {
            info!(cluster = %cluster, status = status.as_u16(), "Upload sessions unsupported, pushing blob monolithically");
            crate::metrics::record_push_fallback(cluster, "oci", status.as_u16());
            self.http.client().post(&uploads_url)
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicationError::remote(cluster, status.as_u16(), body));
        };

        let request = request
            .query(&[("digest", digest.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream));
        self.http
            .execute(cluster, RemoteHttp::authorize(request, token), &MismatchTable::none())
            .await?
            .into_result(cluster)?;
        crate::metrics::record_push_bytes(cluster, node.size);
        Ok(())
    }

    async fn push_manifest(
        &self,
        ctx: &PushContext,
        repository: &str,
        tag: &str,
        node: &NodeDetail,
        token: Option<&str>,
    ) -> Result<()> {
        let cluster = ctx.cluster.name.as_str();
        let content = self.load(node).await?;
        let media_type = serde_json::from_slice::<Manifest>(&content)
            .ok()
            .and_then(|m| m.media_type)
            .unwrap_or_else(|| DOCKER_MANIFEST_V2.to_string());
        let url = join_url(&ctx.cluster.url, &format!("v2/{}/manifests/{}", repository, tag));
        let size = content.len() as u64;
        let request = self
            .http
            .client()
            .put(url)
            .header(CONTENT_TYPE, media_type)
            .body(content);
        self.http
            .execute(cluster, RemoteHttp::authorize(request, token), &MismatchTable::none())
            .await?
            .into_result(cluster)?;
        crate::metrics::record_push_bytes(cluster, size);
        Ok(())
    }
}

#[async_trait]
impl PushClient for OciPushClient {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Oci
    }

    fn resolve_package(&self, full_path: &str) -> Option<PackageCoordinate> {
        let trimmed = full_path.trim_start_matches('/');
        let prefix = trimmed.strip_suffix(MANIFEST_FILE)?.strip_suffix('/')?;
        let (image, tag) = prefix.rsplit_once('/')?;
        if image.is_empty() || tag.is_empty() {
            return None;
        }
        Some(PackageCoordinate::new(image, tag))
    }

    /// Referenced blobs first, manifest last.
    async fn query_sync_node_list(
        &self,
        name: &str,
        version: &str,
        project_id: &str,
        repo_name: &str,
    ) -> Result<Vec<NodeDetail>> {
        let folder = format!("/{}/{}", name, version);
        let manifest_node =
            require_node_detail(self.data.as_ref(), project_id, repo_name, &format!("{}/{}", folder, MANIFEST_FILE))
                .await?;
        let manifest: Manifest = serde_json::from_slice(&self.load(&manifest_node).await?)
            .map_err(|e| ReplicationError::Internal(format!("invalid manifest {}: {}", manifest_node.full_path, e)))?;

        let mut nodes = Vec::with_capacity(manifest.layers.len() + 2);
        for descriptor in manifest.config.iter().chain(manifest.layers.iter()) {
            let file = blob_file_name(&descriptor.digest).ok_or_else(|| {
                ReplicationError::Internal(format!("unsupported digest {}", descriptor.digest))
            })?;
            let blob =
                require_node_detail(self.data.as_ref(), project_id, repo_name, &format!("{}/{}", folder, file)).await?;
            if !nodes.iter().any(|n: &NodeDetail| n.full_path == blob.full_path) {
                nodes.push(blob);
            }
        }
        nodes.push(manifest_node);
        Ok(nodes)
    }

    async fn get_authorization_details(&self, ctx: &PushContext, name: &str) -> Result<Option<String>> {
        if let Some(token) = ctx.cluster.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(format!("Bearer {}", token)));
        }

        let cluster = ctx.cluster.name.as_str();
        let ping = self.http.client().get(join_url(&ctx.cluster.url, "v2/"));
        let response = self.http.send(cluster, ping).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match parse_bearer_challenge(&challenge) {
            Some(params) => {
                let token = self.fetch_token(ctx, &params, &Self::remote_repository(ctx, name)).await?;
                Ok(Some(token))
            }
            None => match &ctx.cluster.username {
                Some(user) => Ok(Some(basic_auth(user, ctx.cluster.password.as_deref().unwrap_or_default()))),
                None => Err(ReplicationError::Auth {
                    cluster: cluster.to_string(),
                    message: "registry requires credentials".to_string(),
                }),
            },
        }
    }

    async fn process_to_upload_artifact(
        &self,
        ctx: &PushContext,
        nodes: &[NodeDetail],
        name: &str,
        version: &str,
        token: Option<&str>,
    ) -> Result<bool> {
        let repository = Self::remote_repository(ctx, name);
        let (manifests, blobs): (Vec<&NodeDetail>, Vec<&NodeDetail>) =
            nodes.iter().partition(|n| n.name() == MANIFEST_FILE);

        let mut all_ok = true;
        for blob in blobs {
            if let Err(e) = self.push_blob(ctx, &repository, blob, token).await {
                error!(cluster = %ctx.cluster.name, repository = %repository, blob = %blob.full_path, error = %e, "Blob upload failed");
                all_ok = false;
            }
        }
        if !all_ok {
            // A manifest referencing missing blobs would be rejected anyway.
            return Ok(false);
        }

        for manifest in manifests {
            if let Err(e) = self.push_manifest(ctx, &repository, version, manifest, token).await {
                error!(cluster = %ctx.cluster.name, repository = %repository, tag = %version, error = %e, "Manifest upload failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Compared on the manifest digest the registry reports for the tag.
    async fn remote_state(
        &self,
        ctx: &PushContext,
        package: &PackageCoordinate,
        nodes: &[NodeDetail],
        token: Option<&str>,
    ) -> Result<RemoteState> {
        let Some(manifest) = nodes.iter().find(|n| n.name() == MANIFEST_FILE) else {
            return Ok(RemoteState::Absent);
        };
        let repository = Self::remote_repository(ctx, &package.name);
        let url = join_url(&ctx.cluster.url, &format!("v2/{}/manifests/{}", repository, package.version));
        let request = self.http.client().head(url).header(ACCEPT, DOCKER_MANIFEST_V2);
        self.http
            .remote_state(&ctx.cluster.name, RemoteHttp::authorize(request, token), &manifest.sha256, RemoteState::Different)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;
    use crate::local_data::{sha256_hex, InMemoryDataManager};

    fn client(data: Arc<InMemoryDataManager>) -> OciPushClient {
        OciPushClient::new(
            data,
            RemoteHttp::new(&PushConfig::default()).unwrap(),
            MismatchTable::none(),
        )
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:a:pull""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.example/token");
        assert_eq!(params["service"], "registry.example");
        assert_eq!(params["scope"], "repository:a:pull");

        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge("").is_none());
    }

    #[test]
    fn test_resolve_package() {
        let oci = client(Arc::new(InMemoryDataManager::new()));
        assert_eq!(
            oci.resolve_package("/library/nginx/1.25/manifest.json"),
            Some(PackageCoordinate::new("library/nginx", "1.25"))
        );
        assert_eq!(oci.resolve_package("/nginx/1.25/sha256__abc"), None);
        assert_eq!(oci.resolve_package("/manifest.json"), None);
    }

    #[test]
    fn test_blob_file_name() {
        assert_eq!(blob_file_name("sha256:ab12").as_deref(), Some("sha256__ab12"));
        assert_eq!(blob_file_name("md5:ab12"), None);
    }

    #[tokio::test]
    async fn test_query_lists_blobs_then_manifest() {
        let data = Arc::new(InMemoryDataManager::new());
        let config = b"{\"arch\":\"amd64\"}".to_vec();
        let layer = b"layer-bytes".to_vec();
        let config_digest = format!("sha256:{}", sha256_hex(&config));
        let layer_digest = format!("sha256:{}", sha256_hex(&layer));
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_V2,
            "config": {"digest": config_digest, "size": config.len()},
            "layers": [{"digest": layer_digest, "size": layer.len()}],
        });
        data.put_file("p", "docker", &format!("/nginx/1.25/{}", blob_file_name(&config_digest).unwrap()), config)
            .await;
        data.put_file("p", "docker", &format!("/nginx/1.25/{}", blob_file_name(&layer_digest).unwrap()), layer)
            .await;
        data.put_file("p", "docker", "/nginx/1.25/manifest.json", manifest.to_string()).await;

        let nodes = client(data).query_sync_node_list("nginx", "1.25", "p", "docker").await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].name(), MANIFEST_FILE);
        assert!(nodes[0].name().starts_with(BLOB_PREFIX));
    }

    #[tokio::test]
    async fn test_query_missing_blob() {
        let data = Arc::new(InMemoryDataManager::new());
        let manifest = serde_json::json!({"layers": [{"digest": "sha256:00ff"}]});
        data.put_file("p", "docker", "/app/v1/manifest.json", manifest.to_string()).await;
        let err = client(data).query_sync_node_list("app", "v1", "p", "docker").await.unwrap_err();
        assert!(matches!(err, ReplicationError::NodeNotFound { .. }));
    }
}
