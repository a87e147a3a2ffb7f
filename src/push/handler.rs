//! Shared HTTP plumbing for push clients.
//!
//! [`RemoteHttp::execute`] sends one request and classifies the answer:
//! success, a protocol mismatch (the remote speaks a different upload
//! convention and the caller may fall back), or a final failure.

use super::RemoteState;
use crate::config::{ClusterConfig, PushConfig};
use crate::error::{ReplicationError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

/// Headers a remote may use to report the sha256 of what it stores.
pub const DIGEST_HEADERS: &[&str] = &["X-Checksum-Sha256", "X-BKREPO-SHA256", "Docker-Content-Digest"];

/// `Basic base64(user:password)`.
pub fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Static credentials of a cluster: bearer token first, then basic auth.
pub fn cluster_authorization(cluster: &ClusterConfig) -> Option<String> {
    if let Some(token) = cluster.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(format!("Bearer {}", token));
    }
    match (&cluster.username, &cluster.password) {
        (Some(user), Some(password)) => Some(basic_auth(user, password)),
        (Some(user), None) => Some(basic_auth(user, "")),
        _ => None,
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Status codes meaning "wrong upload convention, try the alternative".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchTable(Vec<u16>);

impl MismatchTable {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self(statuses.into_iter().collect())
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn statuses(&self) -> &[u16] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success(u16),
    ProtocolMismatch(u16),
    Failed { status: u16, body: String },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Success(s) | Self::ProtocolMismatch(s) => *s,
            Self::Failed { status, .. } => *status,
        }
    }

    /// Success becomes `Ok(status)`, anything else a `Remote` error.
    pub fn into_result(self, cluster: &str) -> Result<u16> {
        match self {
            Self::Success(status) => Ok(status),
            Self::ProtocolMismatch(status) => {
                Err(ReplicationError::remote(cluster, status, "upload convention not supported"))
            }
            Self::Failed { status, body } => Err(ReplicationError::remote(cluster, status, body)),
        }
    }
}

/// HTTP client shared by every push client.
#[derive(Clone)]
pub struct RemoteHttp {
    client: Client,
}

impl RemoteHttp {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout_duration())
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| ReplicationError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Attach an Authorization header when a token is present.
    pub fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    /// Send without classifying the status.
    pub async fn send(&self, cluster: &str, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| ReplicationError::http(cluster, e))
    }

    /// HEAD-style request whose answer is compared against `expected_sha256`.
    ///
    /// A remote that has the artifact but reports no digest yields `undigested`.
    pub async fn remote_state(
        &self,
        cluster: &str,
        request: RequestBuilder,
        expected_sha256: &str,
        undigested: RemoteState,
    ) -> Result<RemoteState> {
        let response = self.send(cluster, request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(RemoteState::Absent);
        }
        if !status.is_success() {
            return Err(ReplicationError::remote(cluster, status.as_u16(), "existence check failed"));
        }
        let state = match reported_sha256(response.headers()) {
            Some(remote) if remote.eq_ignore_ascii_case(expected_sha256) => RemoteState::Identical,
            Some(_) => RemoteState::Different,
            None => undigested,
        };
        debug!(url = %response.url(), state = ?state, "Compared remote copy");
        Ok(state)
    }

    /// Send and classify the status against `mismatch`.
    pub async fn execute(
        &self,
        cluster: &str,
        request: RequestBuilder,
        mismatch: &MismatchTable,
    ) -> Result<UploadOutcome> {
        let response = self.send(cluster, request).await?;
        Ok(classify(response, mismatch).await)
    }
}

/// First digest header present, without any `sha256:` prefix.
pub fn reported_sha256(headers: &HeaderMap) -> Option<String> {
    DIGEST_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?.trim();
        let hex = value.strip_prefix("sha256:").unwrap_or(value);
        (!hex.is_empty()).then(|| hex.to_ascii_lowercase())
    })
}

async fn classify(response: Response, mismatch: &MismatchTable) -> UploadOutcome {
    let status = response.status();
    let code = status.as_u16();
    debug!(url = %response.url(), status = code, "Remote answered");
    if status.is_success() {
        return UploadOutcome::Success(code);
    }
    if mismatch.contains(code) {
        return UploadOutcome::ProtocolMismatch(code);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    UploadOutcome::Failed { status: code, body }
}
