//! Edge cache synchronizer.
//!
//! Proxy nodes cache artifact files under a local tree. A file that has not
//! reached the upstream gateway yet carries a sidecar marker
//! (`<sha256>.sync`); the marker's content, when present, is the storage
//! key the gateway should file the blob under.
//!
//! Each walk:
//! - uploads every marked file to `{gateway}/replication/proxy/replica/blob/push`
//!   and deletes the marker once the gateway answers 2xx
//! - collects unmarked files whose last access is older than the expiry
//!   window and deletes them after the walk
//!
//! A file whose marker is still present is never deleted.

use crate::config::{ProxySyncConfig, PushConfig};
use crate::error::{ReplicationError, Result};
use crate::local_data::{ByteStream, DEFAULT_CHUNK_SIZE};
use crate::metrics;
use crate::push::handler::{basic_auth, join_url};
use crate::push::{MismatchTable, RemoteHttp};
use crate::resilience::ByteRateLimiter;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

/// Suffix of marker files.
pub const MARKER_SUFFIX: &str = ".sync";

/// Gateway endpoint receiving cached blobs.
pub const PUSH_PATH: &str = "/replication/proxy/replica/blob/push";

/// Outcome of one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Regular files seen, markers included.
    pub visited: usize,
    pub synced: usize,
    pub sync_failed: usize,
    pub evicted: usize,
    pub bytes_uploaded: u64,
}

/// What the walk does with one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitDecision {
    /// `marker` is pending; upload `file`.
    Sync { marker: PathBuf, file: PathBuf },
    /// Unmarked and expired.
    Evict,
    Keep,
}

/// Marker path for a cached file.
pub fn marker_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(MARKER_SUFFIX);
    PathBuf::from(name)
}

fn is_marker(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(MARKER_SUFFIX))
        .unwrap_or(false)
}

/// Whether a file last accessed at `accessed` has outlived `window` at `now`.
///
/// Access times in the future are never expired.
pub fn is_expired(accessed: SystemTime, now: SystemTime, window: Duration) -> bool {
    now.duration_since(accessed)
        .map(|age| age > window)
        .unwrap_or(false)
}

/// Storage key carried by a marker; an empty marker has none.
pub async fn storage_key(marker: &Path) -> Result<Option<String>> {
    let content = tokio::fs::read_to_string(marker).await?;
    Ok((!content.is_empty()).then_some(content))
}

/// Walks a cache tree, pushing marked files and evicting stale ones.
pub struct ProxySyncVisitor {
    http: RemoteHttp,
    gateway: String,
    limiter: Option<Arc<ByteRateLimiter>>,
    /// `None` disables eviction.
    expire_after: Option<Duration>,
    authorization: Option<String>,
}

impl ProxySyncVisitor {
    pub fn new(config: &ProxySyncConfig, http: RemoteHttp) -> Self {
        let authorization = config
            .username
            .as_deref()
            .map(|user| basic_auth(user, config.password.as_deref().unwrap_or_default()));
        Self {
            http,
            gateway: config.gateway.clone(),
            limiter: ByteRateLimiter::new(config.rate_bytes_per_sec).map(Arc::new),
            expire_after: (config.cache_expire_days > 0).then(|| config.cache_expire_duration()),
            authorization,
        }
    }

    /// Build with an HTTP client using the push timeouts.
    pub fn from_config(config: &ProxySyncConfig, push: &PushConfig) -> Result<Self> {
        Ok(Self::new(config, RemoteHttp::new(push)?))
    }

    pub fn push_url(&self) -> String {
        join_url(&self.gateway, PUSH_PATH)
    }

    /// Walk `root` once.
    pub async fn walk(&self, root: &Path) -> Result<SyncReport> {
        self.walk_at(root, SystemTime::now()).await
    }

    /// Walk `root` judging expiry against `now`.
    pub async fn walk_at(&self, root: &Path, now: SystemTime) -> Result<SyncReport> {
        let timer = Instant::now();
        if !tokio::fs::metadata(root).await?.is_dir() {
            return Err(ReplicationError::Config(format!(
                "cache root {} is not a directory",
                root.display()
            )));
        }

        let mut report = SyncReport::default();
        let mut synced_files = HashSet::new();
        let mut evictions = Vec::new();
        let mut dirs = vec![root.to_path_buf()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to read cache directory");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Failed to list cache directory");
                        break;
                    }
                };
                let path = entry.path();
                match entry.file_type().await {
                    Ok(t) if t.is_dir() => {
                        dirs.push(path);
                        continue;
                    }
                    Ok(t) if t.is_file() => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat cache entry");
                        continue;
                    }
                }

                report.visited += 1;
                match self.classify(&path, now).await {
                    Ok(VisitDecision::Sync { marker, file }) => match self.sync_file(&marker, &file).await {
                        Ok(bytes) => {
                            report.synced += 1;
                            report.bytes_uploaded += bytes;
                            synced_files.insert(file);
                        }
                        Err(e) => {
                            error!(file = %file.display(), error = %e, "Cache sync failed");
                            metrics::record_cache_sync(false, 0);
                            report.sync_failed += 1;
                        }
                    },
                    Ok(VisitDecision::Evict) => evictions.push(path),
                    Ok(VisitDecision::Keep) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to inspect cached file"),
                }
            }
        }

        for path in evictions {
            // Uploaded in this walk, or marked since it was visited
            if synced_files.contains(&path) || tokio::fs::try_exists(marker_path(&path)).await.unwrap_or(true) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Evicted expired cache file");
                    report.evicted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to evict cache file"),
            }
        }

        metrics::record_cache_evicted(report.evicted);
        metrics::record_cache_walk(report.visited, timer.elapsed());
        info!(
            root = %root.display(),
            visited = report.visited,
            synced = report.synced,
            failed = report.sync_failed,
            evicted = report.evicted,
            "Cache walk finished"
        );
        Ok(report)
    }

    /// Decide what to do with one regular file.
    pub async fn classify(&self, path: &Path, now: SystemTime) -> Result<VisitDecision> {
        if is_marker(path) {
            let name = path.as_os_str().to_string_lossy();
            let file = PathBuf::from(name.trim_end_matches(MARKER_SUFFIX));
            return Ok(VisitDecision::Sync {
                marker: path.to_path_buf(),
                file,
            });
        }
        if tokio::fs::try_exists(marker_path(path)).await? {
            return Ok(VisitDecision::Keep);
        }
        let Some(window) = self.expire_after else {
            return Ok(VisitDecision::Keep);
        };
        let metadata = tokio::fs::metadata(path).await?;
        // Filesystems without atime report mtime instead
        let accessed = metadata.accessed().or_else(|_| metadata.modified())?;
        if is_expired(accessed, now, window) {
            Ok(VisitDecision::Evict)
        } else {
            Ok(VisitDecision::Keep)
        }
    }

    /// Upload `file` and delete `marker` on success. Returns bytes sent.
    pub async fn sync_file(&self, marker: &Path, file: &Path) -> Result<u64> {
        let sha256 = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ReplicationError::Internal(format!("no file name in {}", file.display())))?;
        let size = tokio::fs::metadata(file).await?.len();
        let storage_key = storage_key(marker).await?;
        info!(file = %file.display(), size, "Syncing cached file");

        let handle = tokio::fs::File::open(file).await?;
        let part = Part::stream_with_length(Body::wrap_stream(self.file_stream(handle)), size)
            .file_name(sha256.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| ReplicationError::http(&self.gateway, e))?;
        let mut form = Form::new()
            .part("file", part)
            .text("size", size.to_string())
            .text("sha256", sha256);
        if let Some(key) = storage_key {
            form = form.text("storageKey", key);
        }

        let request = RemoteHttp::authorize(
            self.http.client().post(self.push_url()).multipart(form),
            self.authorization.as_deref(),
        );
        self.http
            .execute(&self.gateway, request, &MismatchTable::none())
            .await?
            .into_result(&self.gateway)?;

        tokio::fs::remove_file(marker).await?;
        metrics::record_cache_sync(true, size);
        info!(file = %file.display(), "Cached file synced");
        Ok(size)
    }

    /// Read `file` in chunks, paced by the rate limiter when one is set.
    fn file_stream(&self, file: tokio::fs::File) -> ByteStream {
        let limiter = self.limiter.clone();
        let chunk = limiter
            .as_ref()
            .map(|l| l.max_chunk().min(DEFAULT_CHUNK_SIZE))
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .max(1);
        Box::pin(futures::stream::try_unfold((file, limiter), move |(mut file, limiter)| async move {
            let mut buf = vec![0u8; chunk];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            if let Some(limiter) = &limiter {
                limiter.acquire_bytes(n).await;
            }
            Ok(Some((Bytes::from(buf), (file, limiter))))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn visitor(expire_days: u32) -> ProxySyncVisitor {
        let config = ProxySyncConfig {
            enabled: true,
            gateway: "http://127.0.0.1:9".into(),
            cache_expire_days: expire_days,
            ..Default::default()
        };
        ProxySyncVisitor::from_config(&config, &PushConfig::default()).unwrap()
    }

    #[test]
    fn test_marker_path_and_push_url() {
        assert_eq!(marker_path(Path::new("/c/ab/abcd")), PathBuf::from("/c/ab/abcd.sync"));
        assert!(is_marker(Path::new("/c/abcd.sync")));
        assert!(!is_marker(Path::new("/c/abcd")));
        assert_eq!(
            visitor(7).push_url(),
            "http://127.0.0.1:9/replication/proxy/replica/blob/push"
        );
    }

    #[test]
    fn test_is_expired() {
        let now = SystemTime::now();
        assert!(is_expired(now - 8 * DAY, now, 7 * DAY));
        assert!(!is_expired(now - 6 * DAY, now, 7 * DAY));
        assert!(!is_expired(now + DAY, now, 7 * DAY));
    }

    #[tokio::test]
    async fn test_storage_key_verbatim_or_none() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("a.sync");
        let keyed = dir.path().join("b.sync");
        std::fs::write(&empty, "").unwrap();
        std::fs::write(&keyed, "bucket-1\n").unwrap();
        assert_eq!(storage_key(&empty).await.unwrap(), None);
        assert_eq!(storage_key(&keyed).await.unwrap().as_deref(), Some("bucket-1\n"));
    }

    #[tokio::test]
    async fn test_classify() {
        let dir = tempdir().unwrap();
        let marked = dir.path().join("aaaa");
        let unmarked = dir.path().join("bbbb");
        std::fs::write(&marked, b"x").unwrap();
        std::fs::write(marker_path(&marked), b"").unwrap();
        std::fs::write(&unmarked, b"y").unwrap();

        let v = visitor(7);
        let later = SystemTime::now() + 30 * DAY;

        assert_eq!(
            v.classify(&marker_path(&marked), later).await.unwrap(),
            VisitDecision::Sync {
                marker: marker_path(&marked),
                file: marked.clone()
            }
        );
        assert_eq!(v.classify(&marked, later).await.unwrap(), VisitDecision::Keep);
        assert_eq!(v.classify(&unmarked, later).await.unwrap(), VisitDecision::Evict);
        assert_eq!(v.classify(&unmarked, SystemTime::now()).await.unwrap(), VisitDecision::Keep);
        assert_eq!(visitor(0).classify(&unmarked, later).await.unwrap(), VisitDecision::Keep);
    }

    #[tokio::test]
    async fn test_walk_evicts_after_walk_and_keeps_pending() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("ab").join("cd");
        std::fs::create_dir_all(&nested).unwrap();
        let stale = nested.join("stale");
        let pending = nested.join("pending");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&pending, b"new").unwrap();
        std::fs::write(marker_path(&pending), b"").unwrap();

        // Gateway is unreachable, so the pending upload fails
        let report = visitor(7)
            .walk_at(dir.path(), SystemTime::now() + 30 * DAY)
            .await
            .unwrap();

        assert_eq!(report.visited, 3);
        assert_eq!(report.sync_failed, 1);
        assert_eq!(report.evicted, 1);
        assert!(!stale.exists());
        assert!(pending.exists());
        assert!(marker_path(&pending).exists());
    }

    #[tokio::test]
    async fn test_walk_missing_root() {
        let dir = tempdir().unwrap();
        let result = visitor(7).walk(&dir.path().join("absent")).await;
        assert!(matches!(result, Err(ReplicationError::Storage(_))));
    }
}
