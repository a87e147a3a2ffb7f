// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Artifact Replication
//!
//! Most tests run the whole engine in-process: an in-memory operation log,
//! an in-memory data manager and an axum server standing in for the remote
//! cluster. Redis-backed tests use testcontainers and are `#[ignore]`d.
//!
//! # Running Tests
//! ```bash
//! # In-process tests
//! cargo test --test integration
//!
//! # Redis tests (requires Docker)
//! cargo test --test integration redis_ -- --ignored
//! ```
//!
//! # Test Organization
//! - `engine_*` - log entry to remote push, end to end
//! - `proxy_sync_*` - cache walk against a mock gateway
//! - `redis_*` - Redis stream operation log

mod common;

use artifact_replication::config::{ClusterConfig, ProxySyncConfig, PushConfig, TaskStoreConfig};
use artifact_replication::oplog::{LogPosition, OperateType, TailRequest};
use artifact_replication::proxy_sync::marker_path;
use artifact_replication::push::oci::{blob_file_name, DOCKER_MANIFEST_V2};
use artifact_replication::task::{RecordOutcome, ReplicaRecord, ReplicationStatus};
use artifact_replication::{
    InMemoryDataManager, MemoryOperationLog, OperationLog, ProxySyncVisitor, RedisOperationLog,
    ReplicationConfig, ReplicationEngine, RepositoryType, TaskStore,
};
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;

struct Harness {
    engine: ReplicationEngine,
    log: MemoryOperationLog,
    data: Arc<InMemoryDataManager>,
}

impl Harness {
    async fn start(clusters: Vec<ClusterConfig>) -> Self {
        let mut config = ReplicationConfig::for_testing("center");
        config.clusters = clusters;
        let tasks = Arc::new(TaskStore::in_memory().await.unwrap());
        let data = Arc::new(InMemoryDataManager::new());
        Self::start_with(config, tasks, MemoryOperationLog::new(), data).await
    }

    async fn start_with(
        config: ReplicationConfig,
        tasks: Arc<TaskStore>,
        log: MemoryOperationLog,
        data: Arc<InMemoryDataManager>,
    ) -> Self {
        init_tracing();
        let mut engine = ReplicationEngine::new(config, Arc::new(log.clone()), data.clone(), tasks);
        engine.start().await.unwrap();
        Self { engine, log, data }
    }

    async fn append(&self, entry: artifact_replication::OperationLogEntry) -> String {
        self.log.append(&entry).await.unwrap()
    }

    /// Wait until `task_key` has at least `n` records.
    async fn records(&self, task_key: &str, n: usize) -> Vec<ReplicaRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let records = self.engine.tasks().records(task_key).await.unwrap();
            if records.len() >= n {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} records of {}, have {}",
                n,
                task_key,
                records.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn cluster(name: &str, remote: &MockRemote, base: &str) -> ClusterConfig {
    ClusterConfig::for_testing(name, &format!("{}{}", remote.url, base))
}

/// `METHOD path` of every request that writes to the remote.
fn writes(remote: &MockRemote) -> Vec<String> {
    remote
        .request_lines()
        .into_iter()
        .filter(|l| l.starts_with("PUT") || l.starts_with("POST") || l.starts_with("DELETE"))
        .collect()
}

// =============================================================================
// Helm
// =============================================================================

#[tokio::test]
async fn engine_replicates_helm_chart() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "/charts")]).await;
    h.engine
        .tasks()
        .register(task("helm-sync", "p", "charts", RepositoryType::Helm, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "charts", "/mychart-1.0.0.tgz", &b"chart-bytes"[..]).await;

    let id = h.append(node_entry(OperateType::Create, "p", "charts", "/mychart-1.0.0.tgz")).await;
    let records = h.records("helm-sync", 1).await;

    assert_eq!(records[0].outcome, RecordOutcome::Success);
    assert_eq!(records[0].cluster, "edge");
    assert_eq!(records[0].entry_id.as_deref(), Some(id.as_str()));
    assert_eq!(
        remote.stored("/charts/mychart-1.0.0.tgz").as_deref(),
        Some(&b"chart-bytes"[..])
    );
    let put = remote
        .requests()
        .into_iter()
        .find(|r| r.method == "PUT")
        .unwrap();
    assert_eq!(put.content_type.as_deref(), Some("application/octet-stream"));

    let stored_task = h.engine.tasks().get("helm-sync").await.unwrap();
    assert_eq!(stored_task.status, ReplicationStatus::Success);
    assert_eq!(stored_task.execution_times, 1);
    h.engine.shutdown().await;
}

/// Push one chart to a remote whose chart PUT answers `put_status`.
async fn helm_push_against(remote: &MockRemote, put_status: u16) -> (Harness, Vec<ReplicaRecord>) {
    remote.respond_with("PUT", "/charts/mychart-1.0.0.tgz", put_status);
    let h = Harness::start(vec![cluster("edge", remote, "/charts")]).await;
    h.engine
        .tasks()
        .register(task("helm-sync", "p", "charts", RepositoryType::Helm, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "charts", "/mychart-1.0.0.tgz", &b"chart-bytes"[..]).await;
    h.append(node_entry(OperateType::Create, "p", "charts", "/mychart-1.0.0.tgz")).await;
    let records = h.records("helm-sync", 1).await;
    (h, records)
}

#[tokio::test]
async fn engine_helm_falls_back_to_multipart_on_mismatch() {
    let remote = MockRemote::start().await;
    remote.respond_with("PUT", "/charts/mychart-1.0.0.tgz", 404);
    let mut h = Harness::start(vec![
        cluster("edge", &remote, "/charts").with_basic_auth("ci", "secret"),
    ])
    .await;
    h.engine
        .tasks()
        .register(task("helm-sync", "p", "charts", RepositoryType::Helm, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "charts", "/mychart-1.0.0.tgz", &b"chart-bytes"[..]).await;

    h.append(node_entry(OperateType::Create, "p", "charts", "/mychart-1.0.0.tgz")).await;
    let records = h.records("helm-sync", 1).await;
    assert_eq!(records[0].outcome, RecordOutcome::Success);

    let requests = remote.requests();
    let post = requests.iter().find(|r| r.method == "POST").unwrap();
    assert_eq!(post.path, "/charts");
    assert!(post.content_type.as_deref().unwrap().starts_with("multipart/form-data"));
    let body = post.body_text();
    assert!(body.contains("name=\"chart\""));
    assert!(body.contains("filename=\"mychart-1.0.0.tgz\""));
    assert!(body.contains("name=\"force\""));
    assert!(body.contains("chart-bytes"));
    assert!(requests
        .iter()
        .all(|r| r.authorization.as_deref() == Some("Basic Y2k6c2VjcmV0")));
    assert_eq!(
        writes(&remote),
        vec!["PUT /charts/mychart-1.0.0.tgz", "POST /charts"]
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_helm_falls_back_on_method_not_allowed() {
    let remote = MockRemote::start().await;
    let (mut h, records) = helm_push_against(&remote, 405).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RecordOutcome::Success);
    assert_eq!(
        writes(&remote),
        vec!["PUT /charts/mychart-1.0.0.tgz", "POST /charts"]
    );
    let post = remote.requests().into_iter().find(|r| r.method == "POST").unwrap();
    assert!(post.content_type.as_deref().unwrap().starts_with("multipart/form-data"));
    assert!(post.body_text().contains("filename=\"mychart-1.0.0.tgz\""));
    assert_eq!(remote.stored("/charts").as_deref().map(|b| b.is_empty()), Some(false));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_helm_other_failures_are_final() {
    let remote = MockRemote::start().await;
    let (mut h, records) = helm_push_against(&remote, 500).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RecordOutcome::Failed);
    assert!(records[0].message.as_deref().unwrap_or_default().contains("500"));
    assert_eq!(writes(&remote), vec!["PUT /charts/mychart-1.0.0.tgz"]);
    let stored_task = h.engine.tasks().get("helm-sync").await.unwrap();
    assert_eq!(stored_task.status, ReplicationStatus::Failed);
    assert!(h.engine.health_check().await.clusters_failing == 1);
    h.engine.shutdown().await;
}

// =============================================================================
// Generic: event expansion and ordering
// =============================================================================

#[tokio::test]
async fn engine_rename_pushes_new_then_removes_old() {
    let remote = MockRemote::start().await;
    remote.store("/generic/remote-proj/remote-repo/a.txt", &b"old"[..]);
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "files", "/b.txt", &b"new"[..]).await;

    h.append(rename_entry("p", "files", "/a.txt", "/b.txt")).await;
    let records = h.records("files", 2).await;
    assert!(records.iter().all(|r| r.outcome == RecordOutcome::Success));

    let writes: Vec<String> = remote
        .request_lines()
        .into_iter()
        .filter(|l| l.starts_with("PUT") || l.starts_with("DELETE"))
        .collect();
    assert_eq!(
        writes,
        vec![
            "PUT /generic/remote-proj/remote-repo/b.txt",
            "DELETE /generic/remote-proj/remote-repo/a.txt",
        ]
    );
    assert!(remote.stored("/generic/remote-proj/remote-repo/a.txt").is_none());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_move_across_repositories() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "files", "/dir/moved.bin", &b"payload"[..]).await;

    h.append(move_entry("p", "files", "/moved.bin", "/dir/moved.bin")).await;
    let records = h.records("files", 2).await;

    assert_eq!(records[0].action.kind(), "push");
    assert_eq!(records[0].outcome, RecordOutcome::Success);
    // Source never reached the remote
    assert_eq!(records[1].action.kind(), "remove");
    assert_eq!(
        remote.stored("/generic/remote-proj/remote-repo/dir/moved.bin").as_deref(),
        Some(&b"payload"[..])
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_skips_unparseable_entries() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "files", "/ok.txt", &b"ok"[..]).await;

    h.append(artifact_replication::OperationLogEntry::node(
        OperateType::Create,
        json!({ "unexpected": true }),
    ))
    .await;
    h.append(node_entry(OperateType::Create, "p", "files", "/ok.txt")).await;

    let records = h.records("files", 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action.full_path(), "/ok.txt");
    assert!(h.engine.health_check().await.ready);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_keeps_log_order_per_cluster() {
    let remote = MockRemote::start().await;
    remote.set_delay(Duration::from_millis(5));
    let mut h = Harness::start(vec![
        cluster("edge-a", &remote, "/a"),
        cluster("edge-b", &remote, "/b"),
    ])
    .await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge-a", "edge-b"]))
        .await
        .unwrap();

    for i in 0..6 {
        let path = format!("/f{}.txt", i);
        h.data.put_file("p", "files", &path, format!("v{}", i)).await;
        h.append(node_entry(OperateType::Create, "p", "files", &path)).await;
    }
    h.records("files", 12).await;

    for prefix in ["/a", "/b"] {
        let puts: Vec<String> = remote
            .requests()
            .into_iter()
            .filter(|r| r.method == "PUT" && r.path.starts_with(prefix))
            .map(|r| r.path)
            .collect();
        let expected: Vec<String> = (0..6)
            .map(|i| format!("{}/generic/remote-proj/remote-repo/f{}.txt", prefix, i))
            .collect();
        assert_eq!(puts, expected);
    }
    h.engine.shutdown().await;
}

// =============================================================================
// Maven and OCI
// =============================================================================

#[tokio::test]
async fn engine_maven_uploads_pom_last() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "/maven")]).await;
    h.engine
        .tasks()
        .register(task("mvn", "p", "releases", RepositoryType::Maven, &["edge"]))
        .await
        .unwrap();
    let folder = "/com/example/demo/1.0";
    h.data.put_file("p", "releases", &format!("{}/demo-1.0.jar", folder), &b"jar"[..]).await;
    h.data.put_file("p", "releases", &format!("{}/demo-1.0-sources.jar", folder), &b"src"[..]).await;
    h.data.put_file("p", "releases", &format!("{}/demo-1.0.pom", folder), &b"<project/>"[..]).await;

    h.append(node_entry(OperateType::Create, "p", "releases", &format!("{}/demo-1.0.pom", folder))).await;
    let records = h.records("mvn", 1).await;
    assert_eq!(records[0].outcome, RecordOutcome::Success);

    let puts: Vec<String> = remote
        .requests()
        .into_iter()
        .filter(|r| r.method == "PUT")
        .map(|r| r.path)
        .collect();
    assert_eq!(puts.len(), 3);
    assert_eq!(puts.last().unwrap(), "/maven/com/example/demo/1.0/demo-1.0.pom");
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_oci_pushes_blobs_then_manifest() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("images", "p", "docker", RepositoryType::Oci, &["edge"]))
        .await
        .unwrap();

    let config_blob = br#"{"architecture":"amd64"}"#.to_vec();
    let layer = b"layer-bytes".to_vec();
    let config_digest = format!("sha256:{}", artifact_replication::local_data::sha256_hex(&config_blob));
    let layer_digest = format!("sha256:{}", artifact_replication::local_data::sha256_hex(&layer));
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_V2,
        "config": { "mediaType": "application/vnd.docker.container.image.v1+json", "size": config_blob.len(), "digest": config_digest },
        "layers": [{ "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": layer.len(), "digest": layer_digest }],
    });
    let folder = "/nginx/1.25";
    h.data
        .put_file("p", "docker", &format!("{}/{}", folder, blob_file_name(&config_digest).unwrap()), config_blob.clone())
        .await;
    h.data
        .put_file("p", "docker", &format!("{}/{}", folder, blob_file_name(&layer_digest).unwrap()), layer.clone())
        .await;
    h.data
        .put_file("p", "docker", &format!("{}/manifest.json", folder), serde_json::to_vec(&manifest).unwrap())
        .await;

    h.append(node_entry(OperateType::Create, "p", "docker", &format!("{}/manifest.json", folder))).await;
    let records = h.records("images", 1).await;
    assert_eq!(records[0].outcome, RecordOutcome::Success);

    let repo = "/v2/remote-proj/remote-repo/nginx";
    assert_eq!(
        remote.stored(&format!("{}/blobs/{}", repo, layer_digest)).as_deref(),
        Some(layer.as_slice())
    );
    assert!(remote.stored(&format!("{}/blobs/{}", repo, config_digest)).is_some());
    assert!(remote.stored(&format!("{}/manifests/1.25", repo)).is_some());

    let lines = remote.request_lines();
    let manifest_put = lines
        .iter()
        .position(|l| l == &format!("PUT {}/manifests/1.25", repo))
        .unwrap();
    let last_blob_put = lines
        .iter()
        .rposition(|l| l.starts_with("PUT") && l.contains("/blobs/uploads/"))
        .unwrap();
    assert!(last_blob_put < manifest_put);
    h.engine.shutdown().await;
}

// =============================================================================
// Resume
// =============================================================================

#[tokio::test]
async fn engine_resumes_from_checkpoint_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::start().await;
    let log = MemoryOperationLog::new();
    let store_config = TaskStoreConfig {
        sqlite_path: dir.path().join("tasks.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    let mut config = ReplicationConfig::for_testing("center");
    config.clusters = vec![cluster("edge", &remote, "")];
    config.settings.tailer.resume_from_checkpoint = true;

    let data = Arc::new(InMemoryDataManager::new());
    data.put_file("p", "files", "/one.txt", &b"1"[..]).await;
    data.put_file("p", "files", "/two.txt", &b"2"[..]).await;

    let tasks = Arc::new(TaskStore::open(&store_config).await.unwrap());
    let mut first = Harness::start_with(config.clone(), tasks, log.clone(), data.clone()).await;
    first
        .engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    first.append(node_entry(OperateType::Create, "p", "files", "/one.txt")).await;
    first.records("files", 1).await;
    first.engine.shutdown().await;

    // Written while no engine is running
    log.append(&node_entry(OperateType::Create, "p", "files", "/two.txt"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let tasks = Arc::new(TaskStore::open(&store_config).await.unwrap());
    let mut second = Harness::start_with(config, tasks, log, data).await;
    let records = second.records("files", 2).await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].action.full_path(), "/two.txt");
    second.engine.shutdown().await;
}

#[tokio::test]
async fn engine_replays_jobs_cut_off_by_drain_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::start().await;
    remote.set_delay(Duration::from_secs(30));
    let log = MemoryOperationLog::new();
    let store_config = TaskStoreConfig {
        sqlite_path: dir.path().join("tasks.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    let mut config = ReplicationConfig::for_testing("center");
    config.clusters = vec![cluster("edge", &remote, "")];
    config.settings.tailer.resume_from_checkpoint = true;
    config.settings.dispatch.drain_timeout = "200ms".into();

    let data = Arc::new(InMemoryDataManager::new());
    data.put_file("p", "files", "/big", &b"big-payload"[..]).await;

    let tasks = Arc::new(TaskStore::open(&store_config).await.unwrap());
    let mut first = Harness::start_with(config.clone(), tasks, log.clone(), data.clone()).await;
    first
        .engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    first.append(node_entry(OperateType::Create, "p", "files", "/big")).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while remote.requests().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "push never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    first.engine.shutdown().await;
    assert!(first.engine.committed_position().await.is_none());

    // Reopen the same database with a healthy remote
    remote.set_delay(Duration::ZERO);
    let tasks = Arc::new(TaskStore::open(&store_config).await.unwrap());
    assert!(tasks.records("files").await.unwrap().is_empty());
    let mut second = Harness::start_with(config, tasks, log, data).await;
    let records = second.records("files", 1).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RecordOutcome::Success);
    assert_eq!(records[0].action.full_path(), "/big");
    assert_eq!(
        remote.stored("/generic/remote-proj/remote-repo/big").as_deref(),
        Some(&b"big-payload"[..])
    );
    second.engine.shutdown().await;
}

// =============================================================================
// Conflict handling
// =============================================================================

#[tokio::test]
async fn engine_update_replaces_changed_remote_content() {
    let remote = MockRemote::start().await;
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();

    h.data.put_file("p", "files", "/a.txt", &b"v1"[..]).await;
    h.append(node_entry(OperateType::Create, "p", "files", "/a.txt")).await;
    h.records("files", 1).await;

    h.data.put_file("p", "files", "/a.txt", &b"v2"[..]).await;
    h.append(node_entry(OperateType::Update, "p", "files", "/a.txt")).await;
    let records = h.records("files", 2).await;

    assert_eq!(records[0].outcome, RecordOutcome::Success);
    assert_eq!(records[1].outcome, RecordOutcome::Success);
    assert_eq!(
        remote.stored("/generic/remote-proj/remote-repo/a.txt").as_deref(),
        Some(&b"v2"[..])
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn engine_skips_identical_remote_content() {
    let remote = MockRemote::start().await;
    remote.store("/generic/remote-proj/remote-repo/same.txt", &b"same"[..]);
    let mut h = Harness::start(vec![cluster("edge", &remote, "")]).await;
    h.engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    h.data.put_file("p", "files", "/same.txt", &b"same"[..]).await;

    h.append(node_entry(OperateType::Update, "p", "files", "/same.txt")).await;
    let records = h.records("files", 1).await;

    assert_eq!(records[0].outcome, RecordOutcome::Skipped);
    assert!(writes(&remote).is_empty());
    assert_eq!(h.engine.tasks().get("files").await.unwrap().status, ReplicationStatus::Success);
    h.engine.shutdown().await;
}

// =============================================================================
// Proxy cache sync
// =============================================================================

fn proxy_config(remote: &MockRemote) -> ProxySyncConfig {
    ProxySyncConfig {
        enabled: true,
        gateway: remote.url.clone(),
        rate_bytes_per_sec: 0,
        username: Some("proxy".into()),
        password: Some("pw".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn proxy_sync_uploads_marked_files() {
    let remote = MockRemote::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sha = "ab12cd34";
    let keyed = dir.path().join("ab").join(sha);
    let plain = dir.path().join("cd").join("ef56");
    std::fs::create_dir_all(keyed.parent().unwrap()).unwrap();
    std::fs::create_dir_all(plain.parent().unwrap()).unwrap();
    std::fs::write(&keyed, b"cached-blob").unwrap();
    std::fs::write(marker_path(&keyed), b"bucket-7").unwrap();
    std::fs::write(&plain, b"other").unwrap();
    std::fs::write(marker_path(&plain), b"").unwrap();

    let visitor = ProxySyncVisitor::from_config(&proxy_config(&remote), &PushConfig::default()).unwrap();
    let report = visitor.walk(dir.path()).await.unwrap();

    assert_eq!(report.synced, 2);
    assert_eq!(report.sync_failed, 0);
    assert_eq!(report.evicted, 0);
    assert_eq!(report.bytes_uploaded, 16);
    assert!(!marker_path(&keyed).exists());
    assert!(!marker_path(&plain).exists());
    assert!(keyed.exists());

    let uploads = remote.requests();
    assert_eq!(uploads.len(), 2);
    for upload in &uploads {
        assert_eq!(upload.method, "POST");
        assert_eq!(upload.path, "/replication/proxy/replica/blob/push");
        assert_eq!(upload.authorization.as_deref(), Some("Basic cHJveHk6cHc="));
    }
    let keyed_body = uploads
        .iter()
        .map(|u| u.body_text())
        .find(|b| b.contains("cached-blob"))
        .unwrap();
    assert!(keyed_body.contains(&format!("filename=\"{}\"", sha)));
    assert!(keyed_body.contains("name=\"size\"\r\n\r\n11"));
    assert!(keyed_body.contains(&format!("name=\"sha256\"\r\n\r\n{}", sha)));
    assert!(keyed_body.contains("name=\"storageKey\"\r\n\r\nbucket-7"));

    let plain_body = uploads
        .iter()
        .map(|u| u.body_text())
        .find(|b| b.contains("other"))
        .unwrap();
    assert!(!plain_body.contains("storageKey"));
}

#[tokio::test]
async fn proxy_sync_keeps_marker_on_failure() {
    let remote = MockRemote::start().await;
    remote.respond_with("POST", "/replication/proxy/replica/blob/push", 503);
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("deadbeef");
    std::fs::write(&file, b"blob").unwrap();
    std::fs::write(marker_path(&file), b"").unwrap();

    let mut config = proxy_config(&remote);
    config.cache_expire_days = 1;
    let visitor = ProxySyncVisitor::from_config(&config, &PushConfig::default()).unwrap();
    let later = std::time::SystemTime::now() + Duration::from_secs(30 * 24 * 3600);
    let report = visitor.walk_at(dir.path(), later).await.unwrap();

    assert_eq!(report.sync_failed, 1);
    assert_eq!(report.evicted, 0);
    assert!(file.exists());
    assert!(marker_path(&file).exists());
}

#[tokio::test]
async fn proxy_sync_rate_limit_still_delivers() {
    let remote = MockRemote::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("feedface");
    let content = vec![7u8; 4096];
    std::fs::write(&file, &content).unwrap();
    std::fs::write(marker_path(&file), b"").unwrap();

    let mut config = proxy_config(&remote);
    config.rate_bytes_per_sec = 1024;
    let visitor = ProxySyncVisitor::from_config(&config, &PushConfig::default()).unwrap();

    let started = std::time::Instant::now();
    let report = visitor.walk(dir.path()).await.unwrap();
    assert_eq!(report.synced, 1);
    // Burst covers the first second of budget
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(remote.requests()[0].body.windows(4096).filter(|w| *w == content.as_slice()).count(), 1);
}

// =============================================================================
// Redis operation log
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_log_reads_nodes_in_order() {
    let docker = Cli::default();
    let store = TestLogStore::new(&docker, "operation_log");
    let log = RedisOperationLog::new(&store.redis_url, &store.stream_key).unwrap();
    let since = chrono::Utc::now() - chrono::Duration::seconds(1);

    let first = log.append(&node_entry(OperateType::Create, "p", "r", "/a")).await.unwrap();
    store
        .xadd_raw(&[("operate_type", "CREATE"), ("resource_type", "PROJECT"), ("description", "{}")])
        .await
        .unwrap();
    store.xadd_raw(&[("operate_type", "???")]).await.unwrap();
    let third = log.append(&rename_entry("p", "r", "/a", "/b")).await.unwrap();
    assert_eq!(store.stream_len().await.unwrap(), 4);

    let mut cursor = log
        .open_cursor(TailRequest::nodes(LogPosition::Since(since)))
        .await
        .unwrap();
    let batch = cursor.next_batch().await.unwrap();

    let ids: Vec<&str> = batch.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), third.as_str()]);
    assert_eq!(batch[1].description["newFullPath"], "/b");
    log.ping().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_log_resumes_after_position() {
    let docker = Cli::default();
    let store = TestLogStore::new(&docker, "operation_log");
    let log = RedisOperationLog::new(&store.redis_url, &store.stream_key).unwrap();

    let first = log.append(&node_entry(OperateType::Create, "p", "r", "/a")).await.unwrap();
    let second = log.append(&node_entry(OperateType::Delete, "p", "r", "/a")).await.unwrap();

    let mut cursor = log
        .open_cursor(TailRequest::nodes(LogPosition::After(first)))
        .await
        .unwrap();
    let batch = cursor.next_batch().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, second);
    assert_eq!(batch[0].operate_type, OperateType::Delete);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_engine_end_to_end() {
    let docker = Cli::default();
    let store = TestLogStore::new(&docker, "operation_log");
    let remote = MockRemote::start().await;

    let mut config = ReplicationConfig::for_testing("center");
    config.settings.tailer.redis_url = store.redis_url.clone();
    config.clusters = vec![cluster("edge", &remote, "")];
    let data = Arc::new(InMemoryDataManager::new());
    data.put_file("p", "files", "/doc.txt", &b"doc"[..]).await;

    let mut engine = ReplicationEngine::connect(config, data).await.unwrap();
    engine
        .tasks()
        .register(task("files", "p", "files", RepositoryType::Generic, &["edge"]))
        .await
        .unwrap();
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let writer = RedisOperationLog::new(&store.redis_url, &store.stream_key).unwrap();
    writer
        .append(&node_entry(OperateType::Create, "p", "files", "/doc.txt"))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while remote.stored("/generic/remote-proj/remote-repo/doc.txt").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "push never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    engine.shutdown().await;
}
