//! Metric accounting tests.
//!
//! Installs a `DebuggingRecorder` as the global recorder for this test
//! binary and checks counters against what actually flowed through the
//! tailer. Counters are cumulative across tests, so each test compares
//! deltas while holding `SERIAL`.
//!
//! Run with: cargo test --test metrics_tests
//! Redis variant (requires Docker): cargo test --test metrics_tests -- --ignored

mod common;

use artifact_replication::config::TailerConfig;
use artifact_replication::oplog::OperateType;
use artifact_replication::{ChangeLogTailer, MemoryOperationLog, OperationLog, OperationLogEntry, RedisOperationLog};
use common::*;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use testcontainers::clients::Cli;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

const ENTRIES_READ: &str = "artifact_replication_log_entries_read_total";

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
static SERIAL: OnceLock<Mutex<()>> = OnceLock::new();

fn serial() -> &'static Mutex<()> {
    SERIAL.get_or_init(|| Mutex::new(()))
}

fn snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        assert!(
            metrics::set_global_recorder(recorder).is_ok(),
            "another recorder is installed"
        );
        snapshotter
    })
}

/// Sum of a counter across all label sets.
fn counter(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => v,
            _ => 0,
        })
        .sum()
}

/// Tail `log` until `n` entries arrive, then stop.
async fn tail(log: Arc<dyn OperationLog>, n: usize) -> Vec<OperationLogEntry> {
    let mut tailer = ChangeLogTailer::new(log, TailerConfig::for_testing());
    let (tx, mut rx) = mpsc::channel(64);
    tailer.start(tx).await.unwrap();
    let mut got = Vec::with_capacity(n);
    while got.len() < n {
        let entry = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for entries")
            .expect("tailer closed the channel");
        got.push(entry);
    }
    tailer.stop().await;
    got
}

#[tokio::test]
async fn entries_read_counted_once_per_entry() {
    let _serial = serial().lock().await;
    init_tracing();
    let before = counter(ENTRIES_READ);

    let log = MemoryOperationLog::new();
    let consumer = {
        let log: Arc<dyn OperationLog> = Arc::new(log.clone());
        tokio::spawn(tail(log, 7))
    };
    // Let the tailer open its cursor before appending
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..7 {
        log.append(&node_entry(OperateType::Create, "p", "r", &format!("/f{}", i)))
            .await
            .unwrap();
    }
    assert_eq!(consumer.await.unwrap().len(), 7);

    assert_eq!(counter(ENTRIES_READ) - before, 7);
}

#[tokio::test]
#[ignore]
async fn redis_entries_read_counted_once_per_entry() {
    let _serial = serial().lock().await;
    init_tracing();
    let docker = Cli::default();
    let store = TestLogStore::new(&docker, "operation_log");
    let log = RedisOperationLog::new(&store.redis_url, &store.stream_key).unwrap();
    let before = counter(ENTRIES_READ);

    let consumer = {
        let reader = RedisOperationLog::new(&store.redis_url, &store.stream_key).unwrap();
        tokio::spawn(tail(Arc::new(reader), 5))
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 0..5 {
        log.append(&node_entry(OperateType::Update, "p", "r", &format!("/f{}", i)))
            .await
            .unwrap();
    }
    assert_eq!(consumer.await.unwrap().len(), 5);

    assert_eq!(counter(ENTRIES_READ) - before, 5);
}
