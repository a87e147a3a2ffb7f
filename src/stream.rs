// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stream backend for the operation log.
//!
//! The log lives in a single stream (default key `operation_log`). Each entry
//! carries these fields:
//!
//! | Field | Encoding |
//! |-------|----------|
//! | `operate_type` | `CREATE`, `UPDATE`, `RENAME`, `COPY`, `MOVE`, `DELETE` |
//! | `resource_type` | `NODE`, `REPOSITORY`, ... |
//! | `description` | JSON object |
//! | `created_date` | milliseconds since epoch |
//! | `user_id` | optional |
//!
//! # Stream Trimming
//!
//! Appends use `XADD MAXLEN ~ n` when a cap is configured, like a capped
//! collection. A cursor that falls behind the trimmed head silently skips
//! the lost entries; [`RedisOperationLog::oldest_id`] lets callers detect it.

use crate::error::{ReplicationError, Result};
use crate::oplog::{
    datetime_from_millis, LogCursor, LogPosition, OperateType, OperationLog, OperationLogEntry,
    ResourceType, TailRequest,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

/// Operation log stored in a Redis stream.
pub struct RedisOperationLog {
    client: redis::Client,
    stream_key: String,
    max_len: Option<usize>,
    connection_timeout: Duration,
    /// Shared connection for appends and pings; cursors get their own.
    shared: OnceCell<ConnectionManager>,
}

impl RedisOperationLog {
    /// Create a log handle. No connection is made until first use.
    pub fn new(redis_url: &str, stream_key: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ReplicationError::Config(format!("invalid redis url '{}': {}", redis_url, e)))?;
        Ok(Self {
            client,
            stream_key: stream_key.to_string(),
            max_len: None,
            connection_timeout: Duration::from_secs(10),
            shared: OnceCell::new(),
        })
    }

    /// Build from tailer configuration.
    pub fn from_config(config: &crate::config::TailerConfig) -> Result<Self> {
        let mut log = Self::new(&config.redis_url, &config.stream_key)?;
        log.max_len = config.max_len;
        Ok(log)
    }

    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connect(&self) -> Result<ConnectionManager> {
        match tokio::time::timeout(self.connection_timeout, ConnectionManager::new(self.client.clone())).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(ReplicationError::redis("CONNECT", e)),
            Err(_) => Err(ReplicationError::redis_msg(
                "CONNECT",
                format!("timed out after {:?}", self.connection_timeout),
            )),
        }
    }

    async fn shared_connection(&self) -> Result<ConnectionManager> {
        self.shared
            .get_or_try_init(|| self.connect())
            .await
            .cloned()
    }

    /// Oldest entry id still in the stream.
    pub async fn oldest_id(&self) -> Result<Option<String>> {
        let mut conn = self.shared_connection().await?;
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XRANGE", e))?;

        Ok(result.first().map(|(id, _)| id.clone()))
    }

    /// Number of entries in the stream (0 if it does not exist).
    pub async fn len(&self) -> Result<u64> {
        let mut conn = self.shared_connection().await?;
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XLEN", e))?;
        Ok(len)
    }
}

#[async_trait]
impl OperationLog for RedisOperationLog {
    fn name(&self) -> &str {
        &self.stream_key
    }

    async fn open_cursor(&self, request: TailRequest) -> Result<Box<dyn LogCursor>> {
        let mut conn = self.connect().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("PING", e))?;

        let last_id = start_id(&request.position);
        debug!(stream = %self.stream_key, position = %request.position, start_id = %last_id, "Registered log cursor");

        Ok(Box::new(RedisCursor {
            conn,
            stream_key: self.stream_key.clone(),
            last_id,
            request,
        }))
    }

    async fn append(&self, entry: &OperationLogEntry) -> Result<String> {
        let mut conn = self.shared_connection().await?;
        let description = serde_json::to_string(&entry.description)
            .map_err(|e| ReplicationError::Internal(format!("description encode: {}", e)))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("operate_type")
            .arg(entry.operate_type.as_str())
            .arg("resource_type")
            .arg(entry.resource_type.as_str())
            .arg("description")
            .arg(description)
            .arg("created_date")
            .arg(entry.created_date.timestamp_millis());
        if let Some(user_id) = &entry.user_id {
            cmd.arg("user_id").arg(user_id);
        }

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XADD", e))?;
        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.shared_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("PING", e))?;
        Ok(())
    }
}

/// XREAD id that yields the first entry at `position`.
///
/// `Since(t)` starts just below the first id Redis could assign at `t`;
/// `created_date` is still checked client-side because ids carry server time.
pub fn start_id(position: &LogPosition) -> String {
    match position {
        LogPosition::After(id) => id.clone(),
        LogPosition::Since(ts) => {
            let ms = ts.timestamp_millis();
            if ms <= 0 {
                "0-0".to_string()
            } else {
                format!("{}-{}", ms - 1, u64::MAX)
            }
        }
    }
}

struct RedisCursor {
    conn: ConnectionManager,
    stream_key: String,
    last_id: String,
    request: TailRequest,
}

#[async_trait]
impl LogCursor for RedisCursor {
    async fn next_batch(&mut self) -> Result<Vec<OperationLogEntry>> {
        let opts = StreamReadOptions::default()
            .block(self.request.block_timeout.as_millis() as usize)
            .count(self.request.batch_size.max(1));

        // XREAD BLOCK timeout COUNT batch STREAMS key last_id
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[&self.last_id], &opts)
            .await
            .map_err(|e| ReplicationError::redis("XREAD", e))?;

        let mut entries = Vec::new();
        let mut scanned = 0usize;

        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                scanned += 1;
                self.last_id = entry.id.clone();
                match parse_entry(&entry.id, &entry.map) {
                    Ok(parsed) => {
                        if self.request.accepts(&parsed) {
                            trace!(
                                stream_id = %parsed.id,
                                op = %parsed.operate_type,
                                "Parsed log entry"
                            );
                            entries.push(parsed);
                        } else {
                            crate::metrics::record_log_entry_skipped("filtered");
                        }
                    }
                    Err(e) => {
                        warn!(
                            stream_id = %entry.id,
                            error = %e,
                            "Failed to parse stream entry, skipping"
                        );
                        crate::metrics::record_log_entry_skipped("unparseable");
                    }
                }
            }
        }

        // After the first read the cursor is purely id-based.
        if scanned > 0 {
            self.request.position = LogPosition::After(self.last_id.clone());
        }

        Ok(entries)
    }
}

/// Parse one stream entry into an [`OperationLogEntry`].
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<OperationLogEntry> {
    let op_str = get_string_field(fields, "operate_type")?;
    let operate_type = OperateType::parse(&op_str)
        .ok_or_else(|| ReplicationError::LogParse(format!("Unknown operate_type: {}", op_str)))?;

    let resource_str = get_string_field(fields, "resource_type")?;
    let resource_type = ResourceType::parse(&resource_str)
        .ok_or_else(|| ReplicationError::LogParse(format!("Unknown resource_type: {}", resource_str)))?;

    let description = match fields.get("description") {
        None => serde_json::Value::Null,
        Some(_) => {
            let raw = get_bytes_field(fields, "description")?;
            serde_json::from_slice(&raw)
                .map_err(|e| ReplicationError::LogParse(format!("Invalid description JSON: {}", e)))?
        }
    };

    let created_ms = match get_string_field(fields, "created_date") {
        Ok(s) => s
            .parse::<i64>()
            .map_err(|_| ReplicationError::LogParse(format!("Invalid created_date: {}", s)))?,
        // Fall back to the id's server timestamp
        Err(_) => parse_stream_id_timestamp(stream_id)
            .map(|ms| ms as i64)
            .ok_or_else(|| ReplicationError::LogParse(format!("No created_date for {}", stream_id)))?,
    };

    Ok(OperationLogEntry {
        id: stream_id.to_string(),
        operate_type,
        resource_type,
        description,
        created_date: datetime_from_millis(created_ms),
        user_id: get_string_field(fields, "user_id").ok(),
    })
}

/// Extract a string field from Redis hash.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| ReplicationError::LogParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| ReplicationError::LogParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        redis::Value::Int(i) => Ok(i.to_string()),
        _ => Err(ReplicationError::LogParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from Redis hash.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| ReplicationError::LogParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(ReplicationError::LogParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Compare two Redis stream IDs.
///
/// Stream IDs are formatted as `{timestamp}-{sequence}` (e.g., "1234567890123-0").
/// This function compares them numerically, not lexicographically.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            // Special cases like "0" (start) or malformed IDs
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    let (a_ts, a_seq) = parse(a);
    let (b_ts, b_seq) = parse(b);

    match a_ts.cmp(&b_ts) {
        Ordering::Equal => a_seq.cmp(&b_seq),
        other => other,
    }
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Time lag in milliseconds between a committed id and "now".
pub fn lag_ms_since(stream_id: &str, now_ms: u64) -> Option<u64> {
    let ts = parse_stream_id_timestamp(stream_id)?;
    Some(now_ms.saturating_sub(ts))
}
