//! Durable room storage: hour-bucketed message history and usage counters.
//!
//! Each room journals the application messages it routes into hour-keyed
//! buckets and counts them into per-day usage counters. The [`RoomStore`]
//! trait is the seam between the routing engine and the backend: Redis in
//! deployment, in-memory for tests and single-process runs.
//!
//! Bucket semantics:
//! - Logs are prepended (newest first) and each bucket is trimmed to
//!   [`MAX_LOGS_PER_HOUR`] entries; the 1001st insert evicts the oldest.
//! - Buckets expire [`LOG_RETENTION_HOURS`] after creation; compaction runs
//!   on the room's idle alarm.
//! - A log's bucket key and its timestamp are derived from the same instant,
//!   so they can never disagree.

pub mod error;
pub mod memory;
pub mod redis_client;

use async_trait::async_trait;
use common::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use redis_client::RedisStore;

/// Maximum log entries retained per hourly bucket.
pub const MAX_LOGS_PER_HOUR: usize = 1000;

/// Hours a bucket is retained before compaction deletes it.
pub const LOG_RETENTION_HOURS: u32 = 24;

/// Maximum per-day entries in a usage report, newest first.
pub const MAX_USAGE_DAYS: usize = 30;

/// Direction of a journaled message relative to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One journaled message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredLog {
    pub id: String,
    pub timestamp: i64,
    pub message_type: String,
    pub direction: Direction,
    /// The full envelope as it arrived on the wire.
    pub envelope: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_role: Option<Role>,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_client_id: Option<String>,
}

/// An hour-keyed bucket of logs, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBucket {
    pub hour_key: String,
    pub logs: Vec<StoredLog>,
    pub created_at: i64,
}

impl LogBucket {
    pub fn new(hour_key: String, created_at: i64) -> Self {
        Self {
            hour_key,
            logs: Vec::new(),
            created_at,
        }
    }

    /// Prepend a log and trim to the newest [`MAX_LOGS_PER_HOUR`] entries.
    pub fn push_front(&mut self, log: StoredLog) {
        self.logs.insert(0, log);
        self.logs.truncate(MAX_LOGS_PER_HOUR);
    }
}

/// One day of usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: String,
    pub count: u64,
}

/// Per-project usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub project_id: String,
    pub total_requests: u64,
    /// Newest first, capped at [`MAX_USAGE_DAYS`] entries.
    pub daily_requests: Vec<DailyUsage>,
}

/// Durable store consumed by a room.
///
/// All writes are best-effort from the room's point of view: the routing
/// engine logs failures and carries on, so implementations must report
/// errors rather than panic.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Append one log to the bucket derived from its timestamp.
    async fn append_log(&self, project_id: &str, log: StoredLog) -> Result<()>;

    /// Logs from the last `hours` hourly buckets, newest first, at most
    /// `limit` entries. Entries older than the window are dropped even when
    /// their bucket still exists.
    async fn recent_logs(&self, project_id: &str, hours: u32, limit: usize)
        -> Result<Vec<StoredLog>>;

    /// Delete buckets created more than `retention_hours` ago. Returns the
    /// number of buckets removed.
    async fn compact_logs(&self, project_id: &str, retention_hours: u32) -> Result<usize>;

    /// Count one inbound application message at `ts_millis`.
    async fn record_usage(&self, project_id: &str, ts_millis: i64) -> Result<()>;

    /// The project's usage totals.
    async fn usage_report(&self, project_id: &str) -> Result<UsageReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_log(ts: i64) -> StoredLog {
        StoredLog {
            id: "log-1".to_string(),
            timestamp: ts,
            message_type: "ping".to_string(),
            direction: Direction::Incoming,
            envelope: json!({"type": "ping", "timestamp": ts}),
            client_id: Some("c1".to_string()),
            client_role: Some(Role::Agent),
            project_id: "P".to_string(),
            from_client_id: None,
        }
    }

    #[test]
    fn test_stored_log_wire_shape() {
        let value = serde_json::to_value(sample_log(1000)).unwrap();
        assert_eq!(value["messageType"], "ping");
        assert_eq!(value["direction"], "incoming");
        assert_eq!(value["clientRole"], "agent");
        assert_eq!(value["projectId"], "P");
        assert!(value.get("fromClientId").is_none());
    }

    #[test]
    fn test_bucket_trims_to_cap() {
        let mut bucket = LogBucket::new("2024-01-15-10".to_string(), 0);
        for i in 0..(MAX_LOGS_PER_HOUR as i64 + 1) {
            bucket.push_front(sample_log(i));
        }
        assert_eq!(bucket.logs.len(), MAX_LOGS_PER_HOUR);
        // Newest first; the very first insert (ts 0) was evicted.
        assert_eq!(bucket.logs[0].timestamp, MAX_LOGS_PER_HOUR as i64);
        assert_eq!(bucket.logs.last().unwrap().timestamp, 1);
    }
}
