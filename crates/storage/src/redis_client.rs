//! Redis room store.
//!
//! Bucket values are JSON [`LogBucket`]s under `logs:{project}:{hourKey}`;
//! the per-room key namespace is realized as the project prefix on a shared
//! server. Read-modify-write on a bucket is safe because the owning room is
//! the single writer for its project. Usage counters are plain `INCR` keys
//! in the `usage:project:` layout.

use crate::error::Result;
use crate::{DailyUsage, LogBucket, StoredLog, UsageReport, MAX_USAGE_DAYS};
use async_trait::async_trait;
use common::{day_key, hour_key, now_millis, recent_hour_keys};
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::debug;

/// Key prefix for log buckets: `logs:{project}:{hourKey}`.
pub const LOG_KEY_PREFIX: &str = "logs:";

/// Key prefix for usage counters: `usage:project:{id}:...`.
pub const USAGE_KEY_PREFIX: &str = "usage:project:";

fn bucket_key(project_id: &str, hour: &str) -> String {
    format!("{}{}:{}", LOG_KEY_PREFIX, project_id, hour)
}

fn usage_total_key(project_id: &str) -> String {
    format!("{}{}:total", USAGE_KEY_PREFIX, project_id)
}

fn usage_day_key(project_id: &str, day: &str) -> String {
    format!("{}{}:day:{}", USAGE_KEY_PREFIX, project_id, day)
}

/// Redis-backed [`crate::RoomStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    async fn load_bucket(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
    ) -> Result<Option<LogBucket>> {
        let json: Option<String> = conn.get(key).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl crate::RoomStore for RedisStore {
    async fn append_log(&self, project_id: &str, log: StoredLog) -> Result<()> {
        let hour = hour_key(log.timestamp);
        let key = bucket_key(project_id, &hour);
        let mut conn = self.get_connection().await?;

        let mut bucket = self
            .load_bucket(&mut conn, &key)
            .await?
            .unwrap_or_else(|| LogBucket::new(hour, log.timestamp));
        bucket.push_front(log);

        let json = serde_json::to_string(&bucket)?;
        conn.set::<_, _, ()>(&key, &json).await?;
        Ok(())
    }

    async fn recent_logs(
        &self,
        project_id: &str,
        hours: u32,
        limit: usize,
    ) -> Result<Vec<StoredLog>> {
        let now = now_millis();
        let cutoff = now - hours as i64 * 3_600_000;
        let mut conn = self.get_connection().await?;

        let mut logs: Vec<StoredLog> = Vec::new();
        for hour in recent_hour_keys(now, hours) {
            let key = bucket_key(project_id, &hour);
            if let Some(bucket) = self.load_bucket(&mut conn, &key).await? {
                logs.extend(bucket.logs.into_iter().filter(|l| l.timestamp >= cutoff));
            }
        }
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn compact_logs(&self, project_id: &str, retention_hours: u32) -> Result<usize> {
        let cutoff = now_millis() - retention_hours as i64 * 3_600_000;
        let mut conn = self.get_connection().await?;

        let pattern = format!("{}{}:*", LOG_KEY_PREFIX, project_id);
        let keys: Vec<String> = conn.keys(&pattern).await?;

        let mut removed = 0;
        for key in keys {
            let Some(bucket) = self.load_bucket(&mut conn, &key).await? else {
                continue;
            };
            if bucket.created_at < cutoff {
                conn.del::<_, ()>(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Compacted {} expired log buckets for {}", removed, project_id);
        }
        Ok(removed)
    }

    async fn record_usage(&self, project_id: &str, ts_millis: i64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.incr::<_, _, i64>(usage_total_key(project_id), 1).await?;
        conn.incr::<_, _, i64>(usage_day_key(project_id, &day_key(ts_millis)), 1)
            .await?;
        Ok(())
    }

    async fn usage_report(&self, project_id: &str) -> Result<UsageReport> {
        let mut conn = self.get_connection().await?;

        let total: Option<u64> = conn.get(usage_total_key(project_id)).await?;

        let day_prefix = format!("{}{}:day:", USAGE_KEY_PREFIX, project_id);
        let mut day_keys: Vec<String> = conn.keys(format!("{}*", day_prefix)).await?;
        // ISO day suffixes sort lexicographically; newest first.
        day_keys.sort_by(|a, b| b.cmp(a));
        day_keys.truncate(MAX_USAGE_DAYS);

        let mut daily_requests = Vec::with_capacity(day_keys.len());
        for key in day_keys {
            let count: Option<u64> = conn.get(&key).await?;
            let date = key.strip_prefix(&day_prefix).unwrap_or(&key).to_string();
            daily_requests.push(DailyUsage {
                date,
                count: count.unwrap_or(0),
            });
        }

        Ok(UsageReport {
            project_id: project_id.to_string(),
            total_requests: total.unwrap_or(0),
            daily_requests,
        })
    }
}
