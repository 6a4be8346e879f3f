//! In-memory room store.
//!
//! Default backend when no Redis URL is configured, and the backend the room
//! tests run against. Observable semantics match the Redis backend.

use crate::error::Result;
use crate::{DailyUsage, LogBucket, StoredLog, UsageReport, MAX_USAGE_DAYS};
use async_trait::async_trait;
use common::{day_key, hour_key, now_millis, recent_hour_keys};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct MemoryStoreInner {
    /// project -> hour key -> bucket
    buckets: RwLock<HashMap<String, HashMap<String, LogBucket>>>,
    /// project -> total count
    totals: RwLock<HashMap<String, u64>>,
    /// project -> day key -> count
    days: RwLock<HashMap<String, HashMap<String, u64>>>,
}

/// In-memory [`crate::RoomStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets for a project. Test hook.
    pub fn bucket_count(&self, project_id: &str) -> usize {
        self.inner
            .buckets
            .read()
            .get(project_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl crate::RoomStore for MemoryStore {
    async fn append_log(&self, project_id: &str, log: StoredLog) -> Result<()> {
        let key = hour_key(log.timestamp);
        let mut buckets = self.inner.buckets.write();
        let project = buckets.entry(project_id.to_string()).or_default();
        let bucket = project
            .entry(key.clone())
            .or_insert_with(|| LogBucket::new(key, log.timestamp));
        bucket.push_front(log);
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
        let keys = recent_hour_keys(now, hours);

        let buckets = self.inner.buckets.read();
        let mut logs: Vec<StoredLog> = Vec::new();
        if let Some(project) = buckets.get(project_id) {
            for key in &keys {
                if let Some(bucket) = project.get(key) {
                    logs.extend(bucket.logs.iter().filter(|l| l.timestamp >= cutoff).cloned());
                }
            }
        }
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn compact_logs(&self, project_id: &str, retention_hours: u32) -> Result<usize> {
        let cutoff = now_millis() - retention_hours as i64 * 3_600_000;
        let mut buckets = self.inner.buckets.write();
        let Some(project) = buckets.get_mut(project_id) else {
            return Ok(0);
        };
        let before = project.len();
        project.retain(|_, bucket| bucket.created_at >= cutoff);
        Ok(before - project.len())
    }

    async fn record_usage(&self, project_id: &str, ts_millis: i64) -> Result<()> {
        *self
            .inner
            .totals
            .write()
            .entry(project_id.to_string())
            .or_default() += 1;
        *self
            .inner
            .days
            .write()
            .entry(project_id.to_string())
            .or_default()
            .entry(day_key(ts_millis))
            .or_default() += 1;
        Ok(())
    }

    async fn usage_report(&self, project_id: &str) -> Result<UsageReport> {
        let total_requests = self
            .inner
            .totals
            .read()
            .get(project_id)
            .copied()
            .unwrap_or(0);

        let mut daily_requests: Vec<DailyUsage> = self
            .inner
            .days
            .read()
            .get(project_id)
            .map(|days| {
                days.iter()
                    .map(|(date, count)| DailyUsage {
                        date: date.clone(),
                        count: *count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        // ISO day keys sort lexicographically; newest first.
        daily_requests.sort_by(|a, b| b.date.cmp(&a.date));
        daily_requests.truncate(MAX_USAGE_DAYS);

        Ok(UsageReport {
            project_id: project_id.to_string(),
            total_requests,
            daily_requests,
        })
    }
}
