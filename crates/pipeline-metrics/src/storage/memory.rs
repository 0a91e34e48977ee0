use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{in_range, MetricsStorage, RollupKind, RollupStorage};
use crate::error::MetricsResult;
use crate::rollup::{BucketRow, Granularity, MetricsRollup, StagePerformanceRollup};
use crate::types::{PerformanceMetrics, PipelineStatus, RangeTotals, UsageAnalytics};

type BucketKey = (Granularity, DateTime<Utc>);
type AppliedKey = (String, RollupKind, Granularity);

/// Process-local storage used when no database path is configured, and in
/// tests.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStorage {
    performance: RwLock<RawTable<PerformanceMetrics>>,
    usage: RwLock<RawTable<UsageAnalytics>>,
    metrics_rollups: DashMap<BucketKey, MetricsRollup>,
    stage_rollups: DashMap<BucketKey, StagePerformanceRollup>,
    /// Pipelines already merged, per rollup family and granularity.
    applied: DashMap<AppliedKey, ()>,
}

trait RawRecord: Clone {
    fn pipeline_id(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;
}

impl RawRecord for PerformanceMetrics {
    fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl RawRecord for UsageAnalytics {
    fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Rows in insertion order plus the set of ids already stored.
#[derive(Debug)]
struct RawTable<T> {
    rows: Vec<T>,
    ids: HashSet<String>,
}

impl<T> Default for RawTable<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            ids: HashSet::new(),
        }
    }
}

impl<T: RawRecord> RawTable<T> {
    fn insert(&mut self, record: &T) -> bool {
        if !self.ids.insert(record.pipeline_id().to_string()) {
            return false;
        }
        self.rows.push(record.clone());
        true
    }

    fn by_id(&self, pipeline_id: &str) -> Option<T> {
        self.rows
            .iter()
            .find(|row| row.pipeline_id() == pipeline_id)
            .cloned()
    }

    fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<T> {
        let mut rows: Vec<T> = self
            .rows
            .iter()
            .filter(|row| in_range(row.timestamp(), start, end))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        rows.sort_by_key(|row| row.timestamp());
        rows
    }

    fn most_recent<F>(&self, limit: usize, filter: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        if limit == 0 {
            return Vec::new();
        }
        let mut rows: Vec<T> = self
            .rows
            .iter()
            .rev()
            .filter(|row| filter(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| Reverse(row.timestamp()));
        rows.truncate(limit);
        rows
    }
}

impl InMemoryMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
        lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
        lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges `delta` unless the marker for this pipeline already exists. The
    /// marker's entry guard is held across the merge, so two reports of the
    /// same pipeline cannot both apply it.
    fn merge_once<R: BucketRow>(
        &self,
        map: &DashMap<BucketKey, R>,
        pipeline_id: &str,
        kind: RollupKind,
        delta: R,
    ) -> bool {
        match self
            .applied
            .entry((pipeline_id.to_string(), kind, delta.granularity()))
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                merge_row(map, delta);
                slot.insert(());
                true
            }
        }
    }
}

fn sum_usage<'a>(rows: impl Iterator<Item = &'a UsageAnalytics>) -> RangeTotals {
    rows.fold(RangeTotals::default(), |mut totals, row| {
        totals.add_assign(RangeTotals {
            requests: 1,
            tokens: row.token_usage.total_tokens(),
            duration_ms: row.total_duration_ms,
        });
        totals
    })
}

fn merge_row<R: BucketRow>(map: &DashMap<BucketKey, R>, delta: R) {
    // The entry guard holds the shard lock for the whole read-modify-write.
    map.entry((delta.granularity(), delta.bucket_start()))
        .and_modify(|row| row.merge(&delta))
        .or_insert_with(|| delta.clone());
}

fn rows_between<R: BucketRow>(
    map: &DashMap<BucketKey, R>,
    granularity: Granularity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<R> {
    let mut rows: Vec<R> = map
        .iter()
        .filter(|entry| {
            let (row_granularity, bucket_start) = *entry.key();
            row_granularity == granularity && in_range(bucket_start, start, end)
        })
        .map(|entry| entry.value().clone())
        .collect();
    rows.sort_by_key(|row| row.bucket_start());
    rows
}

#[async_trait]
impl MetricsStorage for InMemoryMetricsStorage {
    async fn init(&self) -> MetricsResult<()> {
        Ok(())
    }

    async fn save_performance(&self, metrics: &PerformanceMetrics) -> MetricsResult<bool> {
        Ok(Self::write(&self.performance).insert(metrics))
    }

    async fn save_usage(&self, usage: &UsageAnalytics) -> MetricsResult<bool> {
        Ok(Self::write(&self.usage).insert(usage))
    }

    async fn performance_by_id(
        &self,
        pipeline_id: &str,
    ) -> MetricsResult<Option<PerformanceMetrics>> {
        Ok(Self::read(&self.performance).by_id(pipeline_id))
    }

    async fn usage_by_id(&self, pipeline_id: &str) -> MetricsResult<Option<UsageAnalytics>> {
        Ok(Self::read(&self.usage).by_id(pipeline_id))
    }

    async fn performance_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        Ok(Self::read(&self.performance).between(start, end))
    }

    async fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        Ok(Self::read(&self.usage).between(start, end))
    }

    async fn slow_pipelines(
        &self,
        threshold_ms: u64,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        Ok(Self::read(&self.performance)
            .most_recent(limit, |row| row.total_duration_ms >= threshold_ms))
    }

    async fn performance_by_status(
        &self,
        status: PipelineStatus,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        Ok(Self::read(&self.performance).most_recent(limit, |row| row.status == status))
    }

    async fn high_token_usage(
        &self,
        threshold: u64,
        limit: usize,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        Ok(Self::read(&self.usage)
            .most_recent(limit, |row| row.token_usage.total_tokens() >= threshold))
    }

    async fn recent_performance(&self, limit: usize) -> MetricsResult<Vec<PerformanceMetrics>> {
        Ok(Self::read(&self.performance).most_recent(limit, |_| true))
    }

    async fn recent_usage(&self, limit: usize) -> MetricsResult<Vec<UsageAnalytics>> {
        Ok(Self::read(&self.usage).most_recent(limit, |_| true))
    }

    async fn usage_totals_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<RangeTotals> {
        let table = Self::read(&self.usage);
        Ok(sum_usage(
            table.rows.iter().filter(|row| in_range(row.timestamp, start, end)),
        ))
    }

    async fn usage_totals(&self) -> MetricsResult<RangeTotals> {
        Ok(sum_usage(Self::read(&self.usage).rows.iter()))
    }
}

#[async_trait]
impl RollupStorage for InMemoryMetricsStorage {
    async fn merge_metrics_rollup(
        &self,
        pipeline_id: &str,
        delta: MetricsRollup,
    ) -> MetricsResult<bool> {
        Ok(self.merge_once(&self.metrics_rollups, pipeline_id, RollupKind::Metrics, delta))
    }

    async fn merge_stage_rollup(
        &self,
        pipeline_id: &str,
        delta: StagePerformanceRollup,
    ) -> MetricsResult<bool> {
        Ok(self.merge_once(&self.stage_rollups, pipeline_id, RollupKind::Stages, delta))
    }

    async fn metrics_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<MetricsRollup>> {
        Ok(rows_between(&self.metrics_rollups, granularity, start, end))
    }

    async fn stage_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StagePerformanceRollup>> {
        Ok(rows_between(&self.stage_rollups, granularity, start, end))
    }
}
