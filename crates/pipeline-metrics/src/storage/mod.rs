use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MetricsResult;
use crate::rollup::{Granularity, MetricsRollup, StagePerformanceRollup};
use crate::types::{PerformanceMetrics, PipelineStatus, RangeTotals, UsageAnalytics};

mod memory;
mod sqlite;

pub use memory::InMemoryMetricsStorage;
pub use sqlite::SqliteMetricsStorage;

/// Raw per-pipeline records.
///
/// Ranges are half-open (`start <= timestamp < end`). Ascending results break
/// timestamp ties by insertion order; most-recent-first results break them by
/// reverse insertion order. Records are keyed by pipeline id: saving an id
/// that already exists is a no-op and returns `false`.
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    async fn init(&self) -> MetricsResult<()>;

    async fn save_performance(&self, metrics: &PerformanceMetrics) -> MetricsResult<bool>;

    async fn save_usage(&self, usage: &UsageAnalytics) -> MetricsResult<bool>;

    async fn performance_by_id(
        &self,
        pipeline_id: &str,
    ) -> MetricsResult<Option<PerformanceMetrics>>;

    async fn usage_by_id(&self, pipeline_id: &str) -> MetricsResult<Option<UsageAnalytics>>;

    async fn performance_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<PerformanceMetrics>>;

    async fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<UsageAnalytics>>;

    /// Total duration `>= threshold_ms`, most recent first.
    async fn slow_pipelines(
        &self,
        threshold_ms: u64,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>>;

    async fn performance_by_status(
        &self,
        status: PipelineStatus,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>>;

    /// Total tokens `>= threshold`, most recent first.
    async fn high_token_usage(
        &self,
        threshold: u64,
        limit: usize,
    ) -> MetricsResult<Vec<UsageAnalytics>>;

    async fn recent_performance(&self, limit: usize) -> MetricsResult<Vec<PerformanceMetrics>>;

    async fn recent_usage(&self, limit: usize) -> MetricsResult<Vec<UsageAnalytics>>;

    /// Request count, token and duration sums over usage records in the range.
    async fn usage_totals_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<RangeTotals>;

    async fn usage_totals(&self) -> MetricsResult<RangeTotals>;
}

/// Time-bucketed aggregates.
///
/// Merges are atomic per `(granularity, bucket_start)` key; two writers landing
/// in the same bucket never lose an update, and writers in different buckets
/// never contend on a shared lock.
///
/// Each merge is applied at most once per `(pipeline_id, granularity)`. The
/// marker is written together with the merge, so re-reporting a pipeline after
/// a partial failure fills in only the granularities that are still missing.
#[async_trait]
pub trait RollupStorage: Send + Sync {
    /// Returns `false` when this pipeline was already merged at this granularity.
    async fn merge_metrics_rollup(
        &self,
        pipeline_id: &str,
        delta: MetricsRollup,
    ) -> MetricsResult<bool>;

    /// Returns `false` when this pipeline was already merged at this granularity.
    async fn merge_stage_rollup(
        &self,
        pipeline_id: &str,
        delta: StagePerformanceRollup,
    ) -> MetricsResult<bool>;

    /// Rows with `start <= bucket_start < end`, ascending by bucket start.
    async fn metrics_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<MetricsRollup>>;

    async fn stage_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StagePerformanceRollup>>;
}

/// Which rollup family a once-per-pipeline marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RollupKind {
    Metrics,
    Stages,
}

impl RollupKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Stages => "stages",
        }
    }
}

pub(crate) fn in_range(
    timestamp: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    start <= timestamp && timestamp < end
}
