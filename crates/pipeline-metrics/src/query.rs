//! Read-only API over raw records and rollups.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{MetricsError, MetricsResult};
use crate::rollup::{coarsen, Granularity, MetricsRollup, RunningStats, StagePerformanceRollup};
use crate::storage::{MetricsStorage, RollupStorage};
use crate::types::{
    PerformanceMetrics, PipelineDetail, PipelineStatus, RangeTotals, StagePerformanceSummary,
    UsageAnalytics,
};

/// One piece of a totals query: either whole rollup buckets or a raw scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Rollup {
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Raw {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Splits `[start, end)` into the coarsest aligned rollup spans available,
/// leaving unaligned edges to finer granularities and finally to raw scans.
/// `coarsest_first` must be sorted from coarsest to finest.
fn plan_segments(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    coarsest_first: &[Granularity],
) -> Vec<Segment> {
    if start >= end {
        return Vec::new();
    }
    let Some((&granularity, finer)) = coarsest_first.split_first() else {
        return vec![Segment::Raw { start, end }];
    };

    let inner_start = granularity.bucket_ceil(start);
    let inner_end = granularity.bucket_start(end);
    if inner_start >= inner_end {
        return plan_segments(start, end, finer);
    }

    let mut segments = plan_segments(start, inner_start, finer);
    segments.push(Segment::Rollup {
        granularity,
        start: inner_start,
        end: inner_end,
    });
    segments.extend(plan_segments(inner_end, end, finer));
    segments
}

pub struct MetricsQueryService {
    storage: Arc<dyn MetricsStorage>,
    rollups: Arc<dyn RollupStorage>,
    /// Collected granularities, finest first.
    granularities: Vec<Granularity>,
}

impl MetricsQueryService {
    pub fn new(
        storage: Arc<dyn MetricsStorage>,
        rollups: Arc<dyn RollupStorage>,
        granularities: &[Granularity],
    ) -> Self {
        let mut granularities = granularities.to_vec();
        granularities.sort();
        granularities.dedup();
        Self {
            storage,
            rollups,
            granularities,
        }
    }

    /// Performance records finished in `[start, end)`, oldest first.
    pub async fn performance_metrics_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        validate_range(start, end)?;
        self.storage.performance_between(start, end).await
    }

    /// Usage records finished in `[start, end)`, oldest first.
    pub async fn usage_analytics_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        validate_range(start, end)?;
        self.storage.usage_between(start, end).await
    }

    /// Pipelines that took at least `threshold_ms`, most recent first.
    pub async fn slow_pipelines(
        &self,
        threshold_ms: u64,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.storage.slow_pipelines(threshold_ms, limit).await
    }

    /// Usage records with at least `threshold` total tokens, most recent first.
    pub async fn high_token_usage(
        &self,
        threshold: u64,
        limit: usize,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.storage.high_token_usage(threshold, limit).await
    }

    /// The latest `limit` performance records, most recent first.
    pub async fn recent_performance_metrics(
        &self,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.storage.recent_performance(limit).await
    }

    /// The latest `limit` usage records, most recent first.
    pub async fn recent_usage_analytics(
        &self,
        limit: usize,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.storage.recent_usage(limit).await
    }

    /// The latest `limit` pipelines that ended with `status`.
    pub async fn performance_metrics_by_status(
        &self,
        status: PipelineStatus,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.storage.performance_by_status(status, limit).await
    }

    /// Both records of one pipeline, or `None` when neither was stored.
    pub async fn pipeline_detail(
        &self,
        pipeline_id: &str,
    ) -> MetricsResult<Option<PipelineDetail>> {
        let performance = self.storage.performance_by_id(pipeline_id).await?;
        let usage = self.storage.usage_by_id(pipeline_id).await?;
        if performance.is_none() && usage.is_none() {
            return Ok(None);
        }
        Ok(Some(PipelineDetail {
            pipeline_id: pipeline_id.to_string(),
            performance,
            usage,
        }))
    }

    /// Pipelines finished in `[start, end)`.
    pub async fn total_request_count(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<u64> {
        Ok(self.range_totals(start, end).await?.requests)
    }

    /// Prompt plus completion tokens of pipelines finished in `[start, end)`.
    pub async fn total_token_usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<u64> {
        Ok(self.range_totals(start, end).await?.tokens)
    }

    /// Mean total pipeline duration in the range; `None` without requests.
    pub async fn average_response_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Option<f64>> {
        Ok(self.range_totals(start, end).await?.avg_duration_ms())
    }

    /// Every pipeline ever stored.
    pub async fn total_request_count_all(&self) -> MetricsResult<u64> {
        Ok(self.lifetime_totals().await?.requests)
    }

    /// Tokens across every pipeline ever stored.
    pub async fn total_token_usage_all(&self) -> MetricsResult<u64> {
        Ok(self.lifetime_totals().await?.tokens)
    }

    /// Request, token and duration sums over every stored usage record.
    pub async fn lifetime_totals(&self) -> MetricsResult<RangeTotals> {
        self.storage.usage_totals().await
    }

    /// Exact totals for `[start, end)`. Bucket-aligned spans are read from
    /// rollups; the unaligned remainder is scanned from raw records.
    pub async fn range_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<RangeTotals> {
        validate_range(start, end)?;
        let coarsest_first: Vec<Granularity> = self.granularities.iter().rev().copied().collect();

        let mut totals = RangeTotals::default();
        for segment in plan_segments(start, end, &coarsest_first) {
            let part = match segment {
                Segment::Rollup {
                    granularity,
                    start,
                    end,
                } => {
                    let rows = self
                        .rollups
                        .metrics_rollups_between(granularity, start, end)
                        .await?;
                    debug!(
                        "range totals: {} {} rollups for [{}, {})",
                        rows.len(),
                        granularity,
                        start,
                        end
                    );
                    rollup_totals(&rows)
                }
                Segment::Raw { start, end } => {
                    self.storage.usage_totals_between(start, end).await?
                }
            };
            totals.add_assign(part);
        }
        Ok(totals)
    }

    /// Buckets of `granularity` starting in `[start, end)`, ascending. A
    /// granularity that is not collected is derived from a finer one.
    pub async fn metrics_rollups(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<MetricsRollup>> {
        validate_range(start, end)?;
        let source = self.source_for(granularity)?;
        if source == granularity {
            return self.rollups.metrics_rollups_between(granularity, start, end).await;
        }
        let rows = self
            .rollups
            .metrics_rollups_between(
                source,
                granularity.bucket_ceil(start),
                granularity.bucket_ceil(end),
            )
            .await?;
        Ok(coarsen(&rows, granularity))
    }

    /// Stage buckets of `granularity`, derived like [`Self::metrics_rollups`].
    pub async fn stage_rollups(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StagePerformanceRollup>> {
        validate_range(start, end)?;
        let source = self.source_for(granularity)?;
        if source == granularity {
            return self.rollups.stage_rollups_between(granularity, start, end).await;
        }
        let rows = self
            .rollups
            .stage_rollups_between(
                source,
                granularity.bucket_ceil(start),
                granularity.bucket_ceil(end),
            )
            .await?;
        Ok(coarsen(&rows, granularity))
    }

    /// Per-stage duration statistics across every bucket in the range,
    /// slowest stage first.
    pub async fn stage_performance_summary(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StagePerformanceSummary>> {
        let rows = self.stage_rollups(granularity, start, end).await?;

        let mut per_stage: BTreeMap<String, RunningStats> = BTreeMap::new();
        for row in &rows {
            for (stage, stats) in &row.stages {
                per_stage.entry(stage.clone()).or_default().merge(stats);
            }
        }

        let mut summaries: Vec<StagePerformanceSummary> = per_stage
            .into_iter()
            .filter_map(|(stage, stats)| {
                Some(StagePerformanceSummary {
                    stage,
                    count: stats.count,
                    avg_duration_ms: stats.mean()?,
                    min_duration_ms: stats.min,
                    max_duration_ms: stats.max,
                })
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.avg_duration_ms
                .total_cmp(&a.avg_duration_ms)
                .then_with(|| a.stage.cmp(&b.stage))
        });
        Ok(summaries)
    }

    /// `target` itself when collected, otherwise the coarsest collected
    /// granularity finer than it.
    fn source_for(&self, target: Granularity) -> MetricsResult<Granularity> {
        if self.granularities.contains(&target) {
            return Ok(target);
        }
        self.granularities
            .iter()
            .rev()
            .copied()
            .find(|granularity| *granularity < target)
            .ok_or_else(|| {
                MetricsError::InvalidData(format!("no rollups collected at or below {target}"))
            })
    }
}

fn rollup_totals(rows: &[MetricsRollup]) -> RangeTotals {
    rows.iter().fold(RangeTotals::default(), |mut totals, row| {
        totals.add_assign(RangeTotals {
            requests: row.requests(),
            tokens: row.tokens.sum,
            duration_ms: row.duration_ms.sum,
        });
        totals
    })
}

/// Rejects `start > end`; an empty range is valid.
pub fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> MetricsResult<()> {
    if start > end {
        return Err(MetricsError::InvalidRange { start, end });
    }
    Ok(())
}
