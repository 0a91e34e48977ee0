//! Time-bucketed rollups of pipeline snapshots.
//!
//! Every snapshot is folded into one bucket per configured granularity. A
//! bucket holds running `count/sum/min/max` statistics, and merging two
//! buckets is associative and commutative, so the final value of a bucket does
//! not depend on the order in which events arrive. Buckets are never sealed:
//! a late event still merges into its historical bucket.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};
use crate::storage::RollupStorage;
use crate::types::PipelineSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    pub fn width_seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 60 * 60,
            Self::Day => 24 * 60 * 60,
        }
    }

    pub fn width(self) -> Duration {
        Duration::seconds(self.width_seconds())
    }

    /// `floor(timestamp, granularity)` in UTC.
    pub fn bucket_start(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width_seconds();
        let floored = timestamp.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(floored, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Smallest bucket boundary at or after `timestamp`.
    pub fn bucket_ceil(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(timestamp);
        if start == timestamp {
            start
        } else {
            start + self.width()
        }
    }

    pub fn is_aligned(self, timestamp: DateTime<Utc>) -> bool {
        self.bucket_start(timestamp) == timestamp
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_db(&value.trim().to_ascii_lowercase())
            .ok_or_else(|| MetricsError::InvalidData(format!("unknown granularity: {value}")))
    }
}

/// Running statistics sufficient to derive a mean without the raw events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningStats {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl RunningStats {
    pub fn single(value: u64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// A row keyed by `(granularity, bucket_start)` that merges deltas in place.
pub trait BucketRow: Clone + Send + Sync + 'static {
    fn granularity(&self) -> Granularity;
    fn bucket_start(&self) -> DateTime<Utc>;
    fn merge(&mut self, other: &Self);
    /// Same aggregates re-keyed into a coarser bucket.
    fn rebucket(&self, granularity: Granularity) -> Self;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsRollup {
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub failed_requests: u64,
    pub partial_requests: u64,
    pub credits: u64,
    /// Total pipeline duration; `duration_ms.count` is the request count.
    pub duration_ms: RunningStats,
    pub tokens: RunningStats,
}

impl MetricsRollup {
    pub fn from_snapshot(granularity: Granularity, snapshot: &PipelineSnapshot) -> Self {
        let performance = &snapshot.performance;
        Self {
            granularity,
            bucket_start: granularity.bucket_start(snapshot.timestamp()),
            failed_requests: u64::from(!performance.status.is_success()),
            partial_requests: u64::from(performance.partial),
            credits: snapshot.usage.cost.total_credits(),
            duration_ms: RunningStats::single(performance.total_duration_ms),
            tokens: RunningStats::single(snapshot.usage.token_usage.total_tokens()),
        }
    }

    pub fn requests(&self) -> u64 {
        self.duration_ms.count
    }

    pub fn avg_duration_ms(&self) -> Option<f64> {
        self.duration_ms.mean()
    }
}

impl BucketRow for MetricsRollup {
    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket_start
    }

    fn merge(&mut self, other: &Self) {
        debug_assert_eq!(self.granularity, other.granularity);
        debug_assert_eq!(self.bucket_start, other.bucket_start);
        self.failed_requests += other.failed_requests;
        self.partial_requests += other.partial_requests;
        self.credits += other.credits;
        self.duration_ms.merge(&other.duration_ms);
        self.tokens.merge(&other.tokens);
    }

    fn rebucket(&self, granularity: Granularity) -> Self {
        Self {
            granularity,
            bucket_start: granularity.bucket_start(self.bucket_start),
            ..self.clone()
        }
    }
}

/// Per-stage duration statistics for one bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagePerformanceRollup {
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub stages: BTreeMap<String, RunningStats>,
}

impl StagePerformanceRollup {
    pub fn from_snapshot(granularity: Granularity, snapshot: &PipelineSnapshot) -> Self {
        let mut stages: BTreeMap<String, RunningStats> = BTreeMap::new();
        for stage in &snapshot.performance.stages {
            stages
                .entry(stage.stage.clone())
                .or_default()
                .merge(&RunningStats::single(stage.duration_ms()));
        }
        Self {
            granularity,
            bucket_start: granularity.bucket_start(snapshot.timestamp()),
            stages,
        }
    }
}

impl BucketRow for StagePerformanceRollup {
    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket_start
    }

    fn merge(&mut self, other: &Self) {
        debug_assert_eq!(self.granularity, other.granularity);
        debug_assert_eq!(self.bucket_start, other.bucket_start);
        for (stage, stats) in &other.stages {
            self.stages.entry(stage.clone()).or_default().merge(stats);
        }
    }

    fn rebucket(&self, granularity: Granularity) -> Self {
        Self {
            granularity,
            bucket_start: granularity.bucket_start(self.bucket_start),
            stages: self.stages.clone(),
        }
    }
}

/// Folds finer rows into `target` buckets, ascending by bucket start.
pub fn coarsen<R: BucketRow>(rows: &[R], target: Granularity) -> Vec<R> {
    let mut buckets: HashMap<DateTime<Utc>, R> = HashMap::new();

    for row in rows {
        let rebucketed = row.rebucket(target);
        buckets
            .entry(rebucketed.bucket_start())
            .and_modify(|existing| existing.merge(&rebucketed))
            .or_insert(rebucketed);
    }

    let mut rows: Vec<R> = buckets.into_values().collect();
    rows.sort_by_key(|row| row.bucket_start());
    rows
}

/// Merges every snapshot into the configured granularities.
#[derive(Clone)]
pub struct RollupAggregator {
    storage: Arc<dyn RollupStorage>,
    granularities: Vec<Granularity>,
}

impl RollupAggregator {
    pub fn new(storage: Arc<dyn RollupStorage>, granularities: &[Granularity]) -> Self {
        let mut granularities = granularities.to_vec();
        granularities.sort();
        granularities.dedup();
        Self {
            storage,
            granularities,
        }
    }

    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    /// Merges the snapshot at every granularity, once per pipeline.
    ///
    /// A failed merge does not stop the others, and merges that already landed
    /// are skipped by storage, so reporting the snapshot again after an error
    /// applies only what is still missing. Returns the first error.
    pub async fn record(&self, snapshot: &PipelineSnapshot) -> MetricsResult<()> {
        let pipeline_id = snapshot.pipeline_id();
        let mut applied = 0_usize;
        let mut first_error = None;
        for &granularity in &self.granularities {
            let metrics = MetricsRollup::from_snapshot(granularity, snapshot);
            let mut results = vec![self.storage.merge_metrics_rollup(pipeline_id, metrics).await];
            if !snapshot.performance.stages.is_empty() {
                let stages = StagePerformanceRollup::from_snapshot(granularity, snapshot);
                results.push(self.storage.merge_stage_rollup(pipeline_id, stages).await);
            }
            for result in results {
                match result {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(error) => {
                        log::warn!(
                            "{granularity} rollup merge failed for pipeline {pipeline_id}: {error}"
                        );
                        first_error.get_or_insert(error);
                    }
                }
            }
        }
        log::debug!("rollups updated for pipeline {pipeline_id}: {applied} merges applied");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cost::CostModel;
    use crate::storage::InMemoryMetricsStorage;
    use crate::tracker::PipelineTracker;
    use crate::types::{PipelineStatus, TokenUsage};

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, h, m, s)
            .single()
            .expect("valid datetime")
    }

    fn snapshot(
        id: &str,
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        tokens: u64,
    ) -> PipelineSnapshot {
        let start = finished_at - Duration::milliseconds(duration_ms);
        let tracker =
            PipelineTracker::starting_at(id, "gpt-4o-mini", Arc::new(CostModel::default()), start);
        tracker.record_stage_start_at("llm_completion", start).expect("start");
        tracker
            .record_stage_end_at("llm_completion", true, None, finished_at)
            .expect("end");
        tracker
            .record_token_usage(TokenUsage::new(tokens, 0))
            .expect("usage");
        tracker.snapshot_at(PipelineStatus::Completed, finished_at)
    }

    #[test]
    fn bucket_boundaries_split_adjacent_seconds() {
        let a = Granularity::Minute.bucket_start(ts(10, 0, 59));
        let b = Granularity::Minute.bucket_start(ts(10, 1, 0));
        assert_eq!(a, ts(10, 0, 0));
        assert_eq!(b, ts(10, 1, 0));
        assert_ne!(a, b);

        assert_eq!(Granularity::Hour.bucket_start(ts(10, 59, 59)), ts(10, 0, 0));
        assert_eq!(Granularity::Day.bucket_start(ts(23, 59, 59)), ts(0, 0, 0));
    }

    #[test]
    fn bucket_ceil_rounds_up_to_next_boundary() {
        assert_eq!(Granularity::Minute.bucket_ceil(ts(10, 0, 1)), ts(10, 1, 0));
        assert_eq!(Granularity::Minute.bucket_ceil(ts(10, 1, 0)), ts(10, 1, 0));
        assert!(Granularity::Hour.is_aligned(ts(10, 0, 0)));
        assert!(!Granularity::Hour.is_aligned(ts(10, 0, 1)));
    }

    #[test]
    fn merge_is_commutative() {
        let a = snapshot("a", ts(10, 0, 5), 50, 10);
        let b = snapshot("b", ts(10, 0, 40), 300, 99);
        let e1 = MetricsRollup::from_snapshot(Granularity::Minute, &a);
        let e2 = MetricsRollup::from_snapshot(Granularity::Minute, &b);

        let mut left = e1.clone();
        left.merge(&e2);
        let mut right = e2.clone();
        right.merge(&e1);

        assert_eq!(left, right);
        assert_eq!(left.requests(), 2);
        assert_eq!(left.duration_ms.sum, 350);
        assert_eq!(left.duration_ms.min, 50);
        assert_eq!(left.duration_ms.max, 300);
        assert_eq!(left.tokens.sum, 109);
        assert_eq!(left.avg_duration_ms(), Some(175.0));
    }

    #[test]
    fn merging_into_an_empty_row_adopts_the_other() {
        let mut empty = RunningStats::default();
        empty.merge(&RunningStats::single(42));
        assert_eq!(empty, RunningStats::single(42));

        let mut stats = RunningStats::single(7);
        stats.merge(&RunningStats::default());
        assert_eq!(stats, RunningStats::single(7));
    }

    #[test]
    fn stage_rollups_keep_per_stage_statistics() {
        let a = snapshot("a", ts(10, 5, 0), 100, 1);
        let b = snapshot("b", ts(10, 50, 0), 300, 1);
        let mut row = StagePerformanceRollup::from_snapshot(Granularity::Hour, &a);
        row.merge(&StagePerformanceRollup::from_snapshot(Granularity::Hour, &b));

        let llm = row.stages.get("llm_completion").expect("llm stage");
        assert_eq!(llm.count, 2);
        assert_eq!(llm.mean(), Some(200.0));
    }

    #[test]
    fn stage_merge_is_commutative_across_disjoint_stages() {
        let a = snapshot("a", ts(10, 5, 0), 100, 1);
        let b = snapshot("b", ts(10, 6, 0), 40, 1);
        let c = snapshot("c", ts(10, 7, 0), 70, 1);
        let e1 = StagePerformanceRollup::from_snapshot(Granularity::Hour, &a);
        let mut e2 = StagePerformanceRollup::from_snapshot(Granularity::Hour, &b);
        let e3 = StagePerformanceRollup::from_snapshot(Granularity::Hour, &c);
        // A stage only one side has seen must survive either merge order.
        let tts = e2.stages.remove("llm_completion").expect("llm stage");
        e2.stages.insert("tts_synthesis".to_string(), tts);

        let mut left = e1.clone();
        left.merge(&e2);
        left.merge(&e3);
        let mut right = e3.clone();
        right.merge(&e2);
        right.merge(&e1);

        assert_eq!(left, right);
        assert_eq!(left.stages["llm_completion"].count, 2);
        assert_eq!(left.stages["llm_completion"].min, 70);
        assert_eq!(left.stages["tts_synthesis"], RunningStats::single(40));
    }

    #[tokio::test]
    async fn late_event_merges_into_an_existing_historical_bucket() {
        let storage = Arc::new(InMemoryMetricsStorage::new());
        let aggregator = RollupAggregator::new(
            Arc::clone(&storage) as Arc<dyn RollupStorage>,
            &[Granularity::Minute, Granularity::Hour],
        );
        aggregator
            .record(&snapshot("early", ts(10, 0, 10), 100, 10))
            .await
            .expect("record");
        aggregator
            .record(&snapshot("next", ts(10, 5, 0), 20, 1))
            .await
            .expect("record");
        // Arrives after a newer bucket exists, stamped inside the first minute.
        aggregator
            .record(&snapshot("late", ts(10, 0, 50), 300, 5))
            .await
            .expect("record");

        let minutes = storage
            .metrics_rollups_between(Granularity::Minute, ts(10, 0, 0), ts(11, 0, 0))
            .await
            .expect("rollups");
        assert_eq!(minutes.len(), 2);
        assert_eq!(minutes[0].bucket_start, ts(10, 0, 0));
        assert_eq!(minutes[0].requests(), 2);
        assert_eq!(minutes[0].duration_ms.max, 300);
        assert_eq!(minutes[0].tokens.sum, 15);
        assert_eq!(minutes[1].requests(), 1);

        let hours = storage
            .metrics_rollups_between(Granularity::Hour, ts(10, 0, 0), ts(11, 0, 0))
            .await
            .expect("rollups");
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].requests(), 3);
        assert_eq!(hours[0].duration_ms.sum, 420);
    }

    #[test]
    fn coarsen_folds_minutes_into_hours() {
        let a = snapshot("a", ts(10, 0, 5), 10, 1);
        let b = snapshot("b", ts(10, 59, 0), 20, 2);
        let c = snapshot("c", ts(11, 1, 0), 30, 3);
        let rows = vec![
            MetricsRollup::from_snapshot(Granularity::Minute, &a),
            MetricsRollup::from_snapshot(Granularity::Minute, &b),
            MetricsRollup::from_snapshot(Granularity::Minute, &c),
        ];

        let hours = coarsen(&rows, Granularity::Hour);

        assert_eq!(hours.len(), 2);
        assert_eq!(hours[0].bucket_start, ts(10, 0, 0));
        assert_eq!(hours[0].granularity, Granularity::Hour);
        assert_eq!(hours[0].requests(), 2);
        assert_eq!(hours[0].tokens.sum, 3);
        assert_eq!(hours[1].bucket_start, ts(11, 0, 0));
        assert_eq!(hours[1].requests(), 1);
    }

    #[test]
    fn granularity_parses_case_insensitively() {
        assert_eq!("Hour".parse::<Granularity>().expect("parse"), Granularity::Hour);
        assert!("week".parse::<Granularity>().is_err());
    }
}
