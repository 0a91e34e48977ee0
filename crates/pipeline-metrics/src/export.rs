//! Prometheus export of pipeline snapshots.
//!
//! Instruments:
//! - pipeline_duration_seconds (by status)
//! - pipeline_executions_total (by status)
//! - pipeline_stage_duration_seconds (by stage and outcome)
//! - pipeline_first_response_latency_seconds
//! - pipeline_last_response_latency_seconds

use async_trait::async_trait;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::SinkError;
use crate::reporter::MetricsSink;
use crate::types::PipelineSnapshot;

// Exponential with factor 2, 10ms to ~82s.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
];

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Observes every reported snapshot into histograms registered on a
/// caller-owned [`Registry`].
#[derive(Clone)]
pub struct PrometheusSink {
    pipeline_duration: HistogramVec,
    executions: IntCounterVec,
    stage_duration: HistogramVec,
    first_response_latency: Histogram,
    last_response_latency: Histogram,
    registry: Registry,
}

impl PrometheusSink {
    /// Creates the instruments and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pipeline_duration = HistogramVec::new(
            HistogramOpts::new("pipeline_duration_seconds", "Total pipeline duration")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["status"],
        )?;
        registry.register(Box::new(pipeline_duration.clone()))?;

        let executions = IntCounterVec::new(
            Opts::new("pipeline_executions_total", "Pipelines reported, by final status"),
            &["status"],
        )?;
        registry.register(Box::new(executions.clone()))?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("pipeline_stage_duration_seconds", "Duration of one stage run")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(stage_duration.clone()))?;

        let first_response_latency = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_first_response_latency_seconds",
                "Time from pipeline start to the first response",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(first_response_latency.clone()))?;

        let last_response_latency = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_last_response_latency_seconds",
                "Time from pipeline start to the last response",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(last_response_latency.clone()))?;

        Ok(Self {
            pipeline_duration,
            executions,
            stage_duration,
            first_response_latency,
            last_response_latency,
            registry: registry.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn seconds(millis: u64) -> f64 {
    millis as f64 / 1000.0
}

#[async_trait]
impl MetricsSink for PrometheusSink {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn report(&self, snapshot: &PipelineSnapshot) -> Result<(), SinkError> {
        let performance = &snapshot.performance;
        let status = performance.status.as_str();

        self.pipeline_duration
            .with_label_values(&[status])
            .observe(seconds(performance.total_duration_ms));
        self.executions.with_label_values(&[status]).inc();

        for stage in &performance.stages {
            let outcome = if stage.success { "ok" } else { "error" };
            self.stage_duration
                .with_label_values(&[stage.stage.as_str(), outcome])
                .observe(seconds(stage.duration_ms()));
        }
        if let Some(latency) = performance.first_response_latency_ms {
            self.first_response_latency.observe(seconds(latency));
        }
        if let Some(latency) = performance.last_response_latency_ms {
            self.last_response_latency.observe(seconds(latency));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use prometheus::proto::MetricFamily;

    use super::*;
    use crate::cost::CostModel;
    use crate::tracker::PipelineTracker;
    use crate::types::PipelineStatus;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|family| family.name() == name)
            .unwrap_or_else(|| panic!("metric family {name} not registered"))
    }

    fn label<'a>(family: &'a MetricFamily, index: usize, name: &str) -> &'a str {
        family.get_metric()[index]
            .get_label()
            .iter()
            .find(|pair| pair.name() == name)
            .map(|pair| pair.value())
            .unwrap_or_default()
    }

    fn snapshot(id: &str, status: PipelineStatus) -> PipelineSnapshot {
        let start = Utc
            .with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
            .single()
            .expect("valid datetime");
        let ms = Duration::milliseconds;
        let tracker =
            PipelineTracker::starting_at(id, "gpt-4o-mini", Arc::new(CostModel::default()), start);
        tracker.record_stage_start_at("retrieval", start).expect("start");
        tracker
            .record_stage_end_at("retrieval", true, None, start + ms(250))
            .expect("end");
        tracker
            .record_stage_start_at("llm_completion", start + ms(250))
            .expect("start");
        tracker.mark_response_at(start + ms(500)).expect("response");
        tracker
            .record_stage_end_at("llm_completion", false, Some("timeout"), start + ms(1_250))
            .expect("end");
        tracker.snapshot_at(status, start + ms(1_500))
    }

    #[tokio::test]
    async fn reported_snapshots_are_readable_from_the_registry() {
        let registry = Registry::new();
        let sink = PrometheusSink::new(&registry).expect("register");

        sink.report(&snapshot("p-1", PipelineStatus::Completed))
            .await
            .expect("report");
        sink.report(&snapshot("p-2", PipelineStatus::Failed))
            .await
            .expect("report");

        let families = sink.registry().gather();

        let executions = family(&families, "pipeline_executions_total");
        assert_eq!(executions.get_metric().len(), 2);
        assert_eq!(sink.executions.with_label_values(&["completed"]).get(), 1);
        assert_eq!(sink.executions.with_label_values(&["failed"]).get(), 1);

        let duration = family(&families, "pipeline_duration_seconds");
        let total: u64 = duration
            .get_metric()
            .iter()
            .map(|metric| metric.get_histogram().get_sample_count())
            .sum();
        assert_eq!(total, 2);
        assert_eq!(duration.get_metric()[0].get_histogram().get_sample_sum(), 1.25);

        let stages = family(&families, "pipeline_stage_duration_seconds");
        assert_eq!(stages.get_metric().len(), 2);
        for (index, metric) in stages.get_metric().iter().enumerate() {
            let histogram = metric.get_histogram();
            assert_eq!(histogram.get_sample_count(), 2);
            match label(stages, index, "stage") {
                "retrieval" => {
                    assert_eq!(label(stages, index, "outcome"), "ok");
                    assert_eq!(histogram.get_sample_sum(), 0.5);
                }
                "llm_completion" => {
                    assert_eq!(label(stages, index, "outcome"), "error");
                    assert_eq!(histogram.get_sample_sum(), 2.0);
                }
                other => panic!("unexpected stage label {other}"),
            }
        }

        let first = family(&families, "pipeline_first_response_latency_seconds");
        assert_eq!(first.get_metric()[0].get_histogram().get_sample_count(), 2);
        assert_eq!(first.get_metric()[0].get_histogram().get_sample_sum(), 1.0);
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        PrometheusSink::new(&registry).expect("first registration");
        assert!(PrometheusSink::new(&registry).is_err());
    }
}
