//! Delivery of pipeline snapshots to logging and persistent sinks.
//!
//! Reporting is best-effort. A sink failure is logged and counted, never
//! returned to the pipeline that produced the snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::error::{MetricsResult, SinkError};
use crate::export::PrometheusSink;
use crate::rollup::RollupAggregator;
use crate::storage::MetricsStorage;
use crate::types::PipelineSnapshot;

#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str;

    async fn report(&self, snapshot: &PipelineSnapshot) -> Result<(), SinkError>;
}

/// Baseline sink: one summary line per pipeline, one debug line per stage.
#[derive(Debug, Default)]
pub struct LoggingSink {
    reported: AtomicU64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported_count(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricsSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn report(&self, snapshot: &PipelineSnapshot) -> Result<(), SinkError> {
        let performance = &snapshot.performance;
        let usage = &snapshot.usage;
        info!(
            "pipeline {} {}{}: duration={}ms stages={} model={} tokens={}/{}/{} \
             credits={} (llm={}, tts={}){}",
            performance.pipeline_id,
            performance.status,
            if performance.partial { " (partial)" } else { "" },
            performance.total_duration_ms,
            performance.stages.len(),
            usage.model,
            usage.token_usage.prompt_tokens(),
            usage.token_usage.completion_tokens(),
            usage.token_usage.total_tokens(),
            usage.cost.total_credits(),
            usage.cost.llm_credits(),
            usage.cost.tts_credits(),
            if usage.cost_estimated { " estimated" } else { "" },
        );
        for stage in &performance.stages {
            debug!(
                "pipeline {} stage {}: {}ms success={}{}",
                performance.pipeline_id,
                stage.stage,
                stage.duration_ms(),
                stage.success,
                stage
                    .error_kind
                    .as_deref()
                    .map(|kind| format!(" error={kind}"))
                    .unwrap_or_default(),
            );
        }
        self.reported.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes the raw records (and rollups) and then hands the snapshot to the
/// wrapped sink, whether or not the write succeeded.
pub struct PersistentSink<S> {
    storage: Arc<dyn MetricsStorage>,
    aggregator: Option<RollupAggregator>,
    inner: S,
}

impl<S: MetricsSink> PersistentSink<S> {
    pub fn new(storage: Arc<dyn MetricsStorage>, inner: S) -> Self {
        Self {
            storage,
            aggregator: None,
            inner,
        }
    }

    pub fn with_aggregator(mut self, aggregator: RollupAggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every step is keyed by pipeline id: raw saves dedupe, and rollups merge
    /// once per granularity. Reporting a snapshot again after a failure only
    /// applies the steps that did not land.
    async fn persist(&self, snapshot: &PipelineSnapshot) -> MetricsResult<()> {
        let new_performance = self.storage.save_performance(&snapshot.performance).await?;
        let new_usage = self.storage.save_usage(&snapshot.usage).await?;
        if !(new_performance || new_usage) {
            debug!("pipeline {} raw records already persisted", snapshot.pipeline_id());
        }
        if let Some(aggregator) = &self.aggregator {
            aggregator.record(snapshot).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: MetricsSink> MetricsSink for PersistentSink<S> {
    fn name(&self) -> &str {
        "persistent"
    }

    async fn report(&self, snapshot: &PipelineSnapshot) -> Result<(), SinkError> {
        let persisted = self.persist(snapshot).await;
        if let Err(error) = &persisted {
            warn!(
                "failed to persist pipeline {}, falling back to {}: {}",
                snapshot.pipeline_id(),
                self.inner.name(),
                error
            );
        }
        self.inner.report(snapshot).await?;
        persisted.map_err(|source| SinkError::Persist {
            sink: self.name().to_string(),
            pipeline_id: snapshot.pipeline_id().to_string(),
            source,
        })
    }
}

/// A sink that failed for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub sink: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    pub delivered: usize,
    pub failures: Vec<SinkFailure>,
}

impl ReportOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered list of sinks, each called independently.
#[derive(Clone, Default)]
pub struct ReporterChain {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl ReporterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// The logging sink alone, or decorated by a persistent sink when
    /// `persistent_enabled`, followed by the Prometheus exporter if given.
    pub fn from_parts(
        persistent_enabled: bool,
        storage: Arc<dyn MetricsStorage>,
        aggregator: RollupAggregator,
        exporter: Option<PrometheusSink>,
    ) -> Self {
        let chain = if persistent_enabled {
            info!("persistent metrics reporting enabled");
            let sink = PersistentSink::new(storage, LoggingSink::new()).with_aggregator(aggregator);
            Self::new().with_sink(Arc::new(sink))
        } else {
            info!("persistent metrics reporting disabled, logging only");
            Self::new().with_sink(Arc::new(LoggingSink::new()))
        };
        match exporter {
            Some(exporter) => {
                info!("prometheus metrics export enabled");
                chain.with_sink(Arc::new(exporter))
            }
            None => chain,
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn report(&self, snapshot: &PipelineSnapshot) -> ReportOutcome {
        let mut outcome = ReportOutcome::default();
        for sink in &self.sinks {
            match sink.report(snapshot).await {
                Ok(()) => outcome.delivered += 1,
                Err(error) => {
                    warn!(
                        "metrics sink '{}' failed for pipeline {}: {}",
                        sink.name(),
                        snapshot.pipeline_id(),
                        error
                    );
                    outcome.failures.push(SinkFailure {
                        sink: sink.name().to_string(),
                        error: error.to_string(),
                    });
                }
            }
        }
        outcome
    }
}
