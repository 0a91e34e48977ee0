pub mod bus;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod events;
pub mod export;
pub mod logging;
pub mod monitor;
pub mod query;
pub mod reporter;
pub mod rollup;
pub mod runtime;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod worker;

pub use bus::{MetricsBus, WeakMetricsBus};
pub use config::MetricsConfig;
pub use context::PipelineContext;
pub use cost::{CostModel, EmbeddingPrice, ModelPrice, PricingTable};
pub use error::{ConfigError, MetricsError, MetricsResult, SinkError, TrackerError};
pub use events::{EventMeta, MetricsEvent, SystemEvent};
pub use export::PrometheusSink;
pub use monitor::{trace_stage, CompletionGuard, PipelineMonitor};
pub use query::MetricsQueryService;
pub use reporter::{
    LoggingSink, MetricsSink, PersistentSink, ReportOutcome, ReporterChain, SinkFailure,
};
pub use rollup::{
    Granularity, MetricsRollup, RollupAggregator, RunningStats, StagePerformanceRollup,
};
pub use runtime::MetricsRuntime;
pub use storage::{InMemoryMetricsStorage, MetricsStorage, RollupStorage, SqliteMetricsStorage};
pub use tracker::{PipelineTracker, INCOMPLETE_STAGE};
pub use types::{
    attribute_keys, Attributes, CostInfo, DialogueStage, PerformanceMetrics, PipelineDetail,
    PipelineSnapshot, PipelineStatus, RangeTotals, RetrievalMetrics, StagePerformanceSummary,
    StageRecord, TokenUsage, TtsMetrics, UsageAnalytics, UserRequest,
};
pub use worker::{MetricsWorker, WorkerStats};
