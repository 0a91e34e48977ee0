use chrono::{DateTime, Utc};
use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("no pipeline tracker bound to the current context")]
    MissingTracker,

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("time parse error: {0}")]
    Chrono(#[from] chrono::ParseError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("storage task join error: {0}")]
    Task(String),

    #[error("invalid metrics data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Misuse of a [`PipelineTracker`](crate::PipelineTracker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("pipeline {pipeline_id}: stage '{stage}' ended without being started")]
    StageNotStarted { pipeline_id: String, stage: String },

    #[error("pipeline {pipeline_id} is already snapshotted")]
    Frozen { pipeline_id: String },
}

/// A reporting sink failed to deliver a snapshot.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink '{sink}' failed to persist pipeline {pipeline_id}: {source}")]
    Persist {
        sink: String,
        pipeline_id: String,
        #[source]
        source: MetricsError,
    },

    #[error("sink '{sink}' rejected pipeline {pipeline_id}: {reason}")]
    Rejected {
        sink: String,
        pipeline_id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid price for '{model}': {value}")]
    InvalidPrice { model: String, value: f64 },

    #[error("invalid config value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
