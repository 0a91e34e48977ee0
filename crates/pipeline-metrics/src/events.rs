use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PipelineSnapshot;

/// Metadata attached to every metrics event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unique event ID (UUID v4)
    pub event_id: String,
    /// When the event was emitted
    pub occurred_at: DateTime<Utc>,
    /// Optional trace ID for correlating request chains
    pub trace_id: Option<String>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            trace_id: None,
        }
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Self::new()
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricsEvent {
    /// A finished (or cancelled) pipeline ready for the reporter chain.
    Pipeline {
        meta: EventMeta,
        snapshot: Box<PipelineSnapshot>,
    },
    System(SystemEvent),
}

impl MetricsEvent {
    pub fn pipeline(snapshot: PipelineSnapshot) -> Self {
        Self::Pipeline {
            meta: EventMeta::with_trace_id(snapshot.pipeline_id()),
            snapshot: Box::new(snapshot),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pipeline { .. } => "pipeline",
            Self::System(_) => "system",
        }
    }
}

/// System-level events for operational metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    MetricsDropped {
        count: u64,
        reason: String,
    },
    SinkError {
        sink: String,
        pipeline_id: String,
        error: String,
    },
    WorkerStarted,
}
