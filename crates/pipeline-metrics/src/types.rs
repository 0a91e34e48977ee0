use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value annotations recorded on a pipeline or a stage.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute keys the snapshot understands.
pub mod attribute_keys {
    /// Pipeline: length of the user's input in characters.
    pub const INPUT_LENGTH: &str = "input.length";
    /// Pipeline: the user's input; only its length is kept.
    pub const INPUT_TEXT: &str = "input.text";
    /// Pipeline: short preview of the input, stored as-is.
    pub const INPUT_PREVIEW: &str = "input.preview";
    /// `memory_retrieval` stage.
    pub const MEMORY_COUNT: &str = "memory.count";
    /// `retrieval` stage.
    pub const DOCUMENT_COUNT: &str = "document.count";
    /// `llm_completion` stage, used when the vendor reports no usage.
    pub const COMPLETION_TOKENS: &str = "completion.tokens";
    /// `sentence_assembly` stage.
    pub const SENTENCE_COUNT: &str = "sentence.count";
    /// `tts_synthesis` stage.
    pub const AUDIO_CHUNKS: &str = "audio.chunks";
}

/// Reads a non-negative count from an attribute, accepting integer or float JSON.
pub fn attribute_u64(attributes: &Attributes, key: &str) -> Option<u64> {
    let value = attributes.get(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|number| number.is_finite() && *number >= 0.0)
            .map(|number| number as u64)
    })
}

/// Token counts reported by the language model for one pipeline.
///
/// `total_tokens` is always `prompt_tokens + completion_tokens`; the fields are
/// private so the sum cannot drift, and deserialization recomputes it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "TokenUsageParts")]
pub struct TokenUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Deserialize)]
struct TokenUsageParts {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<TokenUsageParts> for TokenUsage {
    fn from(parts: TokenUsageParts) -> Self {
        Self::new(parts.prompt_tokens, parts.completion_tokens)
    }
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn add_assign(&mut self, other: TokenUsage) {
        *self = Self::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens.saturating_add(other.completion_tokens),
        );
    }
}

/// Credits charged for one pipeline. `total_credits == llm_credits + tts_credits`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "CostInfoParts")]
pub struct CostInfo {
    llm_credits: u64,
    tts_credits: u64,
    total_credits: u64,
}

#[derive(Deserialize)]
struct CostInfoParts {
    llm_credits: u64,
    tts_credits: u64,
}

impl From<CostInfoParts> for CostInfo {
    fn from(parts: CostInfoParts) -> Self {
        Self::new(parts.llm_credits, parts.tts_credits)
    }
}

impl CostInfo {
    pub fn new(llm_credits: u64, tts_credits: u64) -> Self {
        Self {
            llm_credits,
            tts_credits,
            total_credits: llm_credits.saturating_add(tts_credits),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn llm_credits(&self) -> u64 {
        self.llm_credits
    }

    pub fn tts_credits(&self) -> u64 {
        self.tts_credits
    }

    pub fn total_credits(&self) -> u64 {
        self.total_credits
    }
}

/// Well-known stages of the dialogue pipeline.
///
/// Tracker operations accept any `AsRef<str>`, so callers may also use
/// free-form stage names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DialogueStage {
    QueryPersistence,
    MemoryRetrieval,
    Retrieval,
    PromptBuilding,
    LlmCompletion,
    SentenceAssembly,
    TtsPreparation,
    TtsSynthesis,
}

impl DialogueStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryPersistence => "query_persistence",
            Self::MemoryRetrieval => "memory_retrieval",
            Self::Retrieval => "retrieval",
            Self::PromptBuilding => "prompt_building",
            Self::LlmCompletion => "llm_completion",
            Self::SentenceAssembly => "sentence_assembly",
            Self::TtsPreparation => "tts_preparation",
            Self::TtsSynthesis => "tts_synthesis",
        }
    }
}

impl AsRef<str> for DialogueStage {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for DialogueStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One occurrence of a stage inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error_kind: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl StageRecord {
    pub fn duration_ms(&self) -> u64 {
        millis_between(self.started_at, self.finished_at)
    }
}

/// Persisted timing record for one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerformanceMetrics {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Set when the snapshot was taken before every stage had finished.
    pub partial: bool,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub first_response_latency_ms: Option<u64>,
    pub last_response_latency_ms: Option<u64>,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRequest {
    pub input_length: u64,
    pub input_preview: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievalMetrics {
    pub memory_count: u64,
    pub document_count: u64,
    /// Time spent in memory retrieval and document retrieval stages.
    pub retrieval_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtsMetrics {
    pub sentence_count: u64,
    pub audio_chunks: u64,
    pub synthesis_time_ms: u64,
}

/// Persisted usage and cost record for one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageAnalytics {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub token_usage: TokenUsage,
    pub cost: CostInfo,
    pub audio_duration_ms: Option<u64>,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub request: UserRequest,
    #[serde(default)]
    pub retrieval: RetrievalMetrics,
    #[serde(default)]
    pub tts: TtsMetrics,
    /// `cost` was computed from estimated prompt tokens or audio length
    /// because the vendor reported none. `token_usage` stays as reported.
    #[serde(default)]
    pub cost_estimated: bool,
}

/// Frozen view of a tracker, handed to sinks instead of the tracker itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub performance: PerformanceMetrics,
    pub usage: UsageAnalytics,
}

impl PipelineSnapshot {
    pub fn pipeline_id(&self) -> &str {
        &self.performance.pipeline_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.performance.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDetail {
    pub pipeline_id: String,
    pub performance: Option<PerformanceMetrics>,
    pub usage: Option<UsageAnalytics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagePerformanceSummary {
    pub stage: String,
    pub count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// Scalar totals over a time range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeTotals {
    pub requests: u64,
    pub tokens: u64,
    pub duration_ms: u64,
}

impl RangeTotals {
    pub fn add_assign(&mut self, other: RangeTotals) {
        self.requests += other.requests;
        self.tokens += other.tokens;
        self.duration_ms += other.duration_ms;
    }

    pub fn avg_duration_ms(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.duration_ms as f64 / self.requests as f64)
    }
}

pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    end.signed_duration_since(start)
        .num_milliseconds()
        .try_into()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_total_is_sum_of_parts() {
        let mut usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens(), 150);

        usage.add_assign(TokenUsage::new(5, 5));
        assert_eq!(usage.prompt_tokens(), 125);
        assert_eq!(usage.completion_tokens(), 35);
        assert_eq!(usage.total_tokens(), 160);
    }

    #[test]
    fn deserialization_recomputes_totals() {
        let usage: TokenUsage = serde_json::from_str(
            r#"{"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 999}"#,
        )
        .expect("deserialize usage");
        assert_eq!(usage.total_tokens(), 14);

        let cost: CostInfo =
            serde_json::from_str(r#"{"llm_credits": 7, "tts_credits": 3, "total_credits": 1}"#)
                .expect("deserialize cost");
        assert_eq!(cost.total_credits(), 10);
    }

    #[test]
    fn pipeline_status_round_trips_through_db_names() {
        for status in [
            PipelineStatus::Running,
            PipelineStatus::Completed,
            PipelineStatus::Failed,
            PipelineStatus::Cancelled,
        ] {
            assert_eq!(PipelineStatus::from_db(status.as_str()), Some(status));
        }
        assert_eq!(PipelineStatus::from_db("unknown"), None);
    }

    #[test]
    fn stage_duration_never_underflows() {
        let now = Utc::now();
        let record = StageRecord {
            stage: DialogueStage::Retrieval.to_string(),
            started_at: now,
            finished_at: now - chrono::Duration::milliseconds(5),
            success: true,
            error_kind: None,
            attributes: Attributes::new(),
        };
        assert_eq!(record.duration_ms(), 0);
    }

    #[test]
    fn attribute_counts_accept_integers_and_floats() {
        let mut attributes = Attributes::new();
        attributes.insert("a".to_string(), Value::from(4));
        attributes.insert("b".to_string(), Value::from(2.9));
        attributes.insert("c".to_string(), Value::from(-1));
        attributes.insert("d".to_string(), Value::from("7"));

        assert_eq!(attribute_u64(&attributes, "a"), Some(4));
        assert_eq!(attribute_u64(&attributes, "b"), Some(2));
        assert_eq!(attribute_u64(&attributes, "c"), None);
        assert_eq!(attribute_u64(&attributes, "d"), None);
        assert_eq!(attribute_u64(&attributes, "missing"), None);
    }

    #[test]
    fn older_records_without_attributes_still_deserialize() {
        let record: StageRecord = serde_json::from_str(
            r#"{"stage": "retrieval", "started_at": "2026-02-10T10:00:00Z",
                "finished_at": "2026-02-10T10:00:01Z", "success": true, "error_kind": null}"#,
        )
        .expect("deserialize stage");
        assert!(record.attributes.is_empty());
        assert_eq!(record.duration_ms(), 1_000);
    }
}
