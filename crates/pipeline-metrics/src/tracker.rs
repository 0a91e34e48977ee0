//! Per-request accumulator for stage timings, token usage and cost.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cost::CostModel;
use crate::error::TrackerError;
use crate::types::{
    attribute_keys, attribute_u64, millis_between, Attributes, DialogueStage,
    PerformanceMetrics, PipelineSnapshot, PipelineStatus, RetrievalMetrics, StageRecord,
    TokenUsage, TtsMetrics, UsageAnalytics, UserRequest,
};

/// Error kind recorded for stages still open when the pipeline is snapshotted.
pub const INCOMPLETE_STAGE: &str = "incomplete";

/// Handle to one in-flight pipeline's tracking state.
///
/// Cloning the handle is cheap and every clone refers to the same tracker;
/// that is how a tracker bound into a [`PipelineContext`](crate::PipelineContext)
/// is reached from stages running on different worker threads. Mutations are
/// serialized by an internal lock.
#[derive(Debug, Clone)]
pub struct PipelineTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    pipeline_id: String,
    started_at: DateTime<Utc>,
    cost_model: Arc<CostModel>,
    state: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    model: String,
    open_stages: Vec<OpenStage>,
    stages: Vec<StageRecord>,
    attributes: Attributes,
    token_usage: TokenUsage,
    /// Whether the vendor reported usage at all, as opposed to reporting zero.
    token_usage_reported: bool,
    audio_duration_ms: Option<u64>,
    first_response_at: Option<DateTime<Utc>>,
    last_response_at: Option<DateTime<Utc>>,
    frozen: Option<PipelineSnapshot>,
}

#[derive(Debug)]
struct OpenStage {
    stage: String,
    started_at: DateTime<Utc>,
    attributes: Attributes,
}

impl PipelineTracker {
    pub fn new(
        pipeline_id: impl Into<String>,
        model: impl Into<String>,
        cost_model: Arc<CostModel>,
    ) -> Self {
        Self::starting_at(pipeline_id, model, cost_model, Utc::now())
    }

    pub fn starting_at(
        pipeline_id: impl Into<String>,
        model: impl Into<String>,
        cost_model: Arc<CostModel>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pipeline_id: pipeline_id.into(),
                started_at,
                cost_model,
                state: Mutex::new(TrackerState {
                    model: model.into(),
                    open_stages: Vec::new(),
                    stages: Vec::new(),
                    attributes: Attributes::new(),
                    token_usage: TokenUsage::default(),
                    token_usage_reported: false,
                    audio_duration_ms: None,
                    first_response_at: None,
                    last_response_at: None,
                    frozen: None,
                }),
            }),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.inner.pipeline_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_frozen(&self) -> bool {
        self.state().frozen.is_some()
    }

    pub fn set_model(&self, model: impl Into<String>) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        state.model = model.into();
        Ok(())
    }

    /// Annotates the pipeline as a whole; a repeated key overwrites.
    pub fn set_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        state.attributes.insert(key.into(), value.into());
        Ok(())
    }

    /// Annotates the latest open occurrence of `stage`, or its latest
    /// finished occurrence when none is open.
    pub fn record_stage_attribute(
        &self,
        stage: impl AsRef<str>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), TrackerError> {
        let stage = stage.as_ref();
        let mut state = self.mutable_state()?;
        let state = &mut *state;
        let open = state
            .open_stages
            .iter_mut()
            .rev()
            .find(|open| open.stage == stage);
        let attributes = match open {
            Some(open) => &mut open.attributes,
            None => state
                .stages
                .iter_mut()
                .rev()
                .find(|record| record.stage == stage)
                .map(|record| &mut record.attributes)
                .ok_or_else(|| TrackerError::StageNotStarted {
                    pipeline_id: self.inner.pipeline_id.clone(),
                    stage: stage.to_string(),
                })?,
        };
        attributes.insert(key.into(), value.into());
        Ok(())
    }

    pub fn record_stage_start(&self, stage: impl AsRef<str>) -> Result<(), TrackerError> {
        self.record_stage_start_at(stage, Utc::now())
    }

    pub fn record_stage_start_at(
        &self,
        stage: impl AsRef<str>,
        started_at: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        state.open_stages.push(OpenStage {
            stage: stage.as_ref().to_string(),
            started_at,
            attributes: Attributes::new(),
        });
        Ok(())
    }

    pub fn record_stage_end(
        &self,
        stage: impl AsRef<str>,
        success: bool,
        error_kind: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.record_stage_end_at(stage, success, error_kind, Utc::now())
    }

    /// Closes the most recently started open occurrence of `stage` and appends
    /// it to the stage list, so records are ordered by completion.
    pub fn record_stage_end_at(
        &self,
        stage: impl AsRef<str>,
        success: bool,
        error_kind: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        let stage = stage.as_ref();
        let mut state = self.mutable_state()?;
        let position = state
            .open_stages
            .iter()
            .rposition(|open| open.stage == stage)
            .ok_or_else(|| TrackerError::StageNotStarted {
                pipeline_id: self.inner.pipeline_id.clone(),
                stage: stage.to_string(),
            })?;

        let open = state.open_stages.remove(position);
        state.stages.push(StageRecord {
            stage: open.stage,
            started_at: open.started_at,
            finished_at,
            success,
            error_kind: error_kind.map(str::to_string),
            attributes: open.attributes,
        });
        Ok(())
    }

    /// Adds to the running token totals; a pipeline may call the model more
    /// than once.
    pub fn record_token_usage(&self, usage: TokenUsage) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        state.token_usage.add_assign(usage);
        state.token_usage_reported = true;
        Ok(())
    }

    pub fn record_audio_duration(&self, millis: u64) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        let total = state.audio_duration_ms.unwrap_or(0).saturating_add(millis);
        state.audio_duration_ms = Some(total);
        Ok(())
    }

    /// Marks a response chunk reaching the user.
    pub fn mark_response(&self) -> Result<(), TrackerError> {
        self.mark_response_at(Utc::now())
    }

    pub fn mark_response_at(&self, at: DateTime<Utc>) -> Result<(), TrackerError> {
        let mut state = self.mutable_state()?;
        if state.first_response_at.is_none() {
            state.first_response_at = Some(at);
        }
        state.last_response_at = Some(at);
        Ok(())
    }

    pub fn stages(&self) -> Vec<StageRecord> {
        self.state().stages.clone()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.state().token_usage
    }

    pub fn attributes(&self) -> Attributes {
        self.state().attributes.clone()
    }

    pub fn snapshot(&self, status: PipelineStatus) -> PipelineSnapshot {
        self.snapshot_at(status, Utc::now())
    }

    /// Freezes the tracker. The first call computes totals and cost; later
    /// calls return the same frozen snapshot regardless of their arguments.
    ///
    /// Stages still open are closed as failed with [`INCOMPLETE_STAGE`] and the
    /// snapshot is marked partial. When the vendor reported no token usage or
    /// audio length, cost falls back to estimates from the recorded attributes.
    pub fn snapshot_at(
        &self,
        status: PipelineStatus,
        finished_at: DateTime<Utc>,
    ) -> PipelineSnapshot {
        let mut state = self.state();
        if let Some(frozen) = &state.frozen {
            return frozen.clone();
        }

        let partial = !state.open_stages.is_empty() || status == PipelineStatus::Cancelled;
        let open_stages = std::mem::take(&mut state.open_stages);
        for open in open_stages {
            state.stages.push(StageRecord {
                stage: open.stage,
                started_at: open.started_at,
                finished_at,
                success: false,
                error_kind: Some(INCOMPLETE_STAGE.to_string()),
                attributes: open.attributes,
            });
        }

        let total_duration_ms = overall_duration_ms(&state.stages);
        let token_usage = state.token_usage;
        debug_assert_eq!(
            token_usage.total_tokens(),
            token_usage.prompt_tokens() + token_usage.completion_tokens()
        );

        let request = user_request(&state.attributes);
        let retrieval = retrieval_metrics(&state.stages);
        let tts = tts_metrics(&state.stages);

        let cost_model = &self.inner.cost_model;
        let llm_ran = state
            .stages
            .iter()
            .any(|stage| stage.stage == DialogueStage::LlmCompletion.as_str());
        let (billed_usage, tokens_estimated) = if state.token_usage_reported || !llm_ran {
            (token_usage, false)
        } else {
            let completion = sum_stage_attribute(
                &state.stages,
                DialogueStage::LlmCompletion,
                attribute_keys::COMPLETION_TOKENS,
            );
            let prompt = cost_model.estimate_prompt_tokens(&request, &retrieval);
            (TokenUsage::new(prompt, completion), true)
        };
        let (billed_audio, audio_estimated) = match state.audio_duration_ms {
            Some(millis) => (Some(millis), false),
            None if tts.sentence_count > 0 => (Some(cost_model.estimate_audio_ms(&tts)), true),
            None => (None, false),
        };
        let cost = cost_model.cost_info(&state.model, billed_usage, billed_audio);

        let started_at = self.inner.started_at;
        let latency = |at: Option<DateTime<Utc>>| at.map(|at| millis_between(started_at, at));

        let snapshot = PipelineSnapshot {
            performance: PerformanceMetrics {
                pipeline_id: self.inner.pipeline_id.clone(),
                status,
                partial,
                started_at,
                timestamp: finished_at,
                total_duration_ms,
                first_response_latency_ms: latency(state.first_response_at),
                last_response_latency_ms: latency(state.last_response_at),
                stages: state.stages.clone(),
                attributes: state.attributes.clone(),
            },
            usage: UsageAnalytics {
                pipeline_id: self.inner.pipeline_id.clone(),
                status,
                timestamp: finished_at,
                model: state.model.clone(),
                token_usage,
                cost,
                audio_duration_ms: state.audio_duration_ms,
                total_duration_ms,
                request,
                retrieval,
                tts,
                cost_estimated: tokens_estimated || audio_estimated,
            },
        };

        state.frozen = Some(snapshot.clone());
        snapshot
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mutable_state(&self) -> Result<MutexGuard<'_, TrackerState>, TrackerError> {
        let state = self.state();
        if state.frozen.is_some() {
            return Err(TrackerError::Frozen {
                pipeline_id: self.inner.pipeline_id.clone(),
            });
        }
        Ok(state)
    }
}

fn user_request(attributes: &Attributes) -> UserRequest {
    let input_length = attribute_u64(attributes, attribute_keys::INPUT_LENGTH).or_else(|| {
        attributes
            .get(attribute_keys::INPUT_TEXT)
            .and_then(Value::as_str)
            .map(|text| text.chars().count() as u64)
    });
    UserRequest {
        input_length: input_length.unwrap_or(0),
        input_preview: attributes
            .get(attribute_keys::INPUT_PREVIEW)
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn stages_named<'a>(
    stages: &'a [StageRecord],
    stage: DialogueStage,
) -> impl Iterator<Item = &'a StageRecord> + 'a {
    stages.iter().filter(move |record| record.stage == stage.as_str())
}

/// Summed across occurrences, since a stage may run more than once.
fn sum_stage_attribute(stages: &[StageRecord], stage: DialogueStage, key: &str) -> u64 {
    stages_named(stages, stage)
        .filter_map(|record| attribute_u64(&record.attributes, key))
        .fold(0, u64::saturating_add)
}

fn sum_stage_duration(stages: &[StageRecord], stage: DialogueStage) -> u64 {
    stages_named(stages, stage)
        .map(StageRecord::duration_ms)
        .fold(0, u64::saturating_add)
}

fn retrieval_metrics(stages: &[StageRecord]) -> RetrievalMetrics {
    RetrievalMetrics {
        memory_count: sum_stage_attribute(
            stages,
            DialogueStage::MemoryRetrieval,
            attribute_keys::MEMORY_COUNT,
        ),
        document_count: sum_stage_attribute(
            stages,
            DialogueStage::Retrieval,
            attribute_keys::DOCUMENT_COUNT,
        ),
        retrieval_time_ms: sum_stage_duration(stages, DialogueStage::MemoryRetrieval)
            .saturating_add(sum_stage_duration(stages, DialogueStage::Retrieval)),
    }
}

fn tts_metrics(stages: &[StageRecord]) -> TtsMetrics {
    TtsMetrics {
        sentence_count: sum_stage_attribute(
            stages,
            DialogueStage::SentenceAssembly,
            attribute_keys::SENTENCE_COUNT,
        ),
        audio_chunks: sum_stage_attribute(
            stages,
            DialogueStage::TtsSynthesis,
            attribute_keys::AUDIO_CHUNKS,
        ),
        synthesis_time_ms: sum_stage_duration(stages, DialogueStage::TtsSynthesis),
    }
}

/// Last stage end minus first stage start; zero when no stage ran.
fn overall_duration_ms(stages: &[StageRecord]) -> u64 {
    let first_start = stages.iter().map(|stage| stage.started_at).min();
    let last_end = stages.iter().map(|stage| stage.finished_at).max();
    match (first_start, last_end) {
        (Some(start), Some(end)) => millis_between(start, end),
        _ => 0,
    }
}
