//! Entry points used by pipeline code: start a tracked pipeline, trace its
//! stages, and hand the finished snapshot to the metrics bus.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};

use crate::bus::MetricsBus;
use crate::context::PipelineContext;
use crate::cost::CostModel;
use crate::tracker::PipelineTracker;
use crate::types::PipelineStatus;

#[derive(Clone)]
pub struct PipelineMonitor {
    cost_model: Arc<CostModel>,
    default_model: String,
    bus: MetricsBus,
}

impl PipelineMonitor {
    pub fn new(
        cost_model: Arc<CostModel>,
        default_model: impl Into<String>,
        bus: MetricsBus,
    ) -> Self {
        Self {
            cost_model,
            default_model: default_model.into(),
            bus,
        }
    }

    pub fn cost_model(&self) -> &Arc<CostModel> {
        &self.cost_model
    }

    pub fn bus(&self) -> &MetricsBus {
        &self.bus
    }

    pub fn create_tracker(&self, pipeline_id: impl Into<String>) -> PipelineTracker {
        PipelineTracker::new(pipeline_id, self.default_model.clone(), Arc::clone(&self.cost_model))
    }

    /// Binds a fresh tracker into `ctx`. The returned guard reports the
    /// pipeline when finished, or as cancelled if it is dropped first.
    pub fn start(
        &self,
        ctx: &PipelineContext,
        pipeline_id: impl Into<String>,
    ) -> (PipelineContext, CompletionGuard) {
        let tracker = self.create_tracker(pipeline_id);
        debug!("pipeline {} started", tracker.pipeline_id());
        let ctx = ctx.with_tracker(tracker.clone());
        (ctx, CompletionGuard::new(tracker, self.bus.clone()))
    }

    /// Runs `pipeline` with a tracked context and reports it as completed or
    /// failed from its result. The pipeline's result is returned untouched.
    pub async fn run<F, Fut, T, E>(
        &self,
        ctx: &PipelineContext,
        pipeline_id: impl Into<String>,
        pipeline: F,
    ) -> Result<T, E>
    where
        F: FnOnce(PipelineContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (ctx, guard) = self.start(ctx, pipeline_id);
        let result = pipeline(ctx).await;
        guard.finish(if result.is_ok() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Failed
        });
        result
    }
}

impl fmt::Debug for PipelineMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineMonitor")
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

/// Snapshots and emits a tracker exactly once.
#[must_use = "dropping the guard reports the pipeline as cancelled"]
pub struct CompletionGuard {
    tracker: PipelineTracker,
    bus: MetricsBus,
    finished: bool,
}

impl CompletionGuard {
    fn new(tracker: PipelineTracker, bus: MetricsBus) -> Self {
        Self {
            tracker,
            bus,
            finished: false,
        }
    }

    pub fn tracker(&self) -> &PipelineTracker {
        &self.tracker
    }

    pub fn finish(mut self, status: PipelineStatus) {
        self.finished = true;
        self.emit(status);
    }

    fn emit(&self, status: PipelineStatus) {
        let snapshot = self.tracker.snapshot(status);
        if !self.bus.emit_snapshot(snapshot) {
            warn!(
                "metrics for pipeline {} dropped: bus unavailable",
                self.tracker.pipeline_id()
            );
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "pipeline {} dropped before completion, reporting partial metrics",
                self.tracker.pipeline_id()
            );
            self.emit(PipelineStatus::Cancelled);
        }
    }
}

/// Records `stage` around `future` on the tracker bound in `ctx`.
///
/// Untracked contexts run the future as-is, and tracker misuse is logged
/// rather than returned: instrumentation never changes the stage's result.
pub async fn trace_stage<S, F, T, E>(ctx: &PipelineContext, stage: S, future: F) -> Result<T, E>
where
    S: AsRef<str>,
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let Some(tracker) = ctx.find_tracker() else {
        return future.await;
    };
    let stage = stage.as_ref();
    if let Err(error) = tracker.record_stage_start(stage) {
        warn!("stage tracing skipped: {}", error);
        return future.await;
    }

    let result = future.await;
    let error_kind = result.as_ref().err().map(ToString::to_string);
    if let Err(error) = tracker.record_stage_end(stage, result.is_ok(), error_kind.as_deref()) {
        warn!("stage tracing incomplete: {}", error);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::MetricsEvent;
    use crate::tracker::INCOMPLETE_STAGE;
    use crate::types::{DialogueStage, PipelineSnapshot, TokenUsage};

    fn monitor() -> (PipelineMonitor, mpsc::Receiver<MetricsEvent>) {
        let (bus, rx) = MetricsBus::new(16);
        (
            PipelineMonitor::new(Arc::new(CostModel::default()), "gpt-4o-mini", bus),
            rx,
        )
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<MetricsEvent>) -> PipelineSnapshot {
        match rx.recv().await.expect("event") {
            MetricsEvent::Pipeline { snapshot, .. } => *snapshot,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_pipelines_report_completed_snapshots() {
        let (monitor, mut rx) = monitor();

        let answer = monitor
            .run(&PipelineContext::new(), "p-ok", |ctx| async move {
                let text = trace_stage(&ctx, DialogueStage::LlmCompletion, async {
                    Ok::<_, String>("hello".to_string())
                })
                .await?;
                ctx.require_tracker()
                    .map_err(|e| e.to_string())?
                    .record_token_usage(TokenUsage::new(12, 3))
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>(text)
            })
            .await
            .expect("pipeline result");

        assert_eq!(answer, "hello");
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.pipeline_id(), "p-ok");
        assert_eq!(snapshot.performance.status, PipelineStatus::Completed);
        assert!(!snapshot.performance.partial);
        assert_eq!(snapshot.performance.stages.len(), 1);
        assert_eq!(snapshot.usage.token_usage.total_tokens(), 15);
    }

    #[tokio::test]
    async fn failed_stages_record_the_error_and_fail_the_pipeline() {
        let (monitor, mut rx) = monitor();

        let result = monitor
            .run(&PipelineContext::new(), "p-err", |ctx| async move {
                trace_stage(&ctx, DialogueStage::Retrieval, async {
                    Err::<(), _>("vector store timeout".to_string())
                })
                .await
            })
            .await;

        assert_eq!(result, Err("vector store timeout".to_string()));
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.performance.status, PipelineStatus::Failed);
        let stage = &snapshot.performance.stages[0];
        assert!(!stage.success);
        assert_eq!(stage.error_kind.as_deref(), Some("vector store timeout"));
    }

    #[tokio::test]
    async fn cancelled_pipelines_still_report_partial_data() {
        let (monitor, mut rx) = monitor();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            monitor.run(&PipelineContext::new(), "p-cancel", |ctx| async move {
                trace_stage(&ctx, DialogueStage::Retrieval, async { Ok::<_, String>(()) }).await?;
                trace_stage(&ctx, DialogueStage::TtsSynthesis, async {
                    std::future::pending::<()>().await;
                    Ok::<_, String>(())
                })
                .await
            }),
        )
        .await;
        assert!(timed_out.is_err());

        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.performance.status, PipelineStatus::Cancelled);
        assert!(snapshot.performance.partial);
        assert_eq!(snapshot.performance.stages.len(), 2);
        assert!(snapshot.performance.stages[0].success);
        assert_eq!(
            snapshot.performance.stages[1].error_kind.as_deref(),
            Some(INCOMPLETE_STAGE)
        );
    }

    #[tokio::test]
    async fn tracing_without_a_tracker_is_a_no_op() {
        let value = trace_stage(&PipelineContext::new(), "retrieval", async { Ok::<_, String>(7) })
            .await
            .expect("value");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn concurrent_pipelines_keep_separate_trackers() {
        let (monitor, mut rx) = monitor();
        let base = PipelineContext::new();

        let left = monitor.run(&base, "left", |ctx| async move {
            trace_stage(&ctx, "retrieval", async {
                tokio::task::yield_now().await;
                Ok::<_, String>(())
            })
            .await
        });
        let right = monitor.run(&base, "right", |ctx| async move {
            for _ in 0..3 {
                trace_stage(&ctx, "llm_completion", async { Ok::<_, String>(()) }).await?;
            }
            Ok::<_, String>(())
        });
        let (left, right) = tokio::join!(left, right);
        left.expect("left");
        right.expect("right");

        let mut stage_counts = Vec::new();
        for _ in 0..2 {
            let snapshot = next_snapshot(&mut rx).await;
            let pipeline_id = snapshot.pipeline_id().to_string();
            stage_counts.push((pipeline_id, snapshot.performance.stages.len()));
        }
        stage_counts.sort();
        assert_eq!(
            stage_counts,
            vec![("left".to_string(), 1), ("right".to_string(), 3)]
        );
    }
}
