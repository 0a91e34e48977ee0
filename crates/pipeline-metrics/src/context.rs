//! Per-request context passed explicitly through every pipeline stage.
//!
//! Stages may resume on any runtime worker, so the active tracker is never
//! stored in a thread-local or global. Instead each stage receives a
//! [`PipelineContext`] value: an immutable, persistent map of typed
//! attachments. Binding a value produces a new context and leaves the
//! original untouched, so forked branches of a pipeline can share a parent
//! context safely.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{MetricsError, MetricsResult};
use crate::tracker::PipelineTracker;

type Attachment = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct PipelineContext {
    entries: Arc<HashMap<TypeId, Attachment>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this context with `value` bound under its type,
    /// replacing any previous value of the same type in the copy only.
    pub fn with<T>(&self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut entries = HashMap::clone(&self.entries);
        entries.insert(TypeId::of::<T>(), Arc::new(value) as Attachment);
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_tracker(&self, tracker: PipelineTracker) -> Self {
        self.with(tracker)
    }

    /// For call sites where tracking is mandatory; a missing tracker is a
    /// wiring bug.
    pub fn require_tracker(&self) -> MetricsResult<PipelineTracker> {
        self.find_tracker().ok_or(MetricsError::MissingTracker)
    }

    /// For best-effort instrumentation that must keep working untracked.
    pub fn find_tracker(&self) -> Option<PipelineTracker> {
        self.get::<PipelineTracker>().cloned()
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("entries", &self.entries.len())
            .field("tracker", &self.find_tracker().map(|t| t.pipeline_id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cost::CostModel;

    fn tracker(id: &str) -> PipelineTracker {
        PipelineTracker::new(id, "gpt-4o-mini", Arc::new(CostModel::default()))
    }

    #[test]
    fn binding_a_tracker_leaves_the_original_context_untouched() {
        let base = PipelineContext::new();
        let bound = base.with_tracker(tracker("req-1"));

        assert!(base.find_tracker().is_none());
        assert_eq!(
            bound.find_tracker().map(|t| t.pipeline_id().to_string()),
            Some("req-1".to_string())
        );
    }

    #[test]
    fn require_tracker_fails_when_absent() {
        let err = PipelineContext::new()
            .require_tracker()
            .expect_err("no tracker bound");
        assert!(matches!(err, MetricsError::MissingTracker));
    }

    #[test]
    fn forked_contexts_do_not_observe_each_other() {
        #[derive(Debug, PartialEq)]
        struct Persona(&'static str);

        let parent = PipelineContext::new().with(Persona("base"));
        let left = parent.with_tracker(tracker("left"));
        let right = parent.with_tracker(tracker("right"));

        assert_eq!(left.require_tracker().expect("left").pipeline_id(), "left");
        assert_eq!(right.require_tracker().expect("right").pipeline_id(), "right");
        assert_eq!(left.get::<Persona>(), Some(&Persona("base")));
        assert_eq!(parent.len(), 1);
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn trackers_found_through_the_context_share_state() {
        let ctx = PipelineContext::new().with_tracker(tracker("shared"));
        let first = ctx.require_tracker().expect("tracker");
        let second = ctx.require_tracker().expect("tracker");

        first
            .record_stage_start("retrieval")
            .expect("start stage");
        second
            .record_stage_end("retrieval", true, None)
            .expect("end stage");

        assert_eq!(first.stages().len(), 1);
    }
}
