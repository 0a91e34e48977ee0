use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{MetricsBus, WeakMetricsBus};
use crate::events::{MetricsEvent, SystemEvent};
use crate::reporter::ReporterChain;

/// Counters returned when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub pipelines: u64,
    pub sink_failures: u64,
    pub system_events: u64,
}

/// Drains the metrics bus into the reporter chain.
///
/// The worker only holds a weak bus handle, so it stops on its own once every
/// producer has been dropped and the queue is empty.
pub struct MetricsWorker {
    chain: Arc<ReporterChain>,
    bus: WeakMetricsBus,
}

impl MetricsWorker {
    pub fn new(chain: Arc<ReporterChain>, bus: &MetricsBus) -> Self {
        Self {
            chain,
            bus: bus.downgrade(),
        }
    }

    pub fn spawn(self, receiver: mpsc::Receiver<MetricsEvent>) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run(receiver))
    }

    async fn run(self, mut receiver: mpsc::Receiver<MetricsEvent>) -> WorkerStats {
        info!("MetricsWorker started ({} sinks)", self.chain.len());
        self.emit(SystemEvent::WorkerStarted);

        let mut stats = WorkerStats::default();
        let mut reported_dropped = self.bus.dropped_count();

        while let Some(event) = receiver.recv().await {
            match event {
                MetricsEvent::Pipeline { meta, snapshot } => {
                    stats.pipelines += 1;
                    debug!(
                        "reporting pipeline {} (event {})",
                        snapshot.pipeline_id(),
                        meta.event_id
                    );
                    let outcome = self.chain.report(&snapshot).await;
                    for failure in outcome.failures {
                        stats.sink_failures += 1;
                        self.emit(SystemEvent::SinkError {
                            sink: failure.sink,
                            pipeline_id: snapshot.pipeline_id().to_string(),
                            error: failure.error,
                        });
                    }
                }
                MetricsEvent::System(event) => {
                    stats.system_events += 1;
                    log_system_event(&event);
                }
            }

            let dropped = self.bus.dropped_count();
            if dropped > reported_dropped {
                if let Some(bus) = self.bus.upgrade() {
                    bus.emit_dropped_notification(dropped - reported_dropped, "metrics bus full");
                }
                reported_dropped = dropped;
            }
        }

        info!(
            "MetricsWorker stopped: {} pipelines reported, {} sink failures",
            stats.pipelines, stats.sink_failures
        );
        stats
    }

    fn emit(&self, event: SystemEvent) {
        if let Some(bus) = self.bus.upgrade() {
            bus.emit_system(event);
        }
    }
}

fn log_system_event(event: &SystemEvent) {
    match event {
        SystemEvent::WorkerStarted => info!("System: WorkerStarted"),
        SystemEvent::MetricsDropped { count, reason } => {
            warn!("System: MetricsDropped - {} events, reason: {}", count, reason);
        }
        SystemEvent::SinkError {
            sink,
            pipeline_id,
            error,
        } => {
            error!("System: SinkError in {} for {} - {}", sink, pipeline_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostModel;
    use crate::reporter::{LoggingSink, MetricsSink};
    use crate::tracker::PipelineTracker;
    use crate::types::PipelineStatus;

    #[tokio::test]
    async fn worker_reports_every_snapshot_and_stops_when_producers_are_gone() {
        let logging = Arc::new(LoggingSink::new());
        let chain = Arc::new(
            ReporterChain::new().with_sink(Arc::clone(&logging) as Arc<dyn MetricsSink>),
        );
        let (bus, rx) = MetricsBus::new(100);
        let handle = MetricsWorker::new(chain, &bus).spawn(rx);

        for i in 0..5 {
            let cost_model = Arc::new(CostModel::default());
            let tracker = PipelineTracker::new(format!("p-{i}"), "gpt-4o-mini", cost_model);
            assert!(bus.emit_snapshot(tracker.snapshot(PipelineStatus::Completed)));
        }
        drop(bus);

        let stats = handle.await.expect("worker join");
        assert_eq!(stats.pipelines, 5);
        assert_eq!(stats.sink_failures, 0);
        assert_eq!(logging.reported_count(), 5);
    }
}
