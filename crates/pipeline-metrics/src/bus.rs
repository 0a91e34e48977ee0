use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::{MetricsEvent, SystemEvent};
use crate::types::PipelineSnapshot;

/// Bounded hand-off between pipelines and the metrics worker.
///
/// Emission uses `try_send` and never waits: when the channel is full the
/// event is dropped and counted, so a slow sink can never stall a pipeline.
#[derive(Debug)]
pub struct MetricsBus {
    tx: mpsc::Sender<MetricsEvent>,
    dropped: Arc<AtomicU64>,
}

impl MetricsBus {
    /// Returns the bus (for emitting events) and the receiver (for the worker).
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Returns `false` when the event was dropped.
    pub fn emit(&self, event: MetricsEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "metrics bus full, dropped {} event (total dropped: {})",
                    event.kind(),
                    dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("metrics bus closed, dropped {} event", event.kind());
                false
            }
        }
    }

    pub fn emit_snapshot(&self, snapshot: PipelineSnapshot) -> bool {
        self.emit(MetricsEvent::pipeline(snapshot))
    }

    /// System events are not counted when dropped, to avoid feedback loops.
    pub fn emit_system(&self, event: SystemEvent) {
        let _ = self.tx.try_send(MetricsEvent::System(event));
    }

    pub fn emit_dropped_notification(&self, count: u64, reason: &str) {
        self.emit_system(SystemEvent::MetricsDropped {
            count,
            reason: reason.to_string(),
        });
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the worker's receiver is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle that does not keep the channel open.
    pub fn downgrade(&self) -> WeakMetricsBus {
        WeakMetricsBus {
            tx: self.tx.downgrade(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Non-owning bus handle held by the worker, so the channel closes once every
/// producer is gone.
#[derive(Debug, Clone)]
pub struct WeakMetricsBus {
    tx: mpsc::WeakSender<MetricsEvent>,
    dropped: Arc<AtomicU64>,
}

impl WeakMetricsBus {
    pub fn upgrade(&self) -> Option<MetricsBus> {
        self.tx.upgrade().map(|tx| MetricsBus {
            tx,
            dropped: Arc::clone(&self.dropped),
        })
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Clone for MetricsBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}
