use std::sync::Arc;

use log::info;
use prometheus::Registry;
use tokio::task::JoinHandle;

use crate::bus::MetricsBus;
use crate::config::MetricsConfig;
use crate::cost::CostModel;
use crate::error::{MetricsError, MetricsResult};
use crate::export::PrometheusSink;
use crate::monitor::PipelineMonitor;
use crate::query::MetricsQueryService;
use crate::reporter::ReporterChain;
use crate::rollup::RollupAggregator;
use crate::storage::{
    InMemoryMetricsStorage, MetricsStorage, RollupStorage, SqliteMetricsStorage,
};
use crate::worker::{MetricsWorker, WorkerStats};

/// Storage, reporting pipeline and query service wired from one config.
pub struct MetricsRuntime {
    monitor: PipelineMonitor,
    query: Arc<MetricsQueryService>,
    registry: Option<Registry>,
    worker: JoinHandle<WorkerStats>,
}

/// Opens the configured store: SQLite when `db_path` is set, memory otherwise.
pub async fn open_storage(
    config: &MetricsConfig,
) -> MetricsResult<(Arc<dyn MetricsStorage>, Arc<dyn RollupStorage>)> {
    match &config.db_path {
        Some(path) => {
            let storage = Arc::new(SqliteMetricsStorage::new(path));
            storage.init().await?;
            info!("metrics storage: sqlite at {}", path.display());
            let metrics: Arc<dyn MetricsStorage> = storage.clone();
            let rollups: Arc<dyn RollupStorage> = storage;
            Ok((metrics, rollups))
        }
        None => {
            info!("metrics storage: in-memory");
            let storage = Arc::new(InMemoryMetricsStorage::new());
            let metrics: Arc<dyn MetricsStorage> = storage.clone();
            let rollups: Arc<dyn RollupStorage> = storage;
            Ok((metrics, rollups))
        }
    }
}

impl MetricsRuntime {
    /// Must be called inside a Tokio runtime; spawns the metrics worker.
    pub async fn start(config: &MetricsConfig) -> MetricsResult<Self> {
        config.validate()?;
        let cost_model = Arc::new(CostModel::new(config.pricing.clone())?);
        let (storage, rollups) = open_storage(config).await?;

        let aggregator = RollupAggregator::new(Arc::clone(&rollups), &config.granularities);
        let registry = config.prometheus_enabled.then(Registry::new);
        let exporter = registry.as_ref().map(PrometheusSink::new).transpose()?;
        let chain = Arc::new(ReporterChain::from_parts(
            config.persistent_enabled,
            Arc::clone(&storage),
            aggregator,
            exporter,
        ));

        let (bus, receiver) = MetricsBus::new(config.bus_capacity);
        let worker = MetricsWorker::new(chain, &bus).spawn(receiver);
        let monitor = PipelineMonitor::new(cost_model, config.default_model.clone(), bus);
        let query = Arc::new(MetricsQueryService::new(storage, rollups, &config.granularities));

        Ok(Self {
            monitor,
            query,
            registry,
            worker,
        })
    }

    pub fn monitor(&self) -> &PipelineMonitor {
        &self.monitor
    }

    pub fn query(&self) -> Arc<MetricsQueryService> {
        Arc::clone(&self.query)
    }

    /// The registry holding the exported histograms, when export is enabled.
    pub fn prometheus_registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    /// Drops this runtime's bus handle and waits for the worker to drain.
    /// Clones of the monitor keep the worker alive until they are dropped too.
    pub async fn shutdown(self) -> MetricsResult<WorkerStats> {
        let Self { monitor, worker, .. } = self;
        drop(monitor);
        worker
            .await
            .map_err(|error| MetricsError::Task(error.to_string()))
    }
}
