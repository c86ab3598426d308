//! # Orchestration Bootstrap
//!
//! Wires every component from one [`ImageBatchConfig`]: the store and queue for the
//! configured backend, the reference collaborators (HTTP fetcher, downscale transform,
//! filesystem output store, HTTP callback delivery) and the orchestration chain
//! intake → dispatch → workers → barrier → finalizer.
//!
//! The same wiring serves the binary, the in-memory test harness and embedding
//! applications. Collaborators can be swapped before [`OrchestrationSystemBuilder::build`]
//! to run against test doubles.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::batch_finalizer::BatchFinalizer;
use super::batch_intake::{BatchIntake, IntakeReport};
use super::completion_barrier::CompletionBarrier;
use super::completion_policy::CompletionPolicy;
use super::csv_ingress::{parse_batch_csv, IntakeRow};
use super::result_delivery::{HttpCallbackDelivery, ResultDelivery};
use super::status_query::{BatchProgress, StatusQuery};
use super::task_dispatcher::{DispatchOutcome, LaneSelector, TaskDispatcher};
use super::unit_reconciler::UnitReconciler;
use crate::config::{Backend, ConfigurationError, ImageBatchConfig};
use crate::error::{ImageBatchError, Result};
use crate::events::EventPublisher;
use crate::logging::log_error;
use crate::messaging::{InMemoryTaskQueue, Lane, PostgresTaskQueue, TaskQueue};
use crate::state_machine::UnitStateMachine;
use crate::store::{BatchStore, InMemoryBatchStore, PostgresBatchStore};
use crate::worker::{
    DownscaleTransform, FilesystemOutputStore, HttpSourceFetcher, ImageProcessor,
    ImageTransform, OutputStore, SourceFetcher, WorkerPool, WorkerPoolHandle,
};

fn client_error(component: &str, err: reqwest::Error) -> ImageBatchError {
    ImageBatchError::Internal(format!("failed to build {component} HTTP client: {err}"))
}

/// Collaborators for an [`OrchestrationSystem`]; anything left unset is built from the
/// configuration.
#[derive(Debug)]
pub struct OrchestrationSystemBuilder {
    config: ImageBatchConfig,
    store: Arc<dyn BatchStore>,
    queue: Arc<dyn TaskQueue>,
    database_pool: Option<PgPool>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    transform: Option<Arc<dyn ImageTransform>>,
    output_store: Option<Arc<dyn OutputStore>>,
    delivery: Option<Option<Arc<dyn ResultDelivery>>>,
    publisher: EventPublisher,
}

impl OrchestrationSystemBuilder {
    pub fn new(
        config: ImageBatchConfig,
        store: Arc<dyn BatchStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            database_pool: None,
            fetcher: None,
            transform: None,
            output_store: None,
            delivery: None,
            publisher: EventPublisher::default(),
        }
    }

    pub fn with_database_pool(mut self, pool: PgPool) -> Self {
        self.database_pool = Some(pool);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn ImageTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_output_store(mut self, output_store: Arc<dyn OutputStore>) -> Self {
        self.output_store = Some(output_store);
        self
    }

    /// `None` disables delivery regardless of configuration
    pub fn with_delivery(mut self, delivery: Option<Arc<dyn ResultDelivery>>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn build(self) -> Result<OrchestrationSystem> {
        let config = self.config;
        let store = self.store;
        let queue = self.queue;
        let publisher = self.publisher;

        let fetcher: Arc<dyn SourceFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpSourceFetcher::from_config(&config.fetch)
                    .map_err(|e| client_error("fetch", e))?,
            ),
        };
        let transform: Arc<dyn ImageTransform> = match self.transform {
            Some(transform) => transform,
            None => Arc::new(
                DownscaleTransform::new(config.transform.downscale_ratio)
                    .map_err(crate::error::ProcessingError::from)?,
            ),
        };
        let output_store: Arc<dyn OutputStore> = match self.output_store {
            Some(output_store) => output_store,
            None => Arc::new(FilesystemOutputStore::new(
                config.storage.output_dir.clone(),
                config.storage.public_base_url.clone(),
            )),
        };
        let delivery: Option<Arc<dyn ResultDelivery>> = match self.delivery {
            Some(delivery) => delivery,
            None => HttpCallbackDelivery::from_config(&config.delivery)
                .map_err(|e| client_error("delivery", e))?
                .map(|d| Arc::new(d) as Arc<dyn ResultDelivery>),
        };

        let lanes = LaneSelector::new(transform.is_pass_through());
        let finalizer = Arc::new(BatchFinalizer::new(
            Arc::clone(&store),
            Arc::clone(&output_store),
            delivery,
            CompletionPolicy::from(&config.finalization),
            publisher.clone(),
        ));
        let barrier = Arc::new(CompletionBarrier::new(
            Arc::clone(&store),
            Arc::clone(&finalizer),
            publisher.clone(),
        ));
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&barrier),
            lanes,
            publisher.clone(),
        );
        let processor = Arc::new(ImageProcessor::new(
            Arc::clone(&store),
            UnitStateMachine::new(Arc::clone(&store), publisher.clone()),
            fetcher,
            transform,
            output_store,
            Arc::clone(&barrier),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&processor),
            config.queue.clone(),
            &config.worker,
        ));

        Ok(OrchestrationSystem {
            intake: BatchIntake::new(Arc::clone(&store), publisher.clone()),
            status: StatusQuery::new(Arc::clone(&store)),
            dispatcher,
            barrier,
            finalizer,
            worker_pool,
            lanes,
            store,
            queue,
            publisher,
            database_pool: self.database_pool,
            config,
        })
    }
}

#[derive(Debug)]
pub struct OrchestrationSystem {
    config: ImageBatchConfig,
    store: Arc<dyn BatchStore>,
    queue: Arc<dyn TaskQueue>,
    publisher: EventPublisher,
    database_pool: Option<PgPool>,
    intake: BatchIntake,
    dispatcher: TaskDispatcher,
    barrier: Arc<CompletionBarrier>,
    status: StatusQuery,
    finalizer: Arc<BatchFinalizer>,
    worker_pool: Arc<WorkerPool>,
    lanes: LaneSelector,
}

impl OrchestrationSystem {
    /// Build the store and queue for the configured backend and wire everything else
    pub async fn bootstrap(config: ImageBatchConfig) -> Result<Self> {
        Self::builder(config).await?.build()
    }

    /// Like [`Self::bootstrap`], stopping before collaborators are resolved
    pub async fn builder(config: ImageBatchConfig) -> Result<OrchestrationSystemBuilder> {
        match config.database.backend {
            Backend::Memory => {
                info!("🚀 Bootstrapping with in-memory store and queue");
                let store = Arc::new(InMemoryBatchStore::new());
                let queue = Arc::new(InMemoryTaskQueue::new());
                Ok(OrchestrationSystemBuilder::new(config, store, queue))
            }
            Backend::Postgres => {
                let url = config.database.url.clone().ok_or_else(|| {
                    ConfigurationError::missing_required_field(
                        "database.url",
                        "the postgres backend (or set DATABASE_URL)",
                    )
                })?;
                let pool = PgPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .min_connections(config.database.min_connections)
                    .acquire_timeout(config.database.acquire_timeout())
                    .connect(&url)
                    .await?;

                let store = PostgresBatchStore::new(pool.clone());
                if config.database.run_migrations {
                    store.migrate().await?;
                }
                let queue =
                    PostgresTaskQueue::new(pool.clone(), config.queue.queue_names()).await;
                queue.ensure_queues().await?;
                info!(
                    max_connections = config.database.max_connections,
                    "🚀 Bootstrapping with PostgreSQL store and queue"
                );

                Ok(
                    OrchestrationSystemBuilder::new(config, Arc::new(store), Arc::new(queue))
                        .with_database_pool(pool),
                )
            }
        }
    }

    /// Validate, persist and dispatch a batch. Returns as soon as the tasks are queued.
    ///
    /// Once intake has committed, a dispatch failure comes back as
    /// [`ImageBatchError::DispatchFailed`] carrying the intake report, so the batch id is
    /// never lost. The batch can be dispatched again with [`Self::dispatch`] or by the
    /// reconciler.
    pub async fn submit_batch(
        &self,
        rows: &[IntakeRow],
        input_artifact: Option<String>,
    ) -> Result<IntakeReport> {
        let (batch, report) = self.intake.intake(rows, input_artifact).await?;
        if let Err(source) = self.dispatcher.dispatch(&batch).await {
            log_error(
                "orchestration_system",
                "dispatch",
                &source.to_string(),
                Some(&batch.batch_uuid.to_string()),
            );
            return Err(ImageBatchError::DispatchFailed {
                report: Box::new(report),
                source: Box::new(source),
            });
        }
        Ok(report)
    }

    /// Parse a CSV submission and hand it to [`Self::submit_batch`]
    pub async fn submit_csv<R: Read>(
        &self,
        reader: R,
        input_artifact: Option<String>,
    ) -> Result<IntakeReport> {
        let rows = parse_batch_csv(reader)?;
        self.submit_batch(&rows, input_artifact).await
    }

    /// Dispatch a batch still in `pending`, for example after
    /// [`ImageBatchError::DispatchFailed`]
    pub async fn dispatch(&self, batch_uuid: Uuid) -> Result<DispatchOutcome> {
        let batch = self
            .store
            .find_batch(batch_uuid)
            .await?
            .ok_or(ImageBatchError::NotFound(batch_uuid))?;
        self.dispatcher.dispatch(&batch).await
    }

    pub async fn get_status(&self, batch_uuid: Uuid) -> Result<BatchProgress> {
        self.status.get_status(batch_uuid).await
    }

    /// Start polling `lanes`, or the configured lanes when empty
    pub fn start_workers(&self, lanes: &[Lane]) -> WorkerPoolHandle {
        let lanes = if lanes.is_empty() {
            self.config.worker.lanes.as_slice()
        } else {
            lanes
        };
        Arc::clone(&self.worker_pool).start(lanes)
    }

    pub fn reconciler(&self) -> UnitReconciler {
        UnitReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.lanes,
            self.dispatcher.clone(),
            Arc::clone(&self.barrier),
            self.publisher.clone(),
            self.config.reconciliation.clone(),
        )
    }

    /// Run the reconciler in the background until the handle is shut down
    pub fn start_reconciler(&self) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.reconciler().run(shutdown_rx));
        ReconcilerHandle { shutdown_tx, task }
    }

    pub fn config(&self) -> &ImageBatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn finalizer(&self) -> &Arc<BatchFinalizer> {
        &self.finalizer
    }

    pub fn database_pool(&self) -> Option<&PgPool> {
        self.database_pool.as_ref()
    }

    /// Close database connections. Background handles are shut down by their owners.
    pub async fn shutdown(self) {
        if let Some(pool) = self.database_pool {
            pool.close().await;
        }
        info!("🛑 Orchestration system shut down");
    }
}

#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
