use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::parser::{self, PayloadFormat};
use crate::pipeline::types::{BatchSummary, EnrichmentResult, ItemOutcome, ItemState};
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::store::{Discovery, PendingItems, WorkItem, WorkItemStore};
use crate::vision::prepare::ImagePreparer;
use crate::vision::VisionClient;

/// Runs pending work items through the vision model with a fixed-size
/// worker pool.
///
/// Workers pull from one shared lazy queue, so at most `max_workers`
/// completion calls are in flight at once. A failing item is logged and
/// counted, never fatal to the batch.
#[derive(Clone)]
pub struct BatchDriver {
    client: Arc<dyn VisionClient>,
    store: Arc<WorkItemStore>,
    policy: RetryPolicy,
    preparer: ImagePreparer,
    prompt: Arc<str>,
    format: PayloadFormat,
    max_workers: usize,
    record_failures: bool,
}

impl BatchDriver {
    pub fn new(
        client: Arc<dyn VisionClient>,
        store: Arc<WorkItemStore>,
        prompt: impl Into<Arc<str>>,
        format: PayloadFormat,
    ) -> Self {
        Self {
            client,
            store,
            policy: RetryPolicy::default(),
            preparer: ImagePreparer::passthrough(),
            prompt: prompt.into(),
            format,
            max_workers: 10,
            record_failures: false,
        }
    }

    /// Wire up a driver from configuration.
    pub fn from_config(config: &AppConfig, client: Arc<dyn VisionClient>) -> Result<Self> {
        let pipeline = &config.pipeline;
        let prompt = prompt::load_prompt(pipeline.prompt_file.as_deref(), pipeline.format)?;
        let store = Arc::new(store_from_config(config)?);

        Ok(Self::new(client, store, prompt, pipeline.format)
            .with_policy(RetryPolicy::from_config(&config.retry))
            .with_preparer(ImagePreparer::new(&config.image))
            .with_max_workers(pipeline.max_workers)
            .record_failures(!pipeline.retry_failed_on_rerun))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_preparer(mut self, preparer: ImagePreparer) -> Self {
        self.preparer = preparer;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Write a failure marker for items that end up failed.
    pub fn record_failures(mut self, record: bool) -> Self {
        self.record_failures = record;
        self
    }

    pub fn store(&self) -> &Arc<WorkItemStore> {
        &self.store
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Process every pending item.
    pub async fn run(&self) -> Result<BatchSummary> {
        self.run_until(std::future::pending()).await
    }

    /// Process pending items until the queue drains or `shutdown` resolves.
    ///
    /// On shutdown the workers are aborted. Their items were never
    /// committed, so they stay pending for the next run.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<BatchSummary>
    where
        S: Future<Output = ()>,
    {
        let stale = self.store.cleanup_stale_temp().await?;
        if stale > 0 {
            tracing::info!(count = stale, "Removed stale temp files from an interrupted run");
        }

        let queue = Arc::new(Mutex::new(self.store.list_pending().await?));
        let (tx, mut rx) = mpsc::unbounded_channel::<ItemOutcome>();

        tracing::info!(
            max_workers = self.max_workers,
            model = self.client.name(),
            root = %self.store.root().display(),
            "Starting batch"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.max_workers {
            let driver = self.clone();
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            workers.spawn(async move { driver.worker(worker, queue, tx).await });
        }
        drop(tx);

        tokio::pin!(shutdown);
        let cancelled = tokio::select! {
            _ = join_workers(&mut workers) => false,
            _ = &mut shutdown => true,
        };

        if cancelled {
            tracing::warn!("Shutdown requested, abandoning in-flight items");
            workers.abort_all();
            join_workers(&mut workers).await;
        }

        let mut summary = BatchSummary {
            cancelled,
            ..BatchSummary::default()
        };
        while let Some(outcome) = rx.recv().await {
            summary.record(outcome);
        }
        summary.skipped = queue.lock().await.skipped();

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            completion_calls = summary.completion_calls,
            cancelled = summary.cancelled,
            "Batch finished"
        );
        for (id, error) in &summary.failures {
            tracing::warn!(item = id, error = %error, "Item failed");
        }

        Ok(summary)
    }

    async fn worker(
        self,
        worker: usize,
        queue: Arc<Mutex<PendingItems>>,
        tx: mpsc::UnboundedSender<ItemOutcome>,
    ) {
        loop {
            let item = {
                let mut queue = queue.lock().await;
                queue.next_pending().await
            };

            let Some(item) = item else {
                tracing::debug!(worker, "Queue drained, worker exiting");
                break;
            };

            tracing::info!(
                worker,
                item = item.id,
                from = %ItemState::Pending,
                to = %ItemState::InFlight,
                "Dispatching item"
            );

            let outcome = self.process(&item).await;
            if tx.send(outcome).is_err() {
                break;
            }
        }
    }

    /// Dispatch, complete, parse and commit one item.
    pub async fn process(&self, item: &WorkItem) -> ItemOutcome {
        let start = Instant::now();

        let image = match self.load_image(item).await {
            Ok(image) => image,
            Err(e) => return self.fail(item, e, 0, start).await,
        };

        let (completion, attempts) = self.complete(&image).await;
        let raw = match completion {
            Ok(raw) => raw,
            Err(e) => return self.fail(item, e, attempts, start).await,
        };

        let payload = match parser::parse(&raw, self.format) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(item = item.id, raw = %raw, "Unparseable response");
                return self.fail(item, e, attempts, start).await;
            }
        };

        if let Err(e) = self.store.commit(item, &payload).await {
            return self.fail(item, e, attempts, start).await;
        }

        tracing::info!(
            item = item.id,
            attempts,
            output = %item.output.display(),
            to = %ItemState::Done,
            "Item processed"
        );

        ItemOutcome {
            id: item.id,
            state: ItemState::Done,
            attempts,
            error: None,
            elapsed: start.elapsed(),
        }
    }

    /// Run one image through the model with retries and parse the answer.
    ///
    /// Returns the result and the number of completion calls made.
    pub async fn enrich(&self, image: &[u8]) -> (EnrichmentResult, u32) {
        let (completion, attempts) = self.complete(image).await;

        let result = match completion {
            Ok(raw) => match parser::parse(&raw, self.format) {
                Ok(payload) => EnrichmentResult {
                    raw: Some(raw),
                    payload: Some(payload),
                    error: None,
                },
                Err(e) => EnrichmentResult {
                    raw: Some(raw),
                    payload: None,
                    error: Some(e.to_string()),
                },
            },
            Err(e) => EnrichmentResult {
                raw: None,
                payload: None,
                error: Some(e.to_string()),
            },
        };

        (result, attempts)
    }

    /// Prepare raw image bytes the way batch items are prepared.
    pub async fn prepare_image(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        self.preparer.prepare_blocking(bytes).await
    }

    async fn complete(&self, image: &[u8]) -> (Result<String>, u32) {
        let client = &self.client;
        let prompt: &str = &self.prompt;

        let outcome = self
            .policy
            .run(|_attempt| async move { client.complete(image, prompt).await })
            .await;

        (outcome.result, outcome.attempts)
    }

    async fn load_image(&self, item: &WorkItem) -> Result<Vec<u8>> {
        let bytes = self.store.load_input(item).await?;
        self.prepare_image(bytes).await
    }

    async fn fail(
        &self,
        item: &WorkItem,
        error: AppError,
        attempts: u32,
        start: Instant,
    ) -> ItemOutcome {
        tracing::error!(
            item = item.id,
            attempts,
            kind = error.kind(),
            error = %error,
            to = %ItemState::Failed,
            "Item failed"
        );

        if self.record_failures {
            if let Err(e) = self.store.record_failure(item, &error).await {
                tracing::warn!(item = item.id, error = %e, "Failed to record failure marker");
            }
        }

        ItemOutcome {
            id: item.id,
            state: ItemState::Failed,
            attempts,
            error: Some(error.to_string()),
            elapsed: start.elapsed(),
        }
    }
}

/// Build the work item store described by the pipeline configuration.
pub fn store_from_config(config: &AppConfig) -> Result<WorkItemStore> {
    let pipeline = &config.pipeline;
    let discovery = match (pipeline.start_id, pipeline.end_id) {
        (Some(start), Some(end)) => Discovery::Range { start, end },
        (None, None) => Discovery::Listing,
        _ => {
            return Err(AppError::Config(
                "pipeline.start_id and pipeline.end_id must be set together".to_string(),
            ))
        }
    };

    Ok(WorkItemStore::new(
        &pipeline.data_dir,
        &pipeline.input_extension,
        pipeline.format.extension(),
    )
    .with_discovery(discovery)
    .skip_failed(!pipeline.retry_failed_on_rerun))
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "Worker panicked");
            }
        }
    }
}
