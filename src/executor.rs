//! Dynamic request batching.
//!
//! Submissions land in a FIFO queue; a single executor task moves them out
//! in batches bounded by `max_batch_size` and the age of the oldest pending
//! request, partitions each batch by model (intra-group order preserved),
//! and completes every response channel exactly once — including the drain
//! pass on shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::BatchingConfig;
use crate::metrics::MetricsCollector;
use crate::registry::ModelRegistry;
use crate::session::{InferenceRequest, InferenceResponse};

/// A queued request waiting to be dispatched.
struct PendingRequest {
    request: InferenceRequest,
    response_tx: oneshot::Sender<InferenceResponse>,
    enqueued_at: Instant,
}

/// Pending items plus the closed flag, under one lock: a submission either
/// lands before the drain pass observes an empty queue, or sees `closed`
/// and is rejected. Nothing can slip in between.
#[derive(Default)]
struct Queue {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

struct ExecutorInner {
    registry: ModelRegistry,
    metrics: Arc<MetricsCollector>,
    config: BatchingConfig,
    queue: StdMutex<Queue>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the batch executor.
#[derive(Clone)]
pub struct BatchExecutor {
    inner: Arc<ExecutorInner>,
}

impl BatchExecutor {
    pub fn new(
        registry: ModelRegistry,
        metrics: Arc<MetricsCollector>,
        config: BatchingConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                metrics,
                config,
                queue: StdMutex::new(Queue::default()),
                notify: Notify::new(),
                shutdown,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the executor task. No-op when batching is disabled or the
    /// executor is already running.
    pub async fn start(&self) {
        if !self.inner.config.enabled {
            tracing::info!("Batching disabled, requests will be processed individually");
            return;
        }

        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let executor = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        *worker = Some(tokio::spawn(async move {
            executor.run_loop(shutdown).await;
        }));

        tracing::info!(
            "Batch executor started (max_batch_size: {}, max_wait_ms: {})",
            self.inner.config.max_batch_size,
            self.inner.config.max_wait_ms
        );
    }

    /// Signal shutdown, wait for the executor task to drain and exit.
    /// Subsequent submissions are rejected. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.notify.notify_waiters();

        let handle = self.inner.worker.lock().await.take();
        match handle {
            Some(handle) => {
                let _ = handle.await;
                tracing::info!("Batch executor stopped");
            }
            // Never started: give anything queued its final dispatch here.
            None => self.drain_remaining().await,
        }
    }

    /// Submit a request. The returned channel resolves exactly once with the
    /// response; submission itself never blocks on inference while batching
    /// is enabled.
    pub async fn submit(&self, request: InferenceRequest) -> oneshot::Receiver<InferenceResponse> {
        let (tx, rx) = oneshot::channel();

        if !self.inner.config.enabled {
            // Process immediately without batching.
            let response = self.inner.registry.run_inference(&request).await;
            let _ = tx.send(response);
            return rx;
        }

        {
            let mut queue = self.inner.queue.lock().expect("batch queue lock");
            if queue.closed {
                drop(queue);
                let _ = tx.send(InferenceResponse::failure("batch executor stopped"));
                return rx;
            }
            queue.items.push_back(PendingRequest {
                request,
                response_tx: tx,
                enqueued_at: Instant::now(),
            });
        }

        self.inner.notify.notify_one();
        rx
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().map(|q| q.items.len()).unwrap_or(0)
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = self.next_flush_delay();

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = async {
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                } => {}
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            let batch = self.take_ready_batch();
            if !batch.is_empty() {
                self.dispatch(batch).await;
            }
        }

        self.drain_remaining().await;
    }

    /// How long until the flush condition can trigger: zero when a batch is
    /// already due, the oldest item's remaining age otherwise, and no
    /// deadline at all when the queue is empty.
    fn next_flush_delay(&self) -> Option<Duration> {
        let queue = self.inner.queue.lock().expect("batch queue lock");
        let oldest = queue.items.front()?;
        if queue.items.len() >= self.inner.config.min_batch_size {
            return Some(Duration::ZERO);
        }
        let max_wait = Duration::from_millis(self.inner.config.max_wait_ms);
        Some(max_wait.saturating_sub(oldest.enqueued_at.elapsed()))
    }

    /// Move up to `max_batch_size` requests out of the queue, FIFO, when
    /// either the size or the age threshold is met.
    fn take_ready_batch(&self) -> Vec<PendingRequest> {
        let mut queue = self.inner.queue.lock().expect("batch queue lock");

        let oldest_age = match queue.items.front() {
            Some(oldest) => oldest.enqueued_at.elapsed(),
            None => return vec![],
        };

        let max_wait = Duration::from_millis(self.inner.config.max_wait_ms);
        if queue.items.len() < self.inner.config.min_batch_size && oldest_age < max_wait {
            return vec![];
        }

        let take = queue.items.len().min(self.inner.config.max_batch_size);
        queue.items.drain(..take).collect()
    }

    /// Dispatch one batch: partition by model preserving intra-group FIFO
    /// order, run each request, complete its channel. Grouping exists so a
    /// future policy can concatenate a group into a single runtime call.
    async fn dispatch(&self, batch: Vec<PendingRequest>) {
        let batch_start = Instant::now();
        let batch_size = batch.len();
        tracing::debug!("Processing batch of {} requests", batch_size);

        self.inner.metrics.set_active_sessions(batch_size);

        let mut by_model: HashMap<String, Vec<PendingRequest>> = HashMap::new();
        for pending in batch {
            by_model
                .entry(pending.request.model_name.clone())
                .or_default()
                .push(pending);
        }

        for (_, group) in by_model {
            for pending in group {
                let queue_ms = pending.enqueued_at.elapsed().as_secs_f64() * 1000.0;
                let mut response = self.inner.registry.run_inference(&pending.request).await;
                response.queue_time_ms = queue_ms;
                // The receiver may have given up; completion is best-effort.
                let _ = pending.response_tx.send(response);
            }
        }

        self.inner.metrics.set_active_sessions(0);
        self.inner
            .metrics
            .record_batch(batch_size, batch_start.elapsed().as_secs_f64());

        tracing::debug!(
            "Batch of {} requests completed in {:.2}ms",
            batch_size,
            batch_start.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// Final dispatch pass on shutdown; no pending request is dropped. The
    /// queue is closed under the lock the moment it is observed empty.
    async fn drain_remaining(&self) {
        loop {
            let batch: Vec<PendingRequest> = {
                let mut queue = self.inner.queue.lock().expect("batch queue lock");
                if queue.items.is_empty() {
                    queue.closed = true;
                    break;
                }
                let take = queue.items.len().min(self.inner.config.max_batch_size);
                queue.items.drain(..take).collect()
            };
            tracing::info!("Draining {} remaining requests", batch.len());
            self.dispatch(batch).await;
        }
    }
}
