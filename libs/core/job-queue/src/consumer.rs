//! Consumer: supervises independent workers on one queue.

use crate::broker::Connector;
use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::job::JobHandler;
use crate::worker::{WorkerHandle, WorkerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

struct Workers<K: Connector> {
    closed: bool,
    handles: Vec<WorkerHandle<K>>,
}

/// Fan-out consumer for one queue.
///
/// Every [`Consumer::start`] call spawns one more worker with its own
/// connection. Workers share nothing but the connector, so jobs are processed
/// concurrently across workers and strictly sequentially within one.
///
/// # Example
///
/// ```rust,ignore
/// let consumer = Consumer::new(RedisConnector::new(), "redis://127.0.0.1:6379", "mail");
/// let handler = |_ctx: JobContext, job: Job, _attempts: u32| async move {
///     send_mail(&job.payload).await.is_ok()
/// };
/// consumer.start(Duration::from_secs(600), handler).await?;
///
/// // on shutdown
/// consumer.close().await?;
/// ```
pub struct Consumer<K: Connector> {
    connector: Arc<K>,
    address: String,
    queue: String,
    config: WorkerConfig,
    workers: Mutex<Workers<K>>,
}

impl<K: Connector> Consumer<K> {
    pub fn new(connector: K, address: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            connector: Arc::new(connector),
            address: address.into(),
            queue: queue.into(),
            config: WorkerConfig::default(),
            workers: Mutex::new(Workers {
                closed: false,
                handles: Vec::new(),
            }),
        }
    }

    /// Timing knobs for workers started after this call.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Spawn one worker running `handler` with a per-job deadline of `timeout`.
    pub async fn start<H: JobHandler>(
        &self,
        timeout: Duration,
        handler: H,
    ) -> Result<(), QueueError> {
        self.start_arc(timeout, Arc::new(handler)).await
    }

    /// Like [`Consumer::start`], sharing one handler instance between workers.
    pub async fn start_arc(
        &self,
        timeout: Duration,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if timeout.is_zero() {
            return Err(QueueError::Config(
                "handler timeout must be greater than zero".to_string(),
            ));
        }

        let mut workers = self.workers.lock().await;
        if workers.closed {
            return Err(QueueError::Closed);
        }

        let handle = WorkerHandle::spawn(
            Arc::clone(&self.connector),
            self.address.clone(),
            self.queue.clone(),
            self.config.clone(),
            timeout,
            handler,
        );
        info!(
            queue = %self.queue,
            worker_id = %handle.worker_id(),
            workers = workers.handles.len() + 1,
            "Consumer worker started"
        );
        workers.handles.push(handle);
        Ok(())
    }

    /// Stop every worker and wait for each to exit. Idempotent.
    ///
    /// Every worker is stopped even if one of them failed; the first failure
    /// is returned.
    pub async fn close(&self) -> Result<(), QueueError> {
        let mut workers = self.workers.lock().await;
        if workers.closed {
            return Ok(());
        }
        workers.closed = true;

        info!(queue = %self.queue, workers = workers.handles.len(), "Closing consumer");
        let mut result = Ok(());
        for handle in workers.handles.iter_mut() {
            if let Err(e) = handle.stop().await {
                result = result.and(Err(e));
            }
        }
        info!(queue = %self.queue, "Consumer closed");
        result
    }

    pub async fn is_closed(&self) -> bool {
        self.workers.lock().await.closed
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.handles.len()
    }

    pub async fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.lock().await.handles.iter().map(|h| h.state()).collect()
    }
}
