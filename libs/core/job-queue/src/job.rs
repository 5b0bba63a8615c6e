//! Jobs, job identifiers and the handler contract.

use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Broker-assigned job identifier.
///
/// For the Redis work queue this is the value of the queue's id counter, for
/// JetStream it is the stream sequence of the delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reserved job. Immutable once reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub payload: Vec<u8>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, with invalid UTF-8 replaced. Used for log lines.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Per-dispatch context handed to the handler.
///
/// Carries the deadline the worker enforces. Long-running handlers should
/// race their work against [`JobContext::expired`]; the worker stops waiting
/// at the deadline but never cancels the handler itself.
#[derive(Debug, Clone)]
pub struct JobContext {
    queue: String,
    job_id: JobId,
    deadline: Instant,
}

impl JobContext {
    pub fn new(queue: impl Into<String>, job_id: JobId, timeout: Duration) -> Self {
        Self {
            queue: queue.into(),
            job_id,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the worker gives up waiting.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves once the deadline has passed.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

/// User-supplied job handler.
///
/// Return `true` when the job is done (it is acknowledged and deleted) and
/// `false` to schedule a retry according to the worker's retry tiers.
/// `attempts` is the number of failed dispatches of this job recorded on the
/// worker's current connection (0 on first delivery).
///
/// Any `Fn(JobContext, Job, u32) -> impl Future<Output = bool>` is a handler.
///
/// # Example
///
/// ```rust,ignore
/// use job_queue::{Job, JobContext};
///
/// let handler = |ctx: JobContext, job: Job, attempts: u32| async move {
///     tracing::info!(job_id = %job.id, attempts, "delivering");
///     tokio::select! {
///         sent = deliver(&job.payload) => sent.is_ok(),
///         _ = ctx.expired() => false,
///     }
/// };
/// consumer.start(Duration::from_secs(600), handler).await?;
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, job: Job, attempts: u32) -> bool;

    /// Handler name for logging and metrics labels.
    fn name(&self) -> &'static str {
        "job_handler"
    }
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, Job, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, job: Job, attempts: u32) -> bool {
        (self)(ctx, job, attempts).await
    }
}
