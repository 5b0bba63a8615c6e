//! Consumer worker: one connection, one job at a time.
//!
//! The worker loop reserves a job, hands it to the handler in a separate
//! task and waits for the outcome up to the handler deadline. The outcome is
//! applied by the task itself (acknowledge, release with delay, or discard),
//! so a handler that outlives its deadline still settles its job later on
//! whatever connection is live at that moment.
//!
//! ```text
//! Disconnected ──► Connecting ──► Reserving ◄──► Processing
//!      ▲               │              │              │
//!      └───────────────┴──────────────┴──────────────┘   (errors)
//!
//! any ──► Stopped   (explicit stop)
//! ```

use crate::broker::{Connection, Connector};
use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::job::{Job, JobContext, JobHandler, JobId};
use crate::metrics::QueueMetrics;
use crate::retry::{AttemptHistory, RetryAction};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Reserving,
    Processing,
    /// Terminal; reached only through an explicit stop
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;

        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) | (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Reserving) => true,
            (Reserving, Reserving) | (Reserving, Processing) => true,
            (Processing, Reserving) => true,
            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, WorkerState::Reserving | WorkerState::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Reserving => "reserving",
            WorkerState::Processing => "processing",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running the handler once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    NotDone,
    /// Handler panicked; carries the panic message
    Panicked(String),
}

impl HandlerOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, HandlerOutcome::Done)
    }
}

/// What happened to a dispatched job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Released { delay: Duration, attempts: u32 },
    Discarded { attempts: u32 },
}

struct Session<T> {
    conn: Option<T>,
    history: AttemptHistory,
    /// Acknowledgments lost to a dropped connection; replayed on reconnect
    pending_acks: HashSet<JobId>,
    connect_failures: u32,
}

enum Step {
    Idle,
    Job(Job, u32),
    Backoff(Duration),
}

struct Shared<C: Connector> {
    worker_id: String,
    connector: Arc<C>,
    address: String,
    queue: String,
    timeout: Duration,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    session: Mutex<Session<C::Connection>>,
    state: watch::Sender<WorkerState>,
    metrics: QueueMetrics,
}

impl<C: Connector> Shared<C> {
    fn new(
        connector: Arc<C>,
        address: String,
        queue: String,
        config: WorkerConfig,
        timeout: Duration,
        handler: Arc<dyn JobHandler>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Arc::new(Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            metrics: QueueMetrics::new(queue.clone()),
            connector,
            address,
            queue,
            timeout,
            config,
            handler,
            session: Mutex::new(Session {
                conn: None,
                history: AttemptHistory::new(),
                pending_acks: HashSet::new(),
                connect_failures: 0,
            }),
            state,
        })
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue,
            connector = self.connector.name(),
            handler = self.handler.name(),
            timeout_secs = self.timeout.as_secs(),
            "Starting consumer worker"
        );

        while !stop_requested(&stop) {
            match self.next_job().await {
                Step::Idle => {}
                Step::Backoff(delay) => self.pause(delay, &mut stop).await,
                Step::Job(job, attempts) => {
                    let job_id = job.id;
                    match Arc::clone(&self).dispatch(job, attempts).await {
                        Ok(disposition) => {
                            trace!(
                                worker_id = %self.worker_id,
                                job_id = %job_id,
                                ?disposition,
                                "Job settled"
                            );
                        }
                        Err(e) => {
                            warn!(
                                worker_id = %self.worker_id,
                                queue = %self.queue,
                                job_id = %job_id,
                                attempts,
                                error = %e,
                                "Dispatch failed, reconnecting"
                            );
                            self.invalidate().await;
                            self.pause(self.config.dispatch_error_cooldown, &mut stop).await;
                        }
                    }
                }
            }
        }

        self.invalidate().await;
        self.set_state(WorkerState::Stopped);
        info!(worker_id = %self.worker_id, queue = %self.queue, "Consumer worker stopped");
    }

    /// Connect if needed, then wait one reserve timeout for a job.
    async fn next_job(&self) -> Step {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        if session.conn.is_none() {
            self.set_state(WorkerState::Disconnected);
            self.set_state(WorkerState::Connecting);

            if let Err(e) = self.connect(session).await {
                session.connect_failures += 1;
                let failures = session.connect_failures;
                self.metrics.connect_failed();
                self.set_state(WorkerState::Disconnected);

                self.log_connect_failure(failures, &e);

                let delay = if failures > 10 {
                    self.config.connect_cooldown
                } else {
                    self.config.connect_retry_delay
                };
                return Step::Backoff(delay);
            }

            session.connect_failures = 0;
        }
        self.set_state(WorkerState::Reserving);

        let Some(conn) = session.conn.as_mut() else {
            return Step::Idle;
        };
        let reserved = conn.reserve(self.config.reserve_timeout).await;

        match reserved {
            Ok(Some(job)) => {
                let attempts = session.history.get(job.id);
                self.metrics.job_reserved();
                self.set_state(WorkerState::Processing);
                debug!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    job_id = %job.id,
                    attempts,
                    "Job reserved"
                );
                Step::Job(job, attempts)
            }
            Ok(None) => {
                trace!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    "No job within reserve timeout"
                );
                Step::Idle
            }
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    error = %e,
                    "Reserve failed, reconnecting"
                );
                self.disconnect(session).await;
                Step::Backoff(self.config.connect_retry_delay)
            }
        }
    }

    fn log_connect_failure(&self, failures: u32, e: &QueueError) {
        if failures >= 10 {
            error!(
                worker_id = %self.worker_id,
                queue = %self.queue,
                address = %self.address,
                failures,
                error = %e,
                "Connect failed"
            );
        } else if failures >= 3 {
            warn!(
                worker_id = %self.worker_id,
                queue = %self.queue,
                address = %self.address,
                failures,
                error = %e,
                "Connect failed"
            );
        } else {
            info!(
                worker_id = %self.worker_id,
                queue = %self.queue,
                address = %self.address,
                failures,
                error = %e,
                "Connect failed"
            );
        }
    }

    /// Dial, reset attempt history and replay deferred acknowledgments.
    async fn connect(&self, session: &mut Session<C::Connection>) -> Result<(), QueueError> {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue,
            address = %self.address,
            "Connecting consumer"
        );

        let mut conn = self.connector.connect(&self.address, &self.queue).await?;
        session.history.reset();

        let pending: Vec<JobId> = session.pending_acks.iter().copied().collect();
        for id in pending {
            match conn.acknowledge(id).await {
                Ok(()) => {
                    session.pending_acks.remove(&id);
                    self.metrics.job_acknowledged();
                    info!(
                        worker_id = %self.worker_id,
                        queue = %self.queue,
                        job_id = %id,
                        "Replayed acknowledgment"
                    );
                }
                Err(e) if e.is_not_found() => {
                    session.pending_acks.remove(&id);
                    debug!(
                        worker_id = %self.worker_id,
                        job_id = %id,
                        "Deferred acknowledgment already settled by broker"
                    );
                }
                Err(e) => {
                    conn.close().await;
                    return Err(e);
                }
            }
        }

        session.conn = Some(conn);
        info!(worker_id = %self.worker_id, queue = %self.queue, "Consumer connected");
        Ok(())
    }

    /// Run the handler for one job, waiting at most the handler timeout.
    async fn dispatch(self: Arc<Self>, job: Job, attempts: u32) -> Result<Disposition, QueueError> {
        let job_id = job.id;
        let task = tokio::spawn(Arc::clone(&self).process(job, attempts));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(QueueError::Worker(join_error.to_string())),
            Err(_) => {
                self.metrics.handler_timed_out();
                warn!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    job_id = %job_id,
                    attempts,
                    timeout_secs = self.timeout.as_secs(),
                    "Handler exceeded its deadline, abandoning job"
                );
                Err(QueueError::HandlerTimeout {
                    queue: self.queue.clone(),
                    job_id,
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn process(self: Arc<Self>, job: Job, attempts: u32) -> Result<Disposition, QueueError> {
        let ctx = JobContext::new(self.queue.as_str(), job.id, self.timeout);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.handler.handle(ctx, job.clone(), attempts))
            .catch_unwind()
            .await;
        // the hook ran on this thread while unwinding, before catch_unwind returned
        let backtrace = result.is_err().then(take_panic_backtrace).flatten();
        let outcome = match result {
            Ok(true) => HandlerOutcome::Done,
            Ok(false) => HandlerOutcome::NotDone,
            Err(panic) => HandlerOutcome::Panicked(panic_message(panic.as_ref())),
        };
        self.metrics.handler_finished(started.elapsed(), outcome.is_done());

        if let HandlerOutcome::Panicked(message) = &outcome {
            self.metrics.handler_panicked();
            let backtrace = backtrace.map(|bt| bt.to_string()).unwrap_or_default();
            error!(
                worker_id = %self.worker_id,
                queue = %self.queue,
                job_id = %job.id,
                attempts,
                panic = %message,
                backtrace = %backtrace,
                "Handler panicked"
            );
            tokio::time::sleep(self.config.panic_cooldown).await;
        }

        let mut session = self.session.lock().await;
        self.settle(&mut session, &job, outcome.is_done()).await
    }

    async fn settle(
        &self,
        session: &mut Session<C::Connection>,
        job: &Job,
        done: bool,
    ) -> Result<Disposition, QueueError> {
        let id = job.id;

        if done {
            session.history.clear(id);
            self.acknowledge(session, id).await?;
            return Ok(Disposition::Acknowledged);
        }

        let attempts = session.history.record_failure(id);
        match self.config.retry_tiers.next_action(attempts) {
            RetryAction::Release(delay) => {
                self.release(session, id, delay, attempts).await?;
                Ok(Disposition::Released { delay, attempts })
            }
            RetryAction::Discard => {
                warn!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    job_id = %id,
                    attempts,
                    payload = %job.payload_lossy(),
                    "Retries exhausted, discarding job"
                );
                session.history.clear(id);
                self.metrics.job_discarded();
                self.acknowledge(session, id).await?;
                Ok(Disposition::Discarded { attempts })
            }
        }
    }

    async fn acknowledge(
        &self,
        session: &mut Session<C::Connection>,
        id: JobId,
    ) -> Result<(), QueueError> {
        let Some(conn) = session.conn.as_mut() else {
            debug!(
                worker_id = %self.worker_id,
                job_id = %id,
                "No live connection, deferring acknowledgment"
            );
            session.pending_acks.insert(id);
            return Ok(());
        };

        match conn.acknowledge(id).await {
            Ok(()) => {
                self.metrics.job_acknowledged();
                debug!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    job_id = %id,
                    "Job acknowledged"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    worker_id = %self.worker_id,
                    job_id = %id,
                    "Job no longer reserved, acknowledgment skipped"
                );
                Ok(())
            }
            Err(e) => {
                session.pending_acks.insert(id);
                self.disconnect(session).await;
                Err(e)
            }
        }
    }

    async fn release(
        &self,
        session: &mut Session<C::Connection>,
        id: JobId,
        delay: Duration,
        attempts: u32,
    ) -> Result<(), QueueError> {
        let Some(conn) = session.conn.as_mut() else {
            debug!(
                worker_id = %self.worker_id,
                job_id = %id,
                "No live connection, broker will redeliver"
            );
            return Ok(());
        };

        match conn.release(id, delay).await {
            Ok(()) => {
                self.metrics.job_released(delay);
                info!(
                    worker_id = %self.worker_id,
                    queue = %self.queue,
                    job_id = %id,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "Job released for retry"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    worker_id = %self.worker_id,
                    job_id = %id,
                    "Job no longer reserved, release skipped"
                );
                Ok(())
            }
            Err(e) => {
                self.disconnect(session).await;
                Err(e)
            }
        }
    }

    async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        self.disconnect(&mut session).await;
    }

    async fn disconnect(&self, session: &mut Session<C::Connection>) {
        if let Some(mut conn) = session.conn.take() {
            conn.close().await;
            info!(worker_id = %self.worker_id, queue = %self.queue, "Consumer connection closed");
        }
        self.set_state(WorkerState::Disconnected);
    }

    async fn pause(&self, delay: Duration, stop: &mut watch::Receiver<bool>) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                trace!(
                    worker_id = %self.worker_id,
                    from = %current,
                    to = %next,
                    "Ignoring state transition"
                );
                return false;
            }
            *current = next;
            true
        });
    }
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the backtrace of the panicking thread.
///
/// Runs once per process; the previous hook still runs afterwards.
fn install_panic_capture() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_BACKTRACE.try_with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture());
            });
            previous(info);
        }));
    });
}

/// Backtrace recorded by the last panic on this thread, if any.
fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Handle to a running worker.
///
/// Dropping the handle stops the worker after its current iteration; use
/// [`WorkerHandle::stop`] to wait for it to exit.
pub struct WorkerHandle<C: Connector> {
    shared: Arc<Shared<C>>,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WorkerState>,
    join: Option<JoinHandle<()>>,
}

impl<C: Connector> WorkerHandle<C> {
    /// Spawn a worker loop on the current runtime.
    pub fn spawn(
        connector: Arc<C>,
        address: impl Into<String>,
        queue: impl Into<String>,
        config: WorkerConfig,
        timeout: Duration,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        install_panic_capture();

        let shared = Shared::new(
            connector,
            address.into(),
            queue.into(),
            config,
            timeout,
            handler,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let state_rx = shared.state.subscribe();
        let join = tokio::spawn(Arc::clone(&shared).run(stop_rx));

        Self {
            shared,
            stop_tx,
            state_rx,
            join: Some(join),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Recorded failures of `id` on the current connection.
    pub async fn attempts(&self, id: JobId) -> u32 {
        self.shared.session.lock().await.history.get(id)
    }

    /// Acknowledgments waiting for the next successful connect.
    pub async fn pending_acks(&self) -> Vec<JobId> {
        let session = self.shared.session.lock().await;
        let mut pending: Vec<JobId> = session.pending_acks.iter().copied().collect();
        pending.sort();
        pending
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|join| join.is_finished())
    }

    /// Signal the loop to stop and wait for it to exit. Idempotent.
    ///
    /// Fails with [`QueueError::Worker`] if the loop task itself panicked.
    pub async fn stop(&mut self) -> Result<(), QueueError> {
        self.stop_tx.send_replace(true);

        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.await.map_err(|e| {
            error!(worker_id = %self.shared.worker_id, error = %e, "Worker task failed");
            QueueError::Worker(e.to_string())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryConnector};
    use std::backtrace::BacktraceStatus;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const QUEUE: &str = "mail";

    fn fast_config() -> WorkerConfig {
        WorkerConfig::new().with_reserve_timeout(Duration::from_millis(100))
    }

    fn spawn_worker<H: JobHandler>(
        broker: &MemoryBroker,
        config: WorkerConfig,
        timeout: Duration,
        handler: H,
    ) -> WorkerHandle<MemoryConnector> {
        WorkerHandle::spawn(
            Arc::new(MemoryConnector::with_broker(broker.clone())),
            "memory://test",
            QUEUE,
            config,
            timeout,
            Arc::new(handler),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..20_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_state_transitions() {
        use WorkerState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Reserving));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Reserving.can_transition_to(Processing));
        assert!(Reserving.can_transition_to(Reserving));
        assert!(Processing.can_transition_to(Reserving));
        assert!(Processing.can_transition_to(Disconnected));
        assert!(Processing.can_transition_to(Stopped));

        assert!(!Disconnected.can_transition_to(Reserving));
        assert!(!Connecting.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Stopped.can_transition_to(Disconnected));
        assert!(!Stopped.can_transition_to(Connecting));

        assert!(Reserving.is_connected());
        assert!(!Connecting.is_connected());
    }

    #[test]
    fn test_panic_backtrace_recorded_on_panicking_thread() {
        install_panic_capture();
        let _ = take_panic_backtrace();

        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());

        let backtrace = take_panic_backtrace().unwrap();
        assert_eq!(backtrace.status(), BacktraceStatus::Captured);
        assert!(
            backtrace
                .to_string()
                .contains("test_panic_backtrace_recorded_on_panicking_thread")
        );
        assert!(take_panic_backtrace().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_job_is_acknowledged() {
        let broker = MemoryBroker::new();
        let id = broker.push(QUEUE, "hello");

        let handler = |_ctx: JobContext, job: Job, attempts: u32| async move {
            job.payload == b"hello" && attempts == 0
        };
        let mut worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.acks() == vec![id]).await;
        assert_eq!(worker.attempts(id).await, 0);
        assert!(broker.releases().is_empty());

        let mut states = worker.subscribe();
        worker.stop().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);
        assert!(worker.is_finished());
        assert_eq!(broker.job_count(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_retried_after_three_seconds() {
        let broker = MemoryBroker::new();
        let id = broker.push(QUEUE, "explode");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        let handler = move |_ctx: JobContext, _job: Job, attempts: u32| {
            let seen = Arc::clone(&handler_seen);
            async move {
                seen.lock().unwrap().push(attempts);
                if attempts == 0 {
                    panic!("boom");
                }
                true
            }
        };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(60), handler);

        wait_until(|| broker.acks() == vec![id]).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        assert_eq!(broker.releases(), vec![(id, Duration::from_secs(3))]);
        assert_eq!(worker.attempts(id).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_follow_retry_tiers() {
        let broker = MemoryBroker::new();
        let id = broker.push(QUEUE, "flaky");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        let handler = move |_ctx: JobContext, _job: Job, attempts: u32| {
            let seen = Arc::clone(&handler_seen);
            async move {
                seen.lock().unwrap().push(attempts);
                false
            }
        };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.releases().len() >= 2).await;
        let releases = broker.releases();
        assert_eq!(releases[0], (id, Duration::from_secs(3)));
        assert_eq!(releases[1], (id, Duration::from_secs(60)));
        assert_eq!(seen.lock().unwrap()[..2], [0, 1]);
        assert_eq!(worker.attempts(id).await, 2);
        assert!(broker.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_after_max_attempts() {
        let broker = MemoryBroker::new();
        let handler = |_ctx: JobContext, _job: Job, _attempts: u32| async move { false };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| worker.state().is_connected()).await;
        worker.shared.session.lock().await.history.set(JobId::new(1), 77);
        let id = broker.push(QUEUE, "undeliverable");
        assert_eq!(id, JobId::new(1));

        wait_until(|| broker.acks() == vec![id]).await;
        assert!(broker.releases().is_empty());
        assert_eq!(worker.attempts(id).await, 0);
        assert_eq!(broker.job_count(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_returns_timeout_error() {
        let shared = Shared::new(
            Arc::new(MemoryConnector::new()),
            "memory://test".to_string(),
            QUEUE.to_string(),
            fast_config(),
            Duration::from_secs(5),
            Arc::new(|_ctx: JobContext, _job: Job, _attempts: u32| {
                std::future::pending::<bool>()
            }),
        );

        let started = Instant::now();
        let err = Arc::clone(&shared)
            .dispatch(Job::new(7, "stuck"), 0)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(
            matches!(err, QueueError::HandlerTimeout { job_id, .. } if job_id == JobId::new(7))
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_does_not_block_next_job() {
        let broker = MemoryBroker::new();
        let slow = broker.push(QUEUE, "slow");
        let fast = broker.push(QUEUE, "fast");

        let stuck_once = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let (handler_stuck, handler_calls) = (Arc::clone(&stuck_once), Arc::clone(&calls));
        let handler = move |_ctx: JobContext, job: Job, _attempts: u32| {
            let stuck = Arc::clone(&handler_stuck);
            let calls = Arc::clone(&handler_calls);
            async move {
                calls.lock().unwrap().push(job.id);
                if job.payload == b"slow" && stuck.swap(false, Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                true
            }
        };
        let _worker = spawn_worker(&broker, fast_config(), Duration::from_secs(5), handler);

        wait_until(|| broker.acks().len() == 2).await;
        assert_eq!(broker.acks(), vec![slow, fast]);
        assert_eq!(*calls.lock().unwrap(), vec![slow, slow, fast]);
        assert_eq!(broker.connections_opened(), 2);
        assert!(broker.max_outstanding_per_connection() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_backoff_escalates() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(12);

        let started = Instant::now();
        let handler = |_ctx: JobContext, _job: Job, _attempts: u32| async move { true };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.connections_opened() == 1).await;
        let elapsed = started.elapsed();

        // ten 1s retries, then two 10s cool-downs
        assert!(elapsed >= Duration::from_secs(30), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(31), "elapsed {elapsed:?}");
        assert_eq!(broker.connect_attempts(), 13);
        assert!(worker.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_error_redials_after_retry_delay() {
        let broker = MemoryBroker::new();
        let handler = |_ctx: JobContext, _job: Job, _attempts: u32| async move { true };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| worker.state().is_connected()).await;
        assert_eq!(broker.connect_attempts(), 1);

        let started = Instant::now();
        broker.set_available(false);
        wait_until(|| broker.connect_attempts() == 2).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(1), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(!worker.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_is_replayed_after_reconnect() {
        let broker = MemoryBroker::new();
        broker.fail_next_acks(1);
        let id = broker.push(QUEUE, "once");

        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let handler = move |_ctx: JobContext, _job: Job, _attempts: u32| {
            let calls = Arc::clone(&handler_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            }
        };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.acks() == vec![id]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.job_count(QUEUE), 0);
        assert!(worker.pending_acks().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_release_reconnects_and_redelivers() {
        let broker = MemoryBroker::new();
        broker.fail_next_releases(1);
        let id = broker.push(QUEUE, "flaky");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        let handler = move |_ctx: JobContext, _job: Job, attempts: u32| {
            let seen = Arc::clone(&handler_seen);
            async move {
                let mut seen = seen.lock().unwrap();
                seen.push(attempts);
                seen.len() > 1
            }
        };

        let started = Instant::now();
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.acks() == vec![id]).await;

        // the dropped connection requeued the job and the new one starts a fresh history
        assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
        assert!(broker.releases().is_empty());
        assert_eq!(broker.connections_opened(), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(worker.attempts(id).await, 0);
        assert_eq!(broker.job_count(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_of_lost_reservation_keeps_connection() {
        let broker = MemoryBroker::with_lease(Duration::from_secs(1));
        let id = broker.push(QUEUE, "slow");

        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let (handler_started, handler_finished, handler_calls) =
            (Arc::clone(&started), Arc::clone(&finished), Arc::clone(&calls));
        let handler = move |_ctx: JobContext, _job: Job, _attempts: u32| {
            let started = Arc::clone(&handler_started);
            let finished = Arc::clone(&handler_finished);
            let calls = Arc::clone(&handler_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.store(true, Ordering::SeqCst);
                true
            }
        };
        let worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| started.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        // the lease ran out, so another connection takes and completes the job
        let connector = MemoryConnector::with_broker(broker.clone());
        let mut other = connector.connect("memory://test", QUEUE).await.unwrap();
        let taken = other.reserve(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(taken.id, id);
        other.acknowledge(id).await.unwrap();
        let opened = broker.connections_opened();
        assert_eq!(opened, 2);

        wait_until(|| {
            finished.load(Ordering::SeqCst) && worker.state() == WorkerState::Reserving
        })
        .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(broker.connections_opened(), opened);
        assert_eq!(broker.acks(), vec![id]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(worker.pending_acks().await.is_empty());
        assert!(worker.state().is_connected());
        other.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let config = fast_config().with_connect_retry_delay(Duration::from_secs(3600));
        let handler = |_ctx: JobContext, _job: Job, _attempts: u32| async move { true };
        let mut worker = spawn_worker(&broker, config, Duration::from_secs(30), handler);

        wait_until(|| broker.connect_attempts() >= 1).await;
        let started = Instant::now();
        worker.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_are_processed_sequentially() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.push(QUEUE, format!("job-{i}"));
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (handler_in_flight, handler_max) = (Arc::clone(&in_flight), Arc::clone(&max_in_flight));
        let handler = move |_ctx: JobContext, _job: Job, _attempts: u32| {
            let in_flight = Arc::clone(&handler_in_flight);
            let max = Arc::clone(&handler_max);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                true
            }
        };
        let _worker = spawn_worker(&broker, fast_config(), Duration::from_secs(30), handler);

        wait_until(|| broker.acks().len() == 5).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(broker.max_outstanding_per_connection(), 1);
    }
}
