//! In-process work-queue broker.
//!
//! Follows work-queue semantics: a reserved job belongs to the connection
//! that reserved it, a closed connection returns its reservations to the
//! ready queue, released jobs become ready after their delay and a
//! reservation that outlives its lease is redelivered.
//!
//! Used by unit tests and the demo app. Fault injection hooks let tests drive
//! the worker state machine without network I/O.

use super::{Connection, Connector, DEFAULT_LEASE};
use crate::error::QueueError;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    owner: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    bodies: HashMap<JobId, Vec<u8>>,
    delayed: HashMap<JobId, Instant>,
    reserved: HashMap<JobId, Reservation>,
}

impl QueueState {
    /// Move due delayed jobs and expired reservations back to ready.
    fn promote(&mut self, now: Instant) {
        let mut due: Vec<(Instant, JobId)> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*at, *id))
            .collect();
        due.sort();
        for (_, id) in due {
            self.delayed.remove(&id);
            self.ready.push_back(id);
        }

        let mut expired: Vec<JobId> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable_by(|a, b| b.cmp(a));
        for id in expired {
            self.reserved.remove(&id);
            self.ready.push_front(id);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed
            .values()
            .chain(self.reserved.values().map(|r| &r.deadline))
            .min()
            .copied()
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_connects: u32,
    fail_acks: u32,
    fail_releases: u32,
    publish_latency: Duration,
}

#[derive(Debug, Default)]
struct Stats {
    connect_attempts: u64,
    connections_opened: u64,
    acks: Vec<JobId>,
    releases: Vec<(JobId, Duration)>,
    published: u64,
    max_outstanding: usize,
    publishes_in_flight: usize,
    max_concurrent_publishes: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_id: u64,
    faults: Faults,
    stats: Stats,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn enqueue(&mut self, queue: &str, payload: &[u8]) -> JobId {
        self.next_id += 1;
        let id = JobId::new(self.next_id);
        let q = self.queue(queue);
        q.bodies.insert(id, payload.to_vec());
        q.ready.push_back(id);
        self.stats.published += 1;
        id
    }

    fn outstanding(&self, owner: u64) -> usize {
        self.queues
            .values()
            .flat_map(|q| q.reserved.values())
            .filter(|r| r.owner == owner)
            .count()
    }

    /// Return every reservation held by `owner` to the ready queue.
    fn requeue_owned(&mut self, owner: u64) {
        for q in self.queues.values_mut() {
            let mut owned: Vec<JobId> = q
                .reserved
                .iter()
                .filter(|(_, r)| r.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            owned.sort_unstable_by(|a, b| b.cmp(a));
            for id in owned {
                q.reserved.remove(&id);
                q.ready.push_front(id);
            }
        }
    }
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_connection: AtomicU64,
    lease: Duration,
}

/// Shared in-process broker. Cloning shares the same queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    /// Broker whose reservations are redelivered after `lease`.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_connection: AtomicU64::new(1),
                lease,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // every mutation is single-step, so a poisoned lock is still consistent
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a job without a connection.
    pub fn push(&self, queue: &str, payload: impl AsRef<[u8]>) -> JobId {
        let id = self.state().enqueue(queue, payload.as_ref());
        self.inner.notify.notify_waiters();
        id
    }

    /// Toggle broker reachability. While unavailable, connects fail and live
    /// connections error on their next operation.
    pub fn set_available(&self, available: bool) {
        self.state().faults.unavailable = !available;
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().faults.fail_connects = n;
    }

    /// Drop the connection on each of the next `n` acknowledgments.
    pub fn fail_next_acks(&self, n: u32) {
        self.state().faults.fail_acks = n;
    }

    /// Drop the connection on each of the next `n` releases.
    pub fn fail_next_releases(&self, n: u32) {
        self.state().faults.fail_releases = n;
    }

    /// Delay every publish by `latency` before it is stored.
    pub fn set_publish_latency(&self, latency: Duration) {
        self.state().faults.publish_latency = latency;
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state().stats.connect_attempts
    }

    pub fn connections_opened(&self) -> u64 {
        self.state().stats.connections_opened
    }

    /// Successfully acknowledged job ids, in order.
    pub fn acks(&self) -> Vec<JobId> {
        self.state().stats.acks.clone()
    }

    /// Successful releases with their delays, in order.
    pub fn releases(&self) -> Vec<(JobId, Duration)> {
        self.state().stats.releases.clone()
    }

    pub fn published(&self) -> u64 {
        self.state().stats.published
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn delayed_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.delayed.len()).unwrap_or(0)
    }

    pub fn reserved_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.reserved.len()).unwrap_or(0)
    }

    /// Jobs still stored (ready, delayed or reserved).
    pub fn job_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.bodies.len()).unwrap_or(0)
    }

    /// Largest number of jobs any single connection held reserved at once.
    pub fn max_outstanding_per_connection(&self) -> usize {
        self.state().stats.max_outstanding
    }

    /// Largest number of publishes in progress at once.
    pub fn max_concurrent_publishes(&self) -> usize {
        self.state().stats.max_concurrent_publishes
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector for a [`MemoryBroker`]
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    /// Connector backed by a fresh broker.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, address: &str, queue: &str) -> Result<MemoryConnection, QueueError> {
        let mut state = self.broker.state();
        state.stats.connect_attempts += 1;

        if state.faults.unavailable {
            return Err(QueueError::connect(address, "broker unavailable"));
        }
        if state.faults.fail_connects > 0 {
            state.faults.fail_connects -= 1;
            return Err(QueueError::connect(address, "connection refused"));
        }

        state.stats.connections_opened += 1;
        let id = self.broker.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, queue = %queue, "memory connection opened");

        Ok(MemoryConnection {
            id,
            queue: queue.to_string(),
            broker: self.broker.clone(),
            open: true,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Session on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    queue: String,
    broker: MemoryBroker,
    open: bool,
}

impl MemoryConnection {
    /// Mark the session dead if the broker went away.
    fn check(&mut self, state: &mut BrokerState) -> Result<(), QueueError> {
        if !self.open {
            return Err(QueueError::Disconnected);
        }
        if state.faults.unavailable {
            self.drop_session(state);
            return Err(QueueError::Disconnected);
        }
        Ok(())
    }

    fn drop_session(&mut self, state: &mut BrokerState) {
        if self.open {
            self.open = false;
            state.requeue_owned(self.id);
            self.broker.inner.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;
        let broker = self.broker.clone();
        let inner = Arc::clone(&broker.inner);

        loop {
            // registered before checking so a concurrent push is not missed
            let notified = inner.notify.notified();

            let wakeup = {
                let mut state = broker.state();
                self.check(&mut state)?;

                let now = Instant::now();
                let lease = inner.lease;
                let q = state.queue(&self.queue);
                q.promote(now);

                let mut found = None;
                while let Some(id) = q.ready.pop_front() {
                    if let Some(body) = q.bodies.get(&id) {
                        let payload = body.clone();
                        let reservation = Reservation {
                            owner: self.id,
                            deadline: now + lease,
                        };
                        q.reserved.insert(id, reservation);
                        found = Some(Job::new(id, payload));
                        break;
                    }
                }

                if let Some(job) = found {
                    let outstanding = state.outstanding(self.id);
                    let stats = &mut state.stats;
                    stats.max_outstanding = stats.max_outstanding.max(outstanding);
                    trace!(connection = self.id, job_id = %job.id, "memory job reserved");
                    return Ok(Some(job));
                }

                let q = state.queue(&self.queue);
                q.next_wakeup().map_or(deadline, |at| at.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wakeup) => {}
            }
        }
    }

    async fn acknowledge(&mut self, id: JobId) -> Result<(), QueueError> {
        let broker = self.broker.clone();
        let mut state = broker.state();
        self.check(&mut state)?;

        if state.faults.fail_acks > 0 {
            state.faults.fail_acks -= 1;
            self.drop_session(&mut state);
            return Err(QueueError::Disconnected);
        }

        let owner = self.id;
        let q = state.queue(&self.queue);
        match q.reserved.get(&id).map(|r| r.owner) {
            Some(holder) if holder != owner => return Err(QueueError::NotFound(id)),
            Some(_) => {
                q.reserved.remove(&id);
            }
            None => {
                // unreserved jobs may be deleted by anyone
                let before = q.ready.len();
                q.ready.retain(|queued| *queued != id);
                if q.ready.len() == before && q.delayed.remove(&id).is_none() {
                    return Err(QueueError::NotFound(id));
                }
            }
        }
        q.bodies.remove(&id);
        state.stats.acks.push(id);
        Ok(())
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        let broker = self.broker.clone();
        let mut state = broker.state();
        self.check(&mut state)?;

        if state.faults.fail_releases > 0 {
            state.faults.fail_releases -= 1;
            self.drop_session(&mut state);
            return Err(QueueError::Disconnected);
        }

        let owner = self.id;
        let q = state.queue(&self.queue);
        match q.reserved.get(&id).map(|r| r.owner) {
            Some(holder) if holder == owner => {
                q.reserved.remove(&id);
            }
            _ => return Err(QueueError::NotFound(id)),
        }

        if delay.is_zero() {
            q.ready.push_back(id);
        } else {
            q.delayed.insert(id, Instant::now() + delay);
        }
        state.stats.releases.push((id, delay));
        drop(state);

        broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let broker = self.broker.clone();
        let latency = {
            let mut state = broker.state();
            self.check(&mut state)?;
            let stats = &mut state.stats;
            stats.publishes_in_flight += 1;
            stats.max_concurrent_publishes =
                stats.max_concurrent_publishes.max(stats.publishes_in_flight);
            state.faults.publish_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut state = broker.state();
            state.stats.publishes_in_flight -= 1;
            self.check(&mut state)?;
            state.enqueue(queue, payload);
        }
        broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) {
        let broker = self.broker.clone();
        let mut state = broker.state();
        if self.open {
            debug!(connection = self.id, "memory connection closed");
        }
        self.drop_session(&mut state);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.open {
            let broker = self.broker.clone();
            let mut state = broker.state();
            self.drop_session(&mut state);
        }
    }
}
