//! Producer pool for job enqueuing
//!
//! A fixed number of connection slots guarded by a semaphore. Each publish
//! borrows a slot, dials it lazily, publishes and gives it back. A slot whose
//! connection failed is returned empty and redials on its next borrow.
//!
//! # Example
//!
//! ```rust,ignore
//! use job_queue::{Producer, RedisConnector};
//!
//! let producer = Producer::new(RedisConnector::new(), 10, "redis://127.0.0.1:6379", "mail")?;
//! producer.publish(br#"{"to":"user@example.com"}"#).await?;
//!
//! // on shutdown: waits for in-flight publishes, then closes every connection
//! producer.close().await?;
//! ```

use crate::broker::{Connection, Connector};
use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

struct Slot<C> {
    conn: Option<C>,
}

/// Bounded-concurrency publisher for one queue.
pub struct Producer<K: Connector> {
    connector: Arc<K>,
    address: String,
    queue: String,
    pool_size: usize,
    permits: Semaphore,
    idle: Mutex<Vec<Slot<K::Connection>>>,
    closed: AtomicBool,
    metrics: QueueMetrics,
}

impl<K: Connector> Producer<K> {
    /// Create a pool of `pool_size` lazily dialed connections.
    pub fn new(
        connector: K,
        pool_size: usize,
        address: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<Self, QueueError> {
        if pool_size == 0 {
            return Err(QueueError::Config("producer pool size must be at least 1".to_string()));
        }
        if pool_size > Semaphore::MAX_PERMITS || u32::try_from(pool_size).is_err() {
            return Err(QueueError::Config(format!("producer pool size {pool_size} is too large")));
        }

        let queue = queue.into();
        Ok(Self {
            connector: Arc::new(connector),
            address: address.into(),
            metrics: QueueMetrics::new(queue.clone()),
            queue,
            pool_size,
            permits: Semaphore::new(pool_size),
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            closed: AtomicBool::new(false),
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Slot<K::Connection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Pooled slots currently holding a live connection.
    pub fn idle_connections(&self) -> usize {
        self.idle().iter().filter(|slot| slot.conn.is_some()).count()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue one job. Waits while `pool_size` publishes are in flight.
    pub async fn publish(&self, payload: impl AsRef<[u8]>) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let _permit = self.permits.acquire().await.map_err(|_| QueueError::Closed)?;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let mut slot = self.idle().pop().unwrap_or(Slot { conn: None });
        let result = self.publish_on(&mut slot, payload.as_ref()).await;
        self.idle().push(slot);

        match &result {
            Ok(()) => self.metrics.published(),
            Err(e) => {
                self.metrics.publish_failed();
                warn!(queue = %self.queue, error = %e, "Publish failed");
            }
        }
        result
    }

    async fn publish_on(
        &self,
        slot: &mut Slot<K::Connection>,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        if slot.conn.is_none() {
            debug!(queue = %self.queue, address = %self.address, "Dialing producer connection");
            slot.conn = Some(self.connector.connect(&self.address, &self.queue).await?);
        }
        let Some(conn) = slot.conn.as_mut() else {
            return Err(QueueError::Disconnected);
        };

        if let Err(e) = conn.publish(&self.queue, payload).await {
            if let Some(mut conn) = slot.conn.take() {
                conn.close().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Refuse new publishes, wait for in-flight ones, close every connection.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(queue = %self.queue, pool_size = self.pool_size, "Closing producer");

        // pool_size fits in u32, checked in new()
        let all = self.pool_size as u32;
        if let Ok(permits) = self.permits.acquire_many(all).await {
            permits.forget();
        }

        let slots = std::mem::take(&mut *self.idle());
        let mut closed = 0;
        for slot in slots {
            if let Some(mut conn) = slot.conn {
                conn.close().await;
                closed += 1;
            }
        }
        self.permits.close();

        info!(queue = %self.queue, connections = closed, "Producer closed");
        Ok(())
    }
}
