//! Broker adapters.
//!
//! Every broker is reduced to the same capability set: dial a connection,
//! then reserve, acknowledge, release and publish over it. Consumers and
//! producers are generic over [`Connector`]; [`AnyConnector`] picks the
//! concrete adapter at runtime from a [`Backend`].

pub mod memory;
pub mod nats;
pub mod redis;

pub use self::memory::{MemoryBroker, MemoryConnection, MemoryConnector};
pub use self::nats::{NatsConnection, NatsConnector};
pub use self::redis::{RedisConnection, RedisConnector};

use crate::config::Backend;
use crate::error::QueueError;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use std::time::Duration;

/// Dial timeout shared by the network adapters
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Default reservation lease (time-to-run) before the broker redelivers
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// Dials connections to one kind of broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection bound to `queue` at `address`.
    async fn connect(&self, address: &str, queue: &str) -> Result<Self::Connection, QueueError>;

    /// Adapter name for logging
    fn name(&self) -> &'static str;
}

/// A live broker session, exclusively owned by one worker or pool slot.
///
/// `acknowledge` and `release` return [`QueueError::NotFound`] when the
/// broker no longer considers the job reserved by this session. Any other
/// error means the session is unusable and must be closed and redialed.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Wait up to `timeout` for a job. `Ok(None)` on timeout.
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Delete a reserved job.
    async fn acknowledge(&mut self, id: JobId) -> Result<(), QueueError>;

    /// Return a reserved job to the queue, visible again after `delay`.
    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError>;

    /// Enqueue a new job on `queue`.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Tear down the session. Idempotent.
    async fn close(&mut self);
}

/// Runtime-selected connector
#[derive(Clone)]
pub enum AnyConnector {
    Redis(RedisConnector),
    Nats(NatsConnector),
    Memory(MemoryConnector),
}

impl AnyConnector {
    /// Connector for `backend` with default adapter settings.
    ///
    /// `Memory` gets a fresh in-process broker; clone the connector to share it.
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Redis => AnyConnector::Redis(RedisConnector::new()),
            Backend::Nats => AnyConnector::Nats(NatsConnector::new()),
            Backend::Memory => AnyConnector::Memory(MemoryConnector::new()),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            AnyConnector::Redis(_) => Backend::Redis,
            AnyConnector::Nats(_) => Backend::Nats,
            AnyConnector::Memory(_) => Backend::Memory,
        }
    }
}

impl From<RedisConnector> for AnyConnector {
    fn from(connector: RedisConnector) -> Self {
        AnyConnector::Redis(connector)
    }
}

impl From<NatsConnector> for AnyConnector {
    fn from(connector: NatsConnector) -> Self {
        AnyConnector::Nats(connector)
    }
}

impl From<MemoryConnector> for AnyConnector {
    fn from(connector: MemoryConnector) -> Self {
        AnyConnector::Memory(connector)
    }
}

#[async_trait]
impl Connector for AnyConnector {
    type Connection = AnyConnection;

    async fn connect(&self, address: &str, queue: &str) -> Result<AnyConnection, QueueError> {
        Ok(match self {
            AnyConnector::Redis(c) => AnyConnection::Redis(c.connect(address, queue).await?),
            AnyConnector::Nats(c) => AnyConnection::Nats(c.connect(address, queue).await?),
            AnyConnector::Memory(c) => AnyConnection::Memory(c.connect(address, queue).await?),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            AnyConnector::Redis(c) => c.name(),
            AnyConnector::Nats(c) => c.name(),
            AnyConnector::Memory(c) => c.name(),
        }
    }
}

/// Connection produced by [`AnyConnector`]
pub enum AnyConnection {
    Redis(RedisConnection),
    Nats(NatsConnection),
    Memory(MemoryConnection),
}

#[async_trait]
impl Connection for AnyConnection {
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        match self {
            AnyConnection::Redis(c) => c.reserve(timeout).await,
            AnyConnection::Nats(c) => c.reserve(timeout).await,
            AnyConnection::Memory(c) => c.reserve(timeout).await,
        }
    }

    async fn acknowledge(&mut self, id: JobId) -> Result<(), QueueError> {
        match self {
            AnyConnection::Redis(c) => c.acknowledge(id).await,
            AnyConnection::Nats(c) => c.acknowledge(id).await,
            AnyConnection::Memory(c) => c.acknowledge(id).await,
        }
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        match self {
            AnyConnection::Redis(c) => c.release(id, delay).await,
            AnyConnection::Nats(c) => c.release(id, delay).await,
            AnyConnection::Memory(c) => c.release(id, delay).await,
        }
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        match self {
            AnyConnection::Redis(c) => c.publish(queue, payload).await,
            AnyConnection::Nats(c) => c.publish(queue, payload).await,
            AnyConnection::Memory(c) => c.publish(queue, payload).await,
        }
    }

    async fn close(&mut self) {
        match self {
            AnyConnection::Redis(c) => c.close().await,
            AnyConnection::Nats(c) => c.close().await,
            AnyConnection::Memory(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_backend() {
        assert_eq!(AnyConnector::for_backend(Backend::Redis).backend(), Backend::Redis);
        assert_eq!(AnyConnector::for_backend(Backend::Nats).name(), "nats");
        assert_eq!(AnyConnector::for_backend(Backend::Memory).name(), "memory");
    }

    #[tokio::test]
    async fn test_any_connector_dispatches_to_memory() {
        let memory = MemoryConnector::new();
        let broker = memory.broker().clone();
        let connector = AnyConnector::from(memory);

        let mut conn = connector.connect("memory://local", "mail").await.unwrap();
        conn.publish("mail", b"hello").await.unwrap();
        assert_eq!(broker.ready_len("mail"), 1);

        let job = conn.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(job.payload, b"hello");
        conn.acknowledge(job.id).await.unwrap();
        assert_eq!(broker.acks(), vec![job.id]);
        conn.close().await;
    }
}
