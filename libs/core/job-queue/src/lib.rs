//! Job Queue Client
//!
//! At-least-once job consumers and producers over broker-backed work queues.
//!
//! ## Features
//!
//! - **Supervised workers**: each worker owns one connection and reconnects
//!   with back-off after broker failures
//! - **Tiered retries**: failed jobs are released with a delay that grows with
//!   the number of attempts, and discarded once the last tier is exhausted
//! - **Handler isolation**: panics and per-job timeouts never take a worker down
//! - **Bounded producers**: publishes share a fixed pool of lazily dialed connections
//! - **Backends**: Redis work queues, NATS JetStream and an in-process broker
//! - **Prometheus metrics**: counters and histograms labelled by queue
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{Consumer, Job, JobContext, Producer, RedisConnector};
//! use std::time::Duration;
//!
//! let producer = Producer::new(RedisConnector::new(), 10, "redis://127.0.0.1:6379", "mail")?;
//! producer.publish(b"hello").await?;
//!
//! let consumer = Consumer::new(RedisConnector::new(), "redis://127.0.0.1:6379", "mail");
//! consumer
//!     .start(Duration::from_secs(600), |_ctx: JobContext, job: Job, attempts: u32| async move {
//!         println!("{} (attempt {attempts})", job.payload_lossy());
//!         true
//!     })
//!     .await?;
//!
//! consumer.close().await?;
//! producer.close().await?;
//! ```

pub mod broker;
mod config;
mod consumer;
mod error;
mod job;
pub mod metrics;
mod producer;
mod registry;
mod retry;
mod worker;

// Re-export main types
pub use broker::{
    AnyConnection, AnyConnector, Connection, Connector, MemoryBroker, MemoryConnector,
    NatsConnector, RedisConnector,
};
pub use config::{Backend, QueueSettings, WorkerConfig};
pub use consumer::Consumer;
pub use error::{ErrorCategory, QueueError};
pub use job::{Job, JobContext, JobHandler, JobId};
pub use metrics::{QueueMetrics, init_metrics, render_metrics};
pub use producer::Producer;
pub use registry::Registry;
pub use retry::{AttemptHistory, RetryAction, RetryTier, RetryTiers};
pub use worker::{Disposition, HandlerOutcome, WorkerHandle, WorkerState};
