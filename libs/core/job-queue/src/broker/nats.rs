//! JetStream pull-consumer adapter.
//!
//! Queue `q` maps to a stream bound to subject `q` and a durable pull
//! consumer `<STREAM>_workers` shared by every worker of the queue. The job
//! id is the message's stream sequence; delivered messages stay in the
//! connection's in-flight table until acknowledged or released.

use super::{Connection, Connector, DEFAULT_LEASE, DIAL_TIMEOUT};
use crate::error::QueueError;
use crate::job::{Job, JobId};
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

type PullConsumer = jetstream::consumer::Consumer<ConsumerConfig>;

/// Shortest pull request expiry sent to the server.
const MIN_PULL_EXPIRY: Duration = Duration::from_millis(10);

/// Stream name for a queue subject: `.` and `:` become `_`, upper-cased.
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| match c {
            '.' | ':' | '*' | '>' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Durable consumer name shared by all workers of a queue.
pub fn durable_name(queue: &str) -> String {
    format!("{}_workers", stream_name(queue))
}

/// Dials [`NatsConnection`]s
#[derive(Debug, Clone)]
pub struct NatsConnector {
    lease: Duration,
}

impl NatsConnector {
    pub fn new() -> Self {
        Self {
            lease: DEFAULT_LEASE,
        }
    }

    /// Ack wait of the durable consumer; unacknowledged jobs are redelivered after it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn ensure_stream(
        &self,
        js: &Context,
        queue: &str,
    ) -> Result<jetstream::stream::Stream, QueueError> {
        let name = stream_name(queue);
        match js.get_stream(&name).await {
            Ok(stream) => {
                debug!(stream = %name, "Stream already exists");
                Ok(stream)
            }
            Err(_) => {
                info!(stream = %name, subject = %queue, "Creating stream");
                js.create_stream(StreamConfig {
                    name: name.clone(),
                    subjects: vec![queue.to_string()],
                    ..Default::default()
                })
                .await
                .map_err(QueueError::nats)
            }
        }
    }

    async fn ensure_consumer(
        &self,
        stream: &jetstream::stream::Stream,
        queue: &str,
    ) -> Result<PullConsumer, QueueError> {
        let durable = durable_name(queue);
        stream
            .get_or_create_consumer(
                &durable,
                ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.lease,
                    max_deliver: -1,
                    filter_subject: queue.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(QueueError::nats)
    }
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Connection = NatsConnection;

    async fn connect(&self, address: &str, queue: &str) -> Result<NatsConnection, QueueError> {
        info!(address = %address, queue = %queue, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(DIAL_TIMEOUT)
            .connect(address)
            .await
            .map_err(|e| QueueError::connect(address, e))?;

        let js = jetstream::new(client.clone());
        let stream = self
            .ensure_stream(&js, queue)
            .await
            .map_err(|e| QueueError::connect(address, e))?;
        let consumer = self
            .ensure_consumer(&stream, queue)
            .await
            .map_err(|e| QueueError::connect(address, e))?;

        Ok(NatsConnection {
            client: Some(client),
            js,
            consumer,
            in_flight: HashMap::new(),
        })
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

/// Session on a JetStream queue
pub struct NatsConnection {
    client: Option<async_nats::Client>,
    js: Context,
    consumer: PullConsumer,
    in_flight: HashMap<JobId, jetstream::Message>,
}

impl NatsConnection {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.client.is_none() {
            return Err(QueueError::Disconnected);
        }
        Ok(())
    }

    /// Messages delivered on this connection and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;

        // a batch request waits on the server until a message arrives or it expires
        let mut messages = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(timeout.max(MIN_PULL_EXPIRY))
            .messages()
            .await
            .map_err(QueueError::nats)?;

        let Some(next) = messages.next().await else {
            return Ok(None);
        };
        let message = next.map_err(QueueError::nats)?;
        let sequence = message.info().map_err(QueueError::nats)?.stream_sequence;

        let id = JobId::new(sequence);
        let job = Job::new(id, message.payload.to_vec());
        self.in_flight.insert(id, message);
        Ok(Some(job))
    }

    async fn acknowledge(&mut self, id: JobId) -> Result<(), QueueError> {
        self.ensure_open()?;
        let message = self.in_flight.remove(&id).ok_or(QueueError::NotFound(id))?;
        message.ack().await.map_err(QueueError::nats)
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let message = self.in_flight.remove(&id).ok_or(QueueError::NotFound(id))?;
        let kind = if delay.is_zero() {
            AckKind::Nak(None)
        } else {
            AckKind::Nak(Some(delay))
        };
        message.ack_with(kind).await.map_err(QueueError::nats)
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.ensure_open()?;

        let ack = self
            .js
            .publish(queue.to_string(), payload.to_vec().into())
            .await
            .map_err(QueueError::nats)?
            .await
            .map_err(QueueError::nats)?;

        debug!(queue = %queue, sequence = ack.sequence, "Published job");
        Ok(())
    }

    async fn close(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        // unsettled deliveries go straight back instead of waiting out the ack wait
        for (id, message) in self.in_flight.drain() {
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                debug!(job_id = %id, error = %e, "Failed to return in-flight job");
            }
        }

        if let Err(e) = client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
        debug!("NATS connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_sanitized() {
        assert_eq!(stream_name("orders.created"), "ORDERS_CREATED");
        assert_eq!(stream_name("mail:outbox"), "MAIL_OUTBOX");
        assert_eq!(durable_name("mail"), "MAIL_workers");
    }

    #[test]
    fn test_connector_lease() {
        let connector = NatsConnector::new().with_lease(Duration::from_secs(45));
        assert_eq!(connector.lease, Duration::from_secs(45));
        assert_eq!(NatsConnector::default().lease, DEFAULT_LEASE);
    }

    #[tokio::test]
    #[ignore] // Requires actual NATS with JetStream
    async fn test_reserve_roundtrip() {
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
        let queue = format!("test.{}", uuid::Uuid::new_v4().simple());

        let mut conn = NatsConnector::new().connect(&nats_url, &queue).await.unwrap();
        conn.publish(&queue, b"hello").await.unwrap();

        let job = conn.reserve(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(job.payload, b"hello");
        assert_eq!(conn.in_flight(), 1);
        conn.acknowledge(job.id).await.unwrap();
        assert!(conn.acknowledge(job.id).await.unwrap_err().is_not_found());
    }
}
