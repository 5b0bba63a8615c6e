//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for queue tests.

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
///
/// // Point a connector at the container
/// let address = redis.connection_string();
///
/// // Inspect queue keys directly
/// let ready = redis.list_len("mail:ready").await;
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses Redis 8 Alpine image by default.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection for direct key inspection
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get the connection string for connectors
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Length of a list key (0 when absent)
    pub async fn list_len(&self, key: &str) -> usize {
        self.connection().llen(key).await.expect("Failed to read list length")
    }

    /// Cardinality of a sorted-set key (0 when absent)
    pub async fn zset_len(&self, key: &str) -> usize {
        self.connection().zcard(key).await.expect("Failed to read sorted set size")
    }

    /// Number of fields in a hash key (0 when absent)
    pub async fn hash_len(&self, key: &str) -> usize {
        self.connection().hlen(key).await.expect("Failed to read hash size")
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
