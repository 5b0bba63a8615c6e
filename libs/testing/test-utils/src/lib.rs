//! Shared test utilities for queue testing
//!
//! This crate provides reusable test infrastructure for broker-backed tests:
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestNats`: NATS container with JetStream enabled (feature: "nats")
//! - `TestDataBuilder`: Deterministic queue names and payloads (always available)
//! - `assertions`: Polling and assertion helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `nats`: Enables NATS JetStream test infrastructure
//! - `all`: Enables all broker test infrastructure
//!
//! # Usage
//!
//! Add the features you need to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_queue_test");
//!
//!     let queue = builder.queue_name("mail");
//!     let address = redis.connection_string();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
pub use nats::TestNats;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Queue names derived from the test name keep parallel tests on one broker
/// from stealing each other's jobs.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_publish_then_consume");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue name valid as a Redis key prefix and a NATS subject
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(255);
    /// assert_eq!(builder.queue_name("mail"), "test_mail_ff");
    /// ```
    pub fn queue_name(&self, prefix: &str) -> String {
        format!("test_{}_{:x}", prefix, self.seed)
    }

    /// Payload for the `n`-th job of a test
    pub fn payload(&self, n: usize) -> Vec<u8> {
        format!("job-{:x}-{}", self.seed, n).into_bytes()
    }

    /// Queue name that is unique across runs, for tests sharing a long-lived broker
    pub fn unique_queue_name(prefix: &str) -> String {
        format!("test_{}_{}", prefix, Uuid::new_v4().simple())
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Poll `condition` every 50ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Assert that `condition` holds within `timeout`
    pub async fn assert_eventually<F>(timeout: Duration, condition: F, context: &str)
    where
        F: FnMut() -> bool,
    {
        assert!(
            eventually(timeout, condition).await,
            "{}: condition not met within {:?}",
            context,
            timeout
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.queue_name("mail"), builder2.queue_name("mail"));
        assert_eq!(builder1.payload(3), builder2.payload(3));
        assert_ne!(builder1.payload(3), builder1.payload(4));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.queue_name("mail"), builder2.queue_name("mail"));
    }

    #[test]
    fn test_unique_queue_names() {
        let a = TestDataBuilder::unique_queue_name("mail");
        let b = TestDataBuilder::unique_queue_name("mail");
        assert!(a.starts_with("test_mail_"));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually() {
        let mut calls = 0;
        let met = assertions::eventually(Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        })
        .await;
        assert!(met);

        let met = assertions::eventually(Duration::from_millis(200), || false).await;
        assert!(!met);
    }
}
