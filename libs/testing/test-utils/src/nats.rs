//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream for testing.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
/// JetStream is enabled so work-queue streams can be created.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Point a connector at the container
/// let address = nats.connection_string();
///
/// // Inspect streams directly
/// let messages = nats.stream_messages("MAIL").await;
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    ///
    /// Uses NATS latest image with JetStream (-js flag).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream inspection
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Get the connection string for connectors
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Messages currently stored in `stream` (0 when it does not exist)
    pub async fn stream_messages(&self, stream: &str) -> u64 {
        match self.jetstream().get_stream(stream).await {
            Ok(mut stream) => {
                let info = stream.info().await.expect("Failed to get stream info");
                info.state.messages
            }
            Err(_) => 0,
        }
    }
}

// Container is automatically cleaned up when TestNats is dropped
impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_stream_messages() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        assert_eq!(nats.stream_messages("MAIL").await, 0);

        jetstream
            .create_stream(async_nats::jetstream::stream::Config {
                name: "MAIL".to_string(),
                subjects: vec!["mail".to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        jetstream
            .publish("mail", "hello".into())
            .await
            .unwrap()
            .await
            .unwrap();

        assert_eq!(nats.stream_messages("MAIL").await, 1);
    }
}
