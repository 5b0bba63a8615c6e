//! Queue Demo - Entry Point
//!
//! Consumes or produces jobs on the queue described by `QUEUE_*` variables.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    queue_demo::run().await
}
