//! Queue Demo Service
//!
//! A small command-line client for the job queue: run workers, publish jobs,
//! or do both in one process.
//!
//! ## Architecture
//!
//! ```text
//! queue-demo produce ──► Producer (pool of QUEUE_POOL_SIZE connections)
//!                          ↓ publish
//!                        Broker queue (QUEUE_NAME at QUEUE_ADDRESS)
//!                          ↓ reserve
//! queue-demo consume ──► Consumer ──► QUEUE_WORKERS × worker ──► LoggingHandler
//! ```
//!
//! ## Configuration
//!
//! | Variable | Default |
//! |---|---|
//! | `QUEUE_BACKEND` | `redis` (`nats`, `memory`) |
//! | `QUEUE_ADDRESS` | required |
//! | `QUEUE_NAME` | required |
//! | `QUEUE_POOL_SIZE` | `10` |
//! | `QUEUE_WORKERS` | `1` |
//! | `QUEUE_HANDLER_TIMEOUT_SECS` | `600` |
//! | `QUEUE_RESERVE_TIMEOUT_SECS` | `5` |
//! | `APP_ENV` | `development` |

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use job_queue::{
    AnyConnector, Backend, Consumer, Job, JobContext, JobHandler, Producer, QueueSettings, Registry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Consume or produce jobs on a broker-backed work queue"
)]
pub struct Cli {
    /// Broker backend, overriding QUEUE_BACKEND
    #[arg(short, long, global = true)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run workers until interrupted
    Consume {
        /// Number of workers, overriding QUEUE_WORKERS
        #[arg(short, long)]
        workers: Option<usize>,

        /// Report every n-th job as not done so it is retried
        #[arg(long)]
        fail_every: Option<u64>,
    },
    /// Publish jobs and exit
    Produce {
        /// Number of jobs to publish
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Payload prefix; each job gets ` #<n>` appended
        #[arg(short, long, default_value = "hello")]
        message: String,
    },
    /// Publish jobs, then consume them in-process until all are done
    Roundtrip {
        /// Number of jobs to publish
        #[arg(short, long, default_value_t = 10)]
        count: usize,

        /// Number of workers, overriding QUEUE_WORKERS
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

/// Handler that logs each job and reports it done, except every
/// `fail_every`-th call.
pub struct LoggingHandler {
    fail_every: Option<u64>,
    calls: AtomicU64,
    done: watch::Sender<u64>,
}

impl LoggingHandler {
    pub fn new(fail_every: Option<u64>) -> Self {
        Self {
            fail_every: fail_every.filter(|n| *n > 0),
            calls: AtomicU64::new(0),
            done: watch::channel(0).0,
        }
    }

    /// Watch the number of jobs reported done.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.done.subscribe()
    }

    pub fn done_count(&self) -> u64 {
        *self.done.borrow()
    }
}

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn handle(&self, ctx: JobContext, job: Job, attempts: u32) -> bool {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let done = self.fail_every.is_none_or(|every| call % every != 0);

        info!(
            queue = %ctx.queue(),
            job_id = %job.id,
            attempts,
            payload = %job.payload_lossy(),
            done,
            "Handled job"
        );
        if done {
            self.done.send_modify(|count| *count += 1);
        }
        done
    }

    fn name(&self) -> &'static str {
        "logging_handler"
    }
}

/// Run the queue demo
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads queue settings from the environment
/// 3. Installs the Prometheus recorder
/// 4. Runs the selected command, then closes every client it created
///
/// # Errors
///
/// Returns an error if the queue configuration is invalid, a worker cannot
/// be started or any publish fails.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let cli = Cli::parse();

    let mut settings = QueueSettings::from_env().wrap_err("Failed to load queue configuration")?;
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }

    job_queue::init_metrics().wrap_err("Failed to install metrics recorder")?;

    info!(
        backend = %settings.backend,
        address = %settings.address,
        queue = %settings.queue,
        pool_size = settings.pool_size,
        workers = settings.workers,
        handler_timeout = ?settings.handler_timeout,
        "Queue configuration loaded"
    );

    let registry = Registry::new();
    let connector = AnyConnector::for_backend(settings.backend);

    let result = match cli.command {
        Command::Consume { workers, fail_every } => {
            let handler = Arc::new(LoggingHandler::new(fail_every));
            let workers = workers.unwrap_or(settings.workers);
            match consume(&registry, connector, &settings, workers, handler).await {
                Ok(()) => shutdown_signal().await,
                Err(e) => Err(e),
            }
        }
        Command::Produce { count, message } => {
            produce(&registry, connector, &settings, count, &message).await
        }
        Command::Roundtrip { count, workers } => {
            let workers = workers.unwrap_or(settings.workers);
            roundtrip(&registry, connector, &settings, count, workers).await
        }
    };

    let closed = registry.close_all().await;
    debug!(metrics = %job_queue::render_metrics(), "Final metrics");
    info!("Queue demo stopped");
    result?;
    closed?;
    Ok(())
}

/// Start `workers` workers sharing `handler`.
async fn consume(
    registry: &Registry<AnyConnector>,
    connector: AnyConnector,
    settings: &QueueSettings,
    workers: usize,
    handler: Arc<LoggingHandler>,
) -> Result<()> {
    let consumer = registry.consumer(&settings.registry_key(), || {
        Consumer::new(connector, &settings.address, &settings.queue)
            .with_config(settings.worker_config())
    });

    let handler: Arc<dyn JobHandler> = handler;
    for _ in 0..workers.max(1) {
        consumer
            .start_arc(settings.handler_timeout, Arc::clone(&handler))
            .await
            .wrap_err("Failed to start worker")?;
    }

    info!(queue = %settings.queue, workers = consumer.worker_count().await, "Consuming");
    Ok(())
}

/// Publish `count` jobs concurrently through the registry's producer.
async fn produce(
    registry: &Registry<AnyConnector>,
    connector: AnyConnector,
    settings: &QueueSettings,
    count: usize,
    message: &str,
) -> Result<()> {
    let producer = registry
        .producer(&settings.registry_key(), || {
            Producer::new(connector, settings.pool_size, &settings.address, &settings.queue)
        })
        .wrap_err("Failed to create producer")?;

    let mut tasks = JoinSet::new();
    for n in 0..count {
        let producer = Arc::clone(&producer);
        let payload = format!("{message} #{n}");
        tasks.spawn(async move { producer.publish(payload).await });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                warn!(error = %e, "Publish failed");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Publish task failed");
            }
        }
    }

    info!(queue = %settings.queue, published = count - failed, failed, "Finished publishing");
    if failed > 0 {
        eyre::bail!("{failed} of {count} publishes failed");
    }
    Ok(())
}

/// Publish `count` jobs and wait until the workers have handled all of them.
async fn roundtrip(
    registry: &Registry<AnyConnector>,
    connector: AnyConnector,
    settings: &QueueSettings,
    count: usize,
    workers: usize,
) -> Result<()> {
    produce(registry, connector.clone(), settings, count, "roundtrip").await?;

    let handler = Arc::new(LoggingHandler::new(None));
    let mut done = handler.subscribe();
    consume(registry, connector, settings, workers, handler).await?;

    let target = count as u64;
    tokio::select! {
        result = done.wait_for(|n| *n >= target) => {
            result.map(|_| ()).wrap_err("Handler dropped before all jobs were done")?;
            info!(jobs = count, "All jobs handled");
        }
        result = shutdown_signal() => result?,
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
