//! Named producers and consumers owned by the application.
//!
//! A [`Registry`] lives in the composition root and is passed by reference to
//! whatever needs a queue. Entries are built once on first request and shared
//! as `Arc`s afterwards.

use crate::broker::Connector;
use crate::consumer::Consumer;
use crate::error::QueueError;
use crate::producer::Producer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

struct Entries<K: Connector> {
    producers: HashMap<String, Arc<Producer<K>>>,
    consumers: HashMap<String, Arc<Consumer<K>>>,
}

/// Map of named [`Producer`]s and [`Consumer`]s sharing one connector type.
///
/// # Example
///
/// ```rust,ignore
/// let registry: Registry<AnyConnector> = Registry::new();
/// let key = settings.registry_key();
/// let producer = registry.producer(&key, || {
///     Producer::new(connector.clone(), settings.pool_size, &settings.address, &settings.queue)
/// })?;
///
/// // on shutdown
/// registry.close_all().await?;
/// ```
pub struct Registry<K: Connector> {
    entries: Mutex<Entries<K>>,
}

impl<K: Connector> Registry<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries<K>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer registered under `name`, building it with `build` if absent.
    ///
    /// A failed build registers nothing.
    pub fn producer<F>(&self, name: &str, build: F) -> Result<Arc<Producer<K>>, QueueError>
    where
        F: FnOnce() -> Result<Producer<K>, QueueError>,
    {
        let mut entries = self.entries();
        if let Some(producer) = entries.producers.get(name) {
            return Ok(Arc::clone(producer));
        }

        let producer = Arc::new(build()?);
        debug!(name = %name, queue = %producer.queue(), "Registered producer");
        entries.producers.insert(name.to_string(), Arc::clone(&producer));
        Ok(producer)
    }

    pub fn get_producer(&self, name: &str) -> Option<Arc<Producer<K>>> {
        self.entries().producers.get(name).cloned()
    }

    /// Consumer registered under `name`, building it with `build` if absent.
    pub fn consumer<F>(&self, name: &str, build: F) -> Arc<Consumer<K>>
    where
        F: FnOnce() -> Consumer<K>,
    {
        let mut entries = self.entries();
        Arc::clone(entries.consumers.entry(name.to_string()).or_insert_with(|| {
            debug!(name = %name, "Registered consumer");
            Arc::new(build())
        }))
    }

    pub fn get_consumer(&self, name: &str) -> Option<Arc<Consumer<K>>> {
        self.entries().consumers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries();
        entries.producers.len() + entries.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and remove every entry. Consumers go first so in-flight jobs
    /// settle before producers drop their connections.
    ///
    /// Every entry is closed even if one fails; the first failure is returned.
    pub async fn close_all(&self) -> Result<(), QueueError> {
        let (producers, consumers) = {
            let mut entries = self.entries();
            (
                std::mem::take(&mut entries.producers),
                std::mem::take(&mut entries.consumers),
            )
        };
        info!(
            producers = producers.len(),
            consumers = consumers.len(),
            "Closing queue registry"
        );

        let mut result = Ok(());
        for (name, consumer) in consumers {
            debug!(name = %name, "Closing consumer");
            if let Err(e) = consumer.close().await {
                warn!(name = %name, error = %e, "Consumer closed with a failed worker");
                result = result.and(Err(e));
            }
        }
        for (name, producer) in producers {
            debug!(name = %name, "Closing producer");
            result = result.and(producer.close().await);
        }
        result
    }
}

impl<K: Connector> Default for Registry<K> {
    fn default() -> Self {
        Self::new()
    }
}
