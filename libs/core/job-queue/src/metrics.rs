//! Prometheus metrics for queue consumers and producers

use crate::error::QueueError;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the same handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, QueueError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| {
                QueueError::Config(format!("failed to install Prometheus recorder: {e}"))
            })?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn job_reserved(&self) {
        counter!("job_queue_jobs_reserved_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn job_acknowledged(&self) {
        counter!("job_queue_jobs_acknowledged_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn job_released(&self, delay: Duration) {
        counter!(
            "job_queue_jobs_released_total",
            "queue" => self.queue.clone(),
            "delay" => delay.as_secs().to_string()
        )
        .increment(1);
    }

    pub fn job_discarded(&self) {
        counter!("job_queue_jobs_discarded_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn handler_panicked(&self) {
        counter!("job_queue_handler_panics_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn handler_timed_out(&self) {
        counter!("job_queue_handler_timeouts_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record how long a handler ran and whether it reported success
    pub fn handler_finished(&self, duration: Duration, done: bool) {
        histogram!(
            "job_queue_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "status" => if done { "done" } else { "not_done" }
        )
        .record(duration.as_secs_f64());
    }

    pub fn connect_failed(&self) {
        counter!("job_queue_connect_failures_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn published(&self) {
        counter!("job_queue_published_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn publish_failed(&self) {
        counter!("job_queue_publish_failures_total", "queue" => self.queue.clone()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    type Recorded = (String, Vec<(String, String)>, DebugValue);
    type Snapshot = Vec<Recorded>;

    /// Run `f` against a thread-local recorder and return what it recorded.
    fn record(f: impl FnOnce()) -> Snapshot {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let key = key.key();
                let labels = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.name().to_string(), labels, value)
            })
            .collect()
    }

    fn find<'a>(snapshot: &'a Snapshot, name: &str) -> &'a Recorded {
        snapshot
            .iter()
            .find(|(n, _, _)| n == name)
            .unwrap_or_else(|| panic!("metric {name} not recorded"))
    }

    fn label<'a>(labels: &'a [(String, String)], key: &str) -> Option<&'a str> {
        labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_counters_are_labelled_by_queue() {
        let snapshot = record(|| {
            let metrics = QueueMetrics::new("mail");
            metrics.job_reserved();
            metrics.job_reserved();
            metrics.job_acknowledged();
            metrics.job_discarded();
            metrics.connect_failed();
            metrics.published();
            metrics.publish_failed();
        });

        let (_, labels, value) = find(&snapshot, "job_queue_jobs_reserved_total");
        assert_eq!(label(labels, "queue"), Some("mail"));
        assert!(matches!(value, DebugValue::Counter(2)));

        for name in [
            "job_queue_jobs_acknowledged_total",
            "job_queue_jobs_discarded_total",
            "job_queue_connect_failures_total",
            "job_queue_published_total",
            "job_queue_publish_failures_total",
        ] {
            let (_, labels, value) = find(&snapshot, name);
            assert_eq!(label(labels, "queue"), Some("mail"), "{name}");
            assert!(matches!(value, DebugValue::Counter(1)), "{name}");
        }
    }

    #[test]
    fn test_release_records_delay_label() {
        let snapshot = record(|| {
            QueueMetrics::new("mail").job_released(Duration::from_secs(60));
        });

        let (_, labels, value) = find(&snapshot, "job_queue_jobs_released_total");
        assert_eq!(label(labels, "queue"), Some("mail"));
        assert_eq!(label(labels, "delay"), Some("60"));
        assert!(matches!(value, DebugValue::Counter(1)));
    }

    #[test]
    fn test_handler_duration_histogram_by_status() {
        let snapshot = record(|| {
            let metrics = QueueMetrics::new("mail");
            metrics.handler_finished(Duration::from_millis(250), true);
            metrics.handler_finished(Duration::from_millis(500), false);
            metrics.handler_panicked();
            metrics.handler_timed_out();
        });

        let histograms: Vec<_> = snapshot
            .iter()
            .filter(|(n, _, _)| n == "job_queue_handler_duration_seconds")
            .collect();
        assert_eq!(histograms.len(), 2);
        for (_, labels, value) in histograms {
            assert_eq!(label(labels, "queue"), Some("mail"));
            let DebugValue::Histogram(samples) = value else {
                panic!("expected a histogram");
            };
            let expected = match label(labels, "status") {
                Some("done") => 0.25,
                Some("not_done") => 0.5,
                other => panic!("unexpected status {other:?}"),
            };
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].into_inner(), expected);
        }

        assert!(matches!(
            find(&snapshot, "job_queue_handler_panics_total").2,
            DebugValue::Counter(1)
        ));
        assert!(matches!(
            find(&snapshot, "job_queue_handler_timeouts_total").2,
            DebugValue::Counter(1)
        ));
    }

    #[test]
    fn test_render_without_init_is_empty() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
    }
}
