/*!
Logging setup and Prometheus metrics for persist/restore.

Metrics are compiled in with the `metrics` feature; structured logging is
always available.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "tabpickle=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<PickleMetrics> = OnceLock::new();

/// Counters and histograms for archive operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PickleMetrics {
    pub persist_total: Counter,
    pub restore_total: Counter,
    pub errors_total: Counter,
    /// Restore attempts beyond the first decoding assumption
    pub fallback_attempts_total: Counter,
    /// Archive symbols answered by the legacy registry
    pub legacy_resolutions_total: Counter,
    pub latency_seconds: Histogram,
    pub archive_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> PersistError {
    PersistError::validation(format!("Failed to create metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl PickleMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };
        let persist_total = counter("tabpickle_persist_total", "Archives written")?;
        let restore_total = counter("tabpickle_restore_total", "Archives restored")?;
        let errors_total = counter("tabpickle_errors_total", "Failed persist or restore calls")?;
        let fallback_attempts_total = counter(
            "tabpickle_fallback_attempts_total",
            "Restore attempts under a fallback string decoding",
        )?;
        let legacy_resolutions_total = counter(
            "tabpickle_legacy_resolutions_total",
            "Archive symbols resolved through the legacy registry",
        )?;

        let histogram = |name: &str, help: &str, buckets: Vec<f64>| -> Result<Histogram> {
            let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
                .map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(histogram.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(histogram)
        };
        let latency_seconds = histogram(
            "tabpickle_latency_seconds",
            "Duration of persist and restore calls in seconds",
            prometheus::DEFAULT_BUCKETS.to_vec(),
        )?;
        let archive_size_bytes = histogram(
            "tabpickle_archive_size_bytes",
            "Decompressed archive size in bytes",
            prometheus::exponential_buckets(256.0, 4.0, 10).map_err(|e| metric_error("buckets", e))?,
        )?;

        Ok(Self {
            persist_total,
            restore_total,
            errors_total,
            fallback_attempts_total,
            legacy_resolutions_total,
            latency_seconds,
            archive_size_bytes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> &'static PickleMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize tabpickle metrics"))
    }

    pub fn record_fallback(&self) {
        self.fallback_attempts_total.inc();
    }

    pub fn record_legacy_resolutions(&self, count: usize) {
        self.legacy_resolutions_total.inc_by(count as f64);
    }

    pub fn record_archive_size(&self, size_bytes: usize) {
        self.archive_size_bytes.observe(size_bytes as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PersistError::validation(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| PersistError::validation(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Operation being timed
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Persist,
    Restore,
}

/// Times one persist or restore call and counts it on completion.
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: Operation,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    pub fn start(operation: Operation) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Record latency and count the call.
    pub fn finish(self) {
        let metrics = PickleMetrics::global();
        metrics.latency_seconds.observe(self.start.elapsed().as_secs_f64());
        match self.operation {
            Operation::Persist => metrics.persist_total.inc(),
            Operation::Restore => metrics.restore_total.inc(),
        }
    }

    /// Record latency and an error.
    pub fn finish_with_error(self) {
        let metrics = PickleMetrics::global();
        metrics.latency_seconds.observe(self.start.elapsed().as_secs_f64());
        metrics.errors_total.inc();
    }

    /// Finish according to `result`.
    pub fn finish_with<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.finish(),
            Err(_) => self.finish_with_error(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `json` selects JSON lines over the human-readable format. `RUST_LOG`
/// overrides [`DEFAULT_FILTER`].
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    PickleMetrics::global();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
        )
    };
    installed.map_err(|e| {
        PersistError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("tabpickle observability initialized");
    Ok(())
}

/// Human-readable logging with the default filter
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}
