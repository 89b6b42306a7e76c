/*!
Observability infrastructure for mempool persistence.

- Structured logging setup through `tracing-subscriber`
- Prometheus counters and histograms for dumps and loads (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "mempersist=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<PersistMetrics>> = OnceLock::new();

/// Metrics collection for dump and load operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PersistMetrics {
    pub dumps_total: Counter,
    pub dump_failures_total: Counter,
    pub dump_latency_seconds: Histogram,
    pub file_size_bytes: Histogram,

    pub loads_total: Counter,
    pub transactions_loaded_total: Counter,
    pub transactions_skipped_total: Counter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| PersistError::observability(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| PersistError::observability(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| PersistError::observability(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| PersistError::observability(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl PersistMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let dumps_total = counter(
            &registry,
            "mempersist_dumps_total",
            "Mempool dumps written to disk",
        )?;
        let dump_failures_total = counter(
            &registry,
            "mempersist_dump_failures_total",
            "Mempool dumps that did not reach the disk",
        )?;
        let dump_latency_seconds = histogram(
            &registry,
            HistogramOpts::new(
                "mempersist_dump_latency_seconds",
                "Duration of mempool dumps in seconds",
            ),
        )?;
        let file_size_bytes = histogram(
            &registry,
            HistogramOpts::new("mempersist_file_size_bytes", "Size of written mempool files")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap_or_default()),
        )?;
        let loads_total = counter(
            &registry,
            "mempersist_loads_total",
            "Mempool files loaded at startup",
        )?;
        let transactions_loaded_total = counter(
            &registry,
            "mempersist_transactions_loaded_total",
            "Transactions re-admitted from a mempool file",
        )?;
        let transactions_skipped_total = counter(
            &registry,
            "mempersist_transactions_skipped_total",
            "Transactions in a mempool file that were not re-admitted",
        )?;

        Ok(Self {
            dumps_total,
            dump_failures_total,
            dump_latency_seconds,
            file_size_bytes,
            loads_total,
            transactions_loaded_total,
            transactions_skipped_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// Returns `None` if the registry could not be built; the failure is
    /// logged once and recording becomes a no-op.
    pub fn global() -> Option<&'static PersistMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!("Metrics disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    pub fn record_dump(&self, duration: std::time::Duration, bytes: usize) {
        self.dumps_total.inc();
        self.dump_latency_seconds.observe(duration.as_secs_f64());
        self.file_size_bytes.observe(bytes as f64);
    }

    pub fn record_dump_failure(&self, duration: std::time::Duration) {
        self.dump_failures_total.inc();
        self.dump_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_load(&self, loaded: u64, skipped: u64) {
        self.loads_total.inc();
        self.transactions_loaded_total.inc_by(loaded as f64);
        self.transactions_skipped_total.inc_by(skipped as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PersistError::observability(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            PersistError::observability(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Render all persistence metrics in Prometheus text format
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    PersistMetrics::global()
        .ok_or_else(|| PersistError::observability("metrics registry unavailable"))?
        .gather_metrics()
}

/// Times one dump and records its outcome
#[cfg(feature = "metrics")]
pub struct DumpTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl DumpTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self, bytes: usize) {
        if let Some(metrics) = PersistMetrics::global() {
            metrics.record_dump(self.start.elapsed(), bytes);
        }
    }

    pub fn finish_with_error(self) {
        if let Some(metrics) = PersistMetrics::global() {
            metrics.record_dump_failure(self.start.elapsed());
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over [`DEFAULT_LOG_FILTER`]. With `json` set,
/// events are written as one JSON object per line.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with_filter(json, DEFAULT_LOG_FILTER)
}

/// Install the global tracing subscriber with a custom default filter
pub fn init_observability_with_filter(json: bool, default_filter: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    PersistMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| PersistError::observability(format!("Invalid log filter: {e}")))?;

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
    });
    let text_layer = (!json).then(|| fmt::layer().with_target(false));

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        PersistError::observability(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Mempool persistence logging initialized");
    Ok(())
}
