//! Logging bootstrap and the mutation engine's metrics collector.
//!
//! The collector retains a rolling window of per-execution samples and
//! computes percentile aggregates over an arbitrary time range on demand
//! (spec §4.7). It does not export anywhere by default; the optional
//! `otel` feature adds OpenTelemetry instrument wiring over the same
//! aggregates.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mutation_core::MutationMetrics;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Instant;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// A constant placeholder for `MutationMetrics::state_size` until a
/// serializer-backed estimator is justified (spec §9 open question).
pub const PLACEHOLDER_STATE_SIZE_BYTES: u64 = 0;

/// Errors raised by telemetry bootstrap.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// OTel pipeline construction failed.
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with an env filter.
/// Set `RUST_LOG`, e.g. `info,mutation_engine=debug`.
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// One recorded execution, the unit the collector aggregates over.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub recorded_at_ms: u64,
    pub operation: String,
    pub success: bool,
    pub execution_time_ms: u64,
    pub validation_time_ms: u64,
    pub policy_evaluation_time_ms: u64,
    pub changes_count: u64,
}

impl MetricSample {
    /// Build a sample from an engine-produced [`MutationMetrics`].
    pub fn from_metrics(operation: impl Into<String>, success: bool, m: &MutationMetrics) -> Self {
        Self {
            recorded_at_ms: m.recorded_at_ms,
            operation: operation.into(),
            success,
            execution_time_ms: m.execution_time_ms,
            validation_time_ms: m.validation_time_ms,
            policy_evaluation_time_ms: m.policy_evaluation_time_ms,
            changes_count: m.changes_count,
        }
    }
}

/// A scope opened at the start of one execution, accumulating the
/// sub-timings and placeholders that become a [`MutationMetrics`] once
/// the execution completes (spec §4.7 `MetricsScope`).
///
/// Wall-clock timing starts the moment the scope is created; `build`
/// stops it and folds in whatever was recorded via the setters.
pub struct MetricsScope {
    execution_id: String,
    started_at: Instant,
    validation_time_ms: u64,
    policy_evaluation_time_ms: u64,
    state_size: Option<u64>,
    memory_used: Option<u64>,
    additional_metrics: BTreeMap<String, serde_json::Value>,
}

impl MetricsScope {
    fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            started_at: Instant::now(),
            validation_time_ms: 0,
            policy_evaluation_time_ms: 0,
            state_size: None,
            memory_used: None,
            additional_metrics: BTreeMap::new(),
        }
    }

    /// The execution id this scope was opened for.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record the time spent in the validation phase.
    pub fn set_validation_time_ms(&mut self, ms: u64) {
        self.validation_time_ms = ms;
    }

    /// Record the time spent evaluating policies.
    pub fn set_policy_evaluation_time_ms(&mut self, ms: u64) {
        self.policy_evaluation_time_ms = ms;
    }

    /// Record a state-size estimate. Faithful implementations may pass a
    /// constant (see [`PLACEHOLDER_STATE_SIZE_BYTES`]) until a serializer
    /// is wired in.
    pub fn set_state_size(&mut self, bytes: u64) {
        self.state_size = Some(bytes);
    }

    /// Record a memory-usage estimate, if one is available.
    pub fn set_memory_used(&mut self, bytes: u64) {
        self.memory_used = Some(bytes);
    }

    /// Attach an arbitrary implementation-defined metric.
    pub fn insert_metric(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.additional_metrics.insert(key.into(), value);
    }

    /// Stop the wall clock and produce the finalized [`MutationMetrics`].
    pub fn build(
        self,
        validated_rules: u64,
        evaluated_policies: u64,
        changes_count: u64,
        used_cache: bool,
    ) -> MutationMetrics {
        MutationMetrics {
            recorded_at_ms: mutation_core::ids::now_ms(),
            execution_time_ms: self.started_at.elapsed().as_millis() as u64,
            validation_time_ms: self.validation_time_ms,
            policy_evaluation_time_ms: self.policy_evaluation_time_ms,
            validated_rules,
            evaluated_policies,
            changes_count,
            state_size: self.state_size,
            memory_used: self.memory_used,
            used_cache,
            additional_metrics: self.additional_metrics,
        }
    }
}

/// Percentile and summary aggregate over a window of samples.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_execution_time_ms: u64,
    pub max_execution_time_ms: u64,
    pub mean_execution_time_ms: f64,
    pub p50_execution_time_ms: u64,
    pub p95_execution_time_ms: u64,
    pub p99_execution_time_ms: u64,
    pub total_changes: u64,
    pub throughput_per_second: f64,
}

/// `floor(n * q)` percentile indexing, clamped to the last element.
///
/// With `n < 100` and `q = 0.99` this selects the maximum, the documented
/// edge case: e.g. `n = 10` gives `floor(9.9) = 9`, the last index.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let idx = ((n as f64) * q).floor() as usize;
    sorted[idx.min(n - 1)]
}

/// Thread-safe, in-memory metrics collector.
///
/// Retains every sample for the lifetime of the process; callers wanting
/// bounded memory should periodically snapshot and `clear()`.
#[derive(Default)]
pub struct MetricsCollector {
    samples: RwLock<Vec<MetricSample>>,
}

impl MetricsCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new timing scope for `execution_id`. The wall clock starts
    /// immediately; call [`MetricsScope::build`] once the execution
    /// completes and pass the result to [`record`](Self::record).
    pub fn begin_scope(&self, execution_id: impl Into<String>) -> MetricsScope {
        MetricsScope::new(execution_id)
    }

    /// Record one execution's metrics.
    pub fn record(&self, sample: MetricSample) {
        let mut w = self.samples.write().expect("metrics collector lock poisoned");
        w.push(sample);
    }

    /// The `recorded_at_ms` of the most recently recorded sample, if any.
    pub fn last_recorded_at_ms(&self) -> Option<u64> {
        self.samples.read().expect("metrics collector lock poisoned").iter().map(|s| s.recorded_at_ms).max()
    }

    /// Total number of samples retained.
    pub fn len(&self) -> usize {
        self.samples.read().expect("metrics collector lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all retained samples.
    pub fn clear(&self) {
        self.samples.write().expect("metrics collector lock poisoned").clear();
    }

    /// Aggregate every sample with `recorded_at_ms` in `[from, to]`
    /// (inclusive on both ends).
    pub fn aggregate(&self, from_ms: u64, to_ms: u64) -> AggregateReport {
        let r = self.samples.read().expect("metrics collector lock poisoned");
        let mut times: Vec<u64> = r
            .iter()
            .filter(|s| s.recorded_at_ms >= from_ms && s.recorded_at_ms <= to_ms)
            .map(|s| s.execution_time_ms)
            .collect();
        times.sort_unstable();

        let windowed: Vec<&MetricSample> = r
            .iter()
            .filter(|s| s.recorded_at_ms >= from_ms && s.recorded_at_ms <= to_ms)
            .collect();

        if windowed.is_empty() {
            return AggregateReport::default();
        }

        let success_count = windowed.iter().filter(|s| s.success).count() as u64;
        let total_changes: u64 = windowed.iter().map(|s| s.changes_count).sum();
        let sum: u64 = times.iter().sum();
        let count = windowed.len() as u64;

        // durationSeconds = max(to - from, epsilon); a zero- or negative-width
        // window still yields a finite (if large) throughput rather than a
        // division by zero.
        let duration_ms = to_ms.saturating_sub(from_ms).max(1);
        let throughput_per_second = count as f64 / duration_ms as f64 * 1000.0;

        AggregateReport {
            count,
            success_count,
            failure_count: count - success_count,
            min_execution_time_ms: *times.first().unwrap(),
            max_execution_time_ms: *times.last().unwrap(),
            mean_execution_time_ms: sum as f64 / times.len() as f64,
            p50_execution_time_ms: percentile(&times, 0.50),
            p95_execution_time_ms: percentile(&times, 0.95),
            p99_execution_time_ms: percentile(&times, 0.99),
            total_changes,
            throughput_per_second,
        }
    }

    /// Aggregate over every retained sample, regardless of timestamp.
    pub fn aggregate_all(&self) -> AggregateReport {
        self.aggregate(0, u64::MAX)
    }
}

#[cfg(feature = "otel")]
pub mod otel {
    //! Optional OpenTelemetry export of the same aggregates the in-memory
    //! collector computes. No transport is assumed beyond the standard
    //! OTLP exporter configured via `OTEL_EXPORTER_*` environment
    //! variables.
    use super::MetricsError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Histogram, Meter};
    use opentelemetry_sdk::runtime;

    static HISTOGRAM: OnceCell<Histogram<u64>> = OnceCell::new();

    /// Initialize the OTLP metrics pipeline and the execution-time
    /// histogram instrument. Idempotent.
    pub fn init_otel_metrics(service_name: &str) -> Result<(), MetricsError> {
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| MetricsError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        let meter: Meter = global::meter(service_name.to_string());
        HISTOGRAM.get_or_init(|| {
            meter
                .u64_histogram("mutation.execution_time_ms")
                .with_description("Mutation execution time in milliseconds")
                .init()
        });
        Ok(())
    }

    /// Record one execution time into the OTel histogram, if initialized.
    pub fn record_execution_time(ms: u64) {
        if let Some(h) = HISTOGRAM.get() {
            h.record(ms, &[]);
        }
    }
}
