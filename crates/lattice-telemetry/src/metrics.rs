//! Prometheus metrics for the communication core.
//!
//! All metrics follow the naming convention: `lattice_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., messages_sent_total)
//! - **Gauge**: Value that can go up or down (e.g., queue_depth)
//! - **Histogram**: Distribution of values (e.g., delivery_latency_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // MESSAGE BUS METRICS
    // =========================================================================

    /// Total messages accepted by the bus
    pub static ref MESSAGES_SENT: CounterVec = CounterVec::new(
        Opts::new("lattice_bus_messages_sent_total", "Messages accepted by the bus"),
        &["pattern", "source_module"]
    ).expect("metric creation failed");

    /// Total messages delivered to a handler successfully
    pub static ref MESSAGES_DELIVERED: Counter = Counter::new(
        "lattice_bus_messages_delivered_total",
        "Messages delivered to their handler successfully"
    ).expect("metric creation failed");

    /// Failed delivery attempts by error kind
    pub static ref MESSAGES_FAILED: CounterVec = CounterVec::new(
        Opts::new("lattice_bus_messages_failed_total", "Failed delivery attempts"),
        &["error_kind"]
    ).expect("metric creation failed");

    /// Messages parked in the dead letter queue
    pub static ref MESSAGES_DEAD_LETTERED: Counter = Counter::new(
        "lattice_bus_messages_dead_lettered_total",
        "Messages that exhausted their attempt budget"
    ).expect("metric creation failed");

    /// End-to-end delivery latency
    pub static ref DELIVERY_LATENCY: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "lattice_bus_delivery_latency_seconds",
            "Time from enqueue to handler completion"
        ).buckets(exponential_buckets(0.0001, 2.0, 14).unwrap())
    ).expect("metric creation failed");

    /// Current delivery queue depth across all priority lanes
    pub static ref QUEUE_DEPTH: Gauge = Gauge::new(
        "lattice_bus_queue_depth",
        "Messages waiting in the delivery queue"
    ).expect("metric creation failed");

    /// Circuit breakers currently open
    pub static ref BREAKERS_OPEN: Gauge = Gauge::new(
        "lattice_bus_breakers_open",
        "Number of module circuit breakers currently open"
    ).expect("metric creation failed");

    // =========================================================================
    // DISCOVERY METRICS
    // =========================================================================

    /// Capabilities currently advertised
    pub static ref CAPABILITIES_REGISTERED: Gauge = Gauge::new(
        "lattice_discovery_capabilities_registered",
        "Capabilities currently advertised across all modules"
    ).expect("metric creation failed");

    /// Discovery query cache hits
    pub static ref DISCOVERY_CACHE_HITS: Counter = Counter::new(
        "lattice_discovery_cache_hits_total",
        "Discovery queries answered from the cache"
    ).expect("metric creation failed");

    /// Discovery query cache misses
    pub static ref DISCOVERY_CACHE_MISSES: Counter = Counter::new(
        "lattice_discovery_cache_misses_total",
        "Discovery queries that scanned the registry"
    ).expect("metric creation failed");

    // =========================================================================
    // EVENT SYSTEM METRICS
    // =========================================================================

    /// Domain events published to the event bus
    pub static ref EVENTS_PUBLISHED: Counter = Counter::new(
        "lattice_events_published_total",
        "Domain events published to the event bus"
    ).expect("metric creation failed");

    /// Events appended to the event store
    pub static ref EVENTS_APPENDED: Counter = Counter::new(
        "lattice_events_appended_total",
        "Events appended to the event store"
    ).expect("metric creation failed");

    // =========================================================================
    // WORKFLOW METRICS
    // =========================================================================

    /// Workflow executions started
    pub static ref WORKFLOWS_STARTED: Counter = Counter::new(
        "lattice_workflow_executions_started_total",
        "Workflow executions started"
    ).expect("metric creation failed");

    /// Workflow executions finished, by outcome
    pub static ref WORKFLOWS_FINISHED: CounterVec = CounterVec::new(
        Opts::new("lattice_workflow_executions_finished_total", "Workflow executions finished"),
        &["outcome"]  // outcome: completed/failed
    ).expect("metric creation failed");

    /// Workflow step duration
    pub static ref STEP_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "lattice_workflow_step_duration_seconds",
            "Time spent executing workflow steps"
        ).buckets(exponential_buckets(0.001, 2.0, 14).unwrap())
    ).expect("metric creation failed");

    // =========================================================================
    // ERROR METRICS
    // =========================================================================

    /// Errors by module and kind
    pub static ref MODULE_ERRORS: CounterVec = CounterVec::new(
        Opts::new("lattice_module_errors_total", "Errors by module and kind"),
        &["module", "error_kind"]
    ).expect("metric creation failed");
}

/// Handle for the metrics registry
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Bus
        Box::new(MESSAGES_SENT.clone()),
        Box::new(MESSAGES_DELIVERED.clone()),
        Box::new(MESSAGES_FAILED.clone()),
        Box::new(MESSAGES_DEAD_LETTERED.clone()),
        Box::new(DELIVERY_LATENCY.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(BREAKERS_OPEN.clone()),
        // Discovery
        Box::new(CAPABILITIES_REGISTERED.clone()),
        Box::new(DISCOVERY_CACHE_HITS.clone()),
        Box::new(DISCOVERY_CACHE_MISSES.clone()),
        // Events
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_APPENDED.clone()),
        // Workflows
        Box::new(WORKFLOWS_STARTED.clone()),
        Box::new(WORKFLOWS_FINISHED.clone()),
        Box::new(STEP_DURATION.clone()),
        // Errors
        Box::new(MODULE_ERRORS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    #[must_use]
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
