//! Metrics collection for Lockstep
//!
//! Process-local Prometheus metrics. Nothing here crosses process
//! boundaries; cluster-wide figures go through the collective instead.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Lockstep
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub collective: CollectiveMetrics,
    pub run: RunMetrics,
    pub hub: HubMetrics,
}

/// Collective and barrier metrics
#[derive(Debug, Clone)]
pub struct CollectiveMetrics {
    /// Sum-reductions issued by this process
    pub collectives_total: IntCounter,

    /// Time spent blocked inside a sum-reduction
    pub collective_wait: Histogram,

    /// Barriers passed
    pub barriers_total: IntCounter,

    /// Health checks that ended in a group abort
    pub health_aborts_total: IntCounter,
}

/// Per-run work metrics
#[derive(Debug, Clone)]
pub struct RunMetrics {
    /// Model load duration
    pub model_load_duration: Histogram,

    /// Generation duration per run
    pub generation_duration: Histogram,

    /// Units (tokens) produced
    pub units_produced_total: IntCounter,

    /// External step failures on this rank
    pub external_failures_total: IntCounter,

    /// Memory growth across model load
    pub memory_delta_bytes: IntGauge,
}

/// Reduction hub metrics
#[derive(Debug, Clone)]
pub struct HubMetrics {
    /// Currently connected members
    pub members_connected: IntGauge,

    /// Reductions completed and broadcast
    pub reductions_total: IntCounter,

    /// Faults sent to members
    pub faults_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Collective metrics
        let collectives_total = IntCounter::new(
            "lockstep_collectives_total",
            "Total number of sum-reductions issued"
        ).unwrap();

        let collective_wait = Histogram::with_opts(
            HistogramOpts::new(
                "lockstep_collective_wait_seconds",
                "Time blocked inside a sum-reduction"
            ).buckets(vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0])
        ).unwrap();

        let barriers_total = IntCounter::new(
            "lockstep_barriers_total",
            "Total number of barriers passed"
        ).unwrap();

        let health_aborts_total = IntCounter::new(
            "lockstep_health_aborts_total",
            "Health checks that aborted the group"
        ).unwrap();

        // Run metrics
        let model_load_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lockstep_model_load_duration_seconds",
                "Model load duration in seconds"
            ).buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        let generation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lockstep_generation_duration_seconds",
                "Generation duration in seconds"
            ).buckets(vec![0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
        ).unwrap();

        let units_produced_total = IntCounter::new(
            "lockstep_units_produced_total",
            "Total number of units (tokens) produced"
        ).unwrap();

        let external_failures_total = IntCounter::new(
            "lockstep_external_failures_total",
            "External step failures on this rank"
        ).unwrap();

        let memory_delta_bytes = IntGauge::new(
            "lockstep_memory_delta_bytes",
            "Memory growth across model load"
        ).unwrap();

        // Hub metrics
        let members_connected = IntGauge::new(
            "lockstep_hub_members_connected",
            "Members currently connected to the hub"
        ).unwrap();

        let reductions_total = IntCounter::new(
            "lockstep_hub_reductions_total",
            "Reductions completed by the hub"
        ).unwrap();

        let faults_total = IntCounter::new(
            "lockstep_hub_faults_total",
            "Faults reported by the hub"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(collectives_total.clone())).unwrap();
        registry.register(Box::new(collective_wait.clone())).unwrap();
        registry.register(Box::new(barriers_total.clone())).unwrap();
        registry.register(Box::new(health_aborts_total.clone())).unwrap();

        registry.register(Box::new(model_load_duration.clone())).unwrap();
        registry.register(Box::new(generation_duration.clone())).unwrap();
        registry.register(Box::new(units_produced_total.clone())).unwrap();
        registry.register(Box::new(external_failures_total.clone())).unwrap();
        registry.register(Box::new(memory_delta_bytes.clone())).unwrap();

        registry.register(Box::new(members_connected.clone())).unwrap();
        registry.register(Box::new(reductions_total.clone())).unwrap();
        registry.register(Box::new(faults_total.clone())).unwrap();

        let collective = CollectiveMetrics {
            collectives_total,
            collective_wait,
            barriers_total,
            health_aborts_total,
        };

        let run = RunMetrics {
            model_load_duration,
            generation_duration,
            units_produced_total,
            external_failures_total,
            memory_delta_bytes,
        };

        let hub = HubMetrics {
            members_connected,
            reductions_total,
            faults_total,
        };

        MetricsRegistry {
            registry,
            collective,
            run,
            hub,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
