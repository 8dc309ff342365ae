//! Prometheus metrics for function executions.
//!
//! Only compiled with the `metrics` feature.

use std::sync::atomic::AtomicI64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::audit::HostCallAudit;
use crate::function::FunctionOutput;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `success` or `failed`.
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// [`ErrorKind`](crate::ErrorKind) label, e.g. `timeout`.
    pub error_kind: String,
}

/// Label set for host call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostCallLabels {
    /// `wallet`, `storage`, `oracle` or `http`.
    pub capability: String,
    /// Whether the call succeeded.
    pub success: String,
}

/// Metrics for a sandbox or pool.
pub struct SandboxMetrics {
    /// Executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Histogram,
    /// Peak guest heap per execution, in bytes.
    pub execution_memory_bytes: Histogram,
    /// Failures by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Host capability calls.
    pub host_calls_total: Family<HostCallLabels, Counter>,
    /// Sandboxes currently alive in the pool.
    pub pool_sandboxes_alive: Gauge<i64, AtomicI64>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "funcbox_executions",
            "Total function executions",
            executions_total.clone(),
        );

        let execution_duration_seconds = Histogram::new(
            [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter(),
        );
        registry.register(
            "funcbox_execution_duration_seconds",
            "Function execution duration",
            execution_duration_seconds.clone(),
        );

        let execution_memory_bytes = Histogram::new(
            prometheus_client::metrics::histogram::exponential_buckets(1024.0 * 1024.0, 2.0, 10),
        );
        registry.register(
            "funcbox_execution_memory_bytes",
            "Peak guest heap per execution",
            execution_memory_bytes.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "funcbox_errors",
            "Failed executions by kind",
            errors_total.clone(),
        );

        let host_calls_total = Family::default();
        registry.register(
            "funcbox_host_calls",
            "Host capability calls made by guest code",
            host_calls_total.clone(),
        );

        let pool_sandboxes_alive = Gauge::default();
        registry.register(
            "funcbox_pool_sandboxes_alive",
            "Sandboxes alive in the pool",
            pool_sandboxes_alive.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            execution_memory_bytes,
            errors_total,
            host_calls_total,
            pool_sandboxes_alive,
        }
    }

    /// Record one finished execution.
    pub fn record_execution(&self, output: &FunctionOutput, host_calls: &[HostCallAudit]) {
        let outcome = if output.is_success() { "success" } else { "failed" };
        self.executions_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        self.execution_duration_seconds
            .observe(output.duration.as_secs_f64());
        self.execution_memory_bytes.observe(output.memory_used as f64);
        if let Some(kind) = output.error_kind {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.as_str().to_string(),
                })
                .inc();
        }
        for call in host_calls {
            self.host_calls_total
                .get_or_create(&HostCallLabels {
                    capability: call.capability.clone(),
                    success: call.success.to_string(),
                })
                .inc();
        }
    }
}
