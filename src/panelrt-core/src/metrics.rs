//! Metric names and guards for the runtime (SPEC_FULL.md §B).
//!
//! Grounded on the teacher's `sandbox/metrics.rs`: a `Drop`-based guard that
//! increments a gauge and a lifetime counter on creation and decrements the
//! gauge on drop, plus a handful of bare `metrics::counter!`/`histogram!`
//! call sites at the places that aren't naturally "create, then eventually
//! drop" (an execution, a cache hit).

pub static METRIC_PANELS_ACTIVE: &str = "panelrt_panels_active";
pub static METRIC_PANELS_TOTAL: &str = "panelrt_panels_total";
pub static METRIC_SUSPENSIONS_ACTIVE: &str = "panelrt_suspensions_active";
pub static METRIC_EXECUTIONS_TOTAL: &str = "panelrt_executions_total";
pub static METRIC_EXECUTION_TIME_US: &str = "panelrt_execution_time_us";
pub static METRIC_CACHE_HITS_TOTAL: &str = "panelrt_cache_hits_total";
pub static METRIC_HANDLER_ERRORS_TOTAL: &str = "panelrt_handler_errors_total";
pub static METRIC_ERROR_CODE_LABEL: &str = "code";

/// Held for the lifetime of a live `Panel`; mirrors the teacher's
/// `SandboxMetricsGuard<JSSandbox>` (increment gauge + lifetime counter on
/// construction, decrement the gauge on drop).
pub struct PanelMetricsGuard;

impl PanelMetricsGuard {
    pub fn new() -> Self {
        metrics::gauge!(METRIC_PANELS_ACTIVE).increment(1.0);
        metrics::counter!(METRIC_PANELS_TOTAL).increment(1);
        Self
    }
}

impl Default for PanelMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PanelMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_PANELS_ACTIVE).decrement(1.0);
    }
}

/// Held for the lifetime of an open `SuspensionContext`.
pub struct SuspensionMetricsGuard;

impl SuspensionMetricsGuard {
    pub fn new() -> Self {
        metrics::gauge!(METRIC_SUSPENSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SuspensionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuspensionMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_SUSPENSIONS_ACTIVE).decrement(1.0);
    }
}

pub fn record_execution(elapsed_us: u64, cache_hit: bool) {
    metrics::counter!(METRIC_EXECUTIONS_TOTAL).increment(1);
    metrics::histogram!(METRIC_EXECUTION_TIME_US).record(elapsed_us as f64);
    if cache_hit {
        metrics::counter!(METRIC_CACHE_HITS_TOTAL).increment(1);
    }
}

pub fn record_handler_error(code: panelrt_common::ErrorCode) {
    metrics::counter!(METRIC_HANDLER_ERRORS_TOTAL, METRIC_ERROR_CODE_LABEL => format!("{code:?}")).increment(1);
}
