//! Shared application state handed to every axum handler, assembled once at
//! startup by `build_runtime` (panelrt-core's `orchestrator::build_runtime`).

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use panelrt_core::{ExtensionRegistry, HandlerOrchestrator, PanelManager, RuntimeConfig};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<HandlerOrchestrator>,
    pub panels: Arc<PanelManager>,
    pub extensions: Arc<ExtensionRegistry>,
    pub config: Arc<RuntimeConfig>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
