//! The suspension manager (§4.4, §3's `SuspensionContext`): tracks
//! in-flight extension calls against a deadline and races the real
//! extension call against that deadline so a slow/stuck extension can never
//! hold a handler open indefinitely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use panelrt_common::{AsyncResult, SuspensionDetails, SuspensionId};
use tracing::{instrument, warn};

use crate::extension::{ExtensionCallError, ExtensionRegistry};

#[derive(Clone)]
pub struct SuspensionContext {
    pub details: SuspensionDetails,
    pub panel_id: String,
    pub handler_name: String,
    pub created_at: Instant,
    pub deadline: Instant,
    _metrics: Arc<crate::metrics::SuspensionMetricsGuard>,
}

impl std::fmt::Debug for SuspensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspensionContext")
            .field("details", &self.details)
            .field("panel_id", &self.panel_id)
            .field("handler_name", &self.handler_name)
            .field("created_at", &self.created_at)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[derive(Default)]
pub struct SuspensionManager {
    contexts: DashMap<SuspensionId, SuspensionContext>,
}

impl SuspensionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a suspension (§4.6 `register_suspension`), returning the
    /// context so the caller can surface a `PROGRESS` message.
    #[instrument(skip(self))]
    pub fn register(
        &self,
        panel_id: impl Into<String>,
        handler_name: impl Into<String>,
        details: SuspensionDetails,
        timeout: Duration,
    ) -> SuspensionContext {
        let now = Instant::now();
        let ctx = SuspensionContext {
            details,
            panel_id: panel_id.into(),
            handler_name: handler_name.into(),
            created_at: now,
            deadline: now + timeout,
            _metrics: Arc::new(crate::metrics::SuspensionMetricsGuard::new()),
        };
        self.contexts.insert(ctx.details.suspension_id, ctx.clone());
        ctx
    }

    /// Removes and returns the context (§4.6 `complete_suspension`).
    pub fn complete(&self, suspension_id: SuspensionId) -> Option<SuspensionContext> {
        self.contexts.remove(&suspension_id).map(|(_, v)| v)
    }

    pub fn get(&self, suspension_id: SuspensionId) -> Option<SuspensionContext> {
        self.contexts.get(&suspension_id).map(|e| e.clone())
    }

    pub fn open_count_for_panel(&self, panel_id: &str) -> usize {
        self.contexts.iter().filter(|e| e.panel_id == panel_id).count()
    }

    pub fn ids_for_panel(&self, panel_id: &str) -> Vec<SuspensionId> {
        self.contexts
            .iter()
            .filter(|e| e.panel_id == panel_id)
            .map(|e| *e.key())
            .collect()
    }

    /// Invokes the extension, racing it against `ctx.deadline` (§4.4's
    /// "Timeouts" paragraph). A timeout yields the handler-catchable
    /// `AsyncResult::err("suspension timeout")` and drops the in-flight
    /// extension call.
    #[instrument(skip(self, registry))]
    pub async fn call_with_timeout(&self, registry: &ExtensionRegistry, ctx: &SuspensionContext) -> AsyncResult {
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        let call = registry.call(&ctx.details.extension_name, &ctx.details.method_name, ctx.details.args.clone());
        match tokio::time::timeout(remaining, call).await {
            Ok(Ok(value)) => AsyncResult::ok(value),
            Ok(Err(ExtensionCallError::NotFound)) => AsyncResult::err("extension not found"),
            Ok(Err(ExtensionCallError::MethodNotFound)) => AsyncResult::err("extension method not found"),
            Ok(Err(ExtensionCallError::Failed(message))) => AsyncResult::err(message),
            Err(_) => {
                warn!(suspension_id = %ctx.details.suspension_id, "suspension timed out waiting on extension call");
                AsyncResult::err("suspension timeout")
            }
        }
    }

    /// Resolves every open suspension for a panel with a failure result
    /// (§4.6 `destroy_panel`, §5's cancellation policy, §8 invariant 8),
    /// without invoking the extension at all.
    pub fn cancel_panel(&self, panel_id: &str) -> Vec<(SuspensionId, AsyncResult)> {
        self.ids_for_panel(panel_id)
            .into_iter()
            .filter_map(|id| self.contexts.remove(&id))
            .map(|(id, _)| (id, AsyncResult::err("panel destroyed")))
            .collect()
    }
}

pub type SharedSuspensionManager = Arc<SuspensionManager>;

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> SuspensionDetails {
        SuspensionDetails {
            suspension_id: SuspensionId::new(),
            extension_name: "http".to_string(),
            method_name: "get".to_string(),
            args: serde_json::json!({}),
        }
    }

    #[test]
    fn register_then_complete_round_trips() {
        let mgr = SuspensionManager::new();
        let ctx = mgr.register("panel-1", "inc", details(), Duration::from_secs(1));
        let id = ctx.details.suspension_id;
        assert_eq!(mgr.open_count_for_panel("panel-1"), 1);
        assert!(mgr.complete(id).is_some());
        assert_eq!(mgr.open_count_for_panel("panel-1"), 0);
    }

    #[test]
    fn cancel_panel_resolves_every_open_suspension_with_an_error() {
        let mgr = SuspensionManager::new();
        mgr.register("panel-1", "inc", details(), Duration::from_secs(1));
        mgr.register("panel-1", "inc", details(), Duration::from_secs(1));
        let cancelled = mgr.cancel_panel("panel-1");
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|(_, r)| !r.success));
        assert_eq!(mgr.open_count_for_panel("panel-1"), 0);
    }
}
