//! The handler orchestrator (§4.7): drives the execute→suspend→extension
//! call→resume loop and applies interim effects to the Panel Manager
//! between every suspension boundary.

use std::sync::{Arc, Mutex};

use panelrt_common::{EmittedEvent, ExecutionResult, ExecutionStatus, StateMutation, ViewCommand};
use panelrt_sandbox::SharedHost;
use serde_json::Value as Json;
use tracing::{info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::execution_context::ExecutionContext;
use crate::extension::ExtensionRegistry;
use crate::panel::{PanelManager, PanelStatus};
use crate::pool::InterpreterPool;
use crate::suspension::SuspensionManager;

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown panel {0:?}")]
    PanelNotFound(String),
    #[error("panel {panel:?} has no tool named {tool:?}")]
    ToolNotFound { panel: String, tool: String },
    #[error("pool error: {0}")]
    Pool(String),
}

pub struct HandlerOrchestrator {
    pool: Arc<InterpreterPool>,
    suspensions: Arc<SuspensionManager>,
    extensions: Arc<ExtensionRegistry>,
    panels: Arc<PanelManager>,
    config: Arc<RuntimeConfig>,
}

impl HandlerOrchestrator {
    pub fn new(
        pool: Arc<InterpreterPool>,
        suspensions: Arc<SuspensionManager>,
        extensions: Arc<ExtensionRegistry>,
        panels: Arc<PanelManager>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            pool,
            suspensions,
            extensions,
            panels,
            config,
        }
    }

    #[instrument(skip(self, args))]
    pub async fn trigger_tool(&self, panel_id: &str, tool_name: &str, args: Json) -> Result<ExecutionResult, OrchestratorError> {
        if !self.panels.exists(panel_id) {
            return Err(OrchestratorError::PanelNotFound(panel_id.to_string()));
        }
        let Some(tool) = self.panels.tool(panel_id, tool_name) else {
            return Err(OrchestratorError::ToolNotFound {
                panel: panel_id.to_string(),
                tool: tool_name.to_string(),
            });
        };
        let capabilities = self
            .panels
            .capabilities_for_tool(panel_id, &tool)
            .ok_or_else(|| OrchestratorError::PanelNotFound(panel_id.to_string()))?;
        self.run(panel_id, tool_name, &tool.handler_source, capabilities, args).await
    }

    /// Mount/unmount hooks drive the same pipeline with an empty args object
    /// (§4.7's closing paragraph). Returns `None` if the panel declares no
    /// handler for this lifecycle hook — not every panel mounts/unmounts.
    #[instrument(skip(self))]
    pub async fn run_lifecycle_hook(&self, panel_id: &str, hook: &str) -> Option<Result<ExecutionResult, OrchestratorError>> {
        let handler = self.panels.lifecycle_handler(panel_id, hook)?;
        let capabilities = self.panels.capabilities_for_lifecycle(panel_id, &handler)?;
        Some(self.run(panel_id, hook, &handler.source, capabilities, Json::Null).await)
    }

    async fn run(
        &self,
        panel_id: &str,
        handler_name: &str,
        source: &str,
        capabilities: panelrt_common::CapabilitySet,
        args: Json,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let snapshot = self
            .panels
            .state_snapshot(panel_id)
            .ok_or_else(|| OrchestratorError::PanelNotFound(panel_id.to_string()))?;
        let computed_keys = self.panels.computed_keys(panel_id).unwrap_or_default();
        let extensions: Vec<(String, Vec<String>)> = self
            .extensions
            .list()
            .into_iter()
            .map(|name| {
                let methods = self.extensions.methods(&name);
                (name, methods)
            })
            .collect();

        let ctx = ExecutionContext::new(
            panel_id,
            handler_name,
            snapshot,
            computed_keys,
            capabilities,
            self.config.pool.max_host_calls,
            extensions,
        );
        // Kept behind one Arc<Mutex<ExecutionContext>> so the orchestrator
        // can read back host-call counts / accumulated effects by its
        // concrete type, while passing the very same allocation into the
        // sandbox as the trait-object `SharedHost` it actually requires.
        let concrete: Arc<Mutex<ExecutionContext>> = Arc::new(Mutex::new(ctx));
        let host: SharedHost = concrete.clone();

        let timeout = self.config.pool.default_timeout();
        let mut result = self
            .pool
            .execute(source, host.clone(), args, timeout, panel_id)
            .await
            .map_err(|e| OrchestratorError::Pool(e.to_string()))?;

        // Effects carried in the final `ExecutionResult` (spec.md §3, §4.4
        // step 4): every batch drained between yields is folded in here, in
        // emission order, so the caller sees the whole invocation's effects
        // rather than just whatever the last suspend/resume leg produced.
        let mut all_mutations: Vec<StateMutation> = Vec::new();
        let mut all_events: Vec<EmittedEvent> = Vec::new();
        let mut all_view_commands: Vec<ViewCommand> = Vec::new();

        loop {
            let (mutations, events, view_commands) = self.apply_interim_effects(panel_id, &concrete);
            all_mutations.extend(mutations);
            all_events.extend(events);
            all_view_commands.extend(view_commands);

            match result.status {
                ExecutionStatus::Success | ExecutionStatus::Error => {
                    self.patch_metrics(&concrete, &mut result);
                    result.state_mutations = all_mutations;
                    result.events = all_events;
                    result.view_commands = all_view_commands;
                    if result.status == ExecutionStatus::Error {
                        warn!(panel = panel_id, handler = handler_name, error = ?result.error, "handler terminated with an error");
                        if let Some(err) = &result.error {
                            crate::metrics::record_handler_error(err.code);
                        }
                    }
                    return Ok(result);
                }
                ExecutionStatus::Suspended => {
                    let details = result
                        .suspension
                        .clone()
                        .expect("suspended results always carry SuspensionDetails");
                    let suspension_ctx = self.suspensions.register(
                        panel_id,
                        handler_name,
                        details.clone(),
                        self.config.suspension_timeout(),
                    );
                    self.panels.set_status(panel_id, PanelStatus::Suspended);

                    let async_result = self.suspensions.call_with_timeout(&self.extensions, &suspension_ctx).await;
                    self.suspensions.complete(details.suspension_id);
                    if self.suspensions.open_count_for_panel(panel_id) == 0 {
                        self.panels.set_status(panel_id, PanelStatus::Running);
                    }

                    result = self
                        .pool
                        .resume(details.suspension_id, host.clone(), async_result)
                        .await
                        .map_err(|e| OrchestratorError::Pool(e.to_string()))?;
                }
            }
        }
    }

    /// Applies whatever state mutations / events / view commands the
    /// handler accumulated since the last drain, immediately (§4.7's
    /// "Handler Orchestrator applies those interim effects immediately,
    /// then invokes the extension"). Returns the batch actually applied, so
    /// `run()` can fold it into the final `ExecutionResult` in emission
    /// order across the whole suspend/resume loop.
    fn apply_interim_effects(&self, panel_id: &str, host: &Arc<Mutex<ExecutionContext>>) -> (Vec<StateMutation>, Vec<EmittedEvent>, Vec<ViewCommand>) {
        let (mutations, events, view_commands) = host.lock().unwrap().drain_effects();
        let applied = if mutations.is_empty() {
            Vec::new()
        } else {
            match self.panels.apply_mutations(panel_id, &mutations) {
                Ok(applied) => applied,
                Err(err) => {
                    warn!(panel = panel_id, %err, "rejected state mutation from a running handler");
                    Vec::new()
                }
            }
        };
        for event in &events {
            self.panels.emit_event(panel_id, event.clone());
        }
        for command in &view_commands {
            self.panels.broadcast_view_command(panel_id, command);
        }
        (applied, events, view_commands)
    }

    fn patch_metrics(&self, host: &Arc<Mutex<ExecutionContext>>, result: &mut ExecutionResult) {
        let guard = host.lock().unwrap();
        result.metrics.host_calls = guard.host_calls();
        result.metrics.capabilities_inferred = guard.capabilities_inferred();
    }

    /// Pool occupancy/cache-hit stats, for the `GET /health` runtime block
    /// (§6.1).
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Tears down a panel (§4.6 `destroy_panel`): resolves every open
    /// suspension with `panel destroyed` before removing the panel record,
    /// so no in-flight `resume` ever targets a slot this orchestrator has
    /// already forgotten about.
    #[instrument(skip(self))]
    pub fn destroy_panel(&self, panel_id: &str) -> bool {
        for (suspension_id, async_result) in self.suspensions.cancel_panel(panel_id) {
            let _ = async_result; // the frozen interpreter slot is discarded below, not resumed.
            self.pool.discard_suspension(suspension_id);
        }
        let removed = self.panels.destroy_panel(panel_id);
        if removed {
            info!(panel = panel_id, "panel torn down via orchestrator");
        }
        removed
    }
}

/// A convenience constructor exercised by `panelrt-server` to assemble the
/// whole stack from one `RuntimeConfig` (SPEC_FULL.md §2's dependency
/// order, wired bottom-up).
pub fn build_runtime(config: RuntimeConfig) -> anyhow::Result<(Arc<HandlerOrchestrator>, Arc<PanelManager>, Arc<ExtensionRegistry>)> {
    let config = Arc::new(config);
    let pool = InterpreterPool::new(config.pool.clone())?;
    let suspensions = Arc::new(SuspensionManager::new());
    let mut registry = ExtensionRegistry::new();
    if config.http_extension.enabled {
        let http = crate::extension::HttpExtension::new(config.http_extension.clone())?;
        registry
            .register("http", Arc::new(http))
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    let extensions = Arc::new(registry);
    let panels = Arc::new(PanelManager::new(config.computed_max_depth));
    let orchestrator = Arc::new(HandlerOrchestrator::new(
        pool,
        suspensions,
        extensions.clone(),
        panels.clone(),
        config,
    ));
    Ok((orchestrator, panels, extensions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::panel::{PanelConfig, StateSlotConfig, ToolDefinition};
    use panelrt_common::{ErrorCode, PanelType};
    use std::collections::HashMap;

    fn orchestrator() -> (Arc<HandlerOrchestrator>, Arc<PanelManager>) {
        let mut config = RuntimeConfig::default();
        config.http_extension.enabled = false;
        config.pool.min_instances = 1;
        config.pool.max_instances = 2;
        let (orch, panels, _ext) = build_runtime(config).unwrap();
        (orch, panels)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_tool_applies_a_synchronous_state_write() {
        let (orch, panels) = orchestrator();
        let panel_id = panels.create_panel(PanelConfig {
            id: Some("p1".to_string()),
            kind: "demo".to_string(),
            title: None,
            tools: vec![ToolDefinition {
                name: "inc".to_string(),
                handler_source: "export function handler(args) { $state.set('count', $state.get('count') + 1); return 'ok'; }".to_string(),
                trigger: crate::panel::TriggerSpec::Manual,
                description: None,
                declared_capabilities: Some(vec!["state:read:count".to_string(), "state:write:count".to_string()]),
            }],
            initial_state: vec![StateSlotConfig {
                name: "count".to_string(),
                declared_type: PanelType::Number,
                initial: Some(Json::from(0)),
            }],
            computed: vec![],
            lifecycle: HashMap::new(),
            capabilities: None,
            metadata: None,
        });

        let result = orch.trigger_tool(&panel_id, "inc", Json::Null).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(
            result.state_mutations,
            vec![panelrt_common::StateMutation::set("count", Json::from(1))]
        );
        let snapshot = panels.state_snapshot(&panel_id).unwrap();
        assert_eq!(snapshot.get("count"), Some(&Json::from(1.0)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_tool_denies_an_undeclared_capability() {
        let (orch, panels) = orchestrator();
        let panel_id = panels.create_panel(PanelConfig {
            id: Some("p1".to_string()),
            kind: "demo".to_string(),
            title: None,
            tools: vec![ToolDefinition {
                name: "secret".to_string(),
                handler_source: "export function handler(args) { $state.set('secret', 1); return 'ok'; }".to_string(),
                trigger: crate::panel::TriggerSpec::Manual,
                description: None,
                declared_capabilities: Some(vec![]),
            }],
            initial_state: vec![],
            computed: vec![],
            lifecycle: HashMap::new(),
            capabilities: None,
            metadata: None,
        });

        let result = orch.trigger_tool(&panel_id, "secret", Json::Null).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.unwrap().code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn trigger_tool_on_unknown_panel_is_rejected() {
        let (orch, _panels) = orchestrator();
        let err = orch.trigger_tool("does-not-exist", "inc", Json::Null).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PanelNotFound(_)));
    }
}
