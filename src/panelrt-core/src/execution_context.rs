//! `ExecutionContext` (§4.3): the per-invocation snapshot + accumulators
//! that `panelrt-sandbox::HostContext` is implemented against.

use std::collections::HashMap;

use panelrt_common::{CapabilitySet, EmittedEvent, ErrorCode, RuntimeError, StateMutation, ViewCommand};
use panelrt_sandbox::HostContext;
use serde_json::Value as Json;
use tracing::trace;

pub struct ExecutionContext {
    pub panel_id: String,
    pub handler_name: String,
    snapshot: HashMap<String, Json>,
    computed_keys: Vec<String>,
    capabilities: CapabilitySet,
    host_calls: u64,
    max_host_calls: u64,
    extensions: Vec<(String, Vec<String>)>,

    pub mutations: Vec<StateMutation>,
    pub events: Vec<EmittedEvent>,
    pub view_commands: Vec<ViewCommand>,
    pub logs: Vec<(String, String, Option<Json>)>,
}

impl ExecutionContext {
    pub fn new(
        panel_id: impl Into<String>,
        handler_name: impl Into<String>,
        snapshot: HashMap<String, Json>,
        computed_keys: Vec<String>,
        capabilities: CapabilitySet,
        max_host_calls: u64,
        extensions: Vec<(String, Vec<String>)>,
    ) -> Self {
        Self {
            panel_id: panel_id.into(),
            handler_name: handler_name.into(),
            snapshot,
            computed_keys,
            capabilities,
            host_calls: 0,
            max_host_calls,
            extensions,
            mutations: Vec::new(),
            events: Vec::new(),
            view_commands: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn host_calls(&self) -> u64 {
        self.host_calls
    }

    pub fn capabilities_inferred(&self) -> bool {
        self.capabilities.inferred
    }

    /// Drains every accumulator, leaving the context ready for the next
    /// suspend/resume segment (§4.4's "carrying all accumulated
    /// mutations/events/commands since the last yield").
    pub fn drain_effects(&mut self) -> (Vec<StateMutation>, Vec<EmittedEvent>, Vec<ViewCommand>) {
        (
            std::mem::take(&mut self.mutations),
            std::mem::take(&mut self.events),
            std::mem::take(&mut self.view_commands),
        )
    }
}

impl HostContext for ExecutionContext {
    fn state_get(&self, key: &str) -> Option<Json> {
        self.snapshot.get(key).cloned()
    }

    fn state_has(&self, key: &str) -> bool {
        self.snapshot.contains_key(key)
    }

    fn state_keys(&self) -> Vec<String> {
        self.snapshot.keys().cloned().collect()
    }

    fn state_is_computed(&self, key: &str) -> bool {
        self.computed_keys.iter().any(|k| k == key)
    }

    fn check_capability(&mut self, required: &str) -> bool {
        let ok = self.capabilities.check(required);
        trace!(required, ok, "capability check");
        ok
    }

    fn note_host_call(&mut self) -> Result<(), RuntimeError> {
        self.host_calls += 1;
        if self.max_host_calls > 0 && self.host_calls > self.max_host_calls {
            return Err(RuntimeError::new(
                ErrorCode::ResourceLimit,
                format!("host-call limit ({}) exceeded", self.max_host_calls),
            ));
        }
        Ok(())
    }

    fn push_mutation(&mut self, mutation: StateMutation) {
        self.mutations.push(mutation);
    }

    fn push_event(&mut self, event: EmittedEvent) {
        self.events.push(event);
    }

    fn push_view_command(&mut self, command: ViewCommand) {
        self.view_commands.push(command);
    }

    fn push_log(&mut self, level: String, message: String, data: Option<Json>) {
        self.logs.push((level, message, data));
    }

    fn extension_exists(&self, name: &str) -> bool {
        self.extensions.iter().any(|(n, _)| n == name)
    }

    fn extension_has_method(&self, name: &str, method: &str) -> bool {
        self.extensions
            .iter()
            .find(|(n, _)| n == name)
            .is_some_and(|(_, methods)| methods.iter().any(|m| m == method))
    }

    fn now_unix_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelrt_common::CapabilityToken;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "panel-1",
            "inc",
            HashMap::from([("count".to_string(), Json::from(0))]),
            vec![],
            CapabilitySet::declared(vec![CapabilityToken::StateWrite("count".into())]),
            10,
            vec![("http".to_string(), vec!["get".to_string()])],
        )
    }

    #[test]
    fn capability_check_respects_declared_scope() {
        let mut c = ctx();
        assert!(c.check_capability("state:write:count"));
        assert!(!c.check_capability("state:write:secret"));
    }

    #[test]
    fn host_call_limit_trips_resource_limit() {
        let mut c = ctx();
        c.max_host_calls = 2;
        assert!(c.note_host_call().is_ok());
        assert!(c.note_host_call().is_ok());
        assert!(c.note_host_call().is_err());
    }

    #[test]
    fn drain_effects_clears_accumulators() {
        let mut c = ctx();
        c.push_mutation(StateMutation::set("count", Json::from(1)));
        let (muts, _, _) = c.drain_effects();
        assert_eq!(muts.len(), 1);
        assert!(c.mutations.is_empty());
    }
}
