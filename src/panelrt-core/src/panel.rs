//! The panel manager (§4.6): panel lifecycle, client registry, fan-out.
//!
//! Grounded on the teacher's `JSSandbox`/`LoadedJSSandbox` one-shot
//! lifecycle wrappers for the *shape* of "create, use, destroy exactly
//! once" state machines, generalized here to a concurrent map of many
//! long-lived panels rather than one sandbox per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use panelrt_common::{CapabilitySet, EmittedEvent, PanelType, StateMutation};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, instrument};

use crate::state::{PanelState, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelStatus {
    Initializing,
    Running,
    Suspended,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerSpec {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "interval")]
    Interval { ms: u64 },
    #[serde(rename = "event")]
    Event { pattern: String },
    #[serde(rename = "cron")]
    Cron { expression: String },
    #[serde(rename = "state_change")]
    StateChange { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub handler_source: String,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub declared_capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDefinition {
    pub source: String,
    #[serde(default)]
    pub declared_capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSlotConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: PanelType,
    #[serde(default)]
    pub initial: Option<Json>,
}

/// `POST /panels` request body (§6.3).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub initial_state: Vec<StateSlotConfig>,
    #[serde(default)]
    pub computed: Vec<(String, String)>,
    #[serde(default)]
    pub lifecycle: HashMap<String, HandlerDefinition>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Json>,
}

/// `{type:"RESULT"|"PATCH"|"EVENT"|"PROGRESS"|"ERROR"|"PONG"|"CONNECTED", ...}`
/// (§6.2). `serde(tag = "type")` matches the wire shape verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTED")]
    Connected { panel_id: String, state: Json },
    #[serde(rename = "RESULT")]
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: panelrt_common::ExecutionResult,
    },
    #[serde(rename = "PATCH")]
    Patch { mutations: Vec<StateMutation> },
    #[serde(rename = "EVENT")]
    Event { event: EmittedEvent },
    #[serde(rename = "COMMAND")]
    Command { command: panelrt_common::ViewCommand },
    #[serde(rename = "PROGRESS")]
    Progress {
        suspension_id: panelrt_common::SuspensionId,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Json>,
    },
    #[serde(rename = "ERROR")]
    Error { code: panelrt_common::ErrorCode, message: String },
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "STATUS")]
    Status { status: PanelStatus },
}

/// The WebSocket close codes this runtime uses (SPEC_FULL.md §C): 1000 for
/// `destroy_panel`'s graceful teardown, 1011 for a server-initiated
/// abnormal teardown (e.g. forced destruction after a stuck suspension).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1011;

/// A registered WebSocket subscriber. `panelrt-server` implements this over
/// an axum socket sender half; kept as a trait here so this crate never
/// depends on axum.
pub trait ClientSink: Send + Sync {
    fn id(&self) -> u64;
    fn send(&self, message: &ServerMessage);
    fn topics(&self) -> Vec<String>;
    fn subscribe(&self, topic: &str);
    fn unsubscribe(&self, topic: &str);
    fn close(&self, code: u16, reason: &str);
}

pub struct Panel {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
    pub status: PanelStatus,
    pub tools: HashMap<String, ToolDefinition>,
    pub lifecycle: HashMap<String, HandlerDefinition>,
    pub capabilities: CapabilitySet,
    pub metadata: Option<Json>,
    pub state: PanelState,
    pub clients: Vec<Arc<dyn ClientSink>>,
    pub created_at: u64,
    pub last_activity: u64,
    _metrics: crate::metrics::PanelMetricsGuard,
}

/// A read-only summary of a `Panel`, for the `GET /panels` and
/// `GET /panels/:id` HTTP surface (§6.1).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelInfo {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
    pub status: PanelStatus,
    pub tools: Vec<String>,
    pub metadata: Option<Json>,
    pub created_at: u64,
    pub last_activity: u64,
}

impl Panel {
    pub fn tool_capabilities(&self, tool: &ToolDefinition) -> CapabilitySet {
        match &tool.declared_capabilities {
            Some(raw) => CapabilitySet::declared(parse_tokens(raw)),
            None => CapabilitySet::inferred(crate::capability_infer::infer(&tool.handler_source)),
        }
    }

    pub fn lifecycle_capabilities(&self, handler: &HandlerDefinition) -> CapabilitySet {
        match &handler.declared_capabilities {
            Some(raw) => CapabilitySet::declared(parse_tokens(raw)),
            None => CapabilitySet::inferred(crate::capability_infer::infer(&handler.source)),
        }
    }
}

fn parse_tokens(raw: &[String]) -> Vec<panelrt_common::CapabilityToken> {
    raw.iter().filter_map(|s| panelrt_common::CapabilityToken::parse(s).ok()).collect()
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct PanelManager {
    panels: DashMap<String, Panel>,
    next_panel_id: AtomicU64,
    computed_max_depth: u32,
}

impl PanelManager {
    pub fn new(computed_max_depth: u32) -> Self {
        Self {
            panels: DashMap::new(),
            next_panel_id: AtomicU64::new(1),
            computed_max_depth,
        }
    }

    #[instrument(skip(self, config))]
    pub fn create_panel(&self, config: PanelConfig) -> String {
        let id = config.id.unwrap_or_else(|| {
            let n = self.next_panel_id.fetch_add(1, Ordering::Relaxed);
            format!("panel-{n}")
        });

        let mut state = PanelState::new(self.computed_max_depth);
        for slot in &config.initial_state {
            state.define_slot(slot.name.clone(), slot.declared_type, slot.initial.clone().unwrap_or(Json::Null));
        }
        for (name, expr) in &config.computed {
            if let Err(err) = state.define_computed(name.clone(), expr.clone()) {
                tracing::warn!(computed = name, %err, "skipping malformed computed slot expression");
            }
        }

        let capabilities = match &config.capabilities {
            Some(raw) => CapabilitySet::declared(parse_tokens(raw)),
            None => CapabilitySet::default(),
        };

        let panel = Panel {
            id: id.clone(),
            kind: config.kind,
            title: config.title,
            status: PanelStatus::Initializing,
            tools: config.tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            lifecycle: config.lifecycle,
            capabilities,
            metadata: config.metadata,
            state,
            clients: Vec::new(),
            created_at: now_ms(),
            last_activity: now_ms(),
            _metrics: crate::metrics::PanelMetricsGuard::new(),
        };
        self.panels.insert(id.clone(), panel);
        info!(panel = %id, "panel created");
        id
    }

    /// Transitions a freshly-created panel to `running` once its mount hook
    /// (if any) has been dispatched by the orchestrator.
    pub fn mark_running(&self, panel_id: &str) {
        self.set_status(panel_id, PanelStatus::Running);
    }

    pub fn set_status(&self, panel_id: &str, status: PanelStatus) {
        if let Some(mut panel) = self.panels.get_mut(panel_id) {
            if panel.status != status {
                panel.status = status;
                let msg = ServerMessage::Status { status };
                for client in &panel.clients {
                    client.send(&msg);
                }
            }
        }
    }

    pub fn get_status(&self, panel_id: &str) -> Option<PanelStatus> {
        self.panels.get(panel_id).map(|p| p.status)
    }

    pub fn exists(&self, panel_id: &str) -> bool {
        self.panels.contains_key(panel_id)
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.panels.iter().map(|e| e.key().clone()).collect()
    }

    /// A read-only summary for the `GET /panels` / `GET /panels/:id` HTTP
    /// surface (§6.1), echoing creation-time metadata (SPEC_FULL.md §C).
    pub fn info(&self, panel_id: &str) -> Option<PanelInfo> {
        self.panels.get(panel_id).map(|p| PanelInfo {
            id: p.id.clone(),
            kind: p.kind.clone(),
            title: p.title.clone(),
            status: p.status,
            tools: p.tools.keys().cloned().collect(),
            metadata: p.metadata.clone(),
            created_at: p.created_at,
            last_activity: p.last_activity,
        })
    }

    pub fn list_info(&self) -> Vec<PanelInfo> {
        self.panels.iter().filter_map(|e| self.info(e.key())).collect()
    }

    /// `{active, suspended}` panel counts for `GET /health` (§6.1).
    /// `active` counts every panel not currently suspended — initializing,
    /// running, and error alike, since all three still hold a live record.
    pub fn status_counts(&self) -> (usize, usize) {
        let mut active = 0;
        let mut suspended = 0;
        for entry in self.panels.iter() {
            if entry.status == PanelStatus::Suspended {
                suspended += 1;
            } else {
                active += 1;
            }
        }
        (active, suspended)
    }

    pub fn state_snapshot(&self, panel_id: &str) -> Option<HashMap<String, Json>> {
        self.panels.get_mut(panel_id).map(|mut p| p.state.snapshot())
    }

    pub fn computed_keys(&self, panel_id: &str) -> Option<Vec<String>> {
        self.panels.get(panel_id).map(|p| p.state.computed_keys())
    }

    pub fn tool(&self, panel_id: &str, tool_name: &str) -> Option<ToolDefinition> {
        self.panels.get(panel_id).and_then(|p| p.tools.get(tool_name).cloned())
    }

    pub fn lifecycle_handler(&self, panel_id: &str, hook: &str) -> Option<HandlerDefinition> {
        self.panels.get(panel_id).and_then(|p| p.lifecycle.get(hook).cloned())
    }

    pub fn capabilities_for_tool(&self, panel_id: &str, tool: &ToolDefinition) -> Option<CapabilitySet> {
        self.panels.get(panel_id).map(|p| p.tool_capabilities(tool))
    }

    pub fn capabilities_for_lifecycle(&self, panel_id: &str, handler: &HandlerDefinition) -> Option<CapabilitySet> {
        self.panels.get(panel_id).map(|p| p.lifecycle_capabilities(handler))
    }

    pub fn is_computed(&self, panel_id: &str, key: &str) -> bool {
        self.panels.get(panel_id).is_some_and(|p| p.state.is_computed(key))
    }

    /// `apply_mutations` (§4.6): mutates state, bumps last-activity, and
    /// broadcasts a `PATCH` to every client subscribed to `state`. Returns
    /// the post-coercion mutations actually applied, since those may differ
    /// from the caller's input (§4.5's coercion table, undeclared-slot type
    /// inference, reset-to-default on delete).
    #[instrument(skip(self, mutations))]
    pub fn apply_mutations(&self, panel_id: &str, mutations: &[StateMutation]) -> Result<Vec<StateMutation>, StateError> {
        let Some(mut panel) = self.panels.get_mut(panel_id) else {
            return Ok(Vec::new());
        };
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let applied = panel.state.apply_mutations(mutations)?;
        panel.last_activity = now_ms();
        let applied: Vec<StateMutation> = applied
            .into_iter()
            .map(|a| StateMutation {
                op: a.op,
                key: a.key,
                value: a.value,
            })
            .collect();
        let msg = ServerMessage::Patch { mutations: applied.clone() };
        broadcast_to_topic(&panel.clients, "state", &msg);
        debug!(panel = %panel_id, count = applied.len(), "applied mutations and broadcast PATCH");
        Ok(applied)
    }

    pub fn emit_event(&self, panel_id: &str, event: EmittedEvent) {
        if let Some(panel) = self.panels.get(panel_id) {
            let msg = ServerMessage::Event { event };
            broadcast_to_topic(&panel.clients, "events", &msg);
        }
    }

    /// Fans out an imperative `ViewCommand` (§4.7's "broadcast the command
    /// to clients") to every client subscribed to `state` — view commands
    /// target a specific UI component, which lives on the same subscribers
    /// that receive state patches.
    pub fn broadcast_view_command(&self, panel_id: &str, command: &panelrt_common::ViewCommand) {
        if let Some(panel) = self.panels.get(panel_id) {
            let msg = ServerMessage::Command { command: command.clone() };
            broadcast_to_topic(&panel.clients, "state", &msg);
        }
    }

    pub fn send_result(&self, panel_id: &str, client_id: Option<u64>, request_id: Option<String>, result: panelrt_common::ExecutionResult) {
        if let Some(panel) = self.panels.get(panel_id) {
            let msg = ServerMessage::Result { request_id, result };
            match client_id {
                Some(id) => {
                    if let Some(client) = panel.clients.iter().find(|c| c.id() == id) {
                        client.send(&msg);
                    }
                }
                None => {
                    for client in &panel.clients {
                        client.send(&msg);
                    }
                }
            }
        }
    }

    pub fn add_client(&self, panel_id: &str, client: Arc<dyn ClientSink>) {
        if let Some(mut panel) = self.panels.get_mut(panel_id) {
            client.subscribe("state");
            client.subscribe("events");
            panel.clients.push(client);
        }
    }

    pub fn remove_client(&self, panel_id: &str, client_id: u64) {
        if let Some(mut panel) = self.panels.get_mut(panel_id) {
            panel.clients.retain(|c| c.id() != client_id);
        }
    }

    /// Looks up one registered client, for handling its own
    /// `SUBSCRIBE`/`UNSUBSCRIBE`/`PING` frames (§6.2).
    pub fn client(&self, panel_id: &str, client_id: u64) -> Option<Arc<dyn ClientSink>> {
        self.panels.get(panel_id)?.clients.iter().find(|c| c.id() == client_id).cloned()
    }

    /// `destroy_panel` (§4.6): closes every client with a normal-close
    /// code and removes the panel from the map. Suspension cancellation
    /// (resolving open suspensions with an error) is the caller's
    /// responsibility via the suspension manager, since that state lives
    /// outside this map (§4.4's correlation note).
    #[instrument(skip(self))]
    pub fn destroy_panel(&self, panel_id: &str) -> bool {
        let Some((_, panel)) = self.panels.remove(panel_id) else {
            return false;
        };
        for client in &panel.clients {
            client.close(CLOSE_NORMAL, "panel destroyed");
        }
        info!(panel = %panel_id, "panel destroyed");
        true
    }
}

fn broadcast_to_topic(clients: &[Arc<dyn ClientSink>], topic: &str, message: &ServerMessage) {
    for client in clients {
        if client.topics().iter().any(|t| t == topic) {
            client.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingClient {
        id: u64,
        topics: Mutex<Vec<String>>,
        received: Mutex<Vec<String>>,
    }

    impl ClientSink for RecordingClient {
        fn id(&self) -> u64 {
            self.id
        }
        fn send(&self, message: &ServerMessage) {
            self.received.lock().unwrap().push(serde_json::to_string(message).unwrap());
        }
        fn topics(&self) -> Vec<String> {
            self.topics.lock().unwrap().clone()
        }
        fn subscribe(&self, topic: &str) {
            self.topics.lock().unwrap().push(topic.to_string());
        }
        fn unsubscribe(&self, topic: &str) {
            self.topics.lock().unwrap().retain(|t| t != topic);
        }
        fn close(&self, _code: u16, _reason: &str) {}
    }

    fn manager_with_panel() -> (PanelManager, String) {
        let mgr = PanelManager::new(50);
        let id = mgr.create_panel(PanelConfig {
            id: Some("p1".to_string()),
            kind: "demo".to_string(),
            title: None,
            tools: vec![],
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
        (mgr, id)
    }

    #[test]
    fn create_panel_seeds_declared_state_slots() {
        let (mgr, id) = manager_with_panel();
        let snapshot = mgr.state_snapshot(&id).unwrap();
        assert_eq!(snapshot.get("count"), Some(&Json::from(0.0)));
    }

    #[test]
    fn apply_mutations_broadcasts_patch_to_state_subscribers() {
        let (mgr, id) = manager_with_panel();
        let client = Arc::new(RecordingClient { id: 1, topics: Mutex::new(vec![]), received: Mutex::new(vec![]) });
        mgr.add_client(&id, client.clone());
        mgr.apply_mutations(&id, &[StateMutation::set("count", Json::from(1))]).unwrap();
        let received = client.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].contains("PATCH"));
    }

    #[test]
    fn destroy_panel_closes_clients_and_removes_the_panel() {
        let (mgr, id) = manager_with_panel();
        let client = Arc::new(RecordingClient { id: 1, topics: Mutex::new(vec![]), received: Mutex::new(vec![]) });
        mgr.add_client(&id, client);
        assert!(mgr.destroy_panel(&id));
        assert!(!mgr.exists(&id));
    }
}
