use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use panelrt_common::capability::CapabilitySet;
use panelrt_common::{AsyncResult, EmittedEvent, RuntimeError, StateMutation, ViewCommand};
use panelrt_sandbox::{Bytecode, CompileCache, HostContext, Interpreter, RunOutcome};
use serde_json::{json, Value as Json};

struct TestHost {
    state: HashMap<String, Json>,
    computed: Vec<String>,
    capabilities: CapabilitySet,
    host_calls: u32,
    call_limit: u32,
    mutations: Vec<StateMutation>,
    events: Vec<EmittedEvent>,
    view_commands: Vec<ViewCommand>,
    extensions: HashMap<String, Vec<String>>,
}

impl TestHost {
    fn new(capabilities: CapabilitySet) -> Self {
        Self {
            state: HashMap::new(),
            computed: Vec::new(),
            capabilities,
            host_calls: 0,
            call_limit: 1_000,
            mutations: Vec::new(),
            events: Vec::new(),
            view_commands: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    fn with_extension(mut self, name: &str, methods: &[&str]) -> Self {
        self.extensions.insert(name.to_string(), methods.iter().map(|m| m.to_string()).collect());
        self
    }
}

impl HostContext for TestHost {
    fn state_get(&self, key: &str) -> Option<Json> {
        self.state.get(key).cloned()
    }

    fn state_has(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    fn state_keys(&self) -> Vec<String> {
        self.state.keys().cloned().collect()
    }

    fn state_is_computed(&self, key: &str) -> bool {
        self.computed.iter().any(|k| k == key)
    }

    fn check_capability(&mut self, required: &str) -> bool {
        self.capabilities.check(required)
    }

    fn note_host_call(&mut self) -> Result<(), RuntimeError> {
        self.host_calls += 1;
        if self.host_calls > self.call_limit {
            return Err(RuntimeError::new(
                panelrt_common::ErrorCode::ResourceLimit,
                "host call budget exhausted",
            ));
        }
        Ok(())
    }

    fn push_mutation(&mut self, mutation: StateMutation) {
        if let StateMutation { op: panelrt_common::StateOp::Set, key, value: Some(v) } = mutation.clone() {
            self.state.insert(key, v);
        }
        self.mutations.push(mutation);
    }

    fn push_event(&mut self, event: EmittedEvent) {
        self.events.push(event);
    }

    fn push_view_command(&mut self, command: ViewCommand) {
        self.view_commands.push(command);
    }

    fn push_log(&mut self, _level: String, _message: String, _data: Option<Json>) {}

    fn extension_exists(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    fn extension_has_method(&self, name: &str, method: &str) -> bool {
        self.extensions.get(name).map(|methods| methods.iter().any(|m| m == method)).unwrap_or(false)
    }

    fn now_unix_ms(&self) -> u64 {
        0
    }
}

fn compile(cache: &CompileCache, source: &str) -> Bytecode {
    cache.get_or_insert(source).0
}

fn deadline(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[test]
fn sync_handler_returns_value_without_suspending() {
    let cache = CompileCache::new();
    let bytecode = compile(&cache, "function handler(event) { return event.a + event.b; }");
    let host: Arc<Mutex<dyn HostContext + Send>> = Arc::new(Mutex::new(TestHost::new(CapabilitySet::declared(vec![]))));

    let mut interpreter = Interpreter::new(64 * 1024 * 1024).unwrap();
    let (outcome, frozen) = interpreter.execute(&bytecode, host, json!({"a": 1, "b": 41}), deadline(5)).unwrap();

    assert!(frozen.is_none());
    match outcome {
        RunOutcome::Success { return_value } => assert_eq!(return_value, Some(json!(42))),
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn state_write_without_capability_is_denied() {
    let cache = CompileCache::new();
    let bytecode = compile(
        &cache,
        r#"function handler(event) { $state.set("counter", event.n); return $state.get("counter"); }"#,
    );
    let host: Arc<Mutex<dyn HostContext + Send>> = Arc::new(Mutex::new(TestHost::new(CapabilitySet::declared(vec![]))));

    let mut interpreter = Interpreter::new(64 * 1024 * 1024).unwrap();
    let (outcome, _) = interpreter.execute(&bytecode, host, json!({"n": 7}), deadline(5)).unwrap();

    match outcome {
        RunOutcome::Error(err) => assert_eq!(err.code, panelrt_common::ErrorCode::PermissionDenied),
        other => panic!("expected permission denial, got {other:?}"),
    }
}

#[test]
fn state_round_trip_with_capability() {
    use panelrt_common::CapabilityToken;

    let cache = CompileCache::new();
    let bytecode = compile(
        &cache,
        r#"function handler(event) { $state.set("counter", event.n); return $state.get("counter"); }"#,
    );
    let capabilities = CapabilitySet::declared(vec![
        CapabilityToken::parse("state:write:counter").unwrap(),
        CapabilityToken::parse("state:read:counter").unwrap(),
    ]);
    let host: Arc<Mutex<dyn HostContext + Send>> = Arc::new(Mutex::new(TestHost::new(capabilities)));

    let mut interpreter = Interpreter::new(64 * 1024 * 1024).unwrap();
    let (outcome, _) = interpreter.execute(&bytecode, host, json!({"n": 7}), deadline(5)).unwrap();

    match outcome {
        RunOutcome::Success { return_value } => assert_eq!(return_value, Some(json!(7))),
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn ext_call_suspends_and_resumes() {
    use panelrt_common::CapabilityToken;

    let cache = CompileCache::new();
    let bytecode = compile(
        &cache,
        r#"async function handler(event) {
            const doubled = await $ext.math.double(event.n);
            return doubled + 1;
        }"#,
    );
    let capabilities = CapabilitySet::declared(vec![CapabilityToken::parse("ext:math").unwrap()]);
    let host: Arc<Mutex<dyn HostContext + Send>> =
        Arc::new(Mutex::new(TestHost::new(capabilities).with_extension("math", &["double"])));

    let mut interpreter = Interpreter::new(64 * 1024 * 1024).unwrap();
    let (outcome, frozen) = interpreter.execute(&bytecode, host.clone(), json!({"n": 10}), deadline(5)).unwrap();

    let suspension = match outcome {
        RunOutcome::Suspended(details) => details,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(suspension.extension_name, "math");
    assert_eq!(suspension.method_name, "double");
    assert_eq!(suspension.args, json!([10]));

    let frozen = frozen.expect("suspension must carry a frozen continuation");
    let (outcome, frozen) = interpreter
        .resume(frozen, host, AsyncResult::ok(json!(20)), deadline(5))
        .unwrap();

    assert!(frozen.is_none());
    match outcome {
        RunOutcome::Success { return_value } => assert_eq!(return_value, Some(json!(21))),
        other => panic!("expected success after resume, got {other:?}"),
    }
}

#[test]
fn unknown_extension_is_rejected_before_suspension() {
    use panelrt_common::CapabilityToken;

    let cache = CompileCache::new();
    let bytecode = compile(&cache, r#"async function handler(event) { return await $ext.ghost.poke(event); }"#);
    let capabilities = CapabilitySet::declared(vec![CapabilityToken::parse("ext:ghost").unwrap()]);
    let host: Arc<Mutex<dyn HostContext + Send>> = Arc::new(Mutex::new(TestHost::new(capabilities)));

    let mut interpreter = Interpreter::new(64 * 1024 * 1024).unwrap();
    let (outcome, frozen) = interpreter.execute(&bytecode, host, json!({}), deadline(5)).unwrap();

    assert!(frozen.is_none());
    match outcome {
        RunOutcome::Error(err) => assert_eq!(err.code, panelrt_common::ErrorCode::ExtensionNotFound),
        other => panic!("expected extension-not-found, got {other:?}"),
    }
}
