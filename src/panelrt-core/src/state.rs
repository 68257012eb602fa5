//! Panel state & reactivity (§4.5): typed `StateSlot`s, `ComputedSlot`s with
//! dependency tracking, and the coercion-table write path.
//!
//! `ComputedSlot` expressions are evaluated by a small native Rust
//! evaluator (`expr` submodule) rather than by spinning up a sandbox
//! execution — spec.md §2's dependency order places Panel State *before*
//! the Sandbox Engine, so this module must stand on its own.

use std::collections::{HashMap, HashSet};

use panelrt_common::{PanelType, PanelValue, StateMutation, StateOp};
use serde_json::Value as Json;
use tracing::{debug, trace};

mod expr;
pub use expr::{ExprError, Expr};

#[derive(Debug, Clone)]
pub struct StateSlot {
    pub declared_type: PanelType,
    pub value: Json,
    pub version: u64,
}

impl StateSlot {
    fn new(declared_type: PanelType, value: Json) -> Self {
        Self {
            declared_type,
            value,
            version: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputedSlot {
    pub expr_source: String,
    compiled: Expr,
    cached_value: Option<Json>,
    cache_valid: bool,
    dependencies: HashSet<String>,
}

/// The sentinel returned when a `ComputedSlot` transitively reads itself
/// (§4.5's "recursion safety").
const CYCLE_SENTINEL: Json = Json::Null;

#[derive(Debug, Default)]
pub struct PanelState {
    slots: HashMap<String, StateSlot>,
    computed: HashMap<String, ComputedSlot>,
    max_recompute_depth: u32,
}

/// A single coerced write, ready for the panel manager's PATCH broadcast
/// (§4.6). Emitted unconditionally, regardless of whether the value changed
/// (§4.5's "Equality" note — suppression is a subscriber's choice, not
/// this layer's).
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMutation {
    pub op: StateOp,
    pub key: String,
    pub value: Option<Json>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot write to computed slot {0:?}")]
    ComputedIsReadOnly(String),
    #[error("unknown computed slot {0:?}")]
    UnknownComputed(String),
    #[error("expression error in computed {name:?}: {source}")]
    Expr { name: String, source: ExprError },
}

impl PanelState {
    pub fn new(max_recompute_depth: u32) -> Self {
        Self {
            slots: HashMap::new(),
            computed: HashMap::new(),
            max_recompute_depth,
        }
    }

    pub fn define_slot(&mut self, name: impl Into<String>, declared_type: PanelType, initial: Json) {
        let name = name.into();
        let coerced = PanelValue(initial).coerce(declared_type);
        self.slots.insert(name, StateSlot::new(declared_type, coerced.0));
    }

    pub fn define_computed(&mut self, name: impl Into<String>, expr_source: impl Into<String>) -> Result<(), ExprError> {
        let expr_source = expr_source.into();
        let compiled = expr::parse(&expr_source)?;
        self.computed.insert(
            name.into(),
            ComputedSlot {
                expr_source,
                compiled,
                cached_value: None,
                cache_valid: false,
                dependencies: HashSet::new(),
            },
        );
        Ok(())
    }

    pub fn is_computed(&self, key: &str) -> bool {
        self.computed.contains_key(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.slots.contains_key(key) || self.computed.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.keys().chain(self.computed.keys()).cloned().collect()
    }

    /// Names of every `ComputedSlot`, for `ExecutionContext::state_is_computed`.
    pub fn computed_keys(&self) -> Vec<String> {
        self.computed.keys().cloned().collect()
    }

    /// A read-only snapshot for `ExecutionContext` to copy at invocation
    /// start (§4.3, §9 "copy-on-invocation").
    pub fn snapshot(&mut self) -> HashMap<String, Json> {
        let keys: Vec<String> = self.keys();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.get(&key) {
                out.insert(key, v);
            }
        }
        out
    }

    /// Reads a plain slot or evaluates (or returns the cache of) a computed
    /// slot.
    pub fn get(&mut self, key: &str) -> Option<Json> {
        if let Some(slot) = self.slots.get(key) {
            return Some(slot.value.clone());
        }
        self.eval_computed(key, 0).ok()
    }

    fn eval_computed(&mut self, name: &str, depth: u32) -> Result<Json, StateError> {
        if depth >= self.max_recompute_depth {
            return Ok(CYCLE_SENTINEL);
        }
        let Some(existing) = self.computed.get(name) else {
            return Err(StateError::UnknownComputed(name.to_string()));
        };
        if existing.cache_valid {
            return Ok(existing.cached_value.clone().unwrap_or(Json::Null));
        }
        // Mark as valid (with a placeholder) before evaluating so a
        // self-referential read during this evaluation hits the cycle
        // sentinel instead of recursing through `eval_computed` again.
        if let Some(slot) = self.computed.get_mut(name) {
            slot.cache_valid = true;
            slot.cached_value = Some(CYCLE_SENTINEL);
        }

        let compiled = self.computed.get(name).unwrap().compiled.clone();
        let mut observed = HashSet::new();
        let value = expr::eval(&compiled, &mut |ident| {
            observed.insert(ident.to_string());
            if ident == name {
                return Some(CYCLE_SENTINEL);
            }
            if self.slots.contains_key(ident) {
                self.slots.get(ident).map(|s| s.value.clone())
            } else if self.computed.contains_key(ident) {
                self.eval_computed(ident, depth + 1).ok()
            } else {
                None
            }
        })
        .map_err(|source| StateError::Expr {
            name: name.to_string(),
            source,
        })?;

        if let Some(slot) = self.computed.get_mut(name) {
            slot.cached_value = Some(value.clone());
            slot.cache_valid = true;
            slot.dependencies = observed;
        }
        trace!(computed = name, "recomputed");
        Ok(value)
    }

    /// Applies a batch of mutations in order (§4.5's write path), returning
    /// the mutations actually applied (post-coercion) for the PATCH
    /// broadcast.
    pub fn apply_mutations(&mut self, mutations: &[StateMutation]) -> Result<Vec<AppliedMutation>, StateError> {
        let mut applied = Vec::with_capacity(mutations.len());
        let mut touched: HashSet<String> = HashSet::new();
        for m in mutations {
            if self.computed.contains_key(&m.key) {
                return Err(StateError::ComputedIsReadOnly(m.key.clone()));
            }
            match m.op {
                StateOp::Set => {
                    let value = m.value.clone().unwrap_or(Json::Null);
                    let coerced = match self.slots.get(&m.key) {
                        Some(existing) => PanelValue(value).coerce(existing.declared_type).0,
                        None => {
                            // Undeclared slot: infer the declared type from the
                            // incoming value's own JSON shape.
                            self.slots.insert(
                                m.key.clone(),
                                StateSlot::new(infer_type(&value), Json::Null),
                            );
                            value
                        }
                    };
                    let slot = self.slots.get_mut(&m.key).expect("slot just inserted or existing");
                    slot.value = coerced.clone();
                    slot.version += 1;
                    applied.push(AppliedMutation {
                        op: StateOp::Set,
                        key: m.key.clone(),
                        value: Some(coerced),
                    });
                }
                StateOp::Delete => {
                    if let Some(slot) = self.slots.get_mut(&m.key) {
                        slot.value = PanelValue::default_for(slot.declared_type).0;
                        slot.version += 1;
                    }
                    applied.push(AppliedMutation {
                        op: StateOp::Delete,
                        key: m.key.clone(),
                        value: None,
                    });
                }
            }
            touched.insert(m.key.clone());
        }
        self.invalidate_dependents(&touched);
        debug!(count = applied.len(), "applied state mutations");
        Ok(applied)
    }

    fn invalidate_dependents(&mut self, touched: &HashSet<String>) {
        for slot in self.computed.values_mut() {
            if slot.dependencies.iter().any(|d| touched.contains(d)) {
                slot.cache_valid = false;
            }
        }
    }
}

fn infer_type(value: &Json) -> PanelType {
    match value {
        Json::String(_) => PanelType::String,
        Json::Number(_) => PanelType::Number,
        Json::Bool(_) => PanelType::Boolean,
        Json::Array(_) => PanelType::List,
        Json::Object(_) | Json::Null => PanelType::Object,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PanelState {
        let mut s = PanelState::new(50);
        s.define_slot("a", PanelType::Number, Json::from(1));
        s.define_slot("b", PanelType::Number, Json::from(2));
        s
    }

    #[test]
    fn computed_caches_and_invalidates_on_dependency_write() {
        let mut s = state();
        s.define_computed("sum", "$state.a + $state.b").unwrap();

        assert_eq!(s.get("sum"), Some(Json::from(3.0)));
        s.apply_mutations(&[StateMutation::set("a", Json::from(10))]).unwrap();
        assert_eq!(s.get("sum"), Some(Json::from(12.0)));
    }

    #[test]
    fn writing_to_computed_is_rejected() {
        let mut s = state();
        s.define_computed("sum", "$state.a + $state.b").unwrap();
        let err = s.apply_mutations(&[StateMutation::set("sum", Json::from(99))]);
        assert!(matches!(err, Err(StateError::ComputedIsReadOnly(_))));
    }

    #[test]
    fn self_referential_computed_yields_sentinel_not_infinite_loop() {
        let mut s = state();
        s.define_computed("loopy", "$state.loopy + 1").unwrap();
        assert_eq!(s.get("loopy"), Some(Json::from(1.0)));
    }

    #[test]
    fn delete_resets_to_declared_default() {
        let mut s = state();
        s.apply_mutations(&[StateMutation::delete("a")]).unwrap();
        assert_eq!(s.get("a"), Some(Json::from(0.0)));
    }

    #[test]
    fn mutations_emitted_regardless_of_value_equality() {
        let mut s = state();
        let applied = s.apply_mutations(&[StateMutation::set("a", Json::from(1))]).unwrap();
        assert_eq!(applied.len(), 1);
    }
}
