//! The seam between the interpreter and whatever owns panel state (§3, §4.3).
//!
//! `panelrt-core` implements this trait once, on its `ExecutionContext` type.
//! The sandbox crate only ever sees the trait, which keeps the dependency
//! order from §2 intact: the Sandbox Engine does not depend on the Extension
//! Registry or the Panel Manager, it just asks this trait for what it needs.

use panelrt_common::{EmittedEvent, RuntimeError, StateMutation, ViewCommand};
use serde_json::Value as Json;

/// Everything a running handler can observe or accumulate through the host
/// function surface (§4.1's table).
pub trait HostContext {
    /// Read-only snapshot access (`$state.get/has/keys`).
    fn state_get(&self, key: &str) -> Option<Json>;
    fn state_has(&self, key: &str) -> bool;
    fn state_keys(&self) -> Vec<String>;
    /// True if `key` backs a `ComputedSlot` (writes must be rejected, §4.5).
    fn state_is_computed(&self, key: &str) -> bool;

    /// Evaluates `required` (a `domain:action:scope` string) against the
    /// context's granted capability set.
    fn check_capability(&mut self, required: &str) -> bool;

    /// Increments the host-call counter; fails closed with `RESOURCE_LIMIT`
    /// once the configured ceiling is hit (§4.1).
    fn note_host_call(&mut self) -> Result<(), RuntimeError>;

    fn push_mutation(&mut self, mutation: StateMutation);
    fn push_event(&mut self, event: EmittedEvent);
    fn push_view_command(&mut self, command: ViewCommand);
    fn push_log(&mut self, level: String, message: String, data: Option<Json>);

    fn extension_exists(&self, name: &str) -> bool;
    fn extension_has_method(&self, name: &str, method: &str) -> bool;

    /// Milliseconds since the Unix epoch, for event timestamps.
    fn now_unix_ms(&self) -> u64;
}
