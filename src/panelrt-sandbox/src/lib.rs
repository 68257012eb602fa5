//! `panelrt-sandbox` wraps QuickJS (via `rquickjs`) into the handler
//! execution primitive the rest of the runtime uses: the global host
//! bindings (`$state`/`$emit`/`$view`/`$ext`/`$log`), the compile cache, and
//! the single-step job-queue driver that turns `$ext` calls into
//! suspend/resume boundaries (§4.1, §4.4).
//!
//! This crate never touches panel state, the extension registry or the
//! panel manager directly — it only knows about [`HostContext`], the trait
//! `panelrt-core` implements to plug those concerns in.

pub mod bindings;
pub mod bytecode;
pub mod context;
mod crypto;
pub mod interpreter;

pub use bindings::{throw_runtime_error, SharedHost};
pub use bytecode::{Bytecode, CompileCache};
pub use context::HostContext;
pub use interpreter::{Frozen, Interpreter, RunOutcome, TIMEOUT_SENTINEL};
