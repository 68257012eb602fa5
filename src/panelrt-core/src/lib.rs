//! `panelrt-core` is everything that orchestrates handler execution without
//! touching the interpreter directly (§2, §4.2-§4.8): capability inference,
//! the execution context snapshot, reactive panel state, the interpreter
//! pool, the suspension manager, the extension registry, the panel manager
//! and the handler orchestrator that ties them together.
//!
//! Dependency order within this crate follows spec.md §2 (leaves first):
//! `capability_infer`/`execution_context`/`state` depend on nothing else
//! here; `pool` depends on `panelrt-sandbox` and `config`; `extension` and
//! `suspension` depend on `config`/`pool`; `panel` depends on `state`;
//! `orchestrator` depends on all of the above.

pub mod capability_infer;
pub mod config;
pub mod execution_context;
pub mod extension;
pub mod metrics;
pub mod orchestrator;
pub mod panel;
pub mod pool;
pub mod state;
pub mod suspension;

pub use config::RuntimeConfig;
pub use execution_context::ExecutionContext;
pub use extension::{Extension, ExtensionCallError, ExtensionRegistry, HttpExtension};
pub use orchestrator::{build_runtime, HandlerOrchestrator, OrchestratorError};
pub use panel::{ClientSink, Panel, PanelConfig, PanelInfo, PanelManager, PanelStatus, ServerMessage, CLOSE_ABNORMAL, CLOSE_NORMAL};
pub use pool::{InterpreterPool, PoolStats};
pub use state::{PanelState, StateError};
pub use suspension::{SharedSuspensionManager, SuspensionContext, SuspensionManager};
