//! Shared wire vocabulary for the panel execution runtime.
//!
//! This crate has no dependency on the interpreter or on the orchestration
//! layers above it: it only defines the data that crosses those boundaries,
//! so that `panelrt-sandbox` and `panelrt-core` can agree on a shape without
//! depending on each other.

#![forbid(unsafe_code)]

pub mod capability;
pub mod error;
pub mod ids;
pub mod model;
pub mod value;

pub use capability::{CapabilitySet, CapabilityToken};
pub use error::{ErrorCode, RuntimeError, SourceLocation};
pub use ids::SuspensionId;
pub use model::{
    AsyncResult, EmittedEvent, ExecutionMetrics, ExecutionResult, ExecutionStatus, StateMutation,
    StateOp, SuspensionDetails, ViewCommand,
};
pub use value::{PanelType, PanelValue};
