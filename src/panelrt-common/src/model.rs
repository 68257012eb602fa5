//! The effect and result types from §3: `StateMutation`, `EmittedEvent`,
//! `ViewCommand`, `SuspensionDetails`, `ExecutionResult`, `AsyncResult`.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::RuntimeError;
use crate::ids::SuspensionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateOp {
    Set,
    Delete,
}

/// `{op, key, value?}`. Applied in order; later writes to the same key win
/// within one result batch (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMutation {
    pub op: StateOp,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

impl StateMutation {
    pub fn set(key: impl Into<String>, value: Json) -> Self {
        Self {
            op: StateOp::Set,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: StateOp::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// `{name, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub name: String,
    pub payload: Json,
    pub timestamp: u64,
}

/// `{component_id, command, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewCommand {
    pub component_id: String,
    pub command: String,
    pub params: Json,
}

/// `{suspensionId, extensionName, methodName, args}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionDetails {
    pub suspension_id: SuspensionId,
    pub extension_name: String,
    pub method_name: String,
    pub args: Json,
}

/// What the host supplies to `resume()` — either the extension's returned
/// value or its failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AsyncResult {
    pub fn ok(value: Json) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Suspended,
    Error,
}

/// `{executionTimeUs, memoryUsedBytes, memoryPeakBytes, hostCalls, cacheHit}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub execution_time_us: u64,
    pub memory_used_bytes: u64,
    pub memory_peak_bytes: u64,
    pub host_calls: u64,
    pub cache_hit: bool,
    /// Supplemental (§D): whether the capability set attached to this
    /// invocation was declared by the handler author or inferred by the
    /// conservative scanner.
    pub capabilities_inferred: bool,
}

/// `{status, returnValue?, stateMutations, events, viewCommands,
/// suspension?, error?, metrics}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Json>,
    pub state_mutations: Vec<StateMutation>,
    pub events: Vec<EmittedEvent>,
    pub view_commands: Vec<ViewCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RuntimeError>,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ExecutionStatus::Suspended)
    }
}
