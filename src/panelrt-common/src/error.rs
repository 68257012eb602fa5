//! The fixed error taxonomy from the error handling design (§7).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed set of error codes a handler invocation can terminate with.
///
/// `PERMISSION_DENIED`, `EXTENSION_NOT_FOUND` and `METHOD_NOT_FOUND` are
/// raised *inside* the interpreter as catchable exceptions; every other
/// variant is enforced outside the handler and can never be caught by
/// handler code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    MemoryLimit,
    ResourceLimit,
    CompilationError,
    ExecutionError,
    PermissionDenied,
    ExtensionNotFound,
    MethodNotFound,
    InvalidHandler,
    InternalError,
}

impl ErrorCode {
    /// Errors enforced by the host outside the handler; these can never be
    /// observed by a handler-level `try`/`catch`.
    pub fn is_uncatchable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::MemoryLimit | ErrorCode::ResourceLimit
        )
    }
}

/// Source location for an error, when the interpreter can supply one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub source_snippet: Option<String>,
}

/// A terminal runtime error, as it travels on the wire (§6.5) and as it is
/// attached to an `ExecutionResult` (§3).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn permission_denied(required: &str) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            format!("missing capability: {required}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}
