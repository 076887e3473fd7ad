//! Classified outcomes shared by the helper bridge and the compilation pipeline.
//!
//! Every component error maps onto one `ErrorKind`. Callers see only the
//! `Envelope` shape, never a raw `std::io::Error`.

use serde::Serialize;
use serde_json::Value;

/// Stable error taxonomy surfaced to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    HelperNotFound,
    SpawnFailed,
    InvalidInput,
    Timeout,
    HelperCrashed,
    HelperReportedError,
    EmptyOutput,
    CompilationFailed,
    ScratchAllocationFailed,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same request later.
    /// Configuration and programming errors are never retryable.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::HelperNotFound | ErrorKind::InvalidInput | ErrorKind::EmptyOutput => false,
            ErrorKind::SpawnFailed
            | ErrorKind::Timeout
            | ErrorKind::HelperCrashed
            | ErrorKind::HelperReportedError
            | ErrorKind::CompilationFailed
            | ErrorKind::ScratchAllocationFailed => true,
        }
    }
}

/// Implemented by every component error that can reach a caller.
pub trait Classified: std::fmt::Display {
    fn kind(&self) -> ErrorKind;

    /// Message safe to hand to an external caller.
    fn public_message(&self) -> String {
        self.to_string()
    }
}

/// Caller-facing result: `{status: "success", data}` or
/// `{status: "error", kind, message, retryable}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success {
        data: Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
        /// Whether the same request may succeed on a later attempt.
        retryable: bool,
    },
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Envelope::Success { data }
    }

    pub fn error<E: Classified + ?Sized>(err: &E) -> Self {
        let kind = err.kind();
        Envelope::Error {
            kind,
            message: err.public_message(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn from_result<T, E>(result: Result<T, E>) -> Self
    where
        T: Into<Value>,
        E: Classified,
    {
        match result {
            Ok(data) => Envelope::success(data.into()),
            Err(e) => Envelope::error(&e),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Envelope::Success { .. } => None,
            Envelope::Error { kind, .. } => Some(*kind),
        }
    }
}

/// Truncates text to at most `max` characters for log previews.
pub fn preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
