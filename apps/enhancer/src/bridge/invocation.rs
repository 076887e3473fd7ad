use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// One request to run a helper. Created per call, never shared or persisted.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    id: Uuid,
    payload: T,
    timeout: Duration,
    scratch: bool,
}

impl<T: Serialize> Invocation<T> {
    pub fn new(payload: T, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            timeout,
            scratch: false,
        }
    }
}

impl<T> Invocation<T> {
    /// Gives the helper its own scratch directory as working directory
    /// (also exported as `HELPER_SCRATCH_DIR`).
    pub fn with_scratch(mut self) -> Self {
        self.scratch = true;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn wants_scratch(&self) -> bool {
        self.scratch
    }
}

/// Successful helper result.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperOutput {
    /// A well-formed JSON payload was found on stdout.
    Structured(Value),
    /// Clean exit, non-empty stdout, but no JSON payload in it.
    RawText(String),
}

impl From<HelperOutput> for Value {
    fn from(output: HelperOutput) -> Self {
        match output {
            HelperOutput::Structured(v) => v,
            HelperOutput::RawText(text) => json!({ "raw_text": text }),
        }
    }
}

/// Message carried by an explicit error payload, if `value` is one.
///
/// Recognises `{"error": ...}` and `{"status": "error", "message": ...}`.
pub(crate) fn reported_error(value: &Value) -> Option<String> {
    let obj = value.as_object()?;

    if let Some(err) = obj.get("error") {
        return match err {
            Value::Null | Value::Bool(false) => None,
            Value::String(s) => Some(s.clone()),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .or_else(|| Some(other.to_string())),
        };
    }

    if obj.get("status").and_then(|s| s.as_str()) == Some("error") {
        let message = obj
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("helper reported an error without a message");
        return Some(message.to_string());
    }

    None
}
