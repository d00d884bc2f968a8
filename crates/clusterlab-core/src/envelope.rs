//! Request and result contracts shared with the surrounding application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SecurityViolation;

/// One submission of user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub algorithm_hint: Option<String>,
    /// Falls back to the configured default when unset.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            algorithm_hint: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_algorithm_hint(mut self, hint: impl Into<String>) -> Self {
        self.algorithm_hint = Some(hint.into());
        self
    }
}

/// A captured plot, PNG bytes in standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeImage {
    pub id: i64,
    pub data: String,
}

/// The result contract returned for every execution attempt.
///
/// Serializes to exactly `{"output", "error", "images", "success"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    output: String,
    error: String,
    images: Vec<EnvelopeImage>,
    success: bool,
}

impl ExecutionEnvelope {
    pub fn new(output: String, error: String, images: Vec<EnvelopeImage>, success: bool) -> Self {
        Self {
            output,
            error,
            images,
            success,
        }
    }

    /// A failed envelope with no images.
    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(output.into(), error.into(), Vec::new(), false)
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn images(&self) -> &[EnvelopeImage] {
        &self.images
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn to_json(&self) -> String {
        // Only strings, integers and booleans: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<SecurityViolation> for ExecutionEnvelope {
    fn from(violation: SecurityViolation) -> Self {
        ExecutionEnvelope::failure("", violation.message)
    }
}
