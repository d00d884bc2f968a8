//! Error types for every failure mode of a sandboxed execution
//!
//! Failures are grouped by who can act on them. A `SecurityViolation` is the
//! submitter's to fix, a `ContainerRuntimeError` or a system error belongs to
//! the operator, and a `ResultParseError` never leaves the crate: the parser
//! folds it into a degraded envelope.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Security check failed: {0}")]
    Security(#[from] SecurityViolation),
    #[error("Container runtime failure: {0}")]
    ContainerRuntime(#[from] ContainerRuntimeError),
    #[error("System error: {0}")]
    System(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::System(err.to_string())
    }
}

/// Which validator layer rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityRule {
    /// Denylisted text found by the pattern scan.
    Pattern,
    /// Import of a forbidden module found in the syntax tree.
    AstImport,
    /// Direct call of a forbidden builtin found in the syntax tree.
    AstCall,
    /// The code could not be parsed at all.
    Syntax,
}

impl SecurityRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityRule::Pattern => "pattern",
            SecurityRule::AstImport => "ast-import",
            SecurityRule::AstCall => "ast-call",
            SecurityRule::Syntax => "syntax",
        }
    }
}

impl fmt::Display for SecurityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-execution rejection of a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SecurityViolation {
    pub rule: SecurityRule,
    /// The offending identifier, e.g. `os` or `eval(`.
    pub token: String,
    pub message: String,
}

impl SecurityViolation {
    pub fn pattern(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            rule: SecurityRule::Pattern,
            message: format!("Dangerous operation detected: {}", token),
            token,
        }
    }

    pub fn import(module: impl Into<String>) -> Self {
        let token = module.into();
        Self {
            rule: SecurityRule::AstImport,
            message: format!("Import is not allowed: {}", token),
            token,
        }
    }

    pub fn call(function: impl Into<String>) -> Self {
        let token = function.into();
        Self {
            rule: SecurityRule::AstCall,
            message: format!("Call is not allowed: {}", token),
            token,
        }
    }

    pub fn syntax(detail: impl Into<String>) -> Self {
        Self {
            rule: SecurityRule::Syntax,
            token: String::new(),
            message: format!("Syntax error: {}", detail.into()),
        }
    }
}

// Specific error for the container engine layer
#[derive(Error, Debug)]
pub enum ContainerRuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Sandbox image '{tag}' is unavailable: {reason}")]
    ImageBuild { tag: String, reason: String },
    #[error("Container launch failed: {0}")]
    Launch(String),
    #[error("Container exited with code {code}")]
    NonZeroExit { code: i64, output: String },
    #[error("Execution timed out after {}", format_limit(.0))]
    Timeout(Duration),
    #[error("Container wait stream ended unexpectedly")]
    WaitStreamEnded,
}

impl ContainerRuntimeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ContainerRuntimeError::Timeout(_))
    }
}

/// `30s` for whole seconds, `500ms` below one second, `1.5s` otherwise.
pub fn format_limit(limit: &Duration) -> String {
    if limit.subsec_nanos() == 0 {
        format!("{}s", limit.as_secs())
    } else if limit.as_secs() == 0 {
        format!("{}ms", limit.as_millis())
    } else {
        let secs = format!("{:.3}", limit.as_secs_f64());
        format!("{}s", secs.trim_end_matches('0').trim_end_matches('.'))
    }
}

/// Why a container's output could not be turned into an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResultParseError {
    #[error("container produced no output")]
    Empty,
    #[error("no output envelope found in container output")]
    MissingEnvelope,
    #[error("malformed output envelope: {0}")]
    Malformed(String),
    #[error("invalid image {id}: {reason}")]
    InvalidImage { id: i64, reason: String },
}
