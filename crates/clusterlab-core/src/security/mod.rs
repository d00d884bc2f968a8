//! Static pre-execution checks for submitted code
//!
//! Two layers run before any workspace or container exists: a denylist scan
//! over the raw text and a walk over the parsed syntax tree. Both are cheap
//! filters for the common case and both can be defeated by obfuscation; the
//! isolation boundary is the container launched by the runtime, not this
//! module.

pub mod patterns;
pub mod syntax;

pub use patterns::{PatternScanner, DEFAULT_DENYLIST};
pub use syntax::{check_structure, FORBIDDEN_CALLS, FORBIDDEN_MODULES};

use crate::config::ValidatorConfig;
use crate::errors::{SandboxError, SecurityViolation};

/// Runs the enabled validation layers in order, pattern scan first.
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    patterns: Option<PatternScanner>,
    structural: bool,
}

impl SecurityValidator {
    pub fn new(config: &ValidatorConfig) -> Result<Self, SandboxError> {
        let patterns = if config.pattern_layer {
            let entries = DEFAULT_DENYLIST
                .iter()
                .map(|entry| entry.to_string())
                .chain(config.extra_patterns.iter().cloned());
            Some(PatternScanner::new(entries)?)
        } else {
            log::warn!("Pattern layer of the security validator is disabled");
            None
        };

        if !config.structural_layer {
            log::warn!("Structural layer of the security validator is disabled");
        }

        Ok(Self {
            patterns,
            structural: config.structural_layer,
        })
    }

    pub fn validate(&self, code: &str) -> Result<(), SecurityViolation> {
        if code.trim().is_empty() {
            return Err(SecurityViolation::syntax("no code submitted"));
        }

        if let Some(scanner) = &self.patterns {
            scanner.check(code)?;
        }

        if self.structural {
            check_structure(code)?;
        }

        Ok(())
    }
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self {
            patterns: Some(PatternScanner::with_defaults()),
            structural: true,
        }
    }
}
