//! Configuration type definitions for the sandbox
//!
//! Every field carries a default so that an empty YAML document, or no file
//! at all, produces a working configuration with the documented resource
//! limits. Sections map one-to-one onto the components that consume them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::SandboxError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_tag")]
    pub tag: String,
    /// Build the image from the embedded definition when it is missing.
    #[serde(default = "default_true")]
    pub build_on_demand: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            tag: default_image_tag(),
            build_on_demand: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Writable tmpfs mounts, container path to mount options.
    #[serde(default = "default_tmpfs")]
    pub tmpfs: HashMap<String, String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory_bytes(),
            cpu_period: default_cpu_period(),
            cpu_quota: default_cpu_quota(),
            pids_limit: default_pids_limit(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            tmpfs: default_tmpfs(),
        }
    }
}

impl LimitsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Resolves a caller supplied timeout against the configured bounds.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.max_timeout()),
            _ => self.default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_true")]
    pub pattern_layer: bool,
    #[serde(default = "default_true")]
    pub structural_layer: bool,
    /// Appended to the built-in denylist.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            pattern_layer: true,
            structural_layer: true,
            extra_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for workspaces; the system temp dir when unset.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl WorkspaceConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.tag.trim().is_empty() {
            return Err(SandboxError::Config("image.tag must not be empty".to_string()));
        }
        if self.limits.memory_bytes < MIN_MEMORY_BYTES {
            return Err(SandboxError::Config(format!(
                "limits.memory_bytes must be at least {} bytes",
                MIN_MEMORY_BYTES
            )));
        }
        if self.limits.cpu_period <= 0 || self.limits.cpu_quota <= 0 {
            return Err(SandboxError::Config(
                "limits.cpu_period and limits.cpu_quota must be positive".to_string(),
            ));
        }
        if self.limits.default_timeout_secs == 0 || self.limits.max_timeout_secs == 0 {
            return Err(SandboxError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.limits.default_timeout_secs > self.limits.max_timeout_secs {
            return Err(SandboxError::Config(format!(
                "limits.default_timeout_secs ({}) exceeds limits.max_timeout_secs ({})",
                self.limits.default_timeout_secs, self.limits.max_timeout_secs
            )));
        }
        for mount in self.limits.tmpfs.keys() {
            if !mount.starts_with('/') {
                return Err(SandboxError::Config(format!(
                    "tmpfs mount point '{}' must be an absolute container path",
                    mount
                )));
            }
        }
        Ok(())
    }
}

pub const MIN_MEMORY_BYTES: i64 = 16 * 1024 * 1024;

fn default_image_tag() -> String { "clusterlab-sandbox:1".to_string() }
fn default_memory_bytes() -> i64 { 256 * 1024 * 1024 }
fn default_cpu_period() -> i64 { 100_000 }
fn default_cpu_quota() -> i64 { 50_000 }
fn default_pids_limit() -> i64 { 64 }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_timeout_secs() -> u64 { 120 }
fn default_kill_grace_secs() -> u64 { 5 }
fn default_stale_after_secs() -> u64 { 3600 }
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

fn default_tmpfs() -> HashMap<String, String> {
    let mut mounts = HashMap::new();
    mounts.insert("/tmp".to_string(), "rw,exec,size=64m".to_string());
    mounts.insert("/var/tmp".to_string(), "rw,exec,size=32m".to_string());
    mounts
}
