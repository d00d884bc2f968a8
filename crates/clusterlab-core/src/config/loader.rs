//! Configuration loader for YAML files and environment overrides
//!
//! This module handles loading the sandbox configuration from YAML and
//! applying the `CLUSTERLAB_*` environment overrides on top of it.

use crate::config::types::*;
use crate::errors::SandboxError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_IMAGE_TAG: &str = "CLUSTERLAB_IMAGE_TAG";
pub const ENV_TIMEOUT_SECS: &str = "CLUSTERLAB_TIMEOUT_SECS";
pub const ENV_WORKSPACE_ROOT: &str = "CLUSTERLAB_WORKSPACE_ROOT";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load the file when it exists, otherwise start from the defaults.
    pub async fn from_optional_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            log::info!("Loading configuration from file: {}", path.display());
            Self::from_file(path).await
        } else {
            log::debug!(
                "No configuration file at {}, using defaults",
                path.display()
            );
            Self::from_str("")
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandboxConfig, SandboxError> {
        let mut config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| SandboxError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::resolve_environment(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    /// Apply environment overrides to the configuration
    fn resolve_environment(config: &mut SandboxConfig) -> Result<(), SandboxError> {
        if let Ok(tag) = env::var(ENV_IMAGE_TAG) {
            if !tag.trim().is_empty() {
                log::debug!("Image tag overridden by {}", ENV_IMAGE_TAG);
                config.image.tag = tag;
            }
        }

        if let Ok(raw) = env::var(ENV_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                SandboxError::Config(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    ENV_TIMEOUT_SECS, raw
                ))
            })?;
            config.limits.default_timeout_secs = secs;
            if secs > config.limits.max_timeout_secs {
                config.limits.max_timeout_secs = secs;
            }
        }

        if let Ok(root) = env::var(ENV_WORKSPACE_ROOT) {
            if !root.trim().is_empty() {
                config.workspace.root = Some(PathBuf::from(root));
            }
        }

        Ok(())
    }
}
