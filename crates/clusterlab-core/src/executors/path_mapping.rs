//! Host path to bind-mount source translation, one mapper per OS family.

use std::fmt;
use std::path::Path;

use crate::errors::SandboxError;

pub trait PathMapper: Send + Sync + fmt::Debug {
    /// The string the container engine expects as bind source for `host_path`.
    fn mount_source(&self, host_path: &Path) -> Result<String, SandboxError>;
}

/// Linux and macOS hosts: absolute paths pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixPathMapper;

impl PathMapper for PosixPathMapper {
    fn mount_source(&self, host_path: &Path) -> Result<String, SandboxError> {
        let path = utf8(host_path)?;
        if !path.starts_with('/') {
            return Err(SandboxError::System(format!(
                "Workspace path is not absolute: {}",
                path
            )));
        }
        // `:` separates source, target and mode in a bind specification.
        if path.contains(':') {
            return Err(SandboxError::System(format!(
                "Workspace path contains ':' and cannot be bind-mounted: {}",
                path
            )));
        }
        Ok(path.to_string())
    }
}

/// Windows hosts: `C:\Users\me\tmp` becomes `/c/Users/me/tmp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPathMapper;

impl PathMapper for WindowsPathMapper {
    fn mount_source(&self, host_path: &Path) -> Result<String, SandboxError> {
        let raw = utf8(host_path)?;
        let raw = raw.strip_prefix(r"\\?\").unwrap_or(raw);
        let forward = raw.replace('\\', "/");

        let mut chars = forward.chars();
        match (chars.next(), chars.next()) {
            (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
                let rest = &forward[2..];
                if !rest.starts_with('/') {
                    return Err(SandboxError::System(format!(
                        "Workspace path is drive-relative: {}",
                        raw
                    )));
                }
                Ok(format!("/{}{}", drive.to_ascii_lowercase(), rest))
            }
            _ => Err(SandboxError::System(format!(
                "Workspace path has no drive letter: {}",
                raw
            ))),
        }
    }
}

/// The mapper for the OS this process runs on.
pub fn host_path_mapper() -> Box<dyn PathMapper> {
    if cfg!(windows) {
        Box::new(WindowsPathMapper)
    } else {
        Box::new(PosixPathMapper)
    }
}

fn utf8(path: &Path) -> Result<&str, SandboxError> {
    path.to_str().ok_or_else(|| {
        SandboxError::System(format!(
            "Workspace path is not valid UTF-8: {}",
            path.display()
        ))
    })
}
