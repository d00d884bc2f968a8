//! Ephemeral per-execution workspaces.
//!
//! A [`Workspace`] is a uniquely named directory holding exactly one harness
//! file. It is owned by a single execution and removed when the value is
//! closed or dropped, whichever comes first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::envelope::ExecutionRequest;
use crate::errors::SandboxError;
use crate::harness::{HarnessTemplate, HARNESS_FILE_NAME};

/// Directory name prefix shared by every workspace.
pub const WORKSPACE_PREFIX: &str = "clusterlab-ws-";

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    harness_path: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn harness_path(&self) -> &Path {
        &self.harness_path
    }

    pub fn harness_file_name(&self) -> &str {
        HARNESS_FILE_NAME
    }

    /// Removes the directory now and reports failures instead of ignoring them.
    pub fn close(self) -> Result<(), SandboxError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            SandboxError::System(format!(
                "Failed to remove workspace {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Materializes harness scripts into fresh workspaces under one root.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    root: PathBuf,
}

impl EnvironmentBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn build(&self, request: &ExecutionRequest) -> Result<Workspace, SandboxError> {
        fs::create_dir_all(&self.root).await?;

        let dir = Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| {
                SandboxError::System(format!(
                    "Could not create workspace under {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        let harness = HarnessTemplate::new()
            .with_algorithm_hint(request.algorithm_hint.as_deref())
            .render(&request.code);

        let harness_path = dir.path().join(HARNESS_FILE_NAME);
        let mut file = fs::File::create(&harness_path).await?;
        file.write_all(harness.as_bytes()).await?;
        file.flush().await?; // Ensure data is written before the mount

        // The container user is unprivileged; it needs read access through the bind mount.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
            fs::set_permissions(&harness_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        log::debug!(
            "Workspace {} ready ({} bytes of harness)",
            dir.path().display(),
            harness.len()
        );

        Ok(Workspace { dir, harness_path })
    }
}

/// Removes leftover workspaces older than `max_age` from `root`.
///
/// Recovery for host crashes mid-execution; best effort, individual failures
/// are logged and skipped. Returns how many directories were removed.
pub async fn reap_stale_workspaces(root: &Path, max_age: Duration) -> Result<usize, SandboxError> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_dir() => metadata,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                log::info!("Removed stale workspace {}", entry.path().display());
                removed += 1;
            }
            Err(e) => log::warn!(
                "Could not remove stale workspace {}: {}",
                entry.path().display(),
                e
            ),
        }
    }

    Ok(removed)
}
