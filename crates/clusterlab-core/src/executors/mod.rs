//! Container execution of prepared workspaces.
//!
//! The [`SandboxRuntime`] trait is the seam between the orchestration in
//! `service` and the container engine. [`docker::DockerRuntime`] is the
//! production implementation; tests plug in-memory runtimes into the same
//! seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{ContainerRuntimeError, SandboxError};
use crate::workspace::Workspace;

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/app";

/// Label attached to every container this crate creates.
pub const MANAGED_LABEL: &str = "clusterlab.managed";

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Makes sure the sandbox image exists, building it at most once.
    async fn ensure_image(&self) -> Result<(), ContainerRuntimeError>;

    /// Launches one container for the harness in `workspace` and returns its
    /// combined stdout and stderr. The container is gone when this returns.
    async fn run(&self, workspace: &Workspace, timeout: Duration) -> Result<String, SandboxError>;

    /// Forgets the cached image state so the next use checks again.
    async fn invalidate_image(&self) {}

    /// Removes containers left behind by a previous process.
    async fn reap_orphans(&self) -> Result<usize, ContainerRuntimeError> {
        Ok(0)
    }
}

pub mod docker;
pub mod image;
pub mod path_mapping;
