// src/executors/docker.rs
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use uuid::Uuid;

use super::image::{DockerImageProvider, ImageGate, ImageProvider};
use super::path_mapping::{host_path_mapper, PathMapper};
use super::{SandboxRuntime, CONTAINER_WORKDIR, MANAGED_LABEL};
use crate::config::{LimitsConfig, SandboxConfig};
use crate::errors::{ContainerRuntimeError, SandboxError};
use crate::workspace::Workspace;

/// Exit code of a process killed by SIGKILL, which is what the kernel OOM killer sends.
pub const OOM_EXIT_CODE: i64 = 137;

pub struct DockerRuntime {
    docker: Docker,
    provider: DockerImageProvider,
    image: ImageGate,
    limits: LimitsConfig,
    path_mapper: Box<dyn PathMapper>,
}

impl DockerRuntime {
    pub fn new(config: &SandboxConfig) -> Result<Self, ContainerRuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            provider: DockerImageProvider::new(docker.clone()),
            docker,
            image: ImageGate::new(config.image.tag.clone(), config.image.build_on_demand),
            limits: config.limits.clone(),
            path_mapper: host_path_mapper(),
        })
    }

    pub fn with_path_mapper(mut self, path_mapper: Box<dyn PathMapper>) -> Self {
        self.path_mapper = path_mapper;
        self
    }

    pub fn image_tag(&self) -> &str {
        self.image.tag()
    }

    /// Whether the daemon answers at all.
    pub async fn is_available(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Docker daemon is not reachable: {}", e);
                false
            }
        }
    }

    pub async fn image_present(&self) -> Result<bool, ContainerRuntimeError> {
        self.provider.image_exists(self.image.tag()).await
    }

    /// Builds the image unconditionally and resets the cached state.
    pub async fn rebuild_image(&self) -> Result<(), ContainerRuntimeError> {
        self.image.rebuild(&self.provider).await
    }

    /// Starts the container and waits for it, bounded by `timeout`.
    async fn drive(&self, id: &str, timeout: Duration) -> Result<String, ContainerRuntimeError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| ContainerRuntimeError::Launch(e.to_string()))?;

        let mut wait_stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);

        let exit_code = tokio::select! {
            outcome = wait_stream.next() => match outcome {
                Some(Ok(response)) => response.status_code,
                // Bollard reports a non-zero exit status as an error item.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ContainerRuntimeError::WaitStreamEnded),
            },
            _ = tokio::time::sleep(timeout) => {
                // The forced removal in `run` kills the process.
                log::warn!("Execution timed out for container {} after {:?}", id, timeout);
                return Err(ContainerRuntimeError::Timeout(timeout));
            }
        };

        let output = self.collect_logs(id).await?;

        if exit_code != 0 {
            if exit_code == OOM_EXIT_CODE {
                log::warn!(
                    "Container {} was killed (exit {}), probably by the memory limit",
                    id,
                    exit_code
                );
            } else {
                log::info!("Container {} exited with code {}", id, exit_code);
            }
            return Err(ContainerRuntimeError::NonZeroExit {
                code: exit_code,
                output,
            });
        }

        Ok(output)
    }

    async fn collect_logs(&self, id: &str) -> Result<String, ContainerRuntimeError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(log_result) = output_stream.next().await {
            match log_result? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    output.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(output)
    }

    /// Force-removes the container; failures are logged, never returned.
    async fn remove(&self, id: &str) {
        let options = BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        };
        let removal = self.docker.remove_container(id, Some(options));
        match tokio::time::timeout(self.limits.kill_grace(), removal).await {
            Ok(Ok(())) => log::debug!("Removed container {}", id),
            Ok(Err(e)) => log::warn!("Failed to remove container {}: {}", id, e),
            Err(_) => log::warn!(
                "Container {} was not removed within {:?}; it will be reaped later",
                id,
                self.limits.kill_grace()
            ),
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ensure_image(&self) -> Result<(), ContainerRuntimeError> {
        self.image.ensure(&self.provider).await
    }

    async fn run(&self, workspace: &Workspace, timeout: Duration) -> Result<String, SandboxError> {
        self.ensure_image().await?;

        let mount_source = self.path_mapper.mount_source(workspace.path())?;
        let body = container_body(
            &self.limits,
            self.image.tag(),
            &mount_source,
            workspace.harness_file_name(),
        );
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("clusterlab-exec-{}", Uuid::new_v4())),
            ..Default::default()
        });

        let container = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|e| ContainerRuntimeError::Launch(e.to_string()))?;
        log::debug!("Created container {} for {}", container.id, workspace.path().display());

        let outcome = self.drive(&container.id, timeout).await;
        self.remove(&container.id).await;

        Ok(outcome?)
    }

    async fn invalidate_image(&self) {
        self.image.invalidate().await;
    }

    async fn reap_orphans(&self) -> Result<usize, ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let containers = self
            .docker
            .list_containers(Some(BollardListContainersOptionsQuery {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|summary| summary.id) {
            log::info!("Removing orphaned sandbox container {}", id);
            self.remove(&id).await;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Creation parameters for one sandbox container.
///
/// The workspace is the only mount and it is read-only; the writable paths
/// are the tmpfs mounts from `limits`. No network, no capabilities, no
/// privilege escalation.
pub fn container_body(
    limits: &LimitsConfig,
    image: &str,
    mount_source: &str,
    harness_file: &str,
) -> ContainerCreateBody {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(vec![
            "python".to_string(),
            format!("{}/{}", CONTAINER_WORKDIR, harness_file),
        ]),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        labels: Some(labels),
        network_disabled: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:{}:ro", mount_source, CONTAINER_WORKDIR)]),
            memory: Some(limits.memory_bytes),
            // Equal to memory: no swap on top of the limit.
            memory_swap: Some(limits.memory_bytes),
            cpu_period: Some(limits.cpu_period),
            cpu_quota: Some(limits.cpu_quota),
            pids_limit: Some(limits.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(limits.tmpfs.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}
