//! Sandbox image readiness.
//!
//! The image is process-wide state: [`ImageGate`] serializes the
//! check-and-build behind one async lock so concurrent first callers wait for
//! a single build instead of racing to start several. A failed build is
//! remembered and reported to later callers without another attempt until
//! [`ImageGate::invalidate`] or [`ImageGate::rebuild`] is called.

use async_trait::async_trait;
use bollard::query_parameters::BuildImageOptionsBuilder;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use tokio::sync::Mutex;

use crate::errors::ContainerRuntimeError;

/// Definition of the sandbox image, sent as the only file of the build context.
pub const SANDBOX_DOCKERFILE: &str = include_str!("../../docker/code-executor/Dockerfile");

/// Engine operations needed to make an image available.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerRuntimeError>;
    async fn build_image(&self, tag: &str) -> Result<(), ContainerRuntimeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    Unknown,
    Ready,
    Failed(String),
}

#[derive(Debug)]
pub struct ImageGate {
    tag: String,
    build_on_demand: bool,
    state: Mutex<ImageState>,
}

impl ImageGate {
    pub fn new(tag: impl Into<String>, build_on_demand: bool) -> Self {
        Self {
            tag: tag.into(),
            build_on_demand,
            state: Mutex::new(ImageState::Unknown),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn state(&self) -> ImageState {
        self.state.lock().await.clone()
    }

    pub async fn ensure<P>(&self, provider: &P) -> Result<(), ContainerRuntimeError>
    where
        P: ImageProvider + ?Sized,
    {
        let mut state = self.state.lock().await;
        match &*state {
            ImageState::Ready => return Ok(()),
            ImageState::Failed(reason) => {
                return Err(ContainerRuntimeError::ImageBuild {
                    tag: self.tag.clone(),
                    reason: reason.clone(),
                })
            }
            ImageState::Unknown => {}
        }

        // Lookup failures (daemon unreachable) are not build attempts; stay Unknown.
        if provider.image_exists(&self.tag).await? {
            log::info!("Sandbox image {} already exists", self.tag);
            *state = ImageState::Ready;
            return Ok(());
        }

        let result = if self.build_on_demand {
            log::info!("Sandbox image {} not found, building it", self.tag);
            provider.build_image(&self.tag).await
        } else {
            Err(ContainerRuntimeError::ImageBuild {
                tag: self.tag.clone(),
                reason: "image is missing and building on demand is disabled".to_string(),
            })
        };

        self.record_build(&mut state, result)
    }

    /// Builds the image unconditionally while holding the lock, so callers of
    /// [`ImageGate::ensure`] wait for the new image instead of starting their
    /// own build.
    pub async fn rebuild<P>(&self, provider: &P) -> Result<(), ContainerRuntimeError>
    where
        P: ImageProvider + ?Sized,
    {
        let mut state = self.state.lock().await;
        log::info!("Rebuilding sandbox image {}", self.tag);
        let result = provider.build_image(&self.tag).await;
        self.record_build(&mut state, result)
    }

    fn record_build(
        &self,
        state: &mut ImageState,
        result: Result<(), ContainerRuntimeError>,
    ) -> Result<(), ContainerRuntimeError> {
        match result {
            Ok(()) => {
                log::info!("Sandbox image {} built successfully", self.tag);
                *state = ImageState::Ready;
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    ContainerRuntimeError::ImageBuild { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                log::error!("Building sandbox image {} failed: {}", self.tag, reason);
                *state = ImageState::Failed(reason.clone());
                Err(ContainerRuntimeError::ImageBuild {
                    tag: self.tag.clone(),
                    reason,
                })
            }
        }
    }

    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        log::info!("Sandbox image state for {} invalidated", self.tag);
        *state = ImageState::Unknown;
    }
}

/// Packs [`SANDBOX_DOCKERFILE`] into an in-memory tar build context.
pub fn build_context() -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(SANDBOX_DOCKERFILE.len() as u64);
    header.set_mode(0o644);
    archive.append_data(&mut header, "Dockerfile", SANDBOX_DOCKERFILE.as_bytes())?;
    archive.into_inner()
}

/// [`ImageProvider`] backed by the Docker engine API.
#[derive(Debug, Clone)]
pub struct DockerImageProvider {
    docker: Docker,
}

impl DockerImageProvider {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ImageProvider for DockerImageProvider {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerRuntimeError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str) -> Result<(), ContainerRuntimeError> {
        let build_failed = |reason: String| ContainerRuntimeError::ImageBuild {
            tag: tag.to_string(),
            reason,
        };

        let context = build_context().map_err(|e| build_failed(e.to_string()))?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

        while let Some(item) = build_stream.next().await {
            let info = item.map_err(|e| build_failed(e.to_string()))?;
            if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
                return Err(build_failed(message));
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    log::debug!("[image build] {}", line);
                }
            }
        }

        Ok(())
    }
}
