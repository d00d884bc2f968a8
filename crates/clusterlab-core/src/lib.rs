//! Sandboxed execution of untrusted clustering experiments.
//!
//! Short Python snippets (scikit-learn, scipy and matplotlib experiments) go
//! through a fixed pipeline, each stage in its own module:
//!
//! - **security**: static rejection of dangerous constructs before anything
//!   touches the host
//! - **harness** and **workspace**: wrapping the snippet into a script that
//!   captures output and figures, written to a single-use directory
//! - **executors**: one resource-capped, network-less container per run
//! - **parser**: turning whatever the container printed into an
//!   [`ExecutionEnvelope`], degrading instead of failing
//! - **service**: the orchestration that ties the stages together and
//!   guarantees cleanup
//!
//! ```no_run
//! use clusterlab_core::{CodeExecutionService, ExecutionRequest, SandboxConfig};
//!
//! # async fn demo() -> Result<(), clusterlab_core::SandboxError> {
//! let service = CodeExecutionService::connect(SandboxConfig::default())?;
//! let envelope = service
//!     .execute_envelope(ExecutionRequest::new("print(1 + 1)"))
//!     .await;
//! println!("{}", envelope.to_json());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod errors;
pub mod executors;
pub mod harness;
pub mod parser;
pub mod security;
pub mod service;
pub mod workspace;

pub use config::*;
pub use envelope::{EnvelopeImage, ExecutionEnvelope, ExecutionRequest};
pub use errors::{
    ContainerRuntimeError, ResultParseError, SandboxError, SecurityRule, SecurityViolation,
};
pub use executors::docker::DockerRuntime;
pub use executors::SandboxRuntime;
pub use parser::ResultParser;
pub use security::SecurityValidator;
pub use service::{CodeExecutionService, ExecutionState, ReapReport};
pub use workspace::{EnvironmentBuilder, Workspace};
