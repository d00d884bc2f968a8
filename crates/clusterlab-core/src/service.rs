//! Orchestration of one execution: validate, build, run, parse, clean up.
//!
//! [`CodeExecutionService`] is constructed once and shared through `Arc`. The
//! only state shared between executions is the image readiness held by the
//! runtime; everything else is owned by the call in flight.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::envelope::{ExecutionEnvelope, ExecutionRequest};
use crate::errors::{ContainerRuntimeError, SandboxError, SecurityViolation};
use crate::executors::docker::{DockerRuntime, OOM_EXIT_CODE};
use crate::executors::SandboxRuntime;
use crate::parser::ResultParser;
use crate::security::SecurityValidator;
use crate::workspace::{reap_stale_workspaces, EnvironmentBuilder, Workspace};

/// Lifecycle of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Received,
    Validating,
    Rejected,
    Building,
    Running,
    TimedOut,
    Completed,
    RuntimeFailed,
    Parsing,
    Done,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Rejected
                | ExecutionState::TimedOut
                | ExecutionState::RuntimeFailed
                | ExecutionState::Done
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Rejected)
                | (Validating, Building)
                // A workspace that cannot be materialized is a host failure.
                | (Building, RuntimeFailed)
                | (Building, Running)
                | (Running, TimedOut)
                | (Running, Completed)
                | (Running, RuntimeFailed)
                | (Completed, Parsing)
                | (Parsing, Done)
        )
    }
}

/// Current state plus the id that prefixes every log line of one execution.
#[derive(Debug)]
pub struct ExecutionTracker {
    id: Uuid,
    state: ExecutionState,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ExecutionState::Received,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn advance(&mut self, next: ExecutionState) {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "[{}] Unexpected state transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
        }
        log::debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts of resources removed by [`CodeExecutionService::reap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub containers: usize,
    pub workspaces: usize,
}

pub struct CodeExecutionService {
    config: SandboxConfig,
    validator: SecurityValidator,
    builder: EnvironmentBuilder,
    runtime: Arc<dyn SandboxRuntime>,
}

impl CodeExecutionService {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn SandboxRuntime>) -> Result<Self, SandboxError> {
        config.validate()?;
        let validator = SecurityValidator::new(&config.validator)?;
        let builder = EnvironmentBuilder::new(config.workspace.root_dir());
        Ok(Self {
            config,
            validator,
            builder,
            runtime,
        })
    }

    /// A service backed by the local Docker daemon.
    pub fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let runtime = DockerRuntime::new(&config)?;
        Self::new(config, Arc::new(runtime))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Makes the sandbox image available ahead of the first request.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        self.runtime.ensure_image().await?;
        Ok(())
    }

    /// Runs only the static checks.
    pub fn validate(&self, code: &str) -> Result<(), SecurityViolation> {
        self.validator.validate(code)
    }

    /// Executes one request.
    ///
    /// A rejected submission comes back as `Err` so callers can tell "fix your
    /// code" apart from "execution failed"; every other outcome, including
    /// engine and host failures, is an envelope. The workspace is gone by the
    /// time this returns.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionEnvelope, SecurityViolation> {
        let mut tracker = ExecutionTracker::new();
        let id = tracker.id();
        log::info!("[{}] Execution received ({} bytes of code)", id, request.code.len());

        tracker.advance(ExecutionState::Validating);
        if let Err(violation) = self.validator.validate(&request.code) {
            tracker.advance(ExecutionState::Rejected);
            log::info!("[{}] Rejected by {} check: {}", id, violation.rule, violation.message);
            return Err(violation);
        }

        tracker.advance(ExecutionState::Building);
        let workspace = match self.builder.build(&request).await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracker.advance(ExecutionState::RuntimeFailed);
                log::error!("[{}] Could not prepare workspace: {}", id, e);
                return Ok(ExecutionEnvelope::failure("", failure_message(&e)));
            }
        };

        let timeout = self.config.limits.effective_timeout(request.timeout);
        tracker.advance(ExecutionState::Running);
        log::debug!(
            "[{}] Running {} with timeout {:?}",
            id,
            workspace.path().display(),
            timeout
        );
        let outcome = self.runtime.run(&workspace, timeout).await;
        let envelope = self.conclude(&mut tracker, outcome);

        close_workspace(id, workspace);
        log::info!("[{}] Execution finished (success: {})", id, envelope.success());
        Ok(envelope)
    }

    /// Like [`execute`](Self::execute), with rejections normalized into an envelope.
    pub async fn execute_envelope(&self, request: ExecutionRequest) -> ExecutionEnvelope {
        self.execute(request).await.unwrap_or_else(ExecutionEnvelope::from)
    }

    /// Forgets the cached image state, allowing another build attempt.
    pub async fn invalidate_image(&self) {
        self.runtime.invalidate_image().await;
    }

    /// Removes stale workspaces and orphaned containers.
    ///
    /// `max_age` defaults to `workspace.stale_after_secs`.
    pub async fn reap(&self, max_age: Option<Duration>) -> Result<ReapReport, SandboxError> {
        let max_age =
            max_age.unwrap_or_else(|| Duration::from_secs(self.config.workspace.stale_after_secs));
        let workspaces = reap_stale_workspaces(self.builder.root(), max_age).await?;
        let containers = self.runtime.reap_orphans().await?;
        log::info!(
            "Reaped {} container(s) and {} workspace(s)",
            containers,
            workspaces
        );
        Ok(ReapReport {
            containers,
            workspaces,
        })
    }

    fn conclude(
        &self,
        tracker: &mut ExecutionTracker,
        outcome: Result<String, SandboxError>,
    ) -> ExecutionEnvelope {
        let id = tracker.id();
        match outcome {
            Ok(raw) => {
                tracker.advance(ExecutionState::Completed);
                tracker.advance(ExecutionState::Parsing);
                let envelope = ResultParser::parse(&raw);
                tracker.advance(ExecutionState::Done);
                envelope
            }
            Err(SandboxError::ContainerRuntime(ContainerRuntimeError::Timeout(limit))) => {
                tracker.advance(ExecutionState::TimedOut);
                log::warn!("[{}] Timed out after {:?}", id, limit);
                ExecutionEnvelope::failure(
                    "",
                    ContainerRuntimeError::Timeout(limit).to_string(),
                )
            }
            Err(SandboxError::ContainerRuntime(ContainerRuntimeError::NonZeroExit {
                code,
                output,
            })) => match ResultParser::try_parse(&output) {
                // The harness got its envelope out before the interpreter died.
                Ok(envelope) => {
                    tracker.advance(ExecutionState::Completed);
                    tracker.advance(ExecutionState::Parsing);
                    tracker.advance(ExecutionState::Done);
                    envelope
                }
                // Raw output may hold tracebacks and harness paths; keep it in the logs.
                Err(_) => {
                    tracker.advance(ExecutionState::RuntimeFailed);
                    log::error!("[{}] Sandbox exited with code {}: {}", id, code, output.trim_end());
                    ExecutionEnvelope::failure("", exit_message(code))
                }
            },
            Err(e) => {
                tracker.advance(ExecutionState::RuntimeFailed);
                log::error!("[{}] Execution failed: {}", id, e);
                ExecutionEnvelope::failure("", failure_message(&e))
            }
        }
    }
}

fn close_workspace(id: Uuid, workspace: Workspace) {
    let path = workspace.path().to_path_buf();
    match workspace.close() {
        Ok(()) => log::debug!("[{}] Removed workspace {}", id, path.display()),
        Err(e) => log::warn!("[{}] {}", id, e),
    }
}

/// Caller-facing text for a failure; details stay in the logs.
pub fn failure_message(err: &SandboxError) -> String {
    match err {
        SandboxError::ContainerRuntime(ContainerRuntimeError::Timeout(limit)) => {
            ContainerRuntimeError::Timeout(*limit).to_string()
        }
        SandboxError::ContainerRuntime(ContainerRuntimeError::NonZeroExit { code, .. }) => {
            exit_message(*code)
        }
        SandboxError::ContainerRuntime(_) => {
            "Execution failed: the sandbox is unavailable".to_string()
        }
        SandboxError::Security(violation) => violation.message.clone(),
        SandboxError::System(_) | SandboxError::Config(_) => {
            "Execution failed: internal error".to_string()
        }
    }
}

fn exit_message(code: i64) -> String {
    if code == OOM_EXIT_CODE {
        format!(
            "Execution failed: sandbox exited with code {} (memory limit exceeded?)",
            code
        )
    } else {
        format!("Execution failed: sandbox exited with code {}", code)
    }
}
