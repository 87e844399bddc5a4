//! Error taxonomy for the orchestration core
//!
//! Registry and router errors are local and recoverable by the caller.
//! Anything that reaches the orchestrator ends the pipeline run and is
//! reported through [`OrchestratorError::PipelineFailed`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::pipeline::PipelineStage;
use crate::registry::Capability;

/// Result alias used throughout the core
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Errors raised by the registry, router, pool manager and orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// An agent with the same id is already registered.
    #[error("agent already registered: {agent_id}")]
    DuplicateAgent { agent_id: String },

    /// A tool name collides with an existing registration.
    #[error("tool already registered: {tool}")]
    DuplicateTool { tool: String },

    /// A tool claims a capability its owning agent does not declare.
    #[error("tool '{tool}' serves {capability} which agent '{agent_id}' does not declare")]
    UndeclaredCapability {
        agent_id: String,
        tool: String,
        capability: Capability,
    },

    /// Discovery found nothing to invoke.
    #[error("no provider available for {target}")]
    NoProvider { target: String },

    /// Invocation parameters did not match the tool's schema.
    #[error("invalid parameters for '{tool}': {message}")]
    Validation { tool: String, message: String },

    /// The handler failed.
    #[error("tool '{tool}' failed: {message}")]
    Invocation { tool: String, message: String },

    /// The handler did not answer within the configured window.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// Pool creation failed.
    #[error("failed to spawn pool '{pool_type}': {message}")]
    Spawn { pool_type: String, message: String },

    /// Dataset characteristics could not be turned into an allocation.
    #[error("cannot allocate resources: {message}")]
    Allocation { message: String },

    /// The state machine was asked to move backwards or out of a terminal state.
    #[error("invalid pipeline transition {from} -> {to}")]
    InvalidTransition { from: PipelineStage, to: PipelineStage },

    /// No pipeline with that id exists.
    #[error("unknown pipeline: {pipeline_id}")]
    UnknownPipeline { pipeline_id: String },

    /// `approve_escalation` was called on a pipeline that is not paused.
    #[error("pipeline {pipeline_id} is not awaiting approval (stage: {stage})")]
    NotAwaitingApproval { pipeline_id: String, stage: PipelineStage },

    /// `forget_pipeline` was called on a run that has not finished.
    #[error("pipeline {pipeline_id} is still active (stage: {stage})")]
    PipelineActive { pipeline_id: String, stage: PipelineStage },

    /// A stage task panicked or a run stopped without settling.
    #[error("internal failure: {message}")]
    Internal { message: String },

    /// A pipeline run terminated; wraps the cause.
    #[error("pipeline failed during {stage}: {source}")]
    PipelineFailed {
        stage: PipelineStage,
        #[source]
        source: Box<OrchestratorError>,
    },
}

/// Serializable tag of an [`OrchestratorError`], surfaced in failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateAgent,
    DuplicateTool,
    UndeclaredCapability,
    NoProvider,
    Validation,
    Invocation,
    Timeout,
    Spawn,
    Allocation,
    InvalidTransition,
    UnknownPipeline,
    NotAwaitingApproval,
    PipelineActive,
    Internal,
    PipelineFailed,
}

impl OrchestratorError {
    /// Tag of this error. For `PipelineFailed` the tag of the underlying cause is returned.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateAgent { .. } => ErrorKind::DuplicateAgent,
            Self::DuplicateTool { .. } => ErrorKind::DuplicateTool,
            Self::UndeclaredCapability { .. } => ErrorKind::UndeclaredCapability,
            Self::NoProvider { .. } => ErrorKind::NoProvider,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Invocation { .. } => ErrorKind::Invocation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::UnknownPipeline { .. } => ErrorKind::UnknownPipeline,
            Self::NotAwaitingApproval { .. } => ErrorKind::NotAwaitingApproval,
            Self::PipelineActive { .. } => ErrorKind::PipelineActive,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::PipelineFailed { source, .. } => source.kind(),
        }
    }

    /// Wrap this error as the cause of a pipeline failure at `stage`.
    pub fn at_stage(self, stage: PipelineStage) -> Self {
        match self {
            already @ Self::PipelineFailed { .. } => already,
            other => Self::PipelineFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn no_provider(target: impl std::fmt::Display) -> Self {
        Self::NoProvider {
            target: target.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::DuplicateAgent => "DuplicateAgentError",
            ErrorKind::DuplicateTool => "DuplicateToolError",
            ErrorKind::UndeclaredCapability => "UndeclaredCapabilityError",
            ErrorKind::NoProvider => "NoProviderError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Invocation => "InvocationError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Spawn => "SpawnError",
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::InvalidTransition => "InvalidTransitionError",
            ErrorKind::UnknownPipeline => "UnknownPipelineError",
            ErrorKind::NotAwaitingApproval => "NotAwaitingApprovalError",
            ErrorKind::PipelineActive => "PipelineActiveError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::PipelineFailed => "PipelineFailed",
        };
        write!(f, "{}", s)
    }
}
