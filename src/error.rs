//! Error types for the sandbox-warden controller.

use thiserror::Error;

use crate::model::{ProjectId, SandboxId};

/// Top-level error type for health and recovery operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The project does not exist. Fatal, not retried.
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    /// The project has no fragments, so there is no content to recover.
    #[error("project {0} has no content to recover")]
    NothingToRecover(ProjectId),

    /// A freshly materialized sandbox failed re-verification. Fatal; the
    /// caller decides whether to retry the whole operation.
    #[error("recovery of project {project} failed verification against sandbox {sandbox}")]
    VerificationFailed {
        project: ProjectId,
        sandbox: SandboxId,
    },

    /// The project's sandbox is broken and recovery has not completed.
    /// User-facing and transient: retry shortly.
    #[error("sandbox for project {0} is unavailable; recovery in progress, retry shortly")]
    SandboxUnavailable(ProjectId),

    /// A project or fragment store call failed.
    #[error("store error: {0}")]
    Store(String),

    /// A sandbox provider call failed.
    #[error("sandbox provider error: {0}")]
    Provider(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for health and recovery operations.
pub type Result<T> = std::result::Result<T, Error>;
