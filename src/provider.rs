//! Sandbox provider trait and request/response types.
//!
//! The provider is an external capability set: this crate consumes it, never
//! implements the runtime behind it. Every call crosses a network boundary;
//! callers bound the long-pole operations (creation, snapshotting) with their
//! own timeouts, and a timeout is treated like any other provider failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Environment;
use crate::error::Result;
use crate::model::{FragmentId, ProjectId, SandboxId};

/// Provenance-specific options for creating a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxOptions {
    /// Filesystem snapshot image to seed the sandbox from, if one exists.
    /// Without it the provider falls back to the template skeleton.
    #[serde(default)]
    pub recovery_snapshot_image_id: Option<String>,

    /// Whether the project was imported from an external source.
    #[serde(default)]
    pub is_imported_project: bool,

    /// Where the project was imported from, when known, so the provider can
    /// apply provenance-specific bootstrapping.
    #[serde(default)]
    pub imported_from: Option<String>,
}

/// Request to materialize a sandbox for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub project_id: ProjectId,

    /// Fragment whose files seed the sandbox, when one exists.
    pub fragment_id: Option<FragmentId>,

    /// Template skeleton to bootstrap from when no snapshot image is given.
    pub template_name: String,

    #[serde(default)]
    pub options: CreateSandboxOptions,
}

/// A sandbox created by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSandbox {
    pub sandbox_id: SandboxId,
    /// Preview URL served by the sandbox.
    pub sandbox_url: String,
}

/// Capability set consumed from the sandbox host.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Creates a sandbox seeded from a snapshot image or a template.
    async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<CreatedSandbox>;

    /// Deletes a sandbox.
    async fn delete_sandbox(&self, sandbox_id: &SandboxId, project_id: &ProjectId) -> Result<()>;

    /// Lists file paths present in the sandbox filesystem.
    async fn list_files(&self, sandbox_id: &SandboxId) -> Result<Vec<String>>;

    /// Takes a filesystem snapshot of a running sandbox, returning the image
    /// id that can instantiate new sandboxes without replaying file writes.
    async fn create_filesystem_snapshot(
        &self,
        sandbox_id: &SandboxId,
        fragment_id: &FragmentId,
        project_id: &ProjectId,
    ) -> Result<String>;

    /// Returns whether a pre-baked image exists for `(template, environment)`.
    async fn has_snapshot(&self, template_name: &str, environment: Environment) -> Result<bool>;
}
