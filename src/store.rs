//! Project and fragment store traits.
//!
//! Persistence lives outside this crate; these traits are the narrow query
//! surface the controller needs. Fragment queries are ordering queries over a
//! project's history (latest by creation, latest by update, latest with a
//! snapshot image below a creation-time ceiling).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{BuildStatus, Fragment, FragmentId, Project, ProjectId, SandboxId};

/// Field updates applied to a project when recovery completes.
///
/// Applied as simple field writes, not a multi-statement transaction with the
/// provider calls: consistency comes from ordering (provider success before
/// the store write) and idempotent re-verification.
#[derive(Debug, Clone)]
pub struct ProjectRecoveryUpdate {
    /// The freshly materialized sandbox.
    pub sandbox_id: SandboxId,

    /// Preview URL of the new sandbox.
    pub sandbox_url: Option<String>,

    /// Fragment used for recovery; `None` leaves the active pointer unchanged.
    pub active_fragment_id: Option<FragmentId>,

    pub build_status: BuildStatus,

    pub status_updated_at: DateTime<Utc>,
}

/// Read/update surface over projects.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Loads a project by id.
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;

    /// Applies the recovery field updates and clears any stored build error.
    async fn apply_recovery(&self, id: &ProjectId, update: ProjectRecoveryUpdate) -> Result<()>;

    /// Projects whose current sandbox pointer references `sandbox_id`.
    async fn projects_referencing_sandbox(&self, sandbox_id: &SandboxId) -> Result<Vec<ProjectId>>;
}

/// Read surface over a project's fragment history.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Loads a fragment by id.
    async fn get_fragment(&self, id: &FragmentId) -> Result<Option<Fragment>>;

    /// Number of fragments recorded for the project.
    async fn count_for_project(&self, project_id: &ProjectId) -> Result<u64>;

    /// Most recently created fragment of the project.
    async fn latest_created(&self, project_id: &ProjectId) -> Result<Option<Fragment>>;

    /// Most recently updated fragment of the project.
    async fn latest_updated(&self, project_id: &ProjectId) -> Result<Option<Fragment>>;

    /// Latest fragment carrying a snapshot image, optionally bounded by an
    /// inclusive creation-time ceiling.
    async fn latest_with_snapshot(
        &self,
        project_id: &ProjectId,
        created_at_or_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Fragment>>;

    /// Associates a filesystem snapshot image with a fragment.
    async fn attach_snapshot_image(
        &self,
        fragment_id: &FragmentId,
        snapshot_image_id: &str,
    ) -> Result<()>;
}
