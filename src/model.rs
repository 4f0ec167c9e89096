//! Core data model: projects, fragments, and their identifiers.
//!
//! Projects and fragments live in external stores; the types here are the
//! controller's view of them. Fragments are immutable once created apart from
//! the snapshot-image pointer attached after a baseline bootstrap.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Creates a project id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(String);

impl FragmentId {
    /// Creates a fragment id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FragmentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for FragmentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a sandbox held by the provider.
///
/// Sandboxes are external, ephemeral resources referenced by id only; the
/// provider may tear one down out-of-band at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Creates a sandbox id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Build status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// No build has been requested yet.
    #[default]
    Pending,
    /// A build is in flight.
    Building,
    /// The last build completed and the project should have a live sandbox.
    Ready,
    /// The last build failed.
    Failed,
}

/// Import record linked to a project, carrying its own provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Where the project was imported from (e.g. a repository host).
    pub source: String,
}

/// A user project and its sandbox bookkeeping.
///
/// Mutated by the recovery orchestrator (sandbox pointer, build status, active
/// fragment) and by upstream build pipelines. Never deleted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,

    /// Current sandbox, if one has been provisioned.
    #[serde(default)]
    pub sandbox_id: Option<SandboxId>,

    /// Preview URL of the current sandbox.
    #[serde(default)]
    pub sandbox_url: Option<String>,

    /// Provider tag; `None` means the provider this controller manages.
    #[serde(default)]
    pub sandbox_provider: Option<String>,

    /// Fragment the user is currently viewing.
    #[serde(default)]
    pub active_fragment_id: Option<FragmentId>,

    #[serde(default)]
    pub build_status: BuildStatus,

    /// Error message from the last failed build, cleared on recovery.
    #[serde(default)]
    pub build_error: Option<String>,

    /// Import provenance tag, if the project was imported.
    #[serde(default)]
    pub imported_from: Option<String>,

    /// Linked import record, when one exists.
    #[serde(default)]
    pub import_record: Option<ImportRecord>,

    /// When the build status last changed.
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Creates a project with no sandbox, no fragments, and a pending build.
    pub fn new(id: impl Into<ProjectId>) -> Self {
        Self {
            id: id.into(),
            sandbox_id: None,
            sandbox_url: None,
            sandbox_provider: None,
            active_fragment_id: None,
            build_status: BuildStatus::default(),
            build_error: None,
            imported_from: None,
            import_record: None,
            status_updated_at: None,
        }
    }

    /// Sets the sandbox pointer.
    pub fn with_sandbox(mut self, id: impl Into<SandboxId>) -> Self {
        self.sandbox_id = Some(id.into());
        self
    }

    /// Tags the project with a sandbox provider.
    pub fn with_provider_tag(mut self, tag: impl Into<String>) -> Self {
        self.sandbox_provider = Some(tag.into());
        self
    }

    /// Sets the active fragment pointer.
    pub fn with_active_fragment(mut self, id: impl Into<FragmentId>) -> Self {
        self.active_fragment_id = Some(id.into());
        self
    }

    /// Sets the build status.
    pub fn with_build_status(mut self, status: BuildStatus) -> Self {
        self.build_status = status;
        self
    }

    /// Marks the project as imported from the given source.
    pub fn with_import_origin(mut self, from: impl Into<String>) -> Self {
        self.imported_from = Some(from.into());
        self
    }

    /// Returns the import origin, preferring the linked import record over
    /// the plain provenance tag.
    pub fn import_origin(&self) -> Option<&str> {
        self.import_record
            .as_ref()
            .map(|record| record.source.as_str())
            .or(self.imported_from.as_deref())
    }

    /// Returns whether the project was imported from an external source.
    pub fn is_imported(&self) -> bool {
        self.import_origin().is_some()
    }
}

/// An immutable, timestamped snapshot of a project's file tree.
///
/// A fragment with a snapshot image id can be restored instantly from the
/// provider-side image; one without can only seed a fresh sandbox from a
/// template plus file writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub project_id: ProjectId,

    /// Path -> file content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Provider-side filesystem snapshot taken from a sandbox that had these
    /// files materialized.
    #[serde(default)]
    pub snapshot_image_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fragment {
    /// Creates an empty fragment stamped with the current time.
    pub fn new(id: impl Into<FragmentId>, project_id: impl Into<ProjectId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            files: BTreeMap::new(),
            snapshot_image_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds a file to the fragment.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Sets the snapshot image pointer.
    pub fn with_snapshot_image(mut self, image: impl Into<String>) -> Self {
        self.snapshot_image_id = Some(image.into());
        self
    }

    /// Back-dates both timestamps, for ordering-sensitive scenarios.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Sets the update timestamp.
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// Returns whether this fragment can be restored from a snapshot image.
    pub fn is_recoverable(&self) -> bool {
        self.snapshot_image_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_defaults_are_empty() {
        let project = Project::new("p1");

        assert_eq!(project.id.as_str(), "p1");
        assert!(project.sandbox_id.is_none());
        assert!(project.active_fragment_id.is_none());
        assert_eq!(project.build_status, BuildStatus::Pending);
        assert!(!project.is_imported());
    }

    #[test]
    fn project_builder_sets_fields() {
        let project = Project::new("p1")
            .with_sandbox("sbx-1")
            .with_active_fragment("f1")
            .with_build_status(BuildStatus::Ready)
            .with_provider_tag("other-host");

        assert_eq!(project.sandbox_id, Some(SandboxId::from("sbx-1")));
        assert_eq!(project.active_fragment_id, Some(FragmentId::from("f1")));
        assert_eq!(project.build_status, BuildStatus::Ready);
        assert_eq!(project.sandbox_provider.as_deref(), Some("other-host"));
    }

    #[test]
    fn import_origin_prefers_linked_record() {
        let mut project = Project::new("p1").with_import_origin("github");
        assert_eq!(project.import_origin(), Some("github"));

        project.import_record = Some(ImportRecord {
            source: "gitlab".to_string(),
        });
        assert_eq!(project.import_origin(), Some("gitlab"));
        assert!(project.is_imported());
    }

    #[test]
    fn fragment_recoverable_only_with_snapshot_image() {
        let fragment = Fragment::new("f1", "p1").with_file("src/main.tsx", "export {}");
        assert!(!fragment.is_recoverable());

        let fragment = fragment.with_snapshot_image("img-1");
        assert!(fragment.is_recoverable());
    }

    #[test]
    fn build_status_serializes_to_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Ready).unwrap(),
            "\"ready\""
        );
        assert_eq!(
            serde_json::to_string(&BuildStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ProjectId::from("p-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p-42\"");
        assert_eq!(format!("{}", id), "p-42");
    }
}
