//! In-memory store and provider implementations.
//!
//! These back the controller in tests and lightweight embeddings without a
//! database or a live sandbox host. The provider records every call and can
//! be scripted to fail specific operations, so failure paths are exercisable
//! without a flaky backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Environment;
use crate::error::{Error, Result};
use crate::model::{Fragment, FragmentId, Project, ProjectId, SandboxId};
use crate::provider::{CreateSandboxRequest, CreatedSandbox, SandboxProvider};
use crate::recovery::{RecoveryEvent, RecoveryObserver};
use crate::store::{FragmentStore, ProjectRecoveryUpdate, ProjectStore};

/// Locks a mutex, tolerating poisoning from a panicked test thread.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`ProjectStore`].
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<ProjectId, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a project.
    pub fn insert(&self, project: Project) {
        lock(&self.projects).insert(project.id.clone(), project);
    }

    /// Returns a copy of the stored project.
    pub fn get(&self, id: &ProjectId) -> Option<Project> {
        lock(&self.projects).get(id).cloned()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.get(id))
    }

    async fn apply_recovery(&self, id: &ProjectId, update: ProjectRecoveryUpdate) -> Result<()> {
        let mut projects = lock(&self.projects);
        let project = projects
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("project {} not found", id)))?;
        project.sandbox_id = Some(update.sandbox_id);
        project.sandbox_url = update.sandbox_url;
        if let Some(fragment_id) = update.active_fragment_id {
            project.active_fragment_id = Some(fragment_id);
        }
        project.build_status = update.build_status;
        project.build_error = None;
        project.status_updated_at = Some(update.status_updated_at);
        Ok(())
    }

    async fn projects_referencing_sandbox(&self, sandbox_id: &SandboxId) -> Result<Vec<ProjectId>> {
        Ok(lock(&self.projects)
            .values()
            .filter(|project| project.sandbox_id.as_ref() == Some(sandbox_id))
            .map(|project| project.id.clone())
            .collect())
    }
}

/// In-memory [`FragmentStore`].
#[derive(Default)]
pub struct MemoryFragmentStore {
    fragments: Mutex<HashMap<FragmentId, Fragment>>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a fragment.
    pub fn insert(&self, fragment: Fragment) {
        lock(&self.fragments).insert(fragment.id.clone(), fragment);
    }

    /// Returns a copy of the stored fragment.
    pub fn get(&self, id: &FragmentId) -> Option<Fragment> {
        lock(&self.fragments).get(id).cloned()
    }

    fn for_project(&self, project_id: &ProjectId) -> Vec<Fragment> {
        lock(&self.fragments)
            .values()
            .filter(|fragment| &fragment.project_id == project_id)
            .cloned()
            .collect()
    }
}

/// Picks the maximum by timestamp with the fragment id as a stable tie-break.
fn latest_by<K>(fragments: Vec<Fragment>, key: K) -> Option<Fragment>
where
    K: Fn(&Fragment) -> DateTime<Utc>,
{
    fragments
        .into_iter()
        .max_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id)))
}

#[async_trait]
impl FragmentStore for MemoryFragmentStore {
    async fn get_fragment(&self, id: &FragmentId) -> Result<Option<Fragment>> {
        Ok(self.get(id))
    }

    async fn count_for_project(&self, project_id: &ProjectId) -> Result<u64> {
        Ok(self.for_project(project_id).len() as u64)
    }

    async fn latest_created(&self, project_id: &ProjectId) -> Result<Option<Fragment>> {
        Ok(latest_by(self.for_project(project_id), |f| f.created_at))
    }

    async fn latest_updated(&self, project_id: &ProjectId) -> Result<Option<Fragment>> {
        Ok(latest_by(self.for_project(project_id), |f| f.updated_at))
    }

    async fn latest_with_snapshot(
        &self,
        project_id: &ProjectId,
        created_at_or_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Fragment>> {
        let candidates = self
            .for_project(project_id)
            .into_iter()
            .filter(|fragment| fragment.snapshot_image_id.is_some())
            .filter(|fragment| {
                created_at_or_before
                    .map(|ceiling| fragment.created_at <= ceiling)
                    .unwrap_or(true)
            })
            .collect();
        Ok(latest_by(candidates, |f| f.created_at))
    }

    async fn attach_snapshot_image(
        &self,
        fragment_id: &FragmentId,
        snapshot_image_id: &str,
    ) -> Result<()> {
        let mut fragments = lock(&self.fragments);
        let fragment = fragments
            .get_mut(fragment_id)
            .ok_or_else(|| Error::Store(format!("fragment {} not found", fragment_id)))?;
        fragment.snapshot_image_id = Some(snapshot_image_id.to_string());
        Ok(())
    }
}

/// Call record kept by [`MemorySandboxProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create {
        project: ProjectId,
        template: String,
        snapshot_image: Option<String>,
    },
    Delete {
        sandbox: SandboxId,
    },
    ListFiles {
        sandbox: SandboxId,
    },
    Snapshot {
        sandbox: SandboxId,
        fragment: FragmentId,
    },
    HasSnapshot {
        template: String,
    },
}

/// In-memory, scriptable [`SandboxProvider`].
///
/// Sandboxes are file listings keyed by id; snapshot images remember the
/// files of the sandbox they were taken from, so image-seeded sandboxes come
/// up with those files.
#[derive(Default)]
pub struct MemorySandboxProvider {
    files: Mutex<HashMap<SandboxId, Vec<String>>>,
    default_files: Mutex<Vec<String>>,
    snapshot_files: Mutex<HashMap<String, Vec<String>>>,
    templates: Mutex<HashMap<SandboxId, String>>,
    baked: Mutex<HashSet<(String, Environment)>>,
    calls: Mutex<Vec<ProviderCall>>,
    requests: Mutex<Vec<CreateSandboxRequest>>,
    fail_next_creates: AtomicUsize,
    fail_snapshots: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the files reported by sandboxes created from now on.
    pub fn set_default_files(&self, files: &[&str]) {
        *lock(&self.default_files) = files.iter().map(|f| f.to_string()).collect();
    }

    /// Registers a sandbox with an explicit file listing.
    pub fn set_files(&self, sandbox_id: &SandboxId, files: &[&str]) {
        lock(&self.files).insert(
            sandbox_id.clone(),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    /// Marks a pre-baked image as available for `(template, environment)`.
    pub fn mark_baked(&self, template: &str, environment: Environment) {
        lock(&self.baked).insert((template.to_string(), environment));
    }

    /// Fails the next `count` create calls.
    pub fn fail_next_creates(&self, count: usize) {
        self.fail_next_creates.store(count, Ordering::SeqCst);
    }

    /// Toggles failure of snapshot calls.
    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Toggles failure of delete calls.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Returns every recorded call in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Returns every create request in order, with full options.
    pub fn create_requests(&self) -> Vec<CreateSandboxRequest> {
        lock(&self.requests).clone()
    }

    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<CreatedSandbox> {
        self.record(ProviderCall::Create {
            project: request.project_id.clone(),
            template: request.template_name.clone(),
            snapshot_image: request.options.recovery_snapshot_image_id.clone(),
        });
        lock(&self.requests).push(request.clone());

        if self.fail_next_creates.load(Ordering::SeqCst) > 0 {
            self.fail_next_creates.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Provider("scripted create failure".to_string()));
        }

        let sandbox_id = SandboxId::new(format!("sbx-{}", uuid::Uuid::new_v4()));
        let files = request
            .options
            .recovery_snapshot_image_id
            .as_ref()
            .and_then(|image| lock(&self.snapshot_files).get(image).cloned())
            .unwrap_or_else(|| lock(&self.default_files).clone());
        lock(&self.files).insert(sandbox_id.clone(), files);
        lock(&self.templates).insert(sandbox_id.clone(), request.template_name.clone());

        Ok(CreatedSandbox {
            sandbox_url: format!("https://{}.sandbox.test", sandbox_id),
            sandbox_id,
        })
    }

    async fn delete_sandbox(&self, sandbox_id: &SandboxId, _project_id: &ProjectId) -> Result<()> {
        self.record(ProviderCall::Delete {
            sandbox: sandbox_id.clone(),
        });
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Provider("scripted delete failure".to_string()));
        }
        lock(&self.files).remove(sandbox_id);
        lock(&self.templates).remove(sandbox_id);
        Ok(())
    }

    async fn list_files(&self, sandbox_id: &SandboxId) -> Result<Vec<String>> {
        self.record(ProviderCall::ListFiles {
            sandbox: sandbox_id.clone(),
        });
        lock(&self.files)
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("sandbox {} is gone", sandbox_id)))
    }

    async fn create_filesystem_snapshot(
        &self,
        sandbox_id: &SandboxId,
        fragment_id: &FragmentId,
        _project_id: &ProjectId,
    ) -> Result<String> {
        self.record(ProviderCall::Snapshot {
            sandbox: sandbox_id.clone(),
            fragment: fragment_id.clone(),
        });
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Error::Provider("scripted snapshot failure".to_string()));
        }

        let files = lock(&self.files)
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("sandbox {} is gone", sandbox_id)))?;
        let image_id = format!("img-{}", uuid::Uuid::new_v4());
        lock(&self.snapshot_files).insert(image_id.clone(), files);

        // A snapshot taken from a template-seeded sandbox registers a
        // baseline for that template in every environment.
        if let Some(template) = lock(&self.templates).get(sandbox_id).cloned() {
            let mut baked = lock(&self.baked);
            baked.insert((template.clone(), Environment::Development));
            baked.insert((template, Environment::Production));
        }

        Ok(image_id)
    }

    async fn has_snapshot(&self, template_name: &str, environment: Environment) -> Result<bool> {
        self.record(ProviderCall::HasSnapshot {
            template: template_name.to_string(),
        });
        Ok(lock(&self.baked).contains(&(template_name.to_string(), environment)))
    }
}

/// Observer that records every checkpoint event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RecoveryEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events recorded so far, in order.
    pub fn events(&self) -> Vec<RecoveryEvent> {
        lock(&self.events).clone()
    }
}

impl RecoveryObserver for RecordingObserver {
    fn on_event(&self, event: &RecoveryEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildStatus;
    use chrono::Duration;

    #[tokio::test]
    async fn latest_created_uses_creation_order() {
        let store = MemoryFragmentStore::new();
        let base = Utc::now() - Duration::hours(2);
        store.insert(Fragment::new("f1", "p1").with_created_at(base));
        store.insert(Fragment::new("f2", "p1").with_created_at(base + Duration::hours(1)));
        store.insert(Fragment::new("other", "p2").with_created_at(base + Duration::hours(2)));

        let latest = store
            .latest_created(&ProjectId::from("p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, FragmentId::from("f2"));
    }

    #[tokio::test]
    async fn latest_with_snapshot_honors_the_ceiling() {
        let store = MemoryFragmentStore::new();
        let base = Utc::now() - Duration::hours(3);
        store.insert(
            Fragment::new("f1", "p1")
                .with_created_at(base)
                .with_snapshot_image("img-1"),
        );
        store.insert(Fragment::new("f2", "p1").with_created_at(base + Duration::hours(1)));
        store.insert(
            Fragment::new("f3", "p1")
                .with_created_at(base + Duration::hours(2))
                .with_snapshot_image("img-3"),
        );

        let bounded = store
            .latest_with_snapshot(&ProjectId::from("p1"), Some(base + Duration::hours(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounded.id, FragmentId::from("f1"));

        let unbounded = store
            .latest_with_snapshot(&ProjectId::from("p1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unbounded.id, FragmentId::from("f3"));
    }

    #[tokio::test]
    async fn apply_recovery_clears_errors_and_keeps_active_pointer() {
        let store = MemoryProjectStore::new();
        let mut project = Project::new("p1")
            .with_active_fragment("f1")
            .with_build_status(BuildStatus::Failed);
        project.build_error = Some("boom".to_string());
        store.insert(project);

        store
            .apply_recovery(
                &ProjectId::from("p1"),
                ProjectRecoveryUpdate {
                    sandbox_id: SandboxId::from("sbx-new"),
                    sandbox_url: Some("https://preview".to_string()),
                    active_fragment_id: None,
                    build_status: BuildStatus::Ready,
                    status_updated_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let project = store.get(&ProjectId::from("p1")).unwrap();
        assert_eq!(project.sandbox_id, Some(SandboxId::from("sbx-new")));
        assert_eq!(project.build_status, BuildStatus::Ready);
        assert!(project.build_error.is_none());
        // A `None` fragment leaves the active pointer unchanged.
        assert_eq!(project.active_fragment_id, Some(FragmentId::from("f1")));
    }

    #[tokio::test]
    async fn image_seeded_sandboxes_come_up_with_snapshot_files() {
        let provider = MemorySandboxProvider::new();
        provider.set_default_files(&["package.json"]);

        let first = provider
            .create_sandbox(CreateSandboxRequest {
                project_id: ProjectId::from("p1"),
                fragment_id: None,
                template_name: "react-vite".to_string(),
                options: Default::default(),
            })
            .await
            .unwrap();
        provider.set_files(&first.sandbox_id, &["package.json", "src/main.tsx"]);

        let image = provider
            .create_filesystem_snapshot(
                &first.sandbox_id,
                &FragmentId::from("f1"),
                &ProjectId::from("p1"),
            )
            .await
            .unwrap();

        let second = provider
            .create_sandbox(CreateSandboxRequest {
                project_id: ProjectId::from("p1"),
                fragment_id: None,
                template_name: "react-vite".to_string(),
                options: crate::provider::CreateSandboxOptions {
                    recovery_snapshot_image_id: Some(image),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let files = provider.list_files(&second.sandbox_id).await.unwrap();
        assert!(files.contains(&"src/main.tsx".to_string()));
    }

    #[tokio::test]
    async fn snapshotting_registers_a_template_baseline() {
        let provider = MemorySandboxProvider::new();

        assert!(!provider
            .has_snapshot("react-vite", Environment::Development)
            .await
            .unwrap());

        let sandbox = provider
            .create_sandbox(CreateSandboxRequest {
                project_id: ProjectId::from("p1"),
                fragment_id: None,
                template_name: "react-vite".to_string(),
                options: Default::default(),
            })
            .await
            .unwrap();
        provider
            .create_filesystem_snapshot(
                &sandbox.sandbox_id,
                &FragmentId::from("f1"),
                &ProjectId::from("p1"),
            )
            .await
            .unwrap();

        assert!(provider
            .has_snapshot("react-vite", Environment::Development)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn listing_a_gone_sandbox_fails() {
        let provider = MemorySandboxProvider::new();
        let err = provider
            .list_files(&SandboxId::from("sbx-gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
