//! Recovery orchestration: snapshot selection, sandbox materialization,
//! verification, and retirement of superseded sandboxes.
//!
//! Each recovery is a strictly ordered sequence of async store and provider
//! calls. Invocations for different projects proceed fully in parallel;
//! concurrent invocations for the same project are not mutually excluded but
//! are self-healing: a healthy project is a no-op and reconciliation always
//! writes the same consistent target state. Callers wanting timeouts wrap the
//! future in `tokio::time::timeout`; a timeout behaves like a provider
//! failure at that step. No retries happen internally - blind retry risks
//! repeated sandbox creation under provider-side rate limits.

use std::sync::Arc;

use chrono::Utc;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::model::{BuildStatus, Fragment, FragmentId, Project, ProjectId, SandboxId};
use crate::provider::{CreateSandboxOptions, CreateSandboxRequest, CreatedSandbox, SandboxProvider};
use crate::store::{FragmentStore, ProjectRecoveryUpdate, ProjectStore};
use crate::template::{TemplateResolution, TemplateResolver};

/// Caller-supplied options for a recovery attempt.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Recover this specific fragment instead of the project's active one.
    pub fragment_id: Option<FragmentId>,

    /// Explicit template name, overriding the resolver.
    pub template_name: Option<String>,
}

impl RecoveryOptions {
    /// Starts recovery from a specific fragment.
    pub fn with_fragment(mut self, id: impl Into<FragmentId>) -> Self {
        self.fragment_id = Some(id.into());
        self
    }

    /// Forces a template, bypassing the resolver.
    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self
    }
}

/// Outcome of [`RecoveryOrchestrator::ensure_recovered`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// False when the project was already healthy or out of scope.
    pub recovered: bool,
    pub sandbox_id: Option<SandboxId>,
}

/// Checkpoint events emitted during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// Recovery began for a broken project.
    Started { project: ProjectId },
    /// A sandbox was materialized and is about to be re-verified.
    BeforeVerify {
        project: ProjectId,
        sandbox: SandboxId,
    },
    /// Verification passed.
    VerifySucceeded {
        project: ProjectId,
        sandbox: SandboxId,
    },
    /// Verification found the new sandbox still broken.
    VerifyFailed {
        project: ProjectId,
        sandbox: SandboxId,
    },
}

/// Observer invoked at named recovery checkpoints.
///
/// No-op by default so embedders and tests can attach their own sink without
/// coupling to a logging backend.
pub trait RecoveryObserver: Send + Sync {
    fn on_event(&self, event: &RecoveryEvent);
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RecoveryObserver for NoopObserver {
    fn on_event(&self, _event: &RecoveryEvent) {}
}

/// Where the recovery snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotSource {
    /// The starting fragment's own snapshot image.
    ActiveFragment,
    /// An older sibling fragment's snapshot image.
    FallbackFragment,
    /// The latest snapshot of any fragment in the project.
    LatestSnapshot,
    /// A fresh template baseline snapshotted during this recovery.
    Bootstrapped,
    /// No image available; template-only creation.
    TemplateOnly,
}

/// The snapshot-selection verdict for one recovery attempt.
struct SnapshotSelection {
    /// Fragment used for recovery; becomes the active pointer on success.
    fragment: Option<Fragment>,
    snapshot_image_id: Option<String>,
    /// Sandbox already created while bootstrapping a baseline, reused as-is.
    live_sandbox: Option<CreatedSandbox>,
    source: SnapshotSource,
}

/// The recovery state machine: check, select, materialize, verify, reconcile,
/// clean up.
pub struct RecoveryOrchestrator<P, S, F> {
    provider: Arc<P>,
    projects: Arc<S>,
    fragments: Arc<F>,
    health: HealthChecker<P, S, F>,
    resolver: TemplateResolver<P, S, F>,
    config: ControllerConfig,
    observer: Arc<dyn RecoveryObserver>,
}

impl<P: SandboxProvider, S: ProjectStore, F: FragmentStore> RecoveryOrchestrator<P, S, F> {
    /// Creates an orchestrator over the given provider and stores.
    pub fn new(
        provider: Arc<P>,
        projects: Arc<S>,
        fragments: Arc<F>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            health: HealthChecker::new(
                provider.clone(),
                projects.clone(),
                fragments.clone(),
                config.clone(),
            ),
            resolver: TemplateResolver::new(
                provider.clone(),
                projects.clone(),
                fragments.clone(),
                config.clone(),
            ),
            provider,
            projects,
            fragments,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the no-op observer.
    pub fn with_observer(mut self, observer: Arc<dyn RecoveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns the health checker used by this orchestrator.
    pub fn health_checker(&self) -> &HealthChecker<P, S, F> {
        &self.health
    }

    /// Returns the template resolver used by this orchestrator.
    pub fn template_resolver(&self) -> &TemplateResolver<P, S, F> {
        &self.resolver
    }

    /// Guard for request handlers that need a live sandbox.
    ///
    /// A broken project surfaces as a transient "recovery in progress" error
    /// rather than an internal failure; recovery is expected to be attempted
    /// asynchronously or on next access.
    pub async fn require_healthy(&self, project_id: &ProjectId) -> Result<()> {
        let status = self.health.check(project_id).await;
        if status.broken {
            tracing::warn!(project = %project_id, reason = ?status.reason, "sandbox unavailable");
            return Err(Error::SandboxUnavailable(project_id.clone()));
        }
        Ok(())
    }

    /// Ensures the project has a healthy sandbox, recovering it if necessary.
    ///
    /// Strictly idempotent: a healthy project is a no-op, not an error. Fails
    /// only when the project does not exist, has nothing to recover, or the
    /// freshly materialized sandbox fails re-verification; every other fault
    /// degrades or is absorbed into logs.
    pub async fn ensure_recovered(
        &self,
        project_id: &ProjectId,
        options: RecoveryOptions,
    ) -> Result<RecoveryOutcome> {
        let project = self
            .projects
            .get_project(project_id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(project_id.clone()))?;

        // Out of scope: a provider this controller does not manage.
        if let Some(tag) = project.sandbox_provider.as_deref() {
            if tag != self.config.managed_provider {
                return Ok(RecoveryOutcome {
                    recovered: false,
                    sandbox_id: project.sandbox_id,
                });
            }
        }

        // Template resolution and the health check are independent reads.
        let (resolution, status) = tokio::join!(
            async {
                match options.template_name.as_deref() {
                    Some(name) => self.resolver.resolve_override(name).await,
                    None => self.resolver.resolve(project_id).await,
                }
            },
            self.health.check(project_id),
        );

        if !status.broken {
            return Ok(RecoveryOutcome {
                recovered: false,
                sandbox_id: status.sandbox_id,
            });
        }

        self.observer.on_event(&RecoveryEvent::Started {
            project: project_id.clone(),
        });
        tracing::info!(
            project = %project_id,
            reason = ?status.reason,
            template = %resolution.template_name,
            "starting sandbox recovery"
        );

        let previous_sandbox = project.sandbox_id.clone();

        let selection = self
            .find_recovery_snapshot(&project, &options, &resolution)
            .await?;
        tracing::debug!(
            project = %project_id,
            source = ?selection.source,
            fragment = ?selection.fragment.as_ref().map(|f| f.id.clone()),
            snapshot = ?selection.snapshot_image_id,
            "selected recovery snapshot"
        );

        // Materialize, reusing the bootstrap sandbox when one is live.
        let created = match selection.live_sandbox {
            Some(sandbox) => sandbox,
            None => {
                let request = CreateSandboxRequest {
                    project_id: project_id.clone(),
                    fragment_id: selection.fragment.as_ref().map(|f| f.id.clone()),
                    template_name: resolution.template_name.clone(),
                    options: CreateSandboxOptions {
                        recovery_snapshot_image_id: selection.snapshot_image_id.clone(),
                        is_imported_project: project.is_imported(),
                        imported_from: project.import_origin().map(str::to_string),
                    },
                };
                self.provider.create_sandbox(request).await?
            }
        };

        // Reconcile before verification so concurrent readers see the new
        // sandbox promptly. Ready is optimistic until re-checked.
        self.projects
            .apply_recovery(
                project_id,
                ProjectRecoveryUpdate {
                    sandbox_id: created.sandbox_id.clone(),
                    sandbox_url: Some(created.sandbox_url.clone()),
                    active_fragment_id: selection.fragment.as_ref().map(|f| f.id.clone()),
                    build_status: BuildStatus::Ready,
                    status_updated_at: Utc::now(),
                },
            )
            .await?;

        self.observer.on_event(&RecoveryEvent::BeforeVerify {
            project: project_id.clone(),
            sandbox: created.sandbox_id.clone(),
        });
        let verified = self.health.check(project_id).await;
        if verified.broken {
            self.observer.on_event(&RecoveryEvent::VerifyFailed {
                project: project_id.clone(),
                sandbox: created.sandbox_id.clone(),
            });
            tracing::error!(
                project = %project_id,
                sandbox = %created.sandbox_id,
                reason = ?verified.reason,
                "recovered sandbox failed verification"
            );
            return Err(Error::VerificationFailed {
                project: project_id.clone(),
                sandbox: created.sandbox_id,
            });
        }
        self.observer.on_event(&RecoveryEvent::VerifySucceeded {
            project: project_id.clone(),
            sandbox: created.sandbox_id.clone(),
        });

        // Retire the superseded sandbox unless another project references it.
        if let Some(old) = previous_sandbox {
            if old != created.sandbox_id {
                self.cleanup_superseded(project_id, &old).await;
            }
        }

        tracing::info!(project = %project_id, sandbox = %created.sandbox_id, "sandbox recovery complete");
        Ok(RecoveryOutcome {
            recovered: true,
            sandbox_id: Some(created.sandbox_id),
        })
    }

    /// Selects the snapshot to recover from.
    ///
    /// The starting fragment's own snapshot always beats any newer snapshot:
    /// recency of the fragment being recovered takes priority over recency of
    /// the snapshot. When no image exists anywhere, a files-only fragment is
    /// chosen and a fresh template baseline is bootstrapped for it.
    async fn find_recovery_snapshot(
        &self,
        project: &Project,
        options: &RecoveryOptions,
        resolution: &TemplateResolution,
    ) -> Result<SnapshotSelection> {
        let starting = self.starting_fragment(project, options).await;

        if let Some(fragment) = &starting {
            if fragment.snapshot_image_id.is_some() {
                return Ok(SnapshotSelection {
                    snapshot_image_id: fragment.snapshot_image_id.clone(),
                    fragment: starting,
                    live_sandbox: None,
                    source: SnapshotSource::ActiveFragment,
                });
            }

            // An older sibling with an image, bounded by the starting
            // fragment's own creation time so a newer snapshot is never
            // resurrected over the state the user is viewing.
            match self
                .fragments
                .latest_with_snapshot(&project.id, Some(fragment.created_at))
                .await
            {
                Ok(Some(older)) => {
                    return Ok(SnapshotSelection {
                        snapshot_image_id: older.snapshot_image_id.clone(),
                        fragment: Some(older),
                        live_sandbox: None,
                        source: SnapshotSource::FallbackFragment,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(project = %project.id, error = %e, "fallback snapshot lookup failed");
                }
            }
        }

        // Latest snapshot of any fragment.
        match self.fragments.latest_with_snapshot(&project.id, None).await {
            Ok(Some(latest)) => {
                return Ok(SnapshotSelection {
                    snapshot_image_id: latest.snapshot_image_id.clone(),
                    fragment: Some(latest),
                    live_sandbox: None,
                    source: SnapshotSource::LatestSnapshot,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(project = %project.id, error = %e, "latest snapshot lookup failed");
            }
        }

        // No usable image. Pick a files-only fragment: explicit option,
        // then the active fragment, then the most recently updated one.
        let fragment = match starting {
            Some(fragment) => Some(fragment),
            None => match self.fragments.latest_updated(&project.id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(project = %project.id, error = %e, "latest fragment lookup failed");
                    None
                }
            },
        };
        let Some(fragment) = fragment else {
            tracing::warn!(project = %project.id, "no fragments to recover");
            return Err(Error::NothingToRecover(project.id.clone()));
        };

        // Bootstrap a fresh template baseline so the next recovery of this
        // fragment is instant. Bootstrap failure degrades to template-only
        // creation rather than aborting the recovery.
        match self.bootstrap_baseline(project, &fragment, resolution).await {
            Ok((sandbox, image)) => Ok(SnapshotSelection {
                snapshot_image_id: image,
                fragment: Some(fragment),
                live_sandbox: Some(sandbox),
                source: SnapshotSource::Bootstrapped,
            }),
            Err(e) => {
                tracing::warn!(
                    project = %project.id,
                    error = %e,
                    "baseline bootstrap failed; degrading to template-only creation"
                );
                Ok(SnapshotSelection {
                    snapshot_image_id: None,
                    fragment: Some(fragment),
                    live_sandbox: None,
                    source: SnapshotSource::TemplateOnly,
                })
            }
        }
    }

    /// The fragment recovery starts from: the explicit option, else the
    /// project's active fragment.
    async fn starting_fragment(
        &self,
        project: &Project,
        options: &RecoveryOptions,
    ) -> Option<Fragment> {
        let id = options
            .fragment_id
            .clone()
            .or_else(|| project.active_fragment_id.clone())?;
        match self.fragments.get_fragment(&id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(fragment = %id, error = %e, "starting fragment load failed");
                None
            }
        }
    }

    /// Creates a sandbox from the resolved template and snapshots it, so the
    /// chosen fragment becomes instantly restorable next time.
    ///
    /// The live sandbox is returned for reuse even when the snapshot step
    /// fails; only creation failure aborts the bootstrap.
    async fn bootstrap_baseline(
        &self,
        project: &Project,
        fragment: &Fragment,
        resolution: &TemplateResolution,
    ) -> Result<(CreatedSandbox, Option<String>)> {
        let request = CreateSandboxRequest {
            project_id: project.id.clone(),
            fragment_id: Some(fragment.id.clone()),
            template_name: resolution.template_name.clone(),
            options: CreateSandboxOptions {
                recovery_snapshot_image_id: None,
                is_imported_project: project.is_imported(),
                imported_from: project.import_origin().map(str::to_string),
            },
        };
        let sandbox = self.provider.create_sandbox(request).await?;

        let image = match self
            .provider
            .create_filesystem_snapshot(&sandbox.sandbox_id, &fragment.id, &project.id)
            .await
        {
            Ok(image) => {
                if let Err(e) = self
                    .fragments
                    .attach_snapshot_image(&fragment.id, &image)
                    .await
                {
                    tracing::warn!(fragment = %fragment.id, error = %e, "failed to record snapshot image");
                }
                Some(image)
            }
            Err(e) => {
                tracing::warn!(sandbox = %sandbox.sandbox_id, error = %e, "baseline snapshot failed");
                None
            }
        };

        Ok((sandbox, image))
    }

    /// Deletes the superseded sandbox unless another project still references
    /// it. Failures are logged: cleanup never fails a recovery that already
    /// succeeded.
    async fn cleanup_superseded(&self, project_id: &ProjectId, old_sandbox: &SandboxId) {
        let referencing = match self.projects.projects_referencing_sandbox(old_sandbox).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(
                    sandbox = %old_sandbox,
                    error = %e,
                    "reference check failed; leaving old sandbox in place"
                );
                return;
            }
        };
        if referencing.iter().any(|id| id != project_id) {
            tracing::info!(
                sandbox = %old_sandbox,
                "old sandbox still referenced by another project; skipping delete"
            );
            return;
        }
        if let Err(e) = self.provider.delete_sandbox(old_sandbox, project_id).await {
            tracing::warn!(sandbox = %old_sandbox, error = %e, "failed to delete superseded sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        MemoryFragmentStore, MemoryProjectStore, MemorySandboxProvider, ProviderCall,
        RecordingObserver,
    };
    use chrono::{Duration, Utc};

    const HEALTHY_SCAFFOLD: &[&str] = &[
        "package.json",
        "vite.config.ts",
        "tsconfig.json",
        "src/main.tsx",
    ];

    struct Harness {
        provider: Arc<MemorySandboxProvider>,
        projects: Arc<MemoryProjectStore>,
        fragments: Arc<MemoryFragmentStore>,
        observer: Arc<RecordingObserver>,
        orchestrator:
            RecoveryOrchestrator<MemorySandboxProvider, MemoryProjectStore, MemoryFragmentStore>,
    }

    fn harness() -> Harness {
        let provider = Arc::new(MemorySandboxProvider::new());
        provider.set_default_files(HEALTHY_SCAFFOLD);
        let projects = Arc::new(MemoryProjectStore::new());
        let fragments = Arc::new(MemoryFragmentStore::new());
        let observer = Arc::new(RecordingObserver::new());
        let orchestrator = RecoveryOrchestrator::new(
            provider.clone(),
            projects.clone(),
            fragments.clone(),
            ControllerConfig::default(),
        )
        .with_observer(observer.clone());
        Harness {
            provider,
            projects,
            fragments,
            observer,
            orchestrator,
        }
    }

    fn create_calls(provider: &MemorySandboxProvider) -> Vec<ProviderCall> {
        provider
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ProviderCall::Create { .. }))
            .collect()
    }

    fn delete_calls(provider: &MemorySandboxProvider) -> Vec<ProviderCall> {
        provider
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ProviderCall::Delete { .. }))
            .collect()
    }

    #[tokio::test]
    async fn missing_project_is_fatal() {
        let h = harness();

        let err = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("ghost"), RecoveryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn unmanaged_provider_is_returned_untouched() {
        let h = harness();
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-other")
                .with_provider_tag("other-host"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(!outcome.recovered);
        assert_eq!(outcome.sandbox_id, Some(SandboxId::from("sbx-other")));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn healthy_project_is_a_no_op() {
        let h = harness();
        let sandbox = SandboxId::from("sbx-ok");
        h.provider.set_files(&sandbox, HEALTHY_SCAFFOLD);
        h.projects.insert(Project::new("p1").with_sandbox("sbx-ok"));

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(!outcome.recovered);
        assert_eq!(outcome.sandbox_id, Some(sandbox));
        assert!(create_calls(&h.provider).is_empty());
        assert!(delete_calls(&h.provider).is_empty());
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn zero_fragment_project_with_dead_sandbox_has_nothing_to_recover() {
        let h = harness();
        h.projects.insert(Project::new("p1").with_sandbox("sbx-gone"));

        let err = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NothingToRecover(_)));
    }

    #[tokio::test]
    async fn explicit_fragment_snapshot_beats_newer_snapshots() {
        let h = harness();
        let base = Utc::now() - Duration::hours(2);
        h.fragments.insert(
            Fragment::new("f-old", "p1")
                .with_created_at(base)
                .with_snapshot_image("img-old"),
        );
        h.fragments.insert(
            Fragment::new("f-new", "p1")
                .with_created_at(base + Duration::hours(1))
                .with_snapshot_image("img-new"),
        );
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f-new"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(
                &ProjectId::from("p1"),
                RecoveryOptions::default().with_fragment("f-old"),
            )
            .await
            .unwrap();

        assert!(outcome.recovered);
        let creates = create_calls(&h.provider);
        assert_eq!(creates.len(), 1);
        let ProviderCall::Create { snapshot_image, .. } = &creates[0] else {
            panic!("expected create call");
        };
        assert_eq!(snapshot_image.as_deref(), Some("img-old"));
    }

    #[tokio::test]
    async fn fallback_snapshot_respects_the_creation_ceiling() {
        let h = harness();
        let base = Utc::now() - Duration::hours(3);
        // Older sibling with an image, the viewed fragment without one, and a
        // newer fragment whose image must not be resurrected.
        h.fragments.insert(
            Fragment::new("f1", "p1")
                .with_created_at(base)
                .with_snapshot_image("img-1"),
        );
        h.fragments
            .insert(Fragment::new("f2", "p1").with_created_at(base + Duration::hours(1)));
        h.fragments.insert(
            Fragment::new("f3", "p1")
                .with_created_at(base + Duration::hours(2))
                .with_snapshot_image("img-3"),
        );
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f2"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        let creates = create_calls(&h.provider);
        assert_eq!(creates.len(), 1);
        let ProviderCall::Create { snapshot_image, .. } = &creates[0] else {
            panic!("expected create call");
        };
        assert_eq!(snapshot_image.as_deref(), Some("img-1"));

        // The fragment whose image was used becomes the active pointer.
        let project = h.projects.get(&ProjectId::from("p1")).unwrap();
        assert_eq!(project.active_fragment_id, Some(FragmentId::from("f1")));
    }

    #[tokio::test]
    async fn files_only_history_bootstraps_a_baseline() {
        let h = harness();
        h.fragments
            .insert(Fragment::new("f1", "p1").with_file("README.md", "todo board"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        // The bootstrap sandbox is reused for materialization: one create.
        assert_eq!(create_calls(&h.provider).len(), 1);
        // A fresh snapshot was taken and attached to the fragment.
        let fragment = h.fragments.get(&FragmentId::from("f1")).unwrap();
        assert!(fragment.snapshot_image_id.is_some());
    }

    #[tokio::test]
    async fn failed_baseline_snapshot_still_recovers() {
        let h = harness();
        h.provider.fail_snapshots(true);
        h.fragments.insert(Fragment::new("f1", "p1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        let fragment = h.fragments.get(&FragmentId::from("f1")).unwrap();
        assert!(fragment.snapshot_image_id.is_none());
    }

    #[tokio::test]
    async fn failed_bootstrap_creation_degrades_to_template_only() {
        let h = harness();
        h.provider.fail_next_creates(1);
        h.fragments.insert(Fragment::new("f1", "p1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        // First create failed during bootstrap; the second, template-only
        // create materialized the sandbox.
        let creates = create_calls(&h.provider);
        assert_eq!(creates.len(), 2);
        let ProviderCall::Create { snapshot_image, .. } = &creates[1] else {
            panic!("expected create call");
        };
        assert!(snapshot_image.is_none());
    }

    #[tokio::test]
    async fn old_sandbox_is_deleted_exactly_once() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-old")
                .with_active_fragment("f1"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        assert_ne!(outcome.sandbox_id, Some(SandboxId::from("sbx-old")));
        let deletes = delete_calls(&h.provider);
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0],
            ProviderCall::Delete {
                sandbox: SandboxId::from("sbx-old"),
            }
        );
    }

    #[tokio::test]
    async fn shared_old_sandbox_is_never_deleted() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-shared")
                .with_active_fragment("f1"),
        );
        // Another project still points at the same sandbox.
        h.projects
            .insert(Project::new("p2").with_sandbox("sbx-shared"));

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
        assert!(delete_calls(&h.provider).is_empty());
    }

    #[tokio::test]
    async fn delete_failure_does_not_fail_recovery() {
        let h = harness();
        h.provider.fail_deletes(true);
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-old")
                .with_active_fragment("f1"),
        );

        let outcome = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        assert!(outcome.recovered);
    }

    #[tokio::test]
    async fn reconciliation_marks_the_project_ready() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        let mut project = Project::new("p1")
            .with_sandbox("sbx-old")
            .with_active_fragment("f1")
            .with_build_status(BuildStatus::Failed);
        project.build_error = Some("previous build exploded".to_string());
        h.projects.insert(project);

        h.orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        let project = h.projects.get(&ProjectId::from("p1")).unwrap();
        assert_eq!(project.build_status, BuildStatus::Ready);
        assert!(project.build_error.is_none());
        assert!(project.status_updated_at.is_some());
        assert!(project.sandbox_url.is_some());
    }

    #[tokio::test]
    async fn verification_failure_is_fatal_and_observed() {
        let h = harness();
        // Sandboxes created from now on come up without the scaffold.
        h.provider.set_default_files(&[]);
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1"),
        );

        let err = h
            .orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VerificationFailed { .. }));
        let events = h.observer.events();
        assert!(matches!(events[0], RecoveryEvent::Started { .. }));
        assert!(matches!(
            events.last().unwrap(),
            RecoveryEvent::VerifyFailed { .. }
        ));
        // The old sandbox is not cleaned up after a failed verification.
        assert!(delete_calls(&h.provider).is_empty());
    }

    #[tokio::test]
    async fn successful_recovery_emits_checkpoints_in_order() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-old")
                .with_active_fragment("f1"),
        );

        h.orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        let events = h.observer.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RecoveryEvent::Started { .. }));
        assert!(matches!(events[1], RecoveryEvent::BeforeVerify { .. }));
        assert!(matches!(events[2], RecoveryEvent::VerifySucceeded { .. }));
    }

    #[tokio::test]
    async fn template_override_reaches_the_provider() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1"),
        );

        h.orchestrator
            .ensure_recovered(
                &ProjectId::from("p1"),
                RecoveryOptions::default().with_template("saas-dashboard"),
            )
            .await
            .unwrap();

        let creates = create_calls(&h.provider);
        let ProviderCall::Create { template, .. } = &creates[0] else {
            panic!("expected create call");
        };
        assert_eq!(template, "saas-dashboard");
    }

    #[tokio::test]
    async fn import_provenance_is_passed_through() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1").with_snapshot_image("img-1"));
        h.projects.insert(
            Project::new("p1")
                .with_sandbox("sbx-gone")
                .with_active_fragment("f1")
                .with_import_origin("github"),
        );

        h.orchestrator
            .ensure_recovered(&ProjectId::from("p1"), RecoveryOptions::default())
            .await
            .unwrap();

        let requests = h.provider.create_requests();
        assert!(requests[0].options.is_imported_project);
        assert_eq!(requests[0].options.imported_from.as_deref(), Some("github"));
    }

    #[tokio::test]
    async fn require_healthy_rejects_broken_projects() {
        let h = harness();
        h.fragments.insert(Fragment::new("f1", "p1"));
        h.projects.insert(Project::new("p1"));

        let err = h
            .orchestrator
            .require_healthy(&ProjectId::from("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SandboxUnavailable(_)));
    }

    #[tokio::test]
    async fn require_healthy_accepts_pre_build_projects() {
        let h = harness();
        h.projects.insert(Project::new("p1"));

        assert!(h
            .orchestrator
            .require_healthy(&ProjectId::from("p1"))
            .await
            .is_ok());
    }
}
