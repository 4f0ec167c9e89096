//! Sandbox health checking.
//!
//! File presence is a cheap, provider-agnostic proxy for "can this sandbox
//! serve a dev preview": a sandbox can be up yet missing the scaffold
//! entirely when its creation was interrupted, so process liveness alone is
//! not enough. All reads here are best-effort; faults fold into a broken
//! verdict instead of propagating.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::model::{ProjectId, SandboxId};
use crate::provider::SandboxProvider;
use crate::store::{FragmentStore, ProjectStore};

/// Reason code attached to a health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthReason {
    /// Pre-first-build project: healthy by definition.
    NewProjectNoGenerationYet,
    /// The project row is missing or could not be loaded.
    ProjectNotFound,
    /// The project has builds but no sandbox pointer.
    MissingSandbox,
    /// The sandbox belongs to a provider this controller does not manage.
    UnmanagedProvider,
    /// The sandbox is missing required scaffold files.
    MissingCriticalFiles,
    /// Listing sandbox files failed: unreachable, expired, or torn down.
    ListFilesFailed,
}

/// Result of a health check. Ephemeral: recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub broken: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<HealthReason>,

    /// Labels of required files the sandbox is missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_files: Vec<String>,
}

impl HealthStatus {
    /// A healthy verdict with no particular reason.
    pub fn healthy(sandbox_id: Option<SandboxId>) -> Self {
        Self {
            broken: false,
            sandbox_id,
            reason: None,
            missing_files: Vec::new(),
        }
    }

    /// A healthy verdict carrying an explanatory reason.
    pub fn healthy_because(reason: HealthReason, sandbox_id: Option<SandboxId>) -> Self {
        Self {
            broken: false,
            sandbox_id,
            reason: Some(reason),
            missing_files: Vec::new(),
        }
    }

    /// A broken verdict.
    pub fn broken(reason: HealthReason, sandbox_id: Option<SandboxId>) -> Self {
        Self {
            broken: true,
            sandbox_id,
            reason: Some(reason),
            missing_files: Vec::new(),
        }
    }

    /// A broken verdict listing the missing scaffold files.
    pub fn broken_missing_files(sandbox_id: SandboxId, missing_files: Vec<String>) -> Self {
        Self {
            broken: true,
            sandbox_id: Some(sandbox_id),
            reason: Some(HealthReason::MissingCriticalFiles),
            missing_files,
        }
    }
}

/// A required scaffold file: a label plus a path predicate.
///
/// Kept as an ordered data table so each rule is independently testable.
struct RequiredFile {
    label: &'static str,
    matches: fn(&str) -> bool,
}

const REQUIRED_FILES: &[RequiredFile] = &[
    RequiredFile {
        label: "package.json",
        matches: is_package_manifest,
    },
    RequiredFile {
        label: "vite.config",
        matches: is_build_config,
    },
    RequiredFile {
        label: "src/main",
        matches: is_entry_point,
    },
];

/// Label reported when the conditional type-config requirement is unmet.
const TYPE_CONFIG_LABEL: &str = "tsconfig.json";

/// Normalizes a listed path: lower-case, forward slashes, no leading "./" or "/".
fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/").to_lowercase();
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Conventional locations sit at the root or one directory deep.
fn depth_at_most_one(path: &str) -> bool {
    path.matches('/').count() <= 1
}

fn is_package_manifest(path: &str) -> bool {
    depth_at_most_one(path) && file_name(path) == "package.json"
}

const BUILD_CONFIG_STEMS: &[&str] = &[
    "vite.config",
    "next.config",
    "webpack.config",
    "astro.config",
    "svelte.config",
];

const BUILD_CONFIG_EXTS: &[&str] = &["js", "ts", "mjs", "cjs", "mts"];

fn is_build_config(path: &str) -> bool {
    if !depth_at_most_one(path) {
        return false;
    }
    let name = file_name(path);
    BUILD_CONFIG_STEMS.iter().any(|stem| {
        name.strip_prefix(stem)
            .and_then(|rest| rest.strip_prefix('.'))
            .map(|ext| BUILD_CONFIG_EXTS.contains(&ext))
            .unwrap_or(false)
    })
}

const ENTRY_STEMS: &[&str] = &["main", "index", "app"];

const ENTRY_EXTS: &[&str] = &["js", "jsx", "ts", "tsx"];

fn is_entry_point(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("src/") else {
        return false;
    };
    if rest.contains('/') {
        return false;
    }
    ENTRY_STEMS.iter().any(|stem| {
        rest.strip_prefix(stem)
            .and_then(|tail| tail.strip_prefix('.'))
            .map(|ext| ENTRY_EXTS.contains(&ext))
            .unwrap_or(false)
    })
}

/// A statically-typed source under `src/`. Config files written in the typed
/// language (a root `vite.config.ts`) must not count.
fn is_typed_source(path: &str) -> bool {
    path.starts_with("src/") && (path.ends_with(".ts") || path.ends_with(".tsx"))
}

fn is_type_config(path: &str) -> bool {
    if !depth_at_most_one(path) {
        return false;
    }
    let name = file_name(path);
    name == "tsconfig.json" || name == "jsconfig.json"
}

/// Determines whether a project's current sandbox is usable.
pub struct HealthChecker<P, S, F> {
    provider: Arc<P>,
    projects: Arc<S>,
    fragments: Arc<F>,
    config: ControllerConfig,
}

impl<P: SandboxProvider, S: ProjectStore, F: FragmentStore> HealthChecker<P, S, F> {
    /// Creates a health checker over the given provider and stores.
    pub fn new(
        provider: Arc<P>,
        projects: Arc<S>,
        fragments: Arc<F>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            provider,
            projects,
            fragments,
            config,
        }
    }

    /// Checks whether the project's sandbox is usable.
    ///
    /// Never fails: store and provider faults fold into the structured
    /// verdict, so callers always get a [`HealthStatus`].
    pub async fn check(&self, project_id: &ProjectId) -> HealthStatus {
        let project = match self.projects.get_project(project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => return HealthStatus::broken(HealthReason::ProjectNotFound, None),
            Err(e) => {
                tracing::warn!(project = %project_id, error = %e, "project load failed during health check");
                return HealthStatus::broken(HealthReason::ProjectNotFound, None);
            }
        };

        let Some(sandbox_id) = project.sandbox_id.clone() else {
            let fragment_count = match self.fragments.count_for_project(project_id).await {
                Ok(count) => count,
                Err(e) => {
                    // Err on the healthy side: a pre-build project must never
                    // be flagged broken.
                    tracing::warn!(project = %project_id, error = %e, "fragment count failed during health check");
                    0
                }
            };
            if fragment_count == 0 {
                return HealthStatus::healthy_because(HealthReason::NewProjectNoGenerationYet, None);
            }
            return HealthStatus::broken(HealthReason::MissingSandbox, None);
        };

        // Sandboxes of other providers are out of scope for this controller.
        if let Some(tag) = project.sandbox_provider.as_deref() {
            if tag != self.config.managed_provider {
                return HealthStatus::healthy_because(
                    HealthReason::UnmanagedProvider,
                    Some(sandbox_id),
                );
            }
        }

        let files = match self.provider.list_files(&sandbox_id).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(project = %project_id, sandbox = %sandbox_id, error = %e, "sandbox file listing failed");
                return HealthStatus::broken(HealthReason::ListFilesFailed, Some(sandbox_id));
            }
        };

        let paths: Vec<String> = files.iter().map(|path| normalize_path(path)).collect();

        let mut missing = Vec::new();
        for required in REQUIRED_FILES {
            if !paths.iter().any(|path| (required.matches)(path)) {
                missing.push(required.label.to_string());
            }
        }
        // Type config is required only when typed sources exist under src/.
        if paths.iter().any(|path| is_typed_source(path))
            && !paths.iter().any(|path| is_type_config(path))
        {
            missing.push(TYPE_CONFIG_LABEL.to_string());
        }

        if !missing.is_empty() {
            tracing::debug!(project = %project_id, sandbox = %sandbox_id, missing = ?missing, "sandbox missing critical files");
            return HealthStatus::broken_missing_files(sandbox_id, missing);
        }

        HealthStatus::healthy(Some(sandbox_id))
    }
}
