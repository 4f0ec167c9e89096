//! Template resolution heuristics.
//!
//! Infers which base template a project most resembles from its fragment
//! contents. This is a deterministic, auditable keyword match rather than
//! classification: template choice only needs to be close enough to bootstrap
//! a recognizable scaffold, and a wrong guess self-corrects once real files
//! exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::model::ProjectId;
use crate::provider::SandboxProvider;
use crate::store::{FragmentStore, ProjectStore};

/// Where a template resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSource {
    /// Derived from the project's active fragment.
    Project,
    /// Derived from the most recent fragment, regardless of the active pointer.
    Heuristic,
    /// The fixed default template.
    Fallback,
    /// Explicit caller-supplied template name.
    Override,
}

/// Result of resolving a template. Ephemeral: logged, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateResolution {
    pub template_name: String,
    pub source: TemplateSource,
    /// Whether the provider holds a pre-baked image for this template in the
    /// configured environment.
    pub has_snapshot: bool,
}

/// Ordered template rules; the first rule with any keyword hit wins.
///
/// Order is part of the contract: earlier rules shadow later ones when a
/// corpus mentions keywords from both.
pub const TEMPLATE_RULES: &[(&str, &[&str])] = &[
    (
        "ecommerce-store",
        &["checkout", "shopping cart", "storefront", "product catalog", "stripe"],
    ),
    (
        "saas-dashboard",
        &["dashboard", "analytics", "admin panel", "recharts"],
    ),
    ("todo-app", &["todo", "task list", "kanban", "checklist"]),
    ("blog", &["blog", "article", "markdown post", "mdx"]),
    (
        "landing-page",
        &["landing", "hero section", "waitlist", "pricing"],
    ),
    ("portfolio", &["portfolio", "showcase", "case study", "resume"]),
];

/// The subset of a package manifest the heuristic reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub dependencies: BTreeMap<String, serde_json::Value>,

    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, serde_json::Value>,
}

/// A package manifest parsed from a fragment, or the raw text when parsing
/// fails. Malformed JSON is expected in stored fragments and must never
/// surface as an error.
#[derive(Debug, Clone)]
pub enum ManifestText {
    Parsed(PackageManifest),
    Raw(String),
}

impl ManifestText {
    /// Parses manifest JSON, falling back to the raw text on any failure.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<PackageManifest>(raw) {
            Ok(parsed) => Self::Parsed(parsed),
            Err(_) => Self::Raw(raw.to_string()),
        }
    }

    /// Text this manifest contributes to the heuristic corpus.
    pub fn corpus_text(&self) -> String {
        match self {
            Self::Parsed(manifest) => {
                let mut parts: Vec<&str> = Vec::new();
                if let Some(name) = &manifest.name {
                    parts.push(name);
                }
                if let Some(description) = &manifest.description {
                    parts.push(description);
                }
                parts.extend(manifest.dependencies.keys().map(String::as_str));
                parts.extend(manifest.dev_dependencies.keys().map(String::as_str));
                parts.join(" ")
            }
            Self::Raw(raw) => raw.clone(),
        }
    }
}

/// Builds the lower-cased search corpus for a fragment's file map: path
/// names, manifest-derived text, and README contents.
pub(crate) fn heuristic_corpus(files: &BTreeMap<String, String>) -> String {
    let mut corpus = String::new();
    for path in files.keys() {
        corpus.push_str(path);
        corpus.push('\n');
    }
    let manifest = files
        .iter()
        .find(|(path, _)| {
            path.rsplit('/')
                .next()
                .is_some_and(|name| name.eq_ignore_ascii_case("package.json"))
        })
        .map(|(_, content)| content);
    if let Some(manifest) = manifest {
        corpus.push_str(&ManifestText::parse(manifest).corpus_text());
        corpus.push('\n');
    }
    let readme = files
        .iter()
        .find(|(path, _)| path.to_lowercase().ends_with("readme.md"))
        .map(|(_, content)| content);
    if let Some(readme) = readme {
        corpus.push_str(readme);
        corpus.push('\n');
    }
    corpus.to_lowercase()
}

/// First-match walk over the ordered rule table.
pub(crate) fn match_template(corpus: &str) -> Option<&'static str> {
    TEMPLATE_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| corpus.contains(keyword)))
        .map(|(name, _)| *name)
}

/// Infers which base template a project most resembles.
pub struct TemplateResolver<P, S, F> {
    provider: Arc<P>,
    projects: Arc<S>,
    fragments: Arc<F>,
    config: ControllerConfig,
}

impl<P: SandboxProvider, S: ProjectStore, F: FragmentStore> TemplateResolver<P, S, F> {
    /// Creates a resolver over the given provider and stores.
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

    /// Resolves the template for a project.
    ///
    /// Never fails: store faults degrade to the fallback template.
    pub async fn resolve(&self, project_id: &ProjectId) -> TemplateResolution {
        let (template_name, source) = self.resolve_name(project_id).await;
        self.finish(template_name, source).await
    }

    /// Wraps an explicit caller-supplied template name.
    pub async fn resolve_override(&self, template_name: &str) -> TemplateResolution {
        self.finish(template_name.to_string(), TemplateSource::Override)
            .await
    }

    async fn resolve_name(&self, project_id: &ProjectId) -> (String, TemplateSource) {
        // Active fragment first.
        if let Ok(Some(project)) = self.projects.get_project(project_id).await {
            if let Some(active_id) = project.active_fragment_id {
                if let Ok(Some(fragment)) = self.fragments.get_fragment(&active_id).await {
                    if let Some(name) = match_template(&heuristic_corpus(&fragment.files)) {
                        return (name.to_string(), TemplateSource::Project);
                    }
                }
            }
        }

        // Most recent fragment, regardless of the active pointer.
        if let Ok(Some(fragment)) = self.fragments.latest_created(project_id).await {
            if let Some(name) = match_template(&heuristic_corpus(&fragment.files)) {
                return (name.to_string(), TemplateSource::Heuristic);
            }
        }

        (
            self.config.fallback_template.clone(),
            TemplateSource::Fallback,
        )
    }

    /// Completes a resolution: checks for a pre-baked snapshot and logs the
    /// outcome. The log is a named side effect for observability, not
    /// incidental.
    async fn finish(&self, template_name: String, source: TemplateSource) -> TemplateResolution {
        let has_snapshot = match self
            .provider
            .has_snapshot(&template_name, self.config.environment)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(template = %template_name, error = %e, "pre-baked snapshot lookup failed");
                false
            }
        };

        let resolution = TemplateResolution {
            template_name,
            source,
            has_snapshot,
        };
        tracing::info!(
            template = %resolution.template_name,
            source = ?resolution.source,
            has_snapshot = resolution.has_snapshot,
            "resolved template"
        );
        resolution
    }
}
