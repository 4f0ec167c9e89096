//! Sandbox Warden - health checking and recovery for ephemeral project sandboxes.
//!
//! Each user project runs inside a remotely hosted sandbox that can crash,
//! expire, or be left half-initialized. This crate detects unusable sandboxes
//! without false positives on brand-new projects, reconstructs a working
//! sandbox from the best available snapshot or template, does so idempotently
//! under concurrent requests, and retires superseded sandboxes that no other
//! project references.
//!
//! The sandbox runtime, persistence, billing, and UI live elsewhere; this is
//! a library-level controller consumed by request handlers and background
//! jobs through [`HealthChecker`], [`RecoveryOrchestrator`], and the
//! [`SandboxProvider`]/[`ProjectStore`]/[`FragmentStore`] seams.

pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod model;
pub mod provider;
pub mod recovery;
pub mod store;
pub mod template;

pub use config::{ControllerConfig, Environment, Validate, ValidationResult};
pub use error::{Error, Result};
pub use health::{HealthChecker, HealthReason, HealthStatus};
pub use model::{
    BuildStatus, Fragment, FragmentId, ImportRecord, Project, ProjectId, SandboxId,
};
pub use provider::{
    CreateSandboxOptions, CreateSandboxRequest, CreatedSandbox, SandboxProvider,
};
pub use recovery::{
    NoopObserver, RecoveryEvent, RecoveryObserver, RecoveryOptions, RecoveryOrchestrator,
    RecoveryOutcome,
};
pub use store::{FragmentStore, ProjectRecoveryUpdate, ProjectStore};
pub use template::{
    ManifestText, PackageManifest, TemplateResolution, TemplateResolver, TemplateSource,
    TEMPLATE_RULES,
};

pub use memory::{
    MemoryFragmentStore, MemoryProjectStore, MemorySandboxProvider, ProviderCall,
    RecordingObserver,
};
