//! Controller configuration and validation.
//!
//! The deploy environment and provider tag are threaded through explicitly so
//! the health checker and template resolver stay testable with injected
//! configuration instead of reading process environment deep in call chains.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Deploy environment used for pre-baked snapshot lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Configuration for the health and recovery controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Environment tag passed to the provider when checking for pre-baked
    /// template snapshots.
    #[serde(default)]
    pub environment: Environment,

    /// Template used when the resolver finds no match.
    #[serde(default = "default_fallback_template")]
    pub fallback_template: String,

    /// Provider tag this controller manages. Projects tagged with a different
    /// provider are out of scope for health checks and recovery.
    #[serde(default = "default_managed_provider")]
    pub managed_provider: String,
}

fn default_fallback_template() -> String {
    "react-vite".to_string()
}

fn default_managed_provider() -> String {
    "modal".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            fallback_template: default_fallback_template(),
            managed_provider: default_managed_provider(),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML document and validates it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate().into_result()?;
        Ok(config)
    }

    /// Sets the deploy environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the fallback template.
    pub fn with_fallback_template(mut self, template: impl Into<String>) -> Self {
        self.fallback_template = template.into();
        self
    }

    /// Sets the managed provider tag.
    pub fn with_managed_provider(mut self, provider: impl Into<String>) -> Self {
        self.managed_provider = provider.into();
        self
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ControllerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.fallback_template.trim().is_empty() {
            result.add_error("fallback_template cannot be empty");
        }

        if self.managed_provider.trim().is_empty() {
            result.add_error("managed_provider cannot be empty");
        }

        if self.fallback_template.contains(char::is_whitespace) {
            result.add_warning("fallback_template contains whitespace - template names are usually slugs");
        }

        result
    }
}
