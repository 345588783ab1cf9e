//! The declarative service request.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::errors::ValidationError;

/// Minimum service name length.
pub const MIN_NAME_LEN: usize = 3;
/// Maximum service name length.
pub const MAX_NAME_LEN: usize = 50;

// Lowercase segments joined by single hyphens: no leading digit, no
// trailing or doubled hyphen.
#[allow(clippy::unwrap_used)]
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").unwrap())
}

/// A request describing the service to generate.
///
/// Immutable once a job referencing it is active; the coordinator stores a
/// copy on the job record and never edits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Id of the template manifest to render.
    pub template_id: String,
    /// Enabled feature flags.
    #[serde(default)]
    pub feature_flags: BTreeSet<String>,
    /// Target environment (e.g. "staging").
    pub target_env: String,
    /// Owning team or user.
    pub owner: String,
    /// Literal values exposed to templates under `values`.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl ServiceSpec {
    /// Creates a new service spec with no flags.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        template_id: impl Into<String>,
        target_env: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            template_id: template_id.into(),
            feature_flags: BTreeSet::new(),
            target_env: target_env.into(),
            owner: owner.into(),
            values: BTreeMap::new(),
        }
    }

    /// Enables a feature flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flags.insert(flag.into());
        self
    }

    /// Enables several feature flags.
    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.feature_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Adds a literal template value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Validates the shape of the request.
    ///
    /// `known_flags` is the flag vocabulary of the requested template and
    /// `allowed_envs` the configured deployment environments (an empty list
    /// accepts any environment).
    pub fn validate(
        &self,
        known_flags: &BTreeSet<String>,
        allowed_envs: &[String],
    ) -> Result<(), ValidationError> {
        validate_service_name(&self.name)?;

        if self.template_id.trim().is_empty() {
            return Err(ValidationError::new("template_id", "must not be empty"));
        }

        if self.owner.trim().is_empty() {
            return Err(ValidationError::new("owner", "must not be empty"));
        }

        if self.target_env.trim().is_empty() {
            return Err(ValidationError::new("target_env", "must not be empty"));
        }
        if !allowed_envs.is_empty() && !allowed_envs.iter().any(|env| env == &self.target_env) {
            return Err(ValidationError::new(
                "target_env",
                format!(
                    "'{}' is not one of: {}",
                    self.target_env,
                    allowed_envs.join(", ")
                ),
            ));
        }

        let unknown: Vec<&str> = self
            .feature_flags
            .iter()
            .filter(|flag| !known_flags.contains(*flag))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::new(
                "feature_flags",
                format!(
                    "unknown to template '{}': {}",
                    self.template_id,
                    unknown.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Checks a service name against the naming rules.
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(ValidationError::new(
            "name",
            format!("must be {MIN_NAME_LEN}-{MAX_NAME_LEN} characters, got {len}"),
        ));
    }
    if !name_pattern().is_match(name) {
        return Err(ValidationError::new(
            "name",
            format!(
                "'{name}' must start with a lowercase letter, contain only [a-z0-9-], \
                 and have no trailing or consecutive hyphens"
            ),
        ));
    }
    Ok(())
}
