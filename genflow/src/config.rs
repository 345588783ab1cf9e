//! Pipeline configuration.
//!
//! Every field has a default, so a config can be built in code with the
//! `with_*` builders, loaded from JSON with any subset of fields, and then
//! adjusted from `GENFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::Stage;
use crate::errors::{PipelineError, Result};
use crate::retry::RetryPolicy;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GENFLOW";

/// Settings for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Maximum jobs of this stage running at once.
    pub concurrency: usize,
    /// Retry budget and backoff.
    pub retry: RetryPolicy,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
}

impl StageConfig {
    /// Creates a stage config.
    #[must_use]
    pub fn new(concurrency: usize, max_attempts: u32, base_delay_ms: u64, timeout_ms: u64) -> Self {
        Self {
            concurrency,
            retry: RetryPolicy::new()
                .with_max_attempts(max_attempts)
                .with_base_delay_ms(base_delay_ms)
                .with_max_delay_ms(DEFAULT_MAX_DELAY_MS),
            timeout_ms,
        }
    }

    /// Default settings for a stage.
    #[must_use]
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Generation => Self::new(2, 3, 5000, 60_000),
            Stage::Build | Stage::Deployment => Self::new(2, 3, 2000, 300_000),
            Stage::Cleanup => Self::new(4, 3, 1000, 60_000),
        }
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// How many finished pipelines to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Deployed or cancelled pipelines to keep.
    pub remove_on_complete: usize,
    /// Failed pipelines to keep.
    pub remove_on_fail: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            remove_on_complete: 100,
            remove_on_fail: 50,
        }
    }
}

/// Queue adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout_ms: u64,
    /// How long a dispatcher blocks in one receive call.
    pub poll_interval_ms: u64,
    /// Backoff used while the broker is unreachable.
    pub reconnect: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            poll_interval_ms: 250,
            reconnect: RetryPolicy::new()
                .with_max_attempts(5)
                .with_base_delay_ms(500)
                .with_max_delay_ms(10_000),
        }
    }
}

impl QueueConfig {
    /// Visibility timeout as a duration.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Generation stage settings.
    pub generation: StageConfig,
    /// Build stage settings.
    pub build: StageConfig,
    /// Deployment stage settings.
    pub deployment: StageConfig,
    /// Cleanup stage settings.
    pub cleanup: StageConfig,
    /// Retention counts.
    pub retention: RetentionConfig,
    /// Maximum age of a job, checked when a stage is activated.
    pub pipeline_timeout_ms: u64,
    /// Queue settings.
    pub queue: QueueConfig,
    /// Accepted target environments; empty accepts any.
    pub allowed_envs: Vec<String>,
    /// Literal values exposed to templates under `values`.
    pub context_values: BTreeMap<String, serde_json::Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation: StageConfig::default_for(Stage::Generation),
            build: StageConfig::default_for(Stage::Build),
            deployment: StageConfig::default_for(Stage::Deployment),
            cleanup: StageConfig::default_for(Stage::Cleanup),
            retention: RetentionConfig::default(),
            pipeline_timeout_ms: 3_600_000,
            queue: QueueConfig::default(),
            allowed_envs: vec![
                "development".to_string(),
                "staging".to_string(),
                "production".to_string(),
            ],
            context_values: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Settings for a stage.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Generation => &self.generation,
            Stage::Build => &self.build,
            Stage::Deployment => &self.deployment,
            Stage::Cleanup => &self.cleanup,
        }
    }

    /// Mutable settings for a stage.
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageConfig {
        match stage {
            Stage::Generation => &mut self.generation,
            Stage::Build => &mut self.build,
            Stage::Deployment => &mut self.deployment,
            Stage::Cleanup => &mut self.cleanup,
        }
    }

    /// Replaces the settings of one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage, config: StageConfig) -> Self {
        *self.stage_mut(stage) = config;
        self
    }

    /// Sets the concurrency limit of one stage.
    #[must_use]
    pub fn with_concurrency(mut self, stage: Stage, concurrency: usize) -> Self {
        self.stage_mut(stage).concurrency = concurrency;
        self
    }

    /// Sets the retention counts.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the overall pipeline timeout.
    #[must_use]
    pub fn with_pipeline_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.pipeline_timeout_ms = timeout_ms;
        self
    }

    /// Sets the queue settings.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the accepted target environments.
    #[must_use]
    pub fn with_allowed_envs<I, S>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_envs = envs.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a literal template value.
    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_values.insert(key.into(), value);
        self
    }

    /// Overall pipeline timeout as a duration.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }

    /// Applies `GENFLOW_*` overrides from the process environment.
    ///
    /// Recognised variables:
    /// - `GENFLOW_PIPELINE_TIMEOUT_MS`
    /// - `GENFLOW_<STAGE>_CONCURRENCY`
    /// - `GENFLOW_<STAGE>_MAX_ATTEMPTS`
    /// - `GENFLOW_<STAGE>_BASE_DELAY_MS`
    /// - `GENFLOW_<STAGE>_TIMEOUT_MS`
    ///
    /// where `<STAGE>` is one of `GENERATION`, `BUILD`, `DEPLOYMENT`,
    /// `CLEANUP`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var::<u64, _>(&lookup, &format!("{ENV_PREFIX}_PIPELINE_TIMEOUT_MS"))? {
            self.pipeline_timeout_ms = value;
        }

        for stage in Stage::ALL {
            let prefix = format!("{ENV_PREFIX}_{}", stage.env_name());
            let config = self.stage_mut(stage);

            if let Some(value) = parse_var::<usize, _>(&lookup, &format!("{prefix}_CONCURRENCY"))? {
                config.concurrency = value;
            }
            if let Some(value) = parse_var::<u32, _>(&lookup, &format!("{prefix}_MAX_ATTEMPTS"))? {
                config.retry.max_attempts = value;
            }
            if let Some(value) = parse_var::<u64, _>(&lookup, &format!("{prefix}_BASE_DELAY_MS"))? {
                config.retry.base_delay_ms = value;
            }
            if let Some(value) = parse_var::<u64, _>(&lookup, &format!("{prefix}_TIMEOUT_MS"))? {
                config.timeout_ms = value;
            }
        }

        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            let config = self.stage(stage);
            if config.concurrency == 0 {
                return Err(PipelineError::Config(format!("{stage}: concurrency must be at least 1")));
            }
            if config.retry.max_attempts == 0 {
                return Err(PipelineError::Config(format!("{stage}: max_attempts must be at least 1")));
            }
            if config.retry.base_delay_ms > config.retry.max_delay_ms {
                return Err(PipelineError::Config(format!(
                    "{stage}: base_delay_ms ({}) exceeds max_delay_ms ({})",
                    config.retry.base_delay_ms, config.retry.max_delay_ms
                )));
            }
            if config.timeout_ms == 0 {
                return Err(PipelineError::Config(format!("{stage}: timeout_ms must be positive")));
            }
        }

        if self.pipeline_timeout_ms == 0 {
            return Err(PipelineError::Config("pipeline_timeout_ms must be positive".to_string()));
        }
        if self.queue.visibility_timeout_ms == 0 {
            return Err(PipelineError::Config("visibility_timeout_ms must be positive".to_string()));
        }
        if self.queue.reconnect.max_attempts == 0 {
            return Err(PipelineError::Config("reconnect max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();

        assert_eq!(config.generation.concurrency, 2);
        assert_eq!(config.generation.retry.max_attempts, 3);
        assert_eq!(config.generation.retry.base_delay_ms, 5000);
        assert_eq!(config.build.retry.base_delay_ms, 2000);
        assert_eq!(config.build.timeout_ms, 300_000);
        assert_eq!(config.deployment.timeout_ms, 300_000);
        assert_eq!(config.retention.remove_on_complete, 100);
        assert_eq!(config.retention.remove_on_fail, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = PipelineConfig::from_json_str(
            r#"{"pipeline_timeout_ms": 1000, "allowed_envs": []}"#,
        )
        .unwrap();

        assert_eq!(config.pipeline_timeout_ms, 1000);
        assert!(config.allowed_envs.is_empty());
        assert_eq!(config.build, StageConfig::default_for(Stage::Build));
    }

    #[test]
    fn test_from_json_invalid() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GENFLOW_PIPELINE_TIMEOUT_MS", "5000"),
            ("GENFLOW_GENERATION_CONCURRENCY", "7"),
            ("GENFLOW_BUILD_MAX_ATTEMPTS", "5"),
            ("GENFLOW_CLEANUP_BASE_DELAY_MS", " 10 "),
            ("GENFLOW_DEPLOYMENT_TIMEOUT_MS", "1234"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.pipeline_timeout_ms, 5000);
        assert_eq!(config.generation.concurrency, 7);
        assert_eq!(config.build.retry.max_attempts, 5);
        assert_eq!(config.cleanup.retry.base_delay_ms, 10);
        assert_eq!(config.deployment.timeout_ms, 1234);
    }

    #[test]
    fn test_override_parse_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "GENFLOW_BUILD_CONCURRENCY").then(|| "lots".to_string()))
            .unwrap_err();

        assert!(err.to_string().contains("GENFLOW_BUILD_CONCURRENCY"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = PipelineConfig::default().with_concurrency(Stage::Build, 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = PipelineConfig::default().with_stage(
            Stage::Generation,
            StageConfig::default_for(Stage::Generation)
                .with_retry(RetryPolicy::new().with_base_delay_ms(10).with_max_delay_ms(5)),
        );
        assert!(config.validate().is_err());
    }
}
