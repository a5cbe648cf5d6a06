//! Configuration management for Pacer.
//!
//! A configuration file holds default limiter options and any number of named
//! profiles, one per rate-limited service:
//!
//! ```yaml
//! defaults:
//!   max_concurrent_calls: 4
//!   delay_ms: 50
//! profiles:
//!   search:
//!     max_calls_per_interval: 10
//!     interval_length_ms: 1000
//!   export:
//!     max_concurrent_calls: 1
//!     use_alternate_engine: true
//! ```
//!
//! A profile inherits every field it leaves unset from `defaults`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{PacerError, Result};
use crate::ratelimit::{RateLimiter, RateLimiterOptions, RetryPolicy};

/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "PACER";

/// Main configuration for Pacer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Options shared by every profile
    #[serde(default)]
    pub defaults: RateLimiterOptions,

    /// Per-service limiter options
    #[serde(default)]
    pub profiles: BTreeMap<String, RateLimiterOptions>,
}

impl PacerConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| PacerError::Config(e.to_string()))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML file, overridden by the environment.
    ///
    /// Variables are named `PACER_<SECTION>__<FIELD>`, for example
    /// `PACER_DEFAULTS__DELAY_MS=250` or
    /// `PACER_PROFILES__SEARCH__MAX_CONCURRENT_CALLS=2`. Keys are matched
    /// case-insensitively, so profile names are lowercased.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PacerConfig = settings.try_deserialize()?;
        debug!(
            path = %path.display(),
            profiles = config.profiles.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Names of the configured profiles, in sorted order.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Options for `name`, with unset fields taken from `defaults`.
    pub fn profile(&self, name: &str) -> Result<RateLimiterOptions> {
        self.profiles
            .get(name)
            .map(|options| options.merged_over(&self.defaults))
            .ok_or_else(|| PacerError::UnknownProfile(name.to_string()))
    }

    /// Build a limiter for profile `name`.
    pub fn limiter(&self, name: &str, retry: RetryPolicy) -> Result<RateLimiter> {
        let options = self.profile(name)?;
        debug!(profile = name, "Building rate limiter");
        RateLimiter::with_retry(options, retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{EngineKind, Limit};
    use std::time::Duration;

    const CONFIG: &str = r#"
defaults:
  max_concurrent_calls: 4
  delay_ms: 50
profiles:
  search:
    max_calls_per_interval: 10
    interval_length_ms: 1000
  export:
    max_concurrent_calls: 1
    use_alternate_engine: true
  unlimited:
    max_concurrent_calls: .inf
"#;

    #[test]
    fn test_from_yaml() {
        let config = PacerConfig::from_yaml(CONFIG).unwrap();

        assert_eq!(config.defaults.max_concurrent_calls, Some(4.0));
        assert_eq!(config.defaults.delay_ms, Some(50));
        assert_eq!(
            config.profile_names().collect::<Vec<_>>(),
            vec!["export", "search", "unlimited"]
        );
    }

    #[test]
    fn test_profile_inherits_defaults() {
        let config = PacerConfig::from_yaml(CONFIG).unwrap();

        let search = config.profile("search").unwrap().resolve().unwrap();
        assert_eq!(search.max_concurrent_calls, Limit::Bounded(4));
        assert_eq!(search.delay, Duration::from_millis(50));
        assert_eq!(search.max_calls_per_interval, Limit::Bounded(10));
        assert_eq!(search.interval_length, Duration::from_secs(1));

        let export = config.profile("export").unwrap().resolve().unwrap();
        assert_eq!(export.max_concurrent_calls, Limit::Bounded(1));
        assert_eq!(export.engine, EngineKind::Semaphore);

        let unlimited = config.profile("unlimited").unwrap().resolve().unwrap();
        assert_eq!(unlimited.max_concurrent_calls, Limit::Unbounded);
    }

    #[test]
    fn test_unknown_profile() {
        let config = PacerConfig::from_yaml(CONFIG).unwrap();

        assert!(matches!(
            config.profile("missing"),
            Err(PacerError::UnknownProfile(name)) if name == "missing"
        ));
        assert!(config.limiter("missing", RetryPolicy::never()).is_err());
    }

    #[test]
    fn test_limiter_validates_profile() {
        let config = PacerConfig::from_yaml(
            r#"
profiles:
  broken:
    max_calls_per_interval: 5
"#,
        )
        .unwrap();

        assert!(matches!(
            config.limiter("broken", RetryPolicy::never()),
            Err(PacerError::UnpairedIntervalLimit)
        ));
    }

    #[tokio::test]
    async fn test_limiter_from_profile() {
        let config = PacerConfig::from_yaml(CONFIG).unwrap();
        let limiter = config.limiter("export", RetryPolicy::max_attempts(2)).unwrap();

        assert_eq!(limiter.options().engine, EngineKind::Semaphore);
        assert!(limiter.retry_policy().is_enabled());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = PacerConfig::from_yaml("defaults: [1, 2");
        assert!(matches!(result, Err(PacerError::Config(_))));
    }

    #[test]
    fn test_empty_document() {
        let config = PacerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, PacerConfig::default());
    }

    #[test]
    fn test_load_applies_environment_overrides() {
        let path = std::env::temp_dir().join(format!("pacer-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "defaults:\n  delay_ms: 50\nprofiles:\n  search:\n    max_calls_per_interval: 10\n    interval_length_ms: 1000\n  export:\n    max_concurrent_calls: 1\n",
        )
        .unwrap();
        std::env::set_var("PACER_PROFILES__SEARCH__DELAY_MS", "250");

        let config = PacerConfig::load(&path);
        std::env::remove_var("PACER_PROFILES__SEARCH__DELAY_MS");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        let search = config.profile("search").unwrap();
        assert_eq!(search.delay_ms, Some(250));
        assert_eq!(search.max_calls_per_interval, Some(10.0));
        assert_eq!(config.profile("export").unwrap().delay_ms, Some(50));
    }

    #[test]
    fn test_load_missing_file() {
        let result = PacerConfig::load("/nonexistent/pacer.yaml");
        assert!(matches!(result, Err(PacerError::Load(_))));
    }
}
