//! TOML configuration for the quota engine.
//!
//! ```toml
//! default_policy = "default"
//!
//! [limiter]
//! fail_open = true
//! store_timeout = "250ms"
//!
//! [store]
//! backend = "redis"
//! url = "redis://127.0.0.1/"
//! key_prefix = "rate_limit:"
//!
//! [policies.reports]
//! base = "batch"
//! requests_per_second = 1
//! burst_capacity = 2
//! window_size = "10m"
//!
//! [[overrides]]
//! pattern = "/api/v1/reports/**"
//! requests_per_second = 1
//! burst_capacity = 3
//! strategy = "per_api_key"
//! ```
//!
//! Everything is validated when the configuration is loaded: an invalid
//! policy or override fails the load instead of surfacing on a request.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::QuotaEngine;
use crate::error::ConfigError;
use crate::key::IdentityHeaders;
use crate::key::KeyResolver;
use crate::limiter::LimiterOptions;
use crate::limiter::QuotaLimiter;
use crate::pattern::PathPattern;
use crate::policy::Algorithm;
use crate::policy::EndpointOverride;
use crate::policy::KeyStrategy;
use crate::policy::Policy;
use crate::presets;
use crate::selector::PolicySelector;
use crate::store::MemoryStore;
use crate::store::QuotaStore;
#[cfg(feature = "redis")]
use crate::store::RedisStore;
#[cfg(feature = "redis")]
use crate::store::RedisStoreConfig;

const DEFAULT_POLICY: &str = "default";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    /// Name of the policy applied when no override matches.
    pub default_policy: String,
    /// Keep the gateway's built-in endpoint overrides after the configured
    /// ones.
    pub builtin_overrides: bool,
    /// Endpoint overrides of the default policy, in precedence order.
    pub overrides: Vec<OverrideConfig>,
    /// Named policies; a name shared with a preset replaces it.
    pub policies: BTreeMap<String, PolicyConfig>,
    pub limiter: LimiterOptions,
    pub store: StoreConfig,
    pub identity_headers: IdentityHeaders,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_policy: DEFAULT_POLICY.to_string(),
            builtin_overrides: true,
            overrides: Vec::new(),
            policies: BTreeMap::new(),
            limiter: LimiterOptions::default(),
            store: StoreConfig::default(),
            identity_headers: IdentityHeaders::default(),
        }
    }
}

/// A named policy, expressed as changes to a preset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// The preset to start from, `default` when absent.
    pub base: Option<String>,
    pub strategy: Option<KeyStrategy>,
    pub requests_per_second: Option<u32>,
    pub burst_capacity: Option<u32>,
    pub tokens_per_request: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub window_size: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub penalty_duration: Option<Duration>,
    pub enable_burst_protection: Option<bool>,
    pub burst_multiplier: Option<f64>,
    pub enable_sliding_window: Option<bool>,
    pub number_of_sub_windows: Option<u32>,
    pub algorithm: Option<Algorithm>,
    pub strict_sustained_limit: Option<bool>,
    pub denial_message: Option<String>,
}

impl PolicyConfig {
    pub fn build(&self, name: &str) -> Result<Policy, ConfigError> {
        let base = self.base.as_deref().unwrap_or(DEFAULT_POLICY);
        let mut policy =
            presets::by_name(base).ok_or_else(|| ConfigError::UnknownPreset(base.to_string()))?;

        if let Some(strategy) = self.strategy {
            policy.strategy = strategy;
        }
        if let Some(rate) = self.requests_per_second {
            policy.requests_per_second = rate;
        }
        if let Some(burst) = self.burst_capacity {
            policy.burst_capacity = burst;
        }
        if let Some(tokens) = self.tokens_per_request {
            policy.tokens_per_request = tokens;
        }
        if let Some(window) = self.window_size {
            policy.window_size = window;
        }
        if let Some(penalty) = self.penalty_duration {
            policy.penalty_duration = penalty;
        }
        if let Some(enabled) = self.enable_burst_protection {
            policy.enable_burst_protection = enabled;
        }
        if let Some(multiplier) = self.burst_multiplier {
            policy.burst_multiplier = multiplier;
        }
        if let Some(enabled) = self.enable_sliding_window {
            policy.enable_sliding_window = enabled;
        }
        if let Some(count) = self.number_of_sub_windows {
            policy.number_of_sub_windows = count;
        }
        if let Some(algorithm) = self.algorithm {
            policy.algorithm = Some(algorithm);
        }
        if let Some(strict) = self.strict_sustained_limit {
            policy.strict_sustained_limit = strict;
        }
        if let Some(message) = &self.denial_message {
            policy.denial_message = message.clone();
        }

        policy.validate().map_err(|source| ConfigError::Policy {
            name: name.to_string(),
            source,
        })?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideConfig {
    pub pattern: PathPattern,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
    #[serde(default)]
    pub strategy: Option<KeyStrategy>,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn enabled() -> bool {
    true
}

impl From<&OverrideConfig> for EndpointOverride {
    fn from(config: &OverrideConfig) -> Self {
        EndpointOverride {
            pattern: config.pattern.clone(),
            requests_per_second: config.requests_per_second,
            burst_capacity: config.burst_capacity,
            strategy: config.strategy,
            enabled: config.enabled,
            description: config.description.clone(),
        }
    }
}

/// Where quota state is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process; quotas are not shared between instances.
    #[default]
    Memory,
    #[cfg(feature = "redis")]
    Redis(RedisStoreConfig),
}

impl StoreConfig {
    pub async fn connect(&self) -> Result<Arc<dyn QuotaStore>, ConfigError> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "redis")]
            StoreConfig::Redis(config) => {
                let store = RedisStore::connect_with_config(config.clone()).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl QuotaConfig {
    /// Parses and validates a configuration document.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: QuotaConfig = toml::from_str(document)?;
        config.selector()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml_str(&document)
    }

    pub fn selector(&self) -> Result<PolicySelector, ConfigError> {
        let mut named = BTreeMap::new();
        for name in presets::NAMES.iter().chain(presets::ALIASES) {
            if let Some(policy) = presets::by_name(name) {
                named.insert(name.to_ascii_lowercase(), policy);
            }
        }
        for (name, config) in &self.policies {
            named.insert(name.to_ascii_lowercase(), config.build(name)?);
        }

        let default_name = self.default_policy.to_ascii_lowercase();
        let mut default = named
            .get(&default_name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDefault(self.default_policy.clone()))?;

        default.endpoint_overrides = self.overrides.iter().map(EndpointOverride::from).collect();
        if self.builtin_overrides {
            default.endpoint_overrides.extend(presets::gateway_overrides());
        }

        let selector =
            PolicySelector::new(default).map_err(|source| ConfigError::Policy {
                name: self.default_policy.clone(),
                source,
            })?;

        Ok(named
            .into_iter()
            .fold(selector, |selector, (name, policy)| {
                selector.with_named(&name, policy)
            }))
    }

    pub fn resolver(&self) -> KeyResolver {
        KeyResolver::new(self.identity_headers.clone())
    }

    /// Connects the store and assembles the engine.
    pub async fn engine(&self) -> Result<QuotaEngine, ConfigError> {
        let selector = self.selector()?;
        let store = self.store.connect().await?;
        tracing::info!(
            default_policy = %self.default_policy,
            fail_open = self.limiter.fail_open,
            "quota engine configured"
        );
        Ok(QuotaEngine::new(
            selector,
            self.resolver(),
            QuotaLimiter::new(store, self.limiter),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::error::PolicyError;
    use crate::key::RequestContext;

    const EXAMPLE: &str = r#"
default_policy = "default"

[limiter]
fail_open = false
store_timeout = "100ms"

[identity_headers]
user_id = "x-account"

[policies.reports]
base = "batch"
requests_per_second = 1
burst_capacity = 2
window_size = "10m"

[[overrides]]
pattern = "/api/v1/reports/**"
requests_per_second = 1
burst_capacity = 3
strategy = "per_api_key"
description = "Report generation"

[[overrides]]
pattern = "/api/v1/orders/bulk"
requests_per_second = 1
burst_capacity = 1
enabled = false
"#;

    #[test]
    fn parses_the_full_document() {
        let config = QuotaConfig::from_toml_str(EXAMPLE).unwrap();

        assert!(!config.limiter.fail_open);
        assert_eq!(config.limiter.store_timeout, Duration::from_millis(100));
        assert_eq!(config.identity_headers.user_id, "x-account");
        assert_eq!(config.identity_headers.api_key, "x-api-key");
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.overrides.len(), 2);

        let reports = config.policies["reports"].build("reports").unwrap();
        assert_eq!(reports.window_size(), Duration::from_secs(600));
        assert_eq!(reports.tokens_per_request(), 5);
    }

    #[test]
    fn configured_overrides_precede_builtin_ones() {
        let selector = QuotaConfig::from_toml_str(EXAMPLE).unwrap().selector().unwrap();

        let reports = selector.select("/api/v1/reports/daily", None);
        assert_eq!(reports.strategy(), KeyStrategy::PerApiKey);

        // the disabled bulk override leaves the built-in orders override
        let bulk = selector.select("/api/v1/orders/bulk", None);
        assert_eq!(bulk.requests_per_second(), 10);

        let named = selector.select("/", Some("REPORTS"));
        assert_eq!(named.burst_capacity(), 2);
    }

    #[test]
    fn empty_document_is_the_builtin_gateway() {
        let config = QuotaConfig::from_toml_str("").unwrap();
        assert_eq!(config, QuotaConfig::default());

        let selector = config.selector().unwrap();
        assert_eq!(selector.select("/api/v1/auth/login", None).requests_per_second(), 5);
    }

    #[test]
    fn invalid_policy_fails_the_load() {
        let err = QuotaConfig::from_toml_str(
            r#"
[policies.broken]
requests_per_second = 50
burst_capacity = 10
"#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Policy {
                ref name,
                source: PolicyError::BurstBelowRate { burst: 10, rate: 50 },
            } if name == "broken"
        ));
    }

    #[test]
    fn invalid_override_fails_the_load() {
        let err = QuotaConfig::from_toml_str(
            r#"
[[overrides]]
pattern = "/api/**"
requests_per_second = 0
burst_capacity = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policy { .. }));

        let err = QuotaConfig::from_toml_str(
            r#"
[[overrides]]
pattern = "api/**"
requests_per_second = 1
burst_capacity = 1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_names_fail_the_load() {
        assert!(matches!(
            QuotaConfig::from_toml_str("default_policy = \"gold\""),
            Err(ConfigError::UnknownDefault(name)) if name == "gold"
        ));
        assert!(matches!(
            QuotaConfig::from_toml_str("[policies.gold]\nbase = \"platinum\""),
            Err(ConfigError::UnknownPreset(name)) if name == "platinum"
        ));
        assert!(matches!(
            QuotaConfig::from_toml_str("unknown = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn builds_an_in_memory_engine() {
        let engine = QuotaConfig::from_toml_str(EXAMPLE)
            .unwrap()
            .engine()
            .await
            .unwrap();

        let ctx = RequestContext::new("GET", "/api/v1/reports/daily").with_api_key("k-1");
        let evaluation = engine.evaluate(&ctx, None, SystemTime::now()).await;
        assert!(evaluation.decision.allowed());
        assert_eq!(evaluation.key.as_str(), "api_key:k-1");
    }

    #[cfg(feature = "redis")]
    #[test]
    fn redis_store_section() {
        let config = QuotaConfig::from_toml_str(
            r#"
[store]
backend = "redis"
url = "redis://cache:6379/"
"#,
        )
        .unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Redis(RedisStoreConfig {
                url: "redis://cache:6379/".to_string(),
                key_prefix: "rate_limit:".to_string(),
            })
        );
    }
}
