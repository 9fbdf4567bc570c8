use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PolicyError;
use crate::pattern::PathPattern;

/// How the quota key is derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    PerUser,
    PerIp,
    PerApiKey,
    PerEndpoint,
    Combined,
    Custom,
}

impl KeyStrategy {
    /// Prefix that namespaces keys of this strategy.
    pub fn prefix(self) -> &'static str {
        match self {
            KeyStrategy::PerUser => "user:",
            KeyStrategy::PerIp => "ip:",
            KeyStrategy::PerApiKey => "api_key:",
            KeyStrategy::PerEndpoint => "endpoint:",
            KeyStrategy::Combined => "combined:",
            KeyStrategy::Custom => "custom:",
        }
    }
}

/// The algorithm enforcing a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    FixedWindow,
    TokenBucket,
    SlidingWindow,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::SlidingWindow => "sliding-window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A path specific replacement for a policy's rate, burst and strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointOverride {
    pub pattern: PathPattern,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
    /// `None` keeps the strategy of the policy being overridden.
    pub strategy: Option<KeyStrategy>,
    pub enabled: bool,
    pub description: Option<String>,
}

impl EndpointOverride {
    pub fn new(pattern: PathPattern, requests_per_second: u32, burst_capacity: u32) -> Self {
        Self {
            pattern,
            requests_per_second,
            burst_capacity,
            strategy: None,
            enabled: true,
            description: None,
        }
    }

    pub fn with_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An immutable quota description.
///
/// A `Policy` can only be obtained through [`PolicyBuilder::build`], the
/// `with_*` copy constructors or the presets, all of which validate it, so
/// every `Policy` in circulation satisfies [`Policy::is_valid`].
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub(crate) strategy: KeyStrategy,
    pub(crate) requests_per_second: u32,
    pub(crate) burst_capacity: u32,
    pub(crate) tokens_per_request: u32,
    pub(crate) window_size: Duration,
    pub(crate) penalty_duration: Duration,
    pub(crate) enable_burst_protection: bool,
    pub(crate) burst_multiplier: f64,
    pub(crate) enable_sliding_window: bool,
    pub(crate) number_of_sub_windows: u32,
    pub(crate) algorithm: Option<Algorithm>,
    pub(crate) strict_sustained_limit: bool,
    pub(crate) denial_message: String,
    pub(crate) endpoint_overrides: Vec<EndpointOverride>,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }

    pub fn burst_capacity(&self) -> u32 {
        self.burst_capacity
    }

    pub fn tokens_per_request(&self) -> u32 {
        self.tokens_per_request
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Informational back-off communicated to denied clients.
    pub fn penalty_duration(&self) -> Duration {
        self.penalty_duration
    }

    pub fn burst_protection_enabled(&self) -> bool {
        self.enable_burst_protection
    }

    pub fn burst_multiplier(&self) -> f64 {
        self.burst_multiplier
    }

    pub fn sliding_window_enabled(&self) -> bool {
        self.enable_sliding_window
    }

    pub fn number_of_sub_windows(&self) -> u32 {
        self.number_of_sub_windows
    }

    /// Deny at the sustained rate instead of soft-allowing with a penalty.
    pub fn strict_sustained_limit(&self) -> bool {
        self.strict_sustained_limit
    }

    pub fn denial_message(&self) -> &str {
        &self.denial_message
    }

    pub fn endpoint_overrides(&self) -> &[EndpointOverride] {
        &self.endpoint_overrides
    }

    /// The algorithm that enforces this policy.
    ///
    /// An explicitly configured algorithm wins; otherwise the sliding window
    /// is used when enabled and the fixed window when not.
    pub fn algorithm(&self) -> Algorithm {
        match self.algorithm {
            Some(algorithm) => algorithm,
            None if self.enable_sliding_window => Algorithm::SlidingWindow,
            None => Algorithm::FixedWindow,
        }
    }

    /// Burst capacity scaled by the burst multiplier when burst protection
    /// is enabled.
    pub fn effective_burst_capacity(&self) -> u32 {
        if !self.enable_burst_protection {
            return self.burst_capacity;
        }
        (self.burst_capacity as f64 * self.burst_multiplier).ceil() as u32
    }

    pub fn sub_window_duration(&self) -> Duration {
        if !self.enable_sliding_window || self.number_of_sub_windows == 0 {
            return self.window_size;
        }
        self.window_size / self.number_of_sub_windows
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.validate_own()?;
        for endpoint in &self.endpoint_overrides {
            self.derive(endpoint)
                .validate_own()
                .map_err(|source| PolicyError::Override {
                    pattern: endpoint.pattern.to_string(),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    fn validate_own(&self) -> Result<(), PolicyError> {
        if self.requests_per_second == 0 {
            return Err(PolicyError::ZeroRate);
        }
        if self.burst_capacity < self.requests_per_second {
            return Err(PolicyError::BurstBelowRate {
                burst: self.burst_capacity,
                rate: self.requests_per_second,
            });
        }
        if self.tokens_per_request == 0 {
            return Err(PolicyError::ZeroCost);
        }
        if self.window_size.as_millis() == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        if self.burst_multiplier.is_nan() || self.burst_multiplier < 1.0 {
            return Err(PolicyError::MultiplierBelowOne(self.burst_multiplier));
        }
        if self.enable_sliding_window {
            if self.number_of_sub_windows == 0 {
                return Err(PolicyError::ZeroSubWindows);
            }
            if self.sub_window_duration().as_millis() == 0 {
                return Err(PolicyError::SubWindowTooSmall {
                    window: self.window_size,
                    count: self.number_of_sub_windows,
                });
            }
        }
        Ok(())
    }

    /// The policy that applies on paths matched by `endpoint`.
    ///
    /// Derived policies carry no overrides of their own.
    pub fn with_override(&self, endpoint: &EndpointOverride) -> Result<Policy, PolicyError> {
        let derived = self.derive(endpoint);
        derived.validate_own()?;
        Ok(derived)
    }

    fn derive(&self, endpoint: &EndpointOverride) -> Policy {
        Policy {
            strategy: endpoint.strategy.unwrap_or(self.strategy),
            requests_per_second: endpoint.requests_per_second,
            burst_capacity: endpoint.burst_capacity,
            endpoint_overrides: Vec::new(),
            ..self.clone()
        }
    }

    fn modified(&self, change: impl FnOnce(&mut Policy)) -> Result<Policy, PolicyError> {
        let mut policy = self.clone();
        change(&mut policy);
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_requests_per_second(&self, rate: u32) -> Result<Policy, PolicyError> {
        self.modified(|p| p.requests_per_second = rate)
    }

    pub fn with_burst_capacity(&self, burst: u32) -> Result<Policy, PolicyError> {
        self.modified(|p| p.burst_capacity = burst)
    }

    pub fn with_strategy(&self, strategy: KeyStrategy) -> Result<Policy, PolicyError> {
        self.modified(|p| p.strategy = strategy)
    }

    pub fn with_tokens_per_request(&self, tokens: u32) -> Result<Policy, PolicyError> {
        self.modified(|p| p.tokens_per_request = tokens)
    }
}

/// Builder for [`Policy`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    policy: Policy,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self {
            policy: Policy {
                strategy: KeyStrategy::PerUser,
                requests_per_second: 100,
                burst_capacity: 200,
                tokens_per_request: 1,
                window_size: Duration::from_secs(60),
                penalty_duration: Duration::from_secs(300),
                enable_burst_protection: false,
                burst_multiplier: 1.0,
                enable_sliding_window: false,
                number_of_sub_windows: 6,
                algorithm: None,
                strict_sustained_limit: false,
                denial_message: "Rate limit exceeded. Please reduce request frequency.".to_string(),
                endpoint_overrides: Vec::new(),
            },
        }
    }
}

impl PolicyBuilder {
    pub fn strategy(mut self, strategy: KeyStrategy) -> Self {
        self.policy.strategy = strategy;
        self
    }

    pub fn requests_per_second(mut self, rate: u32) -> Self {
        self.policy.requests_per_second = rate;
        self
    }

    pub fn burst_capacity(mut self, burst: u32) -> Self {
        self.policy.burst_capacity = burst;
        self
    }

    pub fn tokens_per_request(mut self, tokens: u32) -> Self {
        self.policy.tokens_per_request = tokens;
        self
    }

    pub fn window_size(mut self, window: Duration) -> Self {
        self.policy.window_size = window;
        self
    }

    pub fn penalty_duration(mut self, penalty: Duration) -> Self {
        self.policy.penalty_duration = penalty;
        self
    }

    /// Enable burst protection with the given multiplier.
    pub fn burst_protection(mut self, multiplier: f64) -> Self {
        self.policy.enable_burst_protection = true;
        self.policy.burst_multiplier = multiplier;
        self
    }

    /// Enable the sliding window with `sub_windows` sub-windows.
    pub fn sliding_window(mut self, sub_windows: u32) -> Self {
        self.policy.enable_sliding_window = true;
        self.policy.number_of_sub_windows = sub_windows;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.policy.algorithm = Some(algorithm);
        self
    }

    pub fn strict_sustained_limit(mut self, strict: bool) -> Self {
        self.policy.strict_sustained_limit = strict;
        self
    }

    pub fn denial_message(mut self, message: impl Into<String>) -> Self {
        self.policy.denial_message = message.into();
        self
    }

    pub fn endpoint_override(mut self, endpoint: EndpointOverride) -> Self {
        self.policy.endpoint_overrides.push(endpoint);
        self
    }

    pub fn build(self) -> Result<Policy, PolicyError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
