use std::time::Duration;

/// A policy whose values cannot be enforced.
///
/// These are configuration errors. They are raised when a [`crate::Policy`]
/// is built or loaded, never while a request is being checked.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("requests_per_second must be greater than 0")]
    ZeroRate,

    #[error("burst_capacity ({burst}) must be at least requests_per_second ({rate})")]
    BurstBelowRate { burst: u32, rate: u32 },

    #[error("tokens_per_request must be greater than 0")]
    ZeroCost,

    #[error("window_size must be greater than 0")]
    ZeroWindow,

    #[error("burst_multiplier must be at least 1.0, got {0}")]
    MultiplierBelowOne(f64),

    #[error("number_of_sub_windows must be greater than 0 when the sliding window is enabled")]
    ZeroSubWindows,

    #[error("sub-window of {window:?} / {count} rounds down to zero")]
    SubWindowTooSmall { window: Duration, count: u32 },

    #[error("invalid path pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("endpoint override {pattern:?}: {source}")]
    Override {
        pattern: String,
        #[source]
        source: Box<PolicyError>,
    },
}

/// Failure to load the quota configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("policy {name:?} is invalid: {source}")]
    Policy {
        name: String,
        #[source]
        source: PolicyError,
    },

    #[error("default policy {0:?} is not defined")]
    UnknownDefault(String),

    #[error("unknown preset {0:?}")]
    UnknownPreset(String),

    #[error("unable to connect the quota store: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a round-trip against the shared store.
///
/// Store errors never reach the caller of a limiter: they are converted into
/// an error [`crate::Decision`] at the limiter boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("malformed store reply: {0}")]
    Malformed(String),

    #[error("store call panicked: {0}")]
    Panicked(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Unavailable(format!("timeout: {err}"))
        } else {
            StoreError::Script(err.to_string())
        }
    }
}
