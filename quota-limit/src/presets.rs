//! Named policies shipped with the gateway.

use std::time::Duration;

use crate::pattern::PathPattern;
use crate::policy::EndpointOverride;
use crate::policy::KeyStrategy;
use crate::policy::Policy;

const MINUTE: Duration = Duration::from_secs(60);

/// Names accepted by [`by_name`], in the order they are documented.
pub const NAMES: &[&str] = &[
    "default",
    "trading",
    "market-data",
    "public-api",
    "admin",
    "mobile",
    "batch",
];

/// Alternative names accepted by [`by_name`].
pub const ALIASES: &[&str] = &["standard", "public"];

fn preset(strategy: KeyStrategy, rate: u32, burst: u32, message: &str) -> Policy {
    Policy {
        strategy,
        requests_per_second: rate,
        burst_capacity: burst,
        tokens_per_request: 1,
        window_size: MINUTE,
        penalty_duration: MINUTE * 5,
        enable_burst_protection: true,
        burst_multiplier: 2.0,
        enable_sliding_window: true,
        number_of_sub_windows: 6,
        algorithm: None,
        strict_sustained_limit: false,
        denial_message: message.to_string(),
        endpoint_overrides: Vec::new(),
    }
}

pub fn standard_user() -> Policy {
    preset(
        KeyStrategy::PerUser,
        100,
        200,
        "Rate limit exceeded. Please reduce request frequency.",
    )
}

pub fn trading_user() -> Policy {
    Policy {
        penalty_duration: MINUTE * 10,
        burst_multiplier: 1.5,
        // 5 second sub-windows
        number_of_sub_windows: 12,
        ..preset(
            KeyStrategy::PerUser,
            10,
            20,
            "Trading rate limit exceeded. Please slow down your order placement.",
        )
    }
}

pub fn public_api() -> Policy {
    Policy {
        penalty_duration: MINUTE * 2,
        enable_burst_protection: false,
        burst_multiplier: 1.0,
        ..preset(KeyStrategy::PerIp, 200, 400, "Public API rate limit exceeded.")
    }
}

pub fn admin_user() -> Policy {
    Policy {
        penalty_duration: MINUTE * 15,
        ..preset(KeyStrategy::Combined, 50, 100, "Admin rate limit exceeded.")
    }
}

pub fn mobile_client() -> Policy {
    Policy {
        penalty_duration: MINUTE * 3,
        burst_multiplier: 1.8,
        ..preset(KeyStrategy::PerUser, 50, 100, "Mobile API rate limit exceeded.")
    }
}

pub fn batch_operations() -> Policy {
    Policy {
        tokens_per_request: 5,
        window_size: MINUTE * 5,
        penalty_duration: MINUTE * 30,
        burst_multiplier: 1.2,
        enable_sliding_window: false,
        number_of_sub_windows: 0,
        ..preset(
            KeyStrategy::PerUser,
            2,
            5,
            "Batch operation rate limit exceeded. Please reduce batch frequency.",
        )
    }
}

/// Looks up a preset by name, case-insensitively.
pub fn by_name(name: &str) -> Option<Policy> {
    match name.to_ascii_lowercase().as_str() {
        "default" | "standard" | "market-data" => Some(standard_user()),
        "trading" => Some(trading_user()),
        "public-api" | "public" => Some(public_api()),
        "admin" => Some(admin_user()),
        "mobile" => Some(mobile_client()),
        "batch" => Some(batch_operations()),
        _ => None,
    }
}

fn endpoint(pattern: &str, rate: u32, burst: u32, strategy: KeyStrategy) -> EndpointOverride {
    let pattern = match PathPattern::parse(pattern) {
        Ok(pattern) => pattern,
        Err(_) => unreachable!("built-in pattern {pattern} is well formed"),
    };
    EndpointOverride::new(pattern, rate, burst).with_strategy(strategy)
}

/// The gateway's endpoint overrides, in precedence order.
///
/// Public market data precedes the general market data entry so that it can
/// be reached at all under first-match resolution.
pub fn gateway_overrides() -> Vec<EndpointOverride> {
    vec![
        endpoint("/api/v1/orders/**", 10, 20, KeyStrategy::PerUser)
            .with_description("Trading operations - strict limits"),
        endpoint("/api/v1/market-data/public/**", 200, 400, KeyStrategy::PerIp)
            .with_description("Public market data - very high throughput"),
        endpoint("/api/v1/market-data/**", 100, 200, KeyStrategy::PerUser)
            .with_description("Market data - high throughput"),
        endpoint("/api/v1/admin/**", 20, 40, KeyStrategy::Combined)
            .with_description("Admin operations - moderate limits"),
        endpoint("/api/v1/auth/**", 5, 10, KeyStrategy::PerIp)
            .with_description("Authentication - prevent brute force"),
    ]
}

/// The standard user policy carrying the gateway's endpoint overrides.
pub fn gateway_default() -> Policy {
    Policy {
        endpoint_overrides: gateway_overrides(),
        ..standard_user()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Algorithm;

    #[test]
    fn every_preset_is_valid() {
        for name in NAMES {
            let policy = by_name(name).unwrap_or_else(|| panic!("missing preset {name}"));
            assert!(policy.is_valid(), "preset {name} is invalid: {policy:?}");
        }
        assert!(gateway_default().is_valid());
    }

    #[test]
    fn lookup_is_case_insensitive_with_aliases() {
        assert_eq!(by_name("TRADING"), Some(trading_user()));
        assert_eq!(by_name("public"), Some(public_api()));
        assert_eq!(by_name("unknown"), None);
    }

    #[test]
    fn batch_uses_fixed_window_with_costly_requests() {
        let batch = batch_operations();
        assert_eq!(batch.algorithm(), Algorithm::FixedWindow);
        assert_eq!(batch.tokens_per_request(), 5);
    }
}
