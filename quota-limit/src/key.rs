use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::policy::KeyStrategy;

/// The request metadata quota keys are derived from.
///
/// Every field is optional except the method and path; missing identity is
/// resolved through the fallback chain of [`KeyResolver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    /// Raw forwarded-for header, possibly a comma separated chain.
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub peer_addr: Option<IpAddr>,
    pub method: String,
    pub path: String,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    pub fn with_real_ip(mut self, ip: impl Into<String>) -> Self {
        self.real_ip = Some(ip.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }
}

/// The key two requests must share to draw from the same quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaKey(String);

impl QuotaKey {
    pub fn new(strategy: KeyStrategy, identity: &str) -> Self {
        Self(format!("{}{}", strategy.prefix(), identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request header names consulted during key resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentityHeaders {
    pub user_id: String,
    pub api_key: String,
    pub forwarded_for: String,
    pub real_ip: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            user_id: "x-user-id".to_string(),
            api_key: "x-api-key".to_string(),
            forwarded_for: "x-forwarded-for".to_string(),
            real_ip: "x-real-ip".to_string(),
        }
    }
}

type CustomResolver = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// Derives quota keys from requests.
///
/// Resolution never fails: when the identity a strategy asks for is absent
/// the client IP is used instead, and when no IP is known either the key
/// falls back to `"unknown"`.
#[derive(Clone, Default)]
pub struct KeyResolver {
    headers: IdentityHeaders,
    custom: Option<CustomResolver>,
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("headers", &self.headers)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl KeyResolver {
    pub fn new(headers: IdentityHeaders) -> Self {
        Self {
            headers,
            custom: None,
        }
    }

    /// Install the identity function used by [`KeyStrategy::Custom`].
    ///
    /// Returning `None` falls back to the client IP.
    pub fn with_custom<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(resolver));
        self
    }

    pub fn headers(&self) -> &IdentityHeaders {
        &self.headers
    }

    pub fn resolve(&self, ctx: &RequestContext, strategy: KeyStrategy) -> QuotaKey {
        // Identity fallbacks land in the IP namespace, so an anonymous
        // caller shares the bucket of its address.
        let by_ip = || QuotaKey::new(KeyStrategy::PerIp, &client_ip(ctx));

        match strategy {
            KeyStrategy::PerUser => match present(&ctx.user_id) {
                Some(user) => QuotaKey::new(strategy, user),
                None => by_ip(),
            },
            KeyStrategy::PerIp => by_ip(),
            KeyStrategy::PerApiKey => match present(&ctx.api_key) {
                Some(key) => QuotaKey::new(strategy, key),
                None => by_ip(),
            },
            KeyStrategy::PerEndpoint => {
                QuotaKey::new(strategy, &format!("{}:{}", ctx.method, ctx.path))
            }
            KeyStrategy::Combined => match present(&ctx.user_id) {
                Some(user) => QuotaKey::new(strategy, &format!("{user}:{}", client_ip(ctx))),
                None => by_ip(),
            },
            KeyStrategy::Custom => match self.custom.as_ref().and_then(|custom| custom(ctx)) {
                Some(identity) => QuotaKey::new(strategy, &identity),
                None => by_ip(),
            },
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// First forwarded-for hop, then the real-ip header, then the peer address.
pub fn client_ip(ctx: &RequestContext) -> String {
    if let Some(first) = present(&ctx.forwarded_for)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = present(&ctx.real_ip) {
        return real_ip.to_string();
    }

    match ctx.peer_addr {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}
