use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PolicyError;
use crate::pattern::PathPattern;
use crate::policy::Policy;
use crate::presets;

/// Maps a request path, and optionally an explicit policy name, to the
/// [`Policy`] that applies.
///
/// Resolution order:
/// 1. the named policy, when a name is given and known
/// 2. the first enabled endpoint override of the default policy whose
///    pattern matches, in declaration order
/// 3. the default policy
///
/// Override policies are derived once, when the selector is built.
#[derive(Debug, Clone)]
pub struct PolicySelector {
    default: Arc<Policy>,
    overrides: Vec<(PathPattern, Arc<Policy>)>,
    named: HashMap<String, Arc<Policy>>,
}

impl PolicySelector {
    pub fn new(default: Policy) -> Result<Self, PolicyError> {
        let mut overrides = Vec::with_capacity(default.endpoint_overrides().len());
        for endpoint in default.endpoint_overrides() {
            if !endpoint.enabled {
                tracing::debug!(pattern = %endpoint.pattern, "skipping disabled endpoint override");
                continue;
            }
            let derived = default
                .with_override(endpoint)
                .map_err(|source| PolicyError::Override {
                    pattern: endpoint.pattern.to_string(),
                    source: Box::new(source),
                })?;
            overrides.push((endpoint.pattern.clone(), Arc::new(derived)));
        }

        Ok(Self {
            default: Arc::new(default),
            overrides,
            named: HashMap::new(),
        })
    }

    /// The gateway defaults: built-in overrides and every preset by name.
    pub fn builtin() -> Self {
        let selector = match Self::new(presets::gateway_default()) {
            Ok(selector) => selector,
            Err(err) => unreachable!("built-in policies are valid: {err}"),
        };

        presets::NAMES
            .iter()
            .chain(presets::ALIASES)
            .filter_map(|name| presets::by_name(name).map(|policy| (*name, policy)))
            .fold(selector, |selector, (name, policy)| {
                selector.with_named(name, policy)
            })
    }

    /// Register `policy` under `name`; names are case-insensitive.
    pub fn with_named(mut self, name: &str, policy: Policy) -> Self {
        self.named
            .insert(name.to_ascii_lowercase(), Arc::new(policy));
        self
    }

    pub fn default_policy(&self) -> &Arc<Policy> {
        &self.default
    }

    pub fn named(&self, name: &str) -> Option<&Arc<Policy>> {
        self.named.get(&name.to_ascii_lowercase())
    }

    pub fn select(&self, path: &str, name: Option<&str>) -> Arc<Policy> {
        if let Some(name) = name {
            match self.named(name) {
                Some(policy) => return Arc::clone(policy),
                None => tracing::warn!(name, "unknown policy name, selecting by path"),
            }
        }

        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, policy)| Arc::clone(policy))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl Default for PolicySelector {
    fn default() -> Self {
        Self::builtin()
    }
}
