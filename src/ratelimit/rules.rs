//! Per-action policy rules.
//!
//! Rules map action keys to policies. A key is either an exact action name or
//! a prefix ending in `*`. Lookup prefers an exact match, then the longest
//! matching prefix, then the default policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::policy::Policy;
use crate::error::{FloodgateError, Result};

/// Policies keyed by action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Policy for actions without a specific rule
    #[serde(default)]
    pub default: Policy,

    /// Action name or `prefix*` pattern to policy
    #[serde(default)]
    pub actions: HashMap<String, Policy>,
}

impl PolicyRules {
    /// Rules that apply `policy` to every action.
    pub fn new(policy: Policy) -> Self {
        Self {
            default: policy,
            actions: HashMap::new(),
        }
    }

    /// Add or replace the policy for an action or `prefix*` pattern.
    pub fn with_action(mut self, pattern: impl Into<String>, policy: Policy) -> Self {
        self.actions.insert(pattern.into(), policy);
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy rules: {}", e)))
    }

    /// Apply an overlay. Its actions win, and its default replaces ours only
    /// when the overlay sets one.
    pub fn merge(&mut self, overlay: RulesOverlay) {
        if let Some(default) = overlay.default {
            self.default = default;
        }
        self.actions.extend(overlay.actions);
    }

    /// Find the policy that applies to an action.
    pub fn policy_for(&self, action: &str) -> &Policy {
        if let Some(policy) = self.actions.get(action) {
            return policy;
        }

        self.actions
            .iter()
            .filter_map(|(pattern, policy)| {
                let prefix = pattern.strip_suffix('*')?;
                action.starts_with(prefix).then_some((prefix.len(), policy))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, policy)| policy)
            .unwrap_or(&self.default)
    }
}

/// Rules layered over an existing [`PolicyRules`], e.g. from a separate file.
///
/// Unlike [`PolicyRules`], a missing `default` stays missing instead of
/// becoming [`Policy::default`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesOverlay {
    #[serde(default)]
    pub default: Option<Policy>,

    #[serde(default)]
    pub actions: HashMap<String, Policy>,
}

impl RulesOverlay {
    /// Load an overlay from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy rules overlay");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load an overlay from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy rules: {}", e)))
    }
}

impl From<PolicyRules> for RulesOverlay {
    fn from(rules: PolicyRules) -> Self {
        Self {
            default: Some(rules.default),
            actions: rules.actions,
        }
    }
}
