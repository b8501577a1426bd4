use super::{Capability, RuleDecision};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A persisted `(capability, pattern, decision)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRule {
    pub capability: Capability,
    pub pattern: String,
    pub decision: RuleDecision,
}

impl PermissionRule {
    pub fn allow(capability: Capability, pattern: impl Into<String>) -> Self {
        Self {
            capability,
            pattern: pattern.into(),
            decision: RuleDecision::Allow,
        }
    }

    pub fn deny(capability: Capability, pattern: impl Into<String>) -> Self {
        Self {
            capability,
            pattern: pattern.into(),
            decision: RuleDecision::Deny,
        }
    }

    pub fn matches(&self, capability: Capability, candidate: &str) -> bool {
        self.capability == capability && pattern_matches(&self.pattern, candidate)
    }
}

/// `*` matches anything, `prefix/*` matches by prefix (slash included), else exact.
pub fn pattern_matches(rule_pattern: &str, candidate: &str) -> bool {
    if rule_pattern == "*" {
        return true;
    }
    if let Some(prefix) = rule_pattern.strip_suffix('*') {
        if prefix.ends_with('/') {
            return candidate.starts_with(prefix);
        }
    }
    rule_pattern == candidate
}

/// Append-only session ruleset. First match in insertion order wins.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<Vec<PermissionRule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = PermissionRule>) -> Self {
        Self {
            rules: RwLock::new(rules.into_iter().collect()),
        }
    }

    pub fn find_match(&self, capability: Capability, pattern: &str) -> Option<PermissionRule> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.matches(capability, pattern))
            .cloned()
    }

    pub fn append(&self, rule: PermissionRule) {
        self.rules.write().push(rule);
    }

    pub fn snapshot(&self) -> Vec<PermissionRule> {
        self.rules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
