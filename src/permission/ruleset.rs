//! Permission rulesets with most-specific-pattern-wins evaluation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// `permission` names a tool (or a permission key such as `edit`), `pattern`
/// the argument it guards (a path, a command). Both accept `*` and `?`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }

    pub fn matches(&self, permission: &str, pattern: &str) -> bool {
        wildcard_match(&self.permission, permission) && wildcard_match(&self.pattern, pattern)
    }

    fn specificity(&self) -> usize {
        self.permission.len() + self.pattern.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Ruleset(Vec<PermissionRule>);

impl Ruleset {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self(rules)
    }

    pub fn push(&mut self, rule: PermissionRule) {
        self.0.push(rule);
    }

    pub fn with(mut self, permission: &str, pattern: &str, action: PermissionAction) -> Self {
        self.push(PermissionRule::new(permission, pattern, action));
        self
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenate scopes. Later scopes win ties.
    pub fn merge(scopes: &[&Ruleset]) -> Ruleset {
        Ruleset(scopes.iter().flat_map(|scope| scope.0.iter().cloned()).collect())
    }

    /// The most specific matching rule, if any.
    pub fn matching(&self, permission: &str, pattern: &str) -> Option<&PermissionRule> {
        let mut best: Option<&PermissionRule> = None;
        for rule in self.0.iter().filter(|rule| rule.matches(permission, pattern)) {
            if best.map_or(true, |current| rule.specificity() >= current.specificity()) {
                best = Some(rule);
            }
        }
        best
    }

    /// Resolve an action. No matching rule means `ask`.
    pub fn evaluate(&self, permission: &str, pattern: &str) -> PermissionAction {
        self.matching(permission, pattern)
            .map(|rule| rule.action)
            .unwrap_or(PermissionAction::Ask)
    }

    /// Whether a tool is denied outright, independent of its arguments.
    pub fn disables(&self, permission: &str) -> bool {
        self.evaluate(permission, "*") == PermissionAction::Deny
    }
}

/// Glob-style match where `*` spans any run of characters and `?` one character.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(|c: char| c == '*' || c == '?') {
        return pattern == value;
    }
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&format!("(?s){source}"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}
