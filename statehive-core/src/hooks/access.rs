/*
    access.rs - Access control gate

    An ordered list of (pattern, permissions) rules evaluated before any
    hook runs. The first rule whose pattern matches the key decides.

    - no rules at all: everything is allowed
    - at least one rule: a key no rule matches is denied (fail-closed)
    - `Admin` grants read, write and delete on the keys its rule matches

    Regex patterns are compiled once when a rule is added and cached in the
    gate, which belongs to exactly one store.
*/

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Admin => "admin",
        })
    }
}

/// `(key, user) -> matches`
pub type KeyPredicate = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum KeyPattern {
    Regex(String),
    Predicate(KeyPredicate),
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Regex(pattern) => f.debug_tuple("Regex").field(pattern).finish(),
            KeyPattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessRule {
    pub pattern: KeyPattern,
    pub permissions: Vec<Permission>,
}

impl AccessRule {
    pub fn regex(pattern: impl Into<String>, permissions: &[Permission]) -> Self {
        AccessRule { pattern: KeyPattern::Regex(pattern.into()), permissions: permissions.to_vec() }
    }

    pub fn predicate(
        predicate: impl Fn(&str, Option<&str>) -> bool + Send + Sync + 'static,
        permissions: &[Permission],
    ) -> Self {
        AccessRule {
            pattern: KeyPattern::Predicate(Arc::new(predicate)),
            permissions: permissions.to_vec(),
        }
    }

    fn grants(&self, action: Permission) -> bool {
        self.permissions.contains(&action) || self.permissions.contains(&Permission::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// A rule matched but does not grant the action
    Denied,
    /// Rules exist and none matched
    NoMatchingRule,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Default)]
pub struct AccessGate {
    rules: Vec<AccessRule>,
    /// `None` marks a pattern that failed to compile; it never matches
    regex_cache: HashMap<String, Option<Regex>>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Returns the compile error of an invalid regex.
    pub fn add_rule(&mut self, rule: AccessRule) -> Result<(), regex::Error> {
        let mut result = Ok(());
        if let KeyPattern::Regex(pattern) = &rule.pattern {
            if !self.regex_cache.contains_key(pattern) {
                let compiled = Regex::new(pattern);
                if let Err(e) = &compiled {
                    result = Err(e.clone());
                }
                self.regex_cache.insert(pattern.clone(), compiled.ok());
            }
        }
        self.rules.push(rule);
        result
    }

    /// Replace every rule; returns the errors of patterns that did not compile
    pub fn set_rules(&mut self, rules: Vec<AccessRule>) -> Vec<regex::Error> {
        self.clear();
        rules.into_iter().filter_map(|rule| self.add_rule(rule).err()).collect()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.regex_cache.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn check(&self, key: &str, action: Permission, user: Option<&str>) -> Decision {
        if self.rules.is_empty() {
            return Decision::Allowed;
        }
        match self.rules.iter().find(|rule| self.matches(rule, key, user)) {
            Some(rule) if rule.grants(action) => Decision::Allowed,
            Some(_) => Decision::Denied,
            None => Decision::NoMatchingRule,
        }
    }

    fn matches(&self, rule: &AccessRule, key: &str, user: Option<&str>) -> bool {
        match &rule.pattern {
            KeyPattern::Regex(pattern) => self
                .regex_cache
                .get(pattern)
                .and_then(Option::as_ref)
                .map(|re| re.is_match(key))
                .unwrap_or(false),
            KeyPattern::Predicate(predicate) => predicate(key, user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_gate_allows_everything() {
        let gate = AccessGate::new();
        assert!(gate.check("anything", Permission::Delete, None).is_allowed());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut gate = AccessGate::new();
        gate.add_rule(AccessRule::regex("^secret\\.", &[Permission::Read])).unwrap();
        gate.add_rule(AccessRule::regex(".*", &[Permission::Admin])).unwrap();

        assert!(gate.check("secret.token", Permission::Read, None).is_allowed());
        assert_eq!(gate.check("secret.token", Permission::Write, None), Decision::Denied);
        assert!(gate.check("public.name", Permission::Delete, None).is_allowed());
    }

    #[test]
    fn test_admin_implies_everything() {
        let mut gate = AccessGate::new();
        gate.add_rule(AccessRule::regex("^cfg", &[Permission::Admin])).unwrap();
        for action in [Permission::Read, Permission::Write, Permission::Delete] {
            assert!(gate.check("cfg.theme", action, None).is_allowed());
        }
    }

    #[test]
    fn test_predicate_sees_user() {
        let mut gate = AccessGate::new();
        gate.add_rule(AccessRule::predicate(
            |key, user| user.map(|u| key.starts_with(&format!("{}.", u))).unwrap_or(false),
            &[Permission::Read, Permission::Write],
        ))
        .unwrap();

        assert!(gate.check("alice.inbox", Permission::Write, Some("alice")).is_allowed());
        assert_eq!(
            gate.check("alice.inbox", Permission::Write, Some("bob")),
            Decision::NoMatchingRule
        );
        assert_eq!(gate.check("alice.inbox", Permission::Read, None), Decision::NoMatchingRule);
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let mut gate = AccessGate::new();
        let errors = gate.set_rules(vec![
            AccessRule::regex("(broken", &[Permission::Admin]),
            AccessRule::regex("^ok$", &[Permission::Read]),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(gate.check("(broken", Permission::Read, None), Decision::NoMatchingRule);
        assert!(gate.check("ok", Permission::Read, None).is_allowed());
    }

    proptest! {
        // Any key outside every rule is denied for every action
        #[test]
        fn prop_fail_closed(
            prefixes in prop::collection::vec("[a-z]{3}", 1..5),
            key in "[0-9]{1,12}",
            action in prop::sample::select(vec![
                Permission::Read, Permission::Write, Permission::Delete, Permission::Admin,
            ]),
        ) {
            let mut gate = AccessGate::new();
            for prefix in &prefixes {
                gate.add_rule(AccessRule::regex(format!("^{}", prefix), &[Permission::Admin])).unwrap();
            }
            prop_assert!(!gate.check(&key, action, None).is_allowed());
        }
    }
}
