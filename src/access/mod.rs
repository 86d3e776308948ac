mod repository;

pub use repository::{AccessRule, NewRule, RuleFilter, RuleType};

use crate::error::AccessError;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::RwLock;

/// Outcome of a firewall evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Blocked(BlockReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Matched an active deny rule.
    Denied,
    /// Allow rules exist but none matched.
    NotInAllowlist,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Denied => "denied",
            Self::NotInAllowlist => "not_in_allowlist",
        }
    }
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Firewall-style allow/deny evaluator.
///
/// All active rules are held in an in-memory cache keyed by instance (plus a
/// dedicated global bucket) and split per bucket into an exact-match table
/// and a `*`-suffix wildcard list, evaluated in that order. The cache is
/// rebuilt from the database at startup and after every mutation; the check
/// itself is pure over the cached snapshot.
pub struct AccessControl {
    cache: RwLock<Cache>,
}

#[derive(Default)]
struct Cache {
    /// `None` key is the global bucket.
    buckets: HashMap<Option<String>, RuleSet>,
}

#[derive(Default)]
struct RuleSet {
    allow_exact: Vec<String>,
    allow_prefix: Vec<String>,
    deny_exact: Vec<String>,
    deny_prefix: Vec<String>,
}

impl RuleSet {
    fn insert(&mut self, rule_type: RuleType, pattern: &str) {
        let (exact, prefix) = match rule_type {
            RuleType::Allow => (&mut self.allow_exact, &mut self.allow_prefix),
            RuleType::Deny => (&mut self.deny_exact, &mut self.deny_prefix),
        };
        match pattern.strip_suffix('*') {
            Some(stem) => prefix.push(stem.to_string()),
            None => exact.push(pattern.to_string()),
        }
    }

    fn has_allow(&self) -> bool {
        !self.allow_exact.is_empty() || !self.allow_prefix.is_empty()
    }

    fn matches_deny(&self, identifier: &str) -> bool {
        self.deny_exact.iter().any(|p| p == identifier)
            || self.deny_prefix.iter().any(|p| identifier.starts_with(p.as_str()))
    }

    fn matches_allow(&self, identifier: &str) -> bool {
        self.allow_exact.iter().any(|p| p == identifier)
            || self.allow_prefix.iter().any(|p| identifier.starts_with(p.as_str()))
    }

    fn is_empty(&self) -> bool {
        self.allow_exact.is_empty()
            && self.allow_prefix.is_empty()
            && self.deny_exact.is_empty()
            && self.deny_prefix.is_empty()
    }
}

/// Normalize a sender identifier before matching: strip a leading `+` and
/// any `@...` channel suffix (`5511999@s.whatsapp.net` → `5511999`).
pub fn normalize_identifier(raw: &str) -> String {
    let stripped = raw.strip_prefix('+').unwrap_or(raw);
    match stripped.split_once('@') {
        Some((head, _)) => head.to_string(),
        None => stripped.to_string(),
    }
}

impl AccessControl {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Load all active rules into the cache. Called at startup and after
    /// every mutation.
    pub async fn reload(&self, pool: &SqlitePool) -> Result<(), AccessError> {
        let rules = repository::list_active(pool).await?;

        let mut cache = Cache::default();
        for rule in &rules {
            cache
                .buckets
                .entry(rule.instance_name.clone())
                .or_default()
                .insert(rule.rule_type, &rule.phone_number);
        }

        *self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = cache;
        Ok(())
    }

    /// Evaluate the firewall for `identifier` on `instance`.
    ///
    /// Decision order: empty rule space allows; instance-scoped deny, then
    /// global deny, blocks; any allow rule anywhere makes the allowlist
    /// mandatory; otherwise allow.
    pub fn check_access(&self, instance: &str, identifier: &str) -> AccessDecision {
        let identifier = normalize_identifier(identifier);
        let cache = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let scoped = cache.buckets.get(&Some(instance.to_string()));
        let global = cache.buckets.get(&None);

        let scoped_empty = scoped.is_none_or(RuleSet::is_empty);
        let global_empty = global.is_none_or(RuleSet::is_empty);
        if scoped_empty && global_empty {
            return AccessDecision::Allowed;
        }

        // Instance-scoped rules take precedence over global rules.
        for bucket in [scoped, global].into_iter().flatten() {
            if bucket.matches_deny(&identifier) {
                return AccessDecision::Blocked(BlockReason::Denied);
            }
        }

        let allowlist_present = scoped.is_some_and(RuleSet::has_allow)
            || global.is_some_and(RuleSet::has_allow);
        if allowlist_present {
            let matched = [scoped, global]
                .into_iter()
                .flatten()
                .any(|bucket| bucket.matches_allow(&identifier));
            if !matched {
                return AccessDecision::Blocked(BlockReason::NotInAllowlist);
            }
        }

        AccessDecision::Allowed
    }

    /// Insert a rule and refresh the cache. Idempotent: re-adding an
    /// existing `(rule_type, pattern, instance)` tuple returns the existing
    /// rule's id.
    pub async fn add_rule(
        &self,
        pool: &SqlitePool,
        new: NewRule<'_>,
    ) -> Result<i64, AccessError> {
        let id = repository::insert(pool, &new).await?;
        self.reload(pool).await?;
        Ok(id)
    }

    /// Delete a rule by id and refresh the cache.
    pub async fn remove_rule(&self, pool: &SqlitePool, id: i64) -> Result<(), AccessError> {
        repository::delete(pool, id).await?;
        self.reload(pool).await?;
        Ok(())
    }

    pub async fn list_rules(
        &self,
        pool: &SqlitePool,
        filter: &RuleFilter,
    ) -> Result<Vec<AccessRule>, AccessError> {
        repository::list(pool, filter).await
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
}
