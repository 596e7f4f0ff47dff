//! Caching rules — which routes and methods are cacheable, and for how long.
//!
//! A rule is declared as a single line of space-separated fields:
//!
//! ```text
//! <route> <method>[|<method>...] <timeout> [yes]
//! ```
//!
//! | Field     | Example     | Meaning                                              |
//! |-----------|-------------|------------------------------------------------------|
//! | route     | `api-users` | routing key the proxy assigns to a matched request   |
//! | methods   | `GET\|HEAD` | methods whose responses may be cached                |
//! | timeout   | `5m`        | lifetime of a stored entry ([`parse_duration`])      |
//! | `yes`     | `YES`       | optional, sets [`Rule::cache_errors`]                |
//!
//! Rules are keyed by route alone. Declaring a second rule for the same route
//! replaces the first one wholesale; method sets are not merged.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::http::Method;

mod duration;

pub use duration::{DurationError, parse_duration};

/// Errors raised while turning rule declarations into a [`RuleSet`].
///
/// Any of these is fatal at startup: the plugin must not serve with a
/// partially understood configuration.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(
        "rule #{index} {declaration:?} must contain 3 or 4 space-separated parts, found {found}"
    )]
    FieldCount {
        index: usize,
        declaration: String,
        found: usize,
    },

    #[error("rule #{index} {declaration:?} has invalid timeout {timeout:?}: {source}")]
    Timeout {
        index: usize,
        declaration: String,
        timeout: String,
        #[source]
        source: DurationError,
    },
}

/// A caching policy bound to one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    route: String,
    methods: HashSet<Method>,
    timeout: Duration,
    cache_errors: bool,
}

impl Rule {
    /// Creates a rule from its parts.
    pub fn new(
        route: impl Into<String>,
        methods: impl IntoIterator<Item = Method>,
        timeout: Duration,
        cache_errors: bool,
    ) -> Self {
        Self {
            route: route.into(),
            methods: methods.into_iter().collect(),
            timeout,
            cache_errors,
        }
    }

    /// Parses one declaration. `index` is only used for error reporting.
    ///
    /// # Errors
    ///
    /// - [`RuleError::FieldCount`] — fewer than 3 or more than 4 fields.
    /// - [`RuleError::Timeout`] — the timeout field is not a valid duration.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use reproxy_cache::http::Method;
    /// use reproxy_cache::rules::Rule;
    ///
    /// let rule = Rule::parse(0, "r2 GET|POST 10s yes").unwrap();
    /// assert_eq!(rule.route(), "r2");
    /// assert!(rule.allows(&Method::Post));
    /// assert_eq!(rule.timeout(), Duration::from_secs(10));
    /// assert!(rule.cache_errors());
    /// ```
    pub fn parse(index: usize, declaration: &str) -> Result<Self, RuleError> {
        // Single-space split: a doubled space yields an empty field and counts.
        let parts: Vec<&str> = declaration.split(' ').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(RuleError::FieldCount {
                index,
                declaration: declaration.to_owned(),
                found: parts.len(),
            });
        }

        let methods = parts[1].split('|').map(Method::from);

        let timeout = parse_duration(parts[2]).map_err(|source| RuleError::Timeout {
            index,
            declaration: declaration.to_owned(),
            timeout: parts[2].to_owned(),
            source,
        })?;

        let cache_errors = parts
            .get(3)
            .is_some_and(|flag| flag.eq_ignore_ascii_case("yes"));

        Ok(Self::new(parts[0], methods, timeout, cache_errors))
    }

    /// Returns the route this rule is registered under.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Returns the set of cacheable methods.
    pub fn methods(&self) -> &HashSet<Method> {
        &self.methods
    }

    /// Returns `true` if responses to `method` may be cached under this rule.
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Returns how long a stored entry stays valid.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the error-caching flag.
    ///
    /// Parsed and kept for policy consumers; storing a response currently does
    /// not depend on it, so non-2xx responses are cached like any other.
    pub fn cache_errors(&self) -> bool {
        self.cache_errors
    }
}

/// Read-only table of [`Rule`]s keyed by route.
///
/// Built once at startup and shared immutably afterwards, so lookups need no
/// synchronization.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, Rule>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rule set from textual declarations.
    ///
    /// # Errors
    ///
    /// Returns the first [`RuleError`] encountered; no partial set is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use reproxy_cache::http::Method;
    /// use reproxy_cache::rules::RuleSet;
    ///
    /// let rules = RuleSet::parse(["r1 GET 5s", "r1 POST 1m"]).unwrap();
    /// let rule = rules.lookup("r1").unwrap();
    /// assert!(rule.allows(&Method::Post));
    /// assert!(!rule.allows(&Method::Get)); // replaced, not merged
    /// ```
    pub fn parse<I, S>(declarations: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        set.register(declarations)?;
        Ok(set)
    }

    /// Parses `declarations` and inserts each resulting rule in order.
    ///
    /// Rules parsed before a failing declaration remain registered.
    pub fn register<I, S>(&mut self, declarations: I) -> Result<(), RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (index, declaration) in declarations.into_iter().enumerate() {
            let rule = Rule::parse(index, declaration.as_ref())?;
            info!(
                route = %rule.route(),
                timeout = ?rule.timeout(),
                cache_errors = rule.cache_errors(),
                "register rule"
            );
            self.insert(rule);
        }
        Ok(())
    }

    /// Inserts `rule`, returning the rule it replaced for the same route, if any.
    pub fn insert(&mut self, rule: Rule) -> Option<Rule> {
        let replaced = self.rules.insert(rule.route.clone(), rule);
        if let Some(old) = &replaced {
            debug!(route = %old.route(), "rule replaced by later declaration");
        }
        replaced
    }

    /// Returns the rule registered for `route`.
    pub fn lookup(&self, route: &str) -> Option<&Rule> {
        self.rules.get(route)
    }

    /// Returns the rule for `route` only if it also allows `method`.
    pub fn matching(&self, route: &str, method: &Method) -> Option<&Rule> {
        self.lookup(route).filter(|rule| rule.allows(method))
    }

    /// Returns the number of registered routes.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterates over registered rules in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_field_rule() {
        let rule = Rule::parse(0, "r1 GET 5s").unwrap();
        assert_eq!(rule.route(), "r1");
        assert_eq!(rule.methods().len(), 1);
        assert!(rule.allows(&Method::Get));
        assert_eq!(rule.timeout(), Duration::from_secs(5));
        assert!(!rule.cache_errors());
    }

    #[test]
    fn cache_errors_flag_is_case_insensitive() {
        assert!(Rule::parse(0, "r GET 1s YES").unwrap().cache_errors());
        assert!(Rule::parse(0, "r GET 1s yEs").unwrap().cache_errors());
        assert!(!Rule::parse(0, "r GET 1s no").unwrap().cache_errors());
        assert!(!Rule::parse(0, "r GET 1s y").unwrap().cache_errors());
    }

    #[test]
    fn multiple_methods() {
        let rule = Rule::parse(0, "r GET|POST|PURGE 1m").unwrap();
        assert!(rule.allows(&Method::Get));
        assert!(rule.allows(&Method::Post));
        assert!(rule.allows(&Method::Custom("PURGE".into())));
        assert!(!rule.allows(&Method::Put));
    }

    #[test]
    fn method_match_is_case_sensitive() {
        let rule = Rule::parse(0, "r get 1m").unwrap();
        assert!(!rule.allows(&Method::Get));
    }

    #[test]
    fn rejects_wrong_field_count() {
        for bad in ["r1 GET", "r1", "", "r1 GET 5s yes extra", "r1  GET 5s yes"] {
            let err = Rule::parse(3, bad).unwrap_err();
            assert!(
                matches!(err, RuleError::FieldCount { index: 3, .. }),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn rejects_bad_timeout() {
        let err = Rule::parse(1, "r1 GET forever").unwrap_err();
        match &err {
            RuleError::Timeout { index, timeout, .. } => {
                assert_eq!(*index, 1);
                assert_eq!(timeout, "forever");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("r1 GET forever"));
    }

    #[test]
    fn same_route_replaces_previous_rule() {
        let rules = RuleSet::parse(["r1 GET|HEAD 5s yes", "r1 POST 30s"]).unwrap();
        assert_eq!(rules.len(), 1);

        let rule = rules.lookup("r1").unwrap();
        assert!(rule.allows(&Method::Post));
        assert!(!rule.allows(&Method::Get));
        assert!(!rule.allows(&Method::Head));
        assert_eq!(rule.timeout(), Duration::from_secs(30));
        assert!(!rule.cache_errors());
    }

    #[test]
    fn insert_returns_replaced_rule() {
        let mut set = RuleSet::new();
        assert!(set.insert(Rule::new("a", [Method::Get], Duration::from_secs(1), false)).is_none());
        let old = set
            .insert(Rule::new("a", [Method::Put], Duration::from_secs(2), true))
            .unwrap();
        assert!(old.allows(&Method::Get));
    }

    #[test]
    fn parse_fails_on_first_bad_declaration() {
        let err = RuleSet::parse(["ok GET 1s", "bad"]).unwrap_err();
        assert!(matches!(err, RuleError::FieldCount { index: 1, .. }));
    }

    #[test]
    fn matching_requires_route_and_method() {
        let rules = RuleSet::parse(["r2 GET|POST 10s yes"]).unwrap();
        assert!(rules.matching("r2", &Method::Post).is_some());
        assert!(rules.matching("r2", &Method::Delete).is_none());
        assert!(rules.matching("r3", &Method::Get).is_none());
    }
}
