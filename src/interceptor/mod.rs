//! The caching interceptor — serves stored responses and records new ones.
//!
//! For every request the proxy calls [`Interceptor::before`] and, if the
//! request reached the origin, [`Interceptor::after`]. Both resolve the
//! [`Rule`](crate::rules::Rule) for the request's route and method the same
//! way, and both derive the cache key with [`cache_key`]. No state is carried
//! from one hook to the other.
//!
//! Requests without a matching rule never touch storage.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use crate::http::Method;
use crate::plugin::{HookRequest, HookResponse, Hooks};
use crate::rules::{Rule, RuleSet};
use crate::storage::{Entry, Storage, StorageError};

// Deadline used when `now + timeout` would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Builds the cache key for `method` on `route`: `METHOD@route`.
///
/// # Examples
///
/// ```
/// use reproxy_cache::http::Method;
/// use reproxy_cache::interceptor::cache_key;
///
/// assert_eq!(cache_key(&Method::Get, "api-users"), "GET@api-users");
/// ```
pub fn cache_key(method: &Method, route: &str) -> String {
    format!("{method}@{route}")
}

/// Hook implementation backed by a [`RuleSet`] and a [`Storage`] backend.
///
/// The rule set is immutable; `storage` is the only shared mutable state and
/// does its own locking, so one interceptor can serve any number of
/// concurrent hook calls.
pub struct Interceptor<S> {
    rules: RuleSet,
    storage: S,
}

impl<S: Storage> Interceptor<S> {
    /// Creates an interceptor over `rules` and `storage`.
    pub fn new(rules: RuleSet, storage: S) -> Self {
        Self { rules, storage }
    }

    /// Returns the rule table.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Returns the storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Serves the request from cache when a live entry exists.
    ///
    /// On a hit, `res` carries the cached status, body and headers, asks the
    /// proxy to skip the origin, and asks for the headers to be used verbatim.
    /// On a miss, or when no rule applies, `res` is left untouched.
    ///
    /// # Errors
    ///
    /// Storage failures other than a miss are returned unchanged.
    pub fn before(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), StorageError> {
        if self.rule_for(req).is_none() {
            return Ok(());
        }

        let key = cache_key(&req.method, &req.route);
        let entry = match self.storage.get(&key) {
            Ok(entry) => entry,
            Err(StorageError::NotFound) => {
                debug!(key = %key, "cache miss");
                return Ok(());
            }
            Err(e) => {
                error!(key = %key, error = %e, "cache lookup failed");
                return Err(e);
            }
        };

        debug!(key = %key, status = entry.status(), "serving from cache");

        res.short_circuit = true;
        res.status_code = entry.status();
        res.body = entry.body().clone();
        res.headers_out = entry.headers().clone();
        res.override_headers_out = true;

        Ok(())
    }

    /// Stores the origin's response for the rule's timeout.
    ///
    /// Every status is stored, errors included. `res` is never modified.
    ///
    /// # Errors
    ///
    /// Storage failures are returned unchanged; nothing is retried.
    pub fn after(&self, req: &HookRequest, _res: &mut HookResponse) -> Result<(), StorageError> {
        let Some(rule) = self.rule_for(req) else {
            return Ok(());
        };

        let key = cache_key(&req.method, &req.route);
        let now = Instant::now();
        let deadline = now
            .checked_add(rule.timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);

        let entry = Entry::new(
            deadline,
            req.response_code,
            req.response_body.clone(),
            req.response_headers.clone(),
        );

        if let Err(e) = self.storage.put(&key, entry) {
            error!(key = %key, error = %e, "cache store failed");
            return Err(e);
        }

        debug!(key = %key, status = req.response_code, ttl = ?rule.timeout(), "response cached");
        Ok(())
    }

    fn rule_for(&self, req: &HookRequest) -> Option<&Rule> {
        let Some(rule) = self.rules.lookup(&req.route) else {
            debug!(route = %req.route, "no rule for route");
            return None;
        };
        if !rule.allows(&req.method) {
            debug!(route = %req.route, method = %req.method, "method not cacheable for route");
            return None;
        }
        Some(rule)
    }
}

impl<S: Storage + 'static> Hooks for Interceptor<S> {
    type Error = StorageError;

    fn before(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), StorageError> {
        Interceptor::before(self, req, res)
    }

    fn after(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), StorageError> {
        Interceptor::after(self, req, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::http::Headers;
    use crate::storage::{DEFAULT_CLEANUP_INTERVAL, MemoryStorage};

    // Counts every storage call on top of a real memory backend.
    struct Counting {
        inner: MemoryStorage,
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(DEFAULT_CLEANUP_INTERVAL),
                gets: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> (usize, usize) {
            (
                self.gets.load(Ordering::SeqCst),
                self.puts.load(Ordering::SeqCst),
            )
        }
    }

    impl Storage for Counting {
        fn get(&self, key: &str) -> Result<Entry, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn put(&self, key: &str, entry: Entry) -> Result<(), StorageError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, entry)
        }
    }

    struct Broken;

    impl Storage for Broken {
        fn get(&self, _key: &str) -> Result<Entry, StorageError> {
            Err(StorageError::backend("backend unreachable"))
        }

        fn put(&self, _key: &str, _entry: Entry) -> Result<(), StorageError> {
            Err(StorageError::backend("backend unreachable"))
        }
    }

    fn interceptor(rules: &[&str]) -> Interceptor<Arc<Counting>> {
        Interceptor::new(RuleSet::parse(rules).unwrap(), Arc::new(Counting::new()))
    }

    fn text_headers() -> Headers {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        h
    }

    fn before(i: &Interceptor<Arc<Counting>>, method: Method, route: &str) -> HookResponse {
        let mut res = HookResponse::default();
        i.before(&HookRequest::new(method, route), &mut res).unwrap();
        res
    }

    fn after(i: &Interceptor<Arc<Counting>>, method: Method, route: &str, status: u16, body: &'static str) {
        let req = HookRequest::new(method, route).with_origin_response(status, body, text_headers());
        let mut res = HookResponse::default();
        i.after(&req, &mut res).unwrap();
        assert!(res.is_pass_through(), "after-hook must not touch the response");
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(cache_key(&Method::Post, "r2"), "POST@r2");
        assert_eq!(
            cache_key(&Method::Custom("PURGE".into()), "a b"),
            "PURGE@a b"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_a_miss_store_then_hit() {
        let i = interceptor(&["r1 GET 5s"]);

        let res = before(&i, Method::Get, "r1");
        assert!(res.is_pass_through());

        after(&i, Method::Get, "r1", 200, "hello");

        tokio::time::advance(Duration::from_secs(1)).await;
        let res = before(&i, Method::Get, "r1");
        assert!(res.short_circuit);
        assert!(res.override_headers_out);
        assert_eq!(res.status_code, 200);
        assert_eq!(&res.body[..], b"hello");
        assert_eq!(res.headers_out, text_headers());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_expired_entry_misses() {
        let i = interceptor(&["r1 GET 5s"]);
        after(&i, Method::Get, "r1", 200, "hello");

        tokio::time::advance(Duration::from_secs(6)).await;
        let res = before(&i, Method::Get, "r1");
        assert!(res.is_pass_through());
        assert!(i.storage().inner.is_empty(), "expired entry removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_error_responses_are_cached() {
        let i = interceptor(&["r2 GET|POST 10s yes"]);
        after(&i, Method::Post, "r2", 500, "boom");

        let res = before(&i, Method::Post, "r2");
        assert!(res.short_circuit);
        assert_eq!(res.status_code, 500);
        assert_eq!(&res.body[..], b"boom");

        // Same route, other method: separate key, nothing stored yet.
        assert!(before(&i, Method::Get, "r2").is_pass_through());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_cached_even_without_flag() {
        let i = interceptor(&["r4 GET 10s"]);
        after(&i, Method::Get, "r4", 503, "down");
        assert_eq!(before(&i, Method::Get, "r4").status_code, 503);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_d_unknown_route_never_touches_storage() {
        let i = interceptor(&["r1 GET 5s"]);

        assert!(before(&i, Method::Get, "r3").is_pass_through());
        after(&i, Method::Get, "r3", 200, "x");
        assert!(before(&i, Method::Post, "r3").is_pass_through());

        assert_eq!(i.storage().calls(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn uncovered_method_never_touches_storage() {
        let i = interceptor(&["r1 GET 5s"]);

        assert!(before(&i, Method::Post, "r1").is_pass_through());
        after(&i, Method::Post, "r1", 200, "x");

        assert_eq!(i.storage().calls(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_rule_drops_first_methods() {
        let i = interceptor(&["r5 GET 5s", "r5 POST 5s"]);

        after(&i, Method::Get, "r5", 200, "get");
        assert!(before(&i, Method::Get, "r5").is_pass_through());
        assert_eq!(i.storage().calls(), (0, 0));

        after(&i, Method::Post, "r5", 200, "post");
        assert_eq!(&before(&i, Method::Post, "r5").body[..], b"post");
    }

    #[tokio::test(start_paused = true)]
    async fn later_store_wins() {
        let i = interceptor(&["r1 GET 5s"]);
        after(&i, Method::Get, "r1", 200, "old");
        after(&i, Method::Get, "r1", 201, "new");

        let res = before(&i, Method::Get, "r1");
        assert_eq!(res.status_code, 201);
        assert_eq!(&res.body[..], b"new");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_uses_rule_timeout() {
        let i = interceptor(&["r1 GET 5s"]);
        after(&i, Method::Get, "r1", 200, "x");

        let stored = i.storage().inner.get("GET@r1").unwrap();
        assert_eq!(stored.deadline(), Instant::now() + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_deadline_falls_back_to_far_future() {
        let mut rules = RuleSet::new();
        rules.insert(Rule::new("r1", [Method::Get], Duration::MAX, false));
        let i = Interceptor::new(rules, Arc::new(Counting::new()));

        after(&i, Method::Get, "r1", 200, "x");

        let stored = i.storage().inner.get("GET@r1").unwrap();
        assert_eq!(stored.deadline(), Instant::now() + FAR_FUTURE);
        assert!(before(&i, Method::Get, "r1").short_circuit);
    }

    #[test]
    fn storage_errors_propagate() {
        let i = Interceptor::new(RuleSet::parse(["r1 GET 5s"]).unwrap(), Broken);
        let mut res = HookResponse::default();

        let err = i.before(&HookRequest::new(Method::Get, "r1"), &mut res).unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(res.is_pass_through());

        let req = HookRequest::new(Method::Get, "r1").with_origin_response(200, "x", Headers::new());
        assert!(i.after(&req, &mut res).is_err());

        // Unmatched requests still succeed without asking the backend.
        assert!(i.before(&HookRequest::new(Method::Get, "other"), &mut res).is_ok());
    }
}
