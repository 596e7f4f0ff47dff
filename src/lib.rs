//! # reproxy-cache
//!
//! A response-caching plugin for reverse proxies.
//!
//! The proxy calls the plugin twice per request. The **before** hook may serve
//! a stored response and skip the origin entirely. The **after** hook records
//! the origin's answer for later reuse. Which requests are cacheable, and for
//! how long, is decided by per-route [`rules`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use reproxy_cache::interceptor::Interceptor;
//! use reproxy_cache::plugin::{Plugin, PluginConfig};
//! use reproxy_cache::rules::RuleSet;
//! use reproxy_cache::storage::MemoryStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rules = RuleSet::parse(["api-users GET|HEAD 30s"])?;
//!     let storage = Arc::new(MemoryStorage::new(Duration::from_secs(600)));
//!     let hooks = Arc::new(Interceptor::new(rules, Arc::clone(&storage)));
//!
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     let config = PluginConfig {
//!         name: "cache".into(),
//!         listen: "127.0.0.1:8080".into(),
//!         upstream: "http://127.0.0.1:8081".into(),
//!     };
//!     Plugin::new(config, hooks).run(shutdown).await?;
//!     storage.shutdown().await;
//!     Ok(())
//! }
//! ```

// ── Caching core ──────────────────────────────────────────────────────────────
pub mod interceptor;
pub mod rules;
pub mod storage;

// ── Proxy boundary and transport ──────────────────────────────────────────────
pub mod http;
pub mod plugin;
pub mod server;

// ── Process glue ──────────────────────────────────────────────────────────────
pub mod config;
pub mod logging;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use interceptor::{Interceptor, cache_key};
pub use plugin::{HookRequest, HookResponse, Hooks, Plugin, PluginConfig};
pub use rules::{Rule, RuleError, RuleSet};
pub use storage::{Entry, MemoryStorage, Storage, StorageError};
