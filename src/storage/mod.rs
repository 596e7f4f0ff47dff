//! Cache storage — time-bounded entries behind a small key/value interface.
//!
//! [`Storage`] is the seam between the interceptor and a backend. The only
//! backend shipped is [`MemoryStorage`], a mutex-guarded map with lazy
//! expiration on read and a background sweeper that drops expired entries
//! nobody asks for again.
//!
//! ## Errors
//!
//! [`StorageError::NotFound`] is the routine "no usable entry" answer and
//! callers are expected to treat it as a miss. Anything else is reported as
//! [`StorageError::Backend`], so "no entry" stays distinguishable from "could
//! not tell".

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use crate::http::Headers;

mod lock;
mod memory;

pub use memory::{DEFAULT_CLEANUP_INTERVAL, MemoryStorage};

/// Errors returned by a [`Storage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache entry not found")]
    NotFound,

    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl StorageError {
    /// Wraps a backend-specific failure.
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        StorageError::Backend(err.into())
    }

    /// Returns `true` for the routine miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

/// A stored response together with its absolute expiration time.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    deadline: Instant,
    status: u16,
    body: Bytes,
    headers: Headers,
}

impl Entry {
    /// Creates an entry that stops being served at `deadline`.
    pub fn new(deadline: Instant, status: u16, body: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            deadline,
            status,
            body: body.into(),
            headers,
        }
    }

    /// Returns the instant after which the entry is no longer valid.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the cached status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the cached body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the cached outbound headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// An entry is live only while its deadline is strictly in the future.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// A key/value store of cache [`Entry`] values.
///
/// Implementations must be safe to call from many tasks at once. Each call is
/// expected to complete quickly; there is no cancellation mid-operation.
pub trait Storage: Send + Sync {
    /// Returns the live entry stored under `key`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] — no entry, or the entry has expired.
    /// - [`StorageError::Backend`] — the backend could not answer.
    fn get(&self, key: &str) -> Result<Entry, StorageError>;

    /// Stores `entry` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if the backend could not store it.
    fn put(&self, key: &str, entry: Entry) -> Result<(), StorageError>;
}

impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    fn get(&self, key: &str) -> Result<Entry, StorageError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, entry: Entry) -> Result<(), StorageError> {
        (**self).put(key, entry)
    }
}
