//! In-memory [`Storage`] backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::lock::mutex_lock;
use super::{Entry, Storage, StorageError};

/// How often the sweeper scans for expired entries unless configured otherwise.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Lower bound for the sweep period; a zero period would spin.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

// Shared between the handle and the sweeper task. One mutex serializes reads,
// writes and sweeps alike.
#[derive(Default)]
struct Table {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Table {
    fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = mutex_lock(&self.entries, "purge_expired");
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }
}

/// A process-local cache table with lazy and periodic expiration.
///
/// Created with [`MemoryStorage::new`], which also spawns the background
/// sweeper on the current Tokio runtime. The sweeper stops when
/// [`shutdown`](Self::shutdown) is called or the storage is dropped.
///
/// `get` takes the same exclusive lock as `put`: a read may delete an expired
/// entry, and no caller ever observes an entry mid-removal.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use reproxy_cache::http::Headers;
/// use reproxy_cache::storage::{Entry, MemoryStorage, Storage};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let storage = MemoryStorage::new(Duration::from_secs(600));
/// let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
/// storage.put("GET@r1", Entry::new(deadline, 200, "hello", Headers::new())).unwrap();
///
/// let hit = storage.get("GET@r1").unwrap();
/// assert_eq!(hit.status(), 200);
/// assert!(storage.get("GET@r2").unwrap_err().is_not_found());
///
/// storage.shutdown().await;
/// # }
/// ```
pub struct MemoryStorage {
    table: Arc<Table>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStorage {
    /// Creates an empty table and starts sweeping it every `cleanup_interval`.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(cleanup_interval: Duration) -> Self {
        let table = Arc::new(Table::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = cleanup_interval.max(MIN_CLEANUP_INTERVAL);

        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&table), period, shutdown_rx));
        debug!(period = ?period, "storage sweeper started");

        Self {
            table,
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Removes every entry whose deadline has passed, returning how many went.
    ///
    /// The sweeper calls this on each tick; it is public so hosts can force a
    /// sweep.
    pub fn purge_expired(&self) -> usize {
        self.table.purge_expired(Instant::now())
    }

    /// Returns the number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        mutex_lock(&self.table.entries, "len").len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the sweeper and waits for it to exit.
    ///
    /// Calling it more than once is harmless. Stored entries stay readable.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = mutex_lock(&self.sweeper, "shutdown").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "storage sweeper ended abnormally");
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Entry, StorageError> {
        let mut entries = mutex_lock(&self.table.entries, "get");

        let entry = entries.get(key).ok_or(StorageError::NotFound)?;
        if entry.is_expired_at(Instant::now()) {
            entries.remove(key);
            trace!(key, "expired entry removed on read");
            return Err(StorageError::NotFound);
        }

        Ok(entry.clone())
    }

    fn put(&self, key: &str, entry: Entry) -> Result<(), StorageError> {
        mutex_lock(&self.table.entries, "put").insert(key.to_owned(), entry);
        Ok(())
    }
}

async fn sweep_loop(table: Arc<Table>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    // First sweep one full period after start, not immediately.
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A closed channel means every handle is gone.
                if changed.is_err() || *shutdown.borrow() {
                    debug!("storage sweeper stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                let removed = table.purge_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "expired cache entries swept");
                }
            }
        }
    }
}
