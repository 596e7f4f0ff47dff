use std::sync::{Mutex, MutexGuard};

use tracing::warn;

// A panic while holding the lock cannot leave a half-written entry behind
// (inserts and removals are single map operations), so recovering is safe.
pub(super) fn mutex_lock<'a, T>(lock: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned storage lock"
            );
            poisoned.into_inner()
        }
    }
}
