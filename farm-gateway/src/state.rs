//! Shared in-memory state guarded by a `parking_lot` mutex.
//!
//! Locks are held for plain map updates only, never across an `.await`.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Clone of the current value, taken under the lock.
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
