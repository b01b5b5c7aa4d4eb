use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
///
/// Registry and listener tables stay structurally valid across a panic in a
/// page callback, so poisoning is not treated as fatal.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
