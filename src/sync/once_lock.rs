//! Safe global-state cell used for the allocator and log-service singletons.
//!
//! A `no_std`-friendly substitute for `std::sync::OnceLock` that also allows
//! tearing down and re-initializing the held value, which the allocator's
//! `shutdown()`/`init()` lifecycle requires and `OnceLock` does not support.

use spin::Mutex;

/// Safe global state guarded by a spinlock, supporting init/take/with access.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state. Fails, returning `value`, if already
    /// initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Run `f` against the held value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run `f` against the held value with mutable access, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }

    /// Remove and return the held value, leaving the cell uninitialized.
    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: GlobalState<T> can be sent across threads if T: Send. The inner
// spin::Mutex provides mutual exclusion, so the contained Option<T> is only
// accessed by one thread at a time.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: GlobalState<T> can be shared across threads if T: Send. The
// spin::Mutex serializes all access to the inner Option<T>, so no concurrent
// access to T is ever exposed without holding the lock; T need not be Sync.
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_with_reads_value() {
        let state = GlobalState::new();
        assert!(state.init(alloc::string::String::from("hello")).is_ok());
        state.with(|s| assert_eq!(s, "hello"));
    }

    #[test]
    fn double_init_is_rejected() {
        let state = GlobalState::new();
        assert!(state.init(1usize).is_ok());
        assert_eq!(state.init(2usize), Err(2usize));
    }

    #[test]
    fn take_clears_state_for_reinit() {
        let state = GlobalState::new();
        state.init(1usize).unwrap();
        assert_eq!(state.take(), Some(1usize));
        assert!(state.with(|_: &usize| ()).is_none());
        assert!(state.init(2usize).is_ok());
    }
}
