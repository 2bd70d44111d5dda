//! The region lock
use core::ops;

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        type RawMutex<T> = std::sync::Mutex<T>;
    } else {
        type RawMutex<T> = spin::Mutex<T>;
    }
}

/// A non-reentrant mutual-exclusion lock.
///
/// Backed by `std::sync::Mutex` when the `std` feature is enabled and by a
/// spin lock otherwise.
pub(crate) struct Lock<T> {
    inner: RawMutex<T>,
}

impl<T> Lock<T> {
    #[inline]
    pub(crate) const fn new(x: T) -> Self {
        Self {
            inner: RawMutex::new(x),
        }
    }

    /// Acquire the lock, blocking the current thread until it's available.
    ///
    /// Locking twice from the same thread deadlocks.
    #[cfg(feature = "std")]
    #[inline]
    pub(crate) fn lock(&self) -> impl ops::DerefMut<Target = T> + '_ {
        // A panic while the lock is held (e.g., in `Block::read`) never leaves
        // the lists half-updated, so poisoning is ignored.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Acquire the lock, spinning until it's available.
    ///
    /// Locking twice from the same thread deadlocks.
    #[cfg(not(feature = "std"))]
    #[inline]
    pub(crate) fn lock(&self) -> impl ops::DerefMut<Target = T> + '_ {
        self.inner.lock()
    }
}
