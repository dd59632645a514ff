//! Context lock
//!
//! A plain mutex that ignores poisoning. With the `lock_tracking` feature
//! every lock call names its purpose, and holds or waits of 1 ms or more
//! are logged together with the last owners.

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::PoisonError,
};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use super::*;
    use log::warn;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    const MAX_LOCK_OWNERS: usize = 20;

    #[derive(Debug)]
    struct Inner<T> {
        last_lock_owner: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// Context mutex that records who held it and warns about long holds
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: Debug> Debug for Mutex<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    last_lock_owner: VecDeque::new(),
                    value,
                }),
            }
        }

        /// Acquire the lock, recording `purpose` among the last owners
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let now = Instant::now();
            let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

            let lock_time = Instant::now();
            let elapsed = lock_time.duration_since(now);
            if elapsed > Duration::from_millis(1) {
                warn!(
                    "Locking the context for {} took {:?}. Last owners: {:?}",
                    purpose, elapsed, guard.last_lock_owner
                );
            }

            MutexGuard {
                guard,
                start_time: lock_time,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        start_time: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            if self.guard.last_lock_owner.len() == MAX_LOCK_OWNERS {
                self.guard.last_lock_owner.pop_back();
            }

            let duration = self.start_time.elapsed();
            if duration > Duration::from_millis(1) {
                warn!("Holding the context for {} took {:?}", self.purpose, duration);
            }

            self.guard.last_lock_owner.push_front((self.purpose, duration));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.guard.value
        }
    }
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::{Mutex, MutexGuard};

#[cfg(not(feature = "lock_tracking"))]
mod non_tracking {
    use super::*;

    /// Context mutex; with `lock_tracking` it also reports long holds
    ///
    /// A panic while the lock is held does not poison it for the event loop.
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, T>,
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.guard.deref()
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.guard.deref_mut()
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use non_tracking::{Mutex, MutexGuard};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_mutate() {
        let m = Mutex::new(vec![1]);
        m.lock("push").push(2);
        assert_eq!(*m.lock("read"), vec![1, 2]);
    }

    #[test]
    fn test_survives_poison() {
        let m = std::sync::Arc::new(Mutex::new(0u32));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock("panicking");
            panic!("boom");
        })
        .join();
        *m.lock("after panic") += 1;
        assert_eq!(*m.lock("read"), 1);
    }
}
