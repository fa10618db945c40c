//! Locking primitives.
//!
//! Every lock in this crate is a plain spinning mutex. Critical sections are
//! expressed as guard scopes so the lock is released on every exit path.

pub type SpinLock<T> = spin::Mutex<T>;
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Busy-wait until `cond` returns `true`.
///
/// Used where the kernel must wait for other processors to leave a critical
/// path, for example a region waiting for in-flight faults to drain.
pub fn spin_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        #[cfg(test)]
        std::thread::yield_now();
        #[cfg(not(test))]
        core::hint::spin_loop();
    }
}
