// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-shared spin lock with adaptive backoff: pause → yield → sleep.
// Lives inside FIFO elements (Locked strategy) and the async context.

use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff.
///
/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A spin lock that is valid in zero-initialised shared memory.
///
/// The all-zero bit pattern is the unlocked state, so a lock embedded in a
/// freshly mapped FIFO element needs no constructor call.
#[repr(C)]
pub struct SpinLock {
    lc: AtomicU32,
}

impl SpinLock {
    /// Create a new unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            lc: AtomicU32::new(0),
        }
    }

    /// Acquire the lock (spinning with adaptive backoff).
    pub fn lock(&self) {
        let mut k = 0u32;
        while self.lc.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    /// Try to acquire the lock once. Returns `true` on success.
    pub fn try_lock(&self) -> bool {
        self.lc
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.lc.store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.lc.load(Ordering::Relaxed) != 0
    }

    /// Acquire the lock and return a guard that releases it on drop.
    pub fn guard(&self) -> SpinGuard<'_> {
        self.lock();
        SpinGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: SpinLock is designed for concurrent access.
unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// RAII guard returned by [`SpinLock::guard`].
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
