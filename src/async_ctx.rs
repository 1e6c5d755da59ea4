// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Async block/unblock: keeps signal- or timer-driven progress out of the
// endpoint registry while it is being modified.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::spin_lock::SpinLock;

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Non-zero id of the calling thread, stable for its lifetime.
fn thread_tag() -> u64 {
    THREAD_TAG.with(|t| *t)
}

pub struct AsyncContext {
    blocked: AtomicU32,
    lock: Option<SpinLock>,
    /// Tag of the thread holding `lock`, 0 when free.
    owner: AtomicU64,
    /// Blocks the owner currently holds.
    depth: AtomicU32,
}

impl AsyncContext {
    pub fn new(multi_thread: bool) -> Self {
        Self {
            blocked: AtomicU32::new(0),
            lock: multi_thread.then(SpinLock::new),
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// Block async progress until the returned guard is dropped.
    ///
    /// In multi-thread mode the guard also holds the registry lock. The lock
    /// is recursive: a thread that already holds a guard may block again, so
    /// endpoint calls made under an outer guard do not wait on themselves.
    pub fn block(&self) -> AsyncGuard<'_> {
        let locked = match &self.lock {
            Some(lock) => {
                self.enter(lock);
                true
            }
            None => false,
        };
        self.blocked.fetch_add(1, Ordering::AcqRel);
        AsyncGuard {
            ctx: self,
            locked,
            _not_send: PhantomData,
        }
    }

    fn enter(&self, lock: &SpinLock) {
        let me = thread_tag();
        // Only this thread ever stores `me`, so a stale read cannot match.
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        lock.lock();
        self.owner.store(me, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    fn exit(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), thread_tag());
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Relaxed);
            if let Some(lock) = &self.lock {
                lock.unlock();
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) != 0
    }

    pub fn is_multi_thread(&self) -> bool {
        self.lock.is_some()
    }
}

/// Held block. Stays on the thread that took it.
pub struct AsyncGuard<'a> {
    ctx: &'a AsyncContext,
    locked: bool,
    _not_send: PhantomData<*const ()>,
}

impl Drop for AsyncGuard<'_> {
    fn drop(&mut self) {
        self.ctx.blocked.fetch_sub(1, Ordering::AcqRel);
        if self.locked {
            self.ctx.exit();
        }
    }
}
