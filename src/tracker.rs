// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Completion tracking for multi-writer elements.
//
// The strategy is chosen once per interface. The padded strategies give each
// writer a fixed slot; Centralized additionally keeps a run-length trailer in
// the last byte of every slot so the reader can discover finished writers
// without a shared counter on the hot path.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::error::CollError;
use crate::fifo::OpMode;

/// How the writers of one element record their completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Writers reduce into one shared buffer under the element lock.
    Locked,
    /// Writers fill packed windows; the last one to bump the counter reduces.
    Atomic,
    /// Writers fill padded slots and bump a counter; the receiver reduces.
    Batched,
    /// Writers fill padded slots and chain trailer bytes; the receiver walks
    /// them and reduces as ranges complete.
    Centralized,
}

impl Strategy {
    /// Automatic binding: Centralized above the threshold, Batched otherwise.
    /// A forced strategy always wins.
    pub fn select(proc_count: usize, centralized_threshold: usize, forced: Option<Strategy>) -> Self {
        match forced {
            Some(s) => s,
            None if proc_count > centralized_threshold => Strategy::Centralized,
            None => Strategy::Batched,
        }
    }

    pub fn op_mode(self) -> OpMode {
        match self {
            Strategy::Locked | Strategy::Atomic => OpMode::Packed,
            Strategy::Batched | Strategy::Centralized => OpMode::Padded,
        }
    }

    /// Whether a configured reducer runs on the receiving side.
    pub fn reduces_on_receive(self) -> bool {
        matches!(self, Strategy::Batched | Strategy::Centralized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Locked => "locked",
            Strategy::Atomic => "atomic",
            Strategy::Batched => "batched",
            Strategy::Centralized => "centralized",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "locked" => Ok(Strategy::Locked),
            "atomic" => Ok(Strategy::Atomic),
            "batched" => Ok(Strategy::Batched),
            "centralized" => Ok(Strategy::Centralized),
            other => Err(CollError::InvalidConfig(format!("unknown strategy '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Run-length trailers
// ---------------------------------------------------------------------------

/// The trailer bytes of `writers + 1` padded slots of one element.
///
/// Slot `writers` is a dummy that no one writes, so its trailer stays 0 and
/// the last writer's neighbour lookup needs no bounds check. Trailer values
/// fit a `u8`, which caps a group at 255 writers.
pub struct SlotTrailers<'a> {
    base: *mut u8,
    stride: usize,
    writers: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> SlotTrailers<'a> {
    /// Trailers over a plain buffer of at least `(writers + 1) * stride` bytes.
    pub fn over(buf: &'a mut [u8], stride: usize, writers: usize) -> Self {
        assert!(stride >= 1 && buf.len() >= (writers + 1) * stride);
        // Safety: bounds checked above; the borrow pins the buffer.
        unsafe { Self::from_raw(buf.as_mut_ptr(), stride, writers) }
    }

    /// # Safety
    /// `base` must be valid for `(writers + 1) * stride` bytes for `'a`, and
    /// the last byte of each slot must only be accessed through this type.
    pub(crate) unsafe fn from_raw(base: *mut u8, stride: usize, writers: usize) -> Self {
        debug_assert!(writers < u8::MAX as usize);
        Self {
            base,
            stride,
            writers,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn trailer(&self, slot: usize) -> &AtomicU8 {
        debug_assert!(slot <= self.writers);
        unsafe { &*(self.base.add(slot * self.stride + self.stride - 1) as *const AtomicU8) }
    }

    pub fn writers(&self) -> usize {
        self.writers
    }

    /// Writer `slot` has finished its slot.
    ///
    /// If the right neighbour already finished, absorb its run so the reader
    /// can skip it in one step.
    pub fn mark_done(&self, slot: usize) {
        let own = self.trailer(slot);
        debug_assert_eq!(own.load(Ordering::Relaxed), 0, "trailer of slot {slot} already set");
        let next = self.trailer(slot + 1);
        let run = next.load(Ordering::Acquire);
        if run == 0 {
            own.store(1, Ordering::Release);
        } else {
            next.store(0, Ordering::Relaxed);
            own.store(run + 1, Ordering::Release);
        }
    }

    /// Walk the completed runs starting at `pending`.
    ///
    /// Each run found is cleared and handed to `on_range` in ascending slot
    /// order. Returns `true` (and resets `pending` to 0) once every writer
    /// has been accounted for; otherwise the partial position stays in
    /// `pending` for the next call.
    pub fn check_ready(&self, pending: &AtomicU32, mut on_range: impl FnMut(Range<usize>)) -> bool {
        let mut pos = pending.load(Ordering::Relaxed) as usize;
        while pos < self.writers {
            let t = self.trailer(pos);
            let run = t.load(Ordering::Acquire) as usize;
            if run == 0 {
                break;
            }
            t.store(0, Ordering::Relaxed);
            on_range(pos..pos + run);
            pos += run;
        }
        debug_assert!(pos <= self.writers);
        if pos >= self.writers {
            pending.store(0, Ordering::Relaxed);
            true
        } else {
            pending.store(pos as u32, Ordering::Relaxed);
            false
        }
    }
}
