// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Collective FIFO ring over a byte arena.
//
// Layout:
//   [FifoCtl: head | tail | info]                   3 cache lines
//   [element 0 .. element N-1]                      elem_size bytes each
//   [segment 0 .. segment N-1]                      seg_size bytes each
//
// Every element starts with a one-cache-line ElemHeader followed by its
// inline payload. Element i owns segment i for buffer-copy sends.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::arena::SharedArena;
use crate::error::{CollError, Result};
use crate::spin_lock::{adaptive_yield, SpinLock};

pub const CACHE_LINE: usize = 64;
pub const HEADER_SIZE: usize = 64;
pub const CTL_SIZE: usize = 192;

/// Element header flag bits.
pub mod elem_flags {
    /// Flips on every lap of the ring; see [`super::Fifo::owner_bit`].
    pub const OWNER: u8 = 1 << 0;
    /// Payload lives inline in the element rather than in its segment.
    pub const INLINE: u8 = 1 << 1;
}

/// How writer contributions are laid out inside an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMode {
    /// Contributions packed back to back (or a single buffer).
    Packed = 0,
    /// Each writer owns a cache-line aligned slot ending in a trailer byte.
    Padded = 1,
}

impl OpMode {
    fn from_raw(v: u8) -> Self {
        if v == OpMode::Padded as u8 {
            OpMode::Padded
        } else {
            OpMode::Packed
        }
    }
}

#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoGeometry {
    pub fifo_size: u32,
    pub elem_size: u32,
    pub seg_size: u32,
}

impl FifoGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.fifo_size < 2 || !self.fifo_size.is_power_of_two() {
            return Err(CollError::InvalidParam(format!(
                "fifo_size {} is not a power of two >= 2",
                self.fifo_size
            )));
        }
        let elem = self.elem_size as usize;
        if elem < HEADER_SIZE + CACHE_LINE || elem % CACHE_LINE != 0 {
            return Err(CollError::InvalidParam(format!(
                "elem_size {elem} must be a multiple of {CACHE_LINE} and at least {}",
                HEADER_SIZE + CACHE_LINE
            )));
        }
        if self.seg_size == 0 {
            return Err(CollError::InvalidParam("seg_size is 0".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        self.fifo_size as u64 - 1
    }

    #[inline]
    pub fn shift(&self) -> u32 {
        self.fifo_size.trailing_zeros()
    }

    /// Inline payload bytes per element.
    #[inline]
    pub fn elem_payload(&self) -> usize {
        self.elem_size as usize - HEADER_SIZE
    }

    pub fn arena_size(&self) -> usize {
        let n = self.fifo_size as usize;
        CTL_SIZE + n * self.elem_size as usize + n * self.seg_size as usize
    }
}

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

#[repr(C, align(64))]
struct IndexLine {
    value: AtomicU64,
}

#[repr(C, align(64))]
struct InfoLine {
    constructed: AtomicU32,
    fifo_size: AtomicU32,
    elem_size: AtomicU32,
    seg_size: AtomicU32,
    signals: AtomicU64,
}

#[repr(C)]
struct FifoCtl {
    head: IndexLine,
    tail: IndexLine,
    info: InfoLine,
}

const _: () = assert!(std::mem::size_of::<FifoCtl>() == CTL_SIZE);

const CTL_UNINIT: u32 = 0;
const CTL_BUSY: u32 = 1;
const CTL_READY: u32 = 2;

/// Spins granted to a peer that is still writing the geometry.
const CONSTRUCT_SPIN_LIMIT: u32 = 5_000;

/// The one-cache-line header at the start of each element.
///
/// All-zero is a valid idle header: owner bit clear, counters at rest,
/// lock released.
#[repr(C, align(64))]
pub struct ElemHeader {
    flags: AtomicU8,
    am_id: AtomicU8,
    op_mode: AtomicU8,
    drained: AtomicU8,
    length: AtomicU32,
    stride: AtomicU32,
    pending: AtomicU32,
    header: AtomicU64,
    lock: SpinLock,
}

const _: () = assert!(std::mem::size_of::<ElemHeader>() == HEADER_SIZE);

impl ElemHeader {
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn am_id(&self) -> u8 {
        self.am_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn op_mode(&self) -> OpMode {
        OpMode::from_raw(self.op_mode.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn header(&self) -> u64 {
        self.header.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn pending(&self) -> &AtomicU32 {
        &self.pending
    }

    #[inline]
    pub(crate) fn lock(&self) -> &SpinLock {
        &self.lock
    }

    /// Store every descriptive field, then publish the flags.
    ///
    /// The flags store is the release point: a reader that observes the new
    /// owner bit with acquire ordering sees the payload and all fields.
    pub(crate) fn publish(&self, desc: &ElemDesc, owner: u8) {
        self.am_id.store(desc.am_id, Ordering::Relaxed);
        self.op_mode.store(desc.op_mode as u8, Ordering::Relaxed);
        self.length.store(desc.length, Ordering::Relaxed);
        self.stride.store(desc.stride, Ordering::Relaxed);
        self.header.store(desc.header, Ordering::Relaxed);
        let mut flags = owner & elem_flags::OWNER;
        if desc.inline {
            flags |= elem_flags::INLINE;
        }
        self.flags.store(flags, Ordering::Release);
    }
}

/// The header fields the completing writer publishes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemDesc {
    pub am_id: u8,
    pub op_mode: OpMode,
    pub inline: bool,
    pub length: u32,
    pub stride: u32,
    pub header: u64,
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A raw byte window of one element: its inline payload or its segment.
///
/// Writers touch disjoint slots concurrently, so no `&mut [u8]` covering the
/// whole window is ever formed while writers are active.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    ptr: *mut u8,
    len: usize,
}

impl Region {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// # Safety
    /// The range must be in bounds and not written concurrently.
    pub unsafe fn slice<'a>(&self, offset: usize, len: usize) -> &'a [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// # Safety
    /// The range must be in bounds and exclusively owned by the caller.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut<'a>(&self, offset: usize, len: usize) -> &'a mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }
}

// ---------------------------------------------------------------------------
// Fifo
// ---------------------------------------------------------------------------

/// One receive ring. Shared by every process or thread of the group through
/// `Arc<Fifo>` (in-process) or a named segment (cross-process).
pub struct Fifo {
    arena: SharedArena,
    geo: FifoGeometry,
}

impl Fifo {
    /// A heap-backed ring for groups of threads.
    pub fn anonymous(geo: FifoGeometry) -> Result<Self> {
        geo.validate()?;
        let arena = SharedArena::heap(geo.arena_size())?;
        let fifo = Self { arena, geo };
        fifo.construct_or_check()?;
        Ok(fifo)
    }

    /// Create the named ring, or open it if a peer already created it.
    #[cfg(unix)]
    pub fn open_shared(name: &str, geo: FifoGeometry) -> Result<Self> {
        geo.validate()?;
        let arena = SharedArena::shm(name, geo.arena_size(), crate::ShmMode::CreateOrOpen)?;
        let fifo = Self { arena, geo };
        fifo.construct_or_check()?;
        Ok(fifo)
    }

    /// Open a ring that a peer has already published.
    #[cfg(unix)]
    pub fn attach(name: &str, geo: FifoGeometry) -> Result<Self> {
        geo.validate()?;
        let arena = SharedArena::shm(name, geo.arena_size(), crate::ShmMode::Open)?;
        let fifo = Self { arena, geo };
        fifo.construct_or_check()?;
        Ok(fifo)
    }

    // Double-checked construction: exactly one mapper stamps the geometry,
    // every other mapper waits for it and compares.
    fn construct_or_check(&self) -> Result<()> {
        let info = &self.ctl().info;
        match info.constructed.compare_exchange(
            CTL_UNINIT,
            CTL_BUSY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info.fifo_size.store(self.geo.fifo_size, Ordering::Relaxed);
                info.elem_size.store(self.geo.elem_size, Ordering::Relaxed);
                info.seg_size.store(self.geo.seg_size, Ordering::Relaxed);
                info.constructed.store(CTL_READY, Ordering::Release);
                Ok(())
            }
            Err(_) => {
                let mut k = 0u32;
                let mut spins = 0u32;
                while info.constructed.load(Ordering::Acquire) != CTL_READY {
                    spins += 1;
                    if spins > CONSTRUCT_SPIN_LIMIT {
                        return Err(CollError::InvalidParam(
                            "peer never finished constructing the FIFO".into(),
                        ));
                    }
                    adaptive_yield(&mut k);
                }
                let found = FifoGeometry {
                    fifo_size: info.fifo_size.load(Ordering::Relaxed),
                    elem_size: info.elem_size.load(Ordering::Relaxed),
                    seg_size: info.seg_size.load(Ordering::Relaxed),
                };
                if found != self.geo {
                    return Err(CollError::InvalidParam(format!(
                        "FIFO geometry mismatch: expected {:?}, found {found:?}",
                        self.geo
                    )));
                }
                Ok(())
            }
        }
    }

    #[inline]
    fn ctl(&self) -> &FifoCtl {
        // Safety: the arena is at least CTL_SIZE bytes and 64-byte aligned.
        unsafe { &*(self.arena.as_ptr() as *const FifoCtl) }
    }

    #[inline]
    pub fn geometry(&self) -> FifoGeometry {
        self.geo
    }

    pub fn is_shared(&self) -> bool {
        self.arena.is_shared()
    }

    /// Number of mappings of the backing segment (1 for heap rings).
    pub fn map_count(&self) -> i32 {
        self.arena.ref_count()
    }

    /// One past the highest completed element.
    #[inline]
    pub fn head(&self) -> u64 {
        self.ctl().head.value.load(Ordering::SeqCst)
    }

    /// The oldest element not yet drained by every reader.
    #[inline]
    pub fn tail(&self) -> u64 {
        self.ctl().tail.value.load(Ordering::SeqCst)
    }

    /// Number of signalled sends completed on this ring.
    pub fn signal_count(&self) -> u64 {
        self.ctl().info.signals.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        self.ctl().info.signals.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that element `index` is complete. Elements may complete out
    /// of order, so the head only ever moves forward.
    pub(crate) fn publish_head(&self, index: u64) {
        self.ctl().head.value.fetch_max(index + 1, Ordering::SeqCst);
    }

    /// The owner bit a writer stamps on element `index`.
    ///
    /// Lap 0 writes 1, so a zeroed ring never looks ready; the value then
    /// flips on every lap.
    #[inline]
    pub fn owner_bit(&self, index: u64) -> u8 {
        (((index >> self.geo.shift()) & 1) as u8) ^ 1
    }

    #[inline]
    fn elem_offset(&self, index: u64) -> usize {
        CTL_SIZE + (index & self.geo.mask()) as usize * self.geo.elem_size as usize
    }

    #[inline]
    pub fn elem(&self, index: u64) -> &ElemHeader {
        let off = self.elem_offset(index);
        // Safety: in bounds by construction; ElemHeader is valid for any
        // bit pattern the protocol writes, including all zeroes.
        unsafe { &*(self.arena.as_ptr().add(off) as *const ElemHeader) }
    }

    /// Whether element `index` carries the owner bit of its lap.
    #[inline]
    pub fn is_ready(&self, index: u64) -> bool {
        (self.elem(index).flags() & elem_flags::OWNER) == self.owner_bit(index)
    }

    /// Inline payload of element `index`.
    pub(crate) fn inline_region(&self, index: u64) -> Region {
        let off = self.elem_offset(index) + HEADER_SIZE;
        Region {
            ptr: unsafe { self.arena.as_ptr().add(off) },
            len: self.geo.elem_payload(),
        }
    }

    /// The segment owned by element `index`.
    pub(crate) fn seg_region(&self, index: u64) -> Region {
        let n = self.geo.fifo_size as usize;
        let off = CTL_SIZE
            + n * self.geo.elem_size as usize
            + (index & self.geo.mask()) as usize * self.geo.seg_size as usize;
        Region {
            ptr: unsafe { self.arena.as_ptr().add(off) },
            len: self.geo.seg_size as usize,
        }
    }

    pub(crate) fn region(&self, index: u64, inline: bool) -> Region {
        if inline {
            self.inline_region(index)
        } else {
            self.seg_region(index)
        }
    }

    /// Mark element `index` drained and move the tail over every drained
    /// element at the front of the ring.
    ///
    /// Each delivered element is released exactly once.
    pub(crate) fn release(&self, index: u64) {
        debug_assert!(
            index >= self.tail() && index < self.head(),
            "element {index} is not in flight (tail {}, head {})",
            self.tail(),
            self.head()
        );
        let prev = self.elem(index).drained.swap(1, Ordering::SeqCst);
        debug_assert_eq!(prev, 0, "element {index} released twice");
        self.advance_tail();
    }

    fn advance_tail(&self) {
        let ctl = self.ctl();
        loop {
            let tail = ctl.tail.value.load(Ordering::SeqCst);
            if tail >= ctl.head.value.load(Ordering::SeqCst) {
                return;
            }
            // Only the releaser that wins this CAS may move the tail past
            // `tail`; everyone else sees 0 and stops.
            let elem = self.elem(tail);
            if elem
                .drained
                .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            // A releaser that stalled for a lap read a stale `tail` and took
            // the mark of a later element in the same slot: hand it back.
            if ctl
                .tail
                .value
                .compare_exchange(tail, tail + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                elem.drained.store(1, Ordering::SeqCst);
            }
        }
    }
}

impl std::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fifo")
            .field("geometry", &self.geo)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(fifo_size: u32) -> Fifo {
        Fifo::anonymous(FifoGeometry {
            fifo_size,
            elem_size: 128,
            seg_size: 64,
        })
        .unwrap()
    }

    #[test]
    fn tail_waits_for_the_oldest_element() {
        let f = ring(4);
        f.publish_head(3);
        assert_eq!(f.head(), 4);

        f.release(2);
        assert_eq!(f.tail(), 0);
        f.release(0);
        assert_eq!(f.tail(), 1);
        f.release(1);
        assert_eq!(f.tail(), 3);
        f.release(3);
        assert_eq!(f.tail(), 4);

        // second lap, same slots
        f.publish_head(7);
        for i in [5, 6] {
            f.release(i);
        }
        assert_eq!(f.tail(), 4);
        f.release(4);
        assert_eq!(f.tail(), 7);
        f.release(7);
        assert_eq!(f.tail(), 8);
    }

    #[test]
    fn head_only_moves_forward() {
        let f = ring(4);
        f.publish_head(2);
        f.publish_head(0);
        assert_eq!(f.head(), 3);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_caught() {
        let f = ring(2);
        f.publish_head(1);
        f.release(1);
        f.release(1);
    }
}
