// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Collective endpoint: one logical peer on a shared FIFO, and the send path
// that writes this member's contribution into the peer's ring.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::IfaceKind;
use crate::error::{CollError, Result};
use crate::fifo::{ElemDesc, Fifo, OpMode, Region};
use crate::iface::PendingCallback;
use crate::reduce::Reducer;
use crate::tracker::{SlotTrailers, Strategy};

/// Interface-wide inputs of a send.
pub(crate) struct SendCtx<'a> {
    pub kind: IfaceKind,
    pub strategy: Strategy,
    pub reducer: Option<&'a Reducer>,
    pub short_stride: usize,
    pub bcopy_stride: usize,
}

impl SendCtx<'_> {
    #[inline]
    fn slot_stride(&self, inline: bool) -> usize {
        if inline {
            self.short_stride
        } else {
            self.bcopy_stride
        }
    }
}

/// How a send reaches the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOp {
    Short,
    Bcopy,
    /// Caller-owned payload copied inline, like a short send.
    Zcopy,
}

/// One send request. `short_len` is known up front for inline sends only.
pub(crate) struct SendReq {
    pub am_id: u8,
    pub header: u64,
    pub op: TxOp,
    pub short_len: Option<usize>,
    pub signaled: bool,
}

impl SendReq {
    #[inline]
    pub fn inline(&self) -> bool {
        self.op != TxOp::Bcopy
    }
}

pub struct CollEp {
    pub(crate) peer_id: u8,
    /// Ordinal of this member among the writers of the peer's FIFO.
    pub(crate) my_offset: usize,
    pub(crate) writer_count: usize,
    pub(crate) fifo: Arc<Fifo>,
    pub(crate) tx_index: u64,
    pub(crate) cached_tail: u64,
    /// Next element to read from the peer's FIFO (broadcast receivers).
    pub(crate) read_index: u64,
    pub(crate) ref_count: u32,
    pub(crate) pending: VecDeque<PendingCallback>,
    scratch: Vec<u8>,
}

impl CollEp {
    pub(crate) fn new(my_id: u8, peer_id: u8, writer_count: usize, fifo: Arc<Fifo>) -> Self {
        // The receiver takes no slot, so ids above it shift down by one.
        let my_offset = my_id as usize - usize::from(peer_id < my_id);
        Self {
            peer_id,
            my_offset,
            writer_count,
            fifo,
            tx_index: 0,
            cached_tail: 0,
            read_index: 0,
            ref_count: 1,
            pending: VecDeque::new(),
            scratch: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> u8 {
        self.peer_id
    }

    pub fn my_offset(&self) -> usize {
        self.my_offset
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn tx_index(&self) -> u64 {
        self.tx_index
    }

    pub fn read_index(&self) -> u64 {
        self.read_index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    #[inline]
    fn has_room(&self) -> bool {
        self.tx_index - self.cached_tail < self.fifo.geometry().fifo_size as u64
    }

    pub(crate) fn refresh_tail(&mut self) {
        self.cached_tail = self.fifo.tail();
    }

    /// Whether a send would find a free element right now.
    pub(crate) fn can_send(&mut self) -> bool {
        if self.has_room() {
            return true;
        }
        self.refresh_tail();
        self.has_room()
    }

    fn check_flow(&mut self) -> Result<()> {
        if self.has_room() {
            return Ok(());
        }
        // Queued requests go first; refreshing here could let this send
        // overtake them.
        if !self.pending.is_empty() {
            return Err(CollError::NoResource);
        }
        self.refresh_tail();
        if self.has_room() {
            Ok(())
        } else {
            Err(CollError::NoResource)
        }
    }

    /// Whether every element this endpoint wrote has been drained.
    pub(crate) fn is_flushed(&self) -> bool {
        self.fifo.tail() >= self.tx_index
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Write one contribution into element `tx_index` of the peer's FIFO.
    ///
    /// `fill` receives the destination window and returns how many bytes it
    /// wrote. Returns that length; a length past the window is
    /// `MessageTooLong` and leaves the element untouched.
    pub(crate) fn send<F>(&mut self, ctx: &SendCtx<'_>, req: &SendReq, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        self.check_flow()?;
        let index = self.tx_index;
        let fifo = Arc::clone(&self.fifo);
        let region = fifo.region(index, req.inline());

        let len = match (ctx.kind, ctx.strategy) {
            (IfaceKind::Broadcast, _) => self.send_single(&fifo, index, region, req, fill),
            (IfaceKind::Incast, Strategy::Locked) => self.send_locked(ctx, &fifo, index, region, req, fill),
            (IfaceKind::Incast, Strategy::Atomic) => self.send_atomic(ctx, &fifo, index, region, req, fill),
            (IfaceKind::Incast, Strategy::Batched) => self.send_batched(ctx, &fifo, index, region, req, fill),
            (IfaceKind::Incast, Strategy::Centralized) => {
                self.send_centralized(ctx, &fifo, index, region, req, fill)
            }
        }?;

        self.tx_index += 1;
        Ok(len)
    }

    fn send_single<F>(&mut self, fifo: &Fifo, index: u64, region: Region, req: &SendReq, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let elem = fifo.elem(index);
        debug_assert_eq!(elem.pending().load(Ordering::Relaxed), 0, "element {index} still being read");
        let cap = region.len();
        // Safety: flow control gives this writer the whole element.
        let len = check_len(fill(unsafe { region.slice_mut(0, cap) }), cap)?;
        publish(fifo, index, req, OpMode::Packed, len, 0);
        Ok(len)
    }

    fn send_locked<F>(
        &mut self,
        ctx: &SendCtx<'_>,
        fifo: &Fifo,
        index: u64,
        region: Region,
        req: &SendReq,
        fill: F,
    ) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let cap = ctx.slot_stride(req.inline()) - 1;
        if self.scratch.len() < cap {
            self.scratch.resize(cap, 0);
        }
        let len = check_len(fill(&mut self.scratch[..cap]), cap)?;
        let src = &self.scratch[..len];

        let elem = fifo.elem(index);
        let _guard = elem.lock().guard();
        let prev = elem.pending().load(Ordering::Relaxed) as usize;
        // Safety: the element lock serialises every writer of this buffer.
        let acc = unsafe { region.slice_mut(0, len) };
        match ctx.reducer {
            Some(r) if prev > 0 => r.apply(acc, src),
            _ => acc.copy_from_slice(src),
        }
        if prev + 1 == self.writer_count {
            elem.pending().store(0, Ordering::Relaxed);
            publish(fifo, index, req, OpMode::Packed, len, 0);
        } else {
            elem.pending().store(prev as u32 + 1, Ordering::Relaxed);
        }
        Ok(len)
    }

    fn send_atomic<F>(
        &mut self,
        ctx: &SendCtx<'_>,
        fifo: &Fifo,
        index: u64,
        region: Region,
        req: &SendReq,
        fill: F,
    ) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        // Short windows are packed tight; bcopy windows keep a fixed size
        // because the length is only known after packing.
        let (window, cap) = match req.short_len {
            Some(n) if req.inline() => (n.max(1), n),
            _ => (ctx.bcopy_stride, ctx.bcopy_stride - 1),
        };
        let offset = self.my_offset * window;
        // Safety: windows of different writers are disjoint.
        let len = check_len(fill(unsafe { region.slice_mut(offset, cap) }), cap)?;

        let elem = fifo.elem(index);
        let prev = elem.pending().fetch_add(1, Ordering::AcqRel) as usize;
        if prev + 1 == self.writer_count {
            elem.pending().store(0, Ordering::Relaxed);
            let stride = match ctx.reducer {
                Some(r) => {
                    // Safety: every other writer is done; we own the buffer.
                    let acc = unsafe { region.slice_mut(0, len) };
                    for k in 1..self.writer_count {
                        r.apply(acc, unsafe { region.slice(k * window, len) });
                    }
                    0
                }
                None => window,
            };
            publish(fifo, index, req, OpMode::Packed, len, stride);
        }
        Ok(len)
    }

    fn send_batched<F>(
        &mut self,
        ctx: &SendCtx<'_>,
        fifo: &Fifo,
        index: u64,
        region: Region,
        req: &SendReq,
        fill: F,
    ) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let stride = ctx.slot_stride(req.inline());
        let cap = stride - 1;
        // Safety: each writer owns its slot.
        let len = check_len(fill(unsafe { region.slice_mut(self.my_offset * stride, cap) }), cap)?;

        let elem = fifo.elem(index);
        let prev = elem.pending().fetch_add(1, Ordering::AcqRel) as usize;
        if prev + 1 == self.writer_count {
            elem.pending().store(0, Ordering::Relaxed);
            publish(fifo, index, req, OpMode::Padded, len, stride);
        }
        Ok(len)
    }

    fn send_centralized<F>(
        &mut self,
        ctx: &SendCtx<'_>,
        fifo: &Fifo,
        index: u64,
        region: Region,
        req: &SendReq,
        fill: F,
    ) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let stride = ctx.slot_stride(req.inline());
        let cap = stride - 1;
        let len = check_len(fill(unsafe { region.slice_mut(self.my_offset * stride, cap) }), cap)?;

        // Safety: the region holds writer_count + 1 slots of `stride` bytes.
        let trailers = unsafe { SlotTrailers::from_raw(region.as_ptr(), stride, self.writer_count) };
        trailers.mark_done(self.my_offset);
        if self.my_offset == 0 {
            publish(fifo, index, req, OpMode::Padded, len, stride);
        }
        Ok(len)
    }
}

/// A fill that reports more than its window is refused before any counter
/// moves or anything is published, so the element is still free.
#[inline]
fn check_len(len: usize, cap: usize) -> Result<usize> {
    if len > cap {
        tracing::error!(len, max = cap, "pack callback overran its window");
        return Err(CollError::MessageTooLong { len, max: cap });
    }
    Ok(len)
}

fn publish(fifo: &Fifo, index: u64, req: &SendReq, op_mode: OpMode, len: usize, stride: usize) {
    let desc = ElemDesc {
        am_id: req.am_id,
        op_mode,
        inline: req.inline(),
        length: len as u32,
        stride: stride as u32,
        header: req.header,
    };
    fifo.elem(index).publish(&desc, fifo.owner_bit(index));
    fifo.publish_head(index);
    if req.signaled {
        fifo.signal();
    }
}

impl std::fmt::Debug for CollEp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollEp")
            .field("peer_id", &self.peer_id)
            .field("my_offset", &self.my_offset)
            .field("tx_index", &self.tx_index)
            .field("read_index", &self.read_index)
            .field("ref_count", &self.ref_count)
            .field("pending", &self.pending.len())
            .finish()
    }
}
