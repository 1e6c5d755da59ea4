// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receive side of the progress engine: detect a completed element, build
// the message view, reduce when the receiver owns reduction, and hand the
// message to its active-message handler.

use std::sync::atomic::Ordering;

use crate::am::{AmFlags, AmMessage, AmStatus, AmTable, SharedDesc};
use crate::fifo::{elem_flags, Fifo, OpMode};
use crate::reduce::Reducer;
use crate::tracker::{SlotTrailers, Strategy};

/// Per-interface traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceStats {
    pub tx_short: u64,
    pub tx_bcopy: u64,
    pub tx_zcopy: u64,
    pub tx_fence: u64,
    /// Sends refused because the destination ring was full.
    pub tx_no_resource: u64,
    pub rx_short: u64,
    pub rx_bcopy: u64,
    /// Deliveries whose handler took the descriptor.
    pub rx_deferred: u64,
}

pub(crate) struct Receiver {
    pub am: AmTable,
    pub strategy: Strategy,
    pub reducer: Option<Reducer>,
    /// Writers per incast element.
    pub writer_count: usize,
}

impl Receiver {
    /// Deliver element `index` of `fifo` if it is complete.
    ///
    /// `peer` is the broadcasting member for broadcast reads and `None` for
    /// reads of our own incast FIFO. Returns `None` when nothing was
    /// delivered; partial centralized progress is kept in the element.
    /// `InProgress` means the handler took the descriptor and the caller
    /// must not release the element.
    pub fn poll(
        &mut self,
        fifo: &Fifo,
        index: u64,
        peer: Option<u8>,
        stats: &mut IfaceStats,
    ) -> Option<AmStatus> {
        if !fifo.is_ready(index) {
            return None;
        }
        let elem = fifo.elem(index);
        let inline = elem.flags() & elem_flags::INLINE != 0;
        let region = fifo.region(index, inline);
        let length = elem.length() as usize;
        let stride = elem.stride() as usize;
        let writers = self.writer_count;
        let padded = elem.op_mode() == OpMode::Padded;

        if padded && self.strategy == Strategy::Centralized {
            // Safety: a padded element holds writers + 1 slots of `stride`.
            let trailers = unsafe { SlotTrailers::from_raw(region.as_ptr(), stride, writers) };
            let reducer = self.reducer.as_ref();
            let ready = trailers.check_ready(elem.pending(), |range| {
                let Some(r) = reducer else { return };
                for k in range.filter(|&k| k > 0) {
                    // Safety: slots up to the end of `range` are complete
                    // and only this reader touches them.
                    let acc = unsafe { region.slice_mut(0, length) };
                    r.apply(acc, unsafe { region.slice(k * stride, length) });
                }
            });
            if !ready {
                return None;
            }
        }
        std::sync::atomic::fence(Ordering::Acquire);

        let mut flags = if inline { AmFlags::INLINE } else { AmFlags::DESC };
        if peer.is_some() {
            flags = flags | AmFlags::SHARED;
        }

        let receiver_reduces = self.reducer.is_some() && self.strategy.reduces_on_receive();
        let (data_len, stride_out) = if stride == 0 {
            (length, 0)
        } else if receiver_reduces {
            if self.strategy == Strategy::Batched {
                if let Some(r) = &self.reducer {
                    for k in 1..writers {
                        let acc = unsafe { region.slice_mut(0, length) };
                        r.apply(acc, unsafe { region.slice(k * stride, length) });
                    }
                }
            }
            (length, 0)
        } else {
            flags = flags | AmFlags::STRIDE;
            (stride * writers, stride)
        };

        // Safety: the element is complete and writers are fenced off by the
        // owner bit until we release it.
        let data = unsafe { region.slice(0, data_len) };
        let mut msg = AmMessage::new(
            elem.am_id(),
            elem.header(),
            data,
            length,
            stride_out,
            flags,
            SharedDesc { peer, index },
        );

        if inline {
            stats.rx_short += 1;
        } else {
            stats.rx_bcopy += 1;
        }
        tracing::trace!(am_id = msg.am_id, index, len = data_len, ?flags, "am recv");

        // Whoever holds the descriptor owns the element, whatever the
        // handler claims.
        let status = self.am.dispatch(&mut msg);
        let kept = msg.desc_taken();
        if kept != (status == AmStatus::InProgress) {
            tracing::warn!(am_id = msg.am_id, index, ?status, kept, "handler status disagrees with its descriptor");
        }
        if kept {
            stats.rx_deferred += 1;
            Some(AmStatus::InProgress)
        } else {
            Some(AmStatus::Ok)
        }
    }
}

/// A broadcast reader finished element `index`; the last of `readers`
/// frees it for the writer.
pub(crate) fn reader_done(fifo: &Fifo, index: u64, readers: usize) {
    let elem = fifo.elem(index);
    let prev = elem.pending().fetch_add(1, Ordering::AcqRel) as usize;
    if prev + 1 == readers {
        elem.pending().store(0, Ordering::Relaxed);
        fifo.release(index);
    }
}
