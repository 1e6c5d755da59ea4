// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broadcast and incast interfaces over a shared core.
//
// Broadcast: the root writes into its own FIFO through the loopback
// endpoint; every other member reads the root's FIFO through an endpoint
// connected to it.
//
// Incast: every non-root member writes its slot of the root's FIFO through
// an endpoint connected to the root; the root polls its own FIFO.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::am::{AmHandler, AmStatus, AmTable, SendFlags, SharedDesc};
use crate::async_ctx::AsyncContext;
use crate::config::{CollIfaceConfig, IfaceKind, IfaceParams};
use crate::ep::{CollEp, SendCtx, SendReq, TxOp};
use crate::error::{CollError, Result};
use crate::fifo::{Fifo, FifoGeometry};
use crate::progress::{reader_done, IfaceStats, Receiver};
use crate::reduce::Reducer;
use crate::registry::{EpHandle, EpRegistry};
use crate::tracker::Strategy;

/// A send deferred until its endpoint has room. Called from `progress()`
/// with the interface and the endpoint it was queued on.
pub type PendingCallback = Box<dyn FnMut(&mut CollIface, EpHandle) -> Result<()> + Send>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Interface capability bits reported by [`CollIface::query`].
pub mod cap {
    pub const AM_SHORT: u64 = 1 << 0;
    pub const AM_BCOPY: u64 = 1 << 1;
    pub const PENDING: u64 = 1 << 2;
    pub const CB_SYNC: u64 = 1 << 3;
    pub const CONNECT_TO_IFACE: u64 = 1 << 4;
    pub const BCAST: u64 = 1 << 5;
    pub const INCAST: u64 = 1 << 6;
    pub const AM_ZCOPY: u64 = 1 << 7;
}

/// Collective layouts an interface accepts.
pub mod coll_mode {
    pub const PACKED: u32 = 1 << 0;
    pub const PADDED: u32 = 1 << 1;
}

pub const LATENCY_NS: u32 = 80;
pub const OVERHEAD_SHORT_NS: u32 = 11;
pub const OVERHEAD_BCOPY_NS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAttr {
    pub kind: IfaceKind,
    pub cap_flags: u64,
    pub coll_modes: u32,
    pub max_short: usize,
    pub max_bcopy: usize,
    pub max_zcopy: usize,
    pub latency_ns: u32,
    pub overhead_short_ns: u32,
    pub overhead_bcopy_ns: u32,
    pub strategy: Strategy,
    /// Geometry of this member's receive FIFO; peers of the same kind and
    /// configuration share it.
    pub geometry: FifoGeometry,
    pub proc_count: usize,
    pub my_id: u8,
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Where a member's receive FIFO lives.
#[derive(Debug, Clone)]
pub struct IfaceAddr {
    coll_id: u8,
    fifo: Arc<Fifo>,
}

impl IfaceAddr {
    /// Attach to the FIFO that member `coll_id` of `job` published in named
    /// shared memory.
    #[cfg(unix)]
    pub fn attach(job: &str, coll_id: u8, geometry: FifoGeometry) -> Result<Self> {
        let fifo = Fifo::attach(&crate::shm_name::fifo_name(job, coll_id), geometry)?;
        Ok(Self {
            coll_id,
            fifo: Arc::new(fifo),
        })
    }

    pub fn coll_id(&self) -> u8 {
        self.coll_id
    }

    pub fn fifo(&self) -> &Arc<Fifo> {
        &self.fifo
    }
}

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

struct IfaceCore {
    kind: IfaceKind,
    my_id: u8,
    proc_count: usize,
    cfg: CollIfaceConfig,
    fifo: Arc<Fifo>,
    short_stride: usize,
    bcopy_stride: usize,
    registry: EpRegistry,
    rx: Receiver,
    async_ctx: Arc<AsyncContext>,
    stats: IfaceStats,
}

enum Variant {
    Broadcast,
    Incast { read_index: u64 },
}

/// One member's collective interface.
pub struct CollIface {
    core: IfaceCore,
    variant: Variant,
}

impl CollIface {
    pub fn open(cfg: &CollIfaceConfig, params: IfaceParams) -> Result<Self> {
        cfg.validate()?;
        params.validate()?;
        let IfaceParams {
            kind,
            proc_idx,
            proc_count,
            reducer,
            shm_job,
        } = params;

        let strategy = Strategy::select(proc_count, cfg.centralized_threshold, cfg.strategy);
        let reducer = match kind {
            IfaceKind::Incast => reducer,
            IfaceKind::Broadcast => None,
        };
        if kind == IfaceKind::Incast && strategy == Strategy::Locked && reducer.is_none() {
            return Err(CollError::InvalidParam("the locked strategy needs a reducer".into()));
        }
        let bcopy_stride = cfg.bcopy_stride(proc_count);
        if bcopy_stride < 2 {
            return Err(CollError::InvalidConfig(format!(
                "seg_size {} is too small for {proc_count} members",
                cfg.seg_size
            )));
        }

        let my_id = proc_idx as u8;
        let geometry = cfg.fifo_geometry(kind, proc_count);
        let fifo = match shm_job.as_deref() {
            None => Fifo::anonymous(geometry)?,
            #[cfg(unix)]
            Some(job) => Fifo::open_shared(&crate::shm_name::fifo_name(job, my_id), geometry)?,
            #[cfg(not(unix))]
            Some(_) => {
                return Err(CollError::InvalidParam(
                    "named shared memory is not supported on this platform".into(),
                ))
            }
        };

        tracing::debug!(?kind, my_id, proc_count, %strategy, ?geometry, shared = fifo.is_shared(), "collective iface opened");

        let variant = match kind {
            IfaceKind::Broadcast => Variant::Broadcast,
            IfaceKind::Incast => Variant::Incast { read_index: 0 },
        };
        Ok(Self {
            core: IfaceCore {
                kind,
                my_id,
                proc_count,
                cfg: cfg.clone(),
                fifo: Arc::new(fifo),
                short_stride: cfg.short_stride(),
                bcopy_stride,
                registry: EpRegistry::new(),
                rx: Receiver {
                    am: AmTable::new(),
                    strategy,
                    reducer,
                    writer_count: proc_count - 1,
                },
                async_ctx: Arc::new(AsyncContext::new(cfg.multi_thread)),
                stats: IfaceStats::default(),
            },
            variant,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn kind(&self) -> IfaceKind {
        self.core.kind
    }

    pub fn my_id(&self) -> u8 {
        self.core.my_id
    }

    pub fn proc_count(&self) -> usize {
        self.core.proc_count
    }

    pub fn strategy(&self) -> Strategy {
        self.core.rx.strategy
    }

    pub fn reducer(&self) -> Option<&Reducer> {
        self.core.rx.reducer.as_ref()
    }

    pub fn stats(&self) -> IfaceStats {
        self.core.stats
    }

    /// This member's receive FIFO.
    pub fn fifo(&self) -> &Arc<Fifo> {
        &self.core.fifo
    }

    /// Shared with signal or timer driven progress; see
    /// [`CollIface::progress_async`].
    pub fn async_context(&self) -> Arc<AsyncContext> {
        Arc::clone(&self.core.async_ctx)
    }

    pub fn ep(&self, ep: EpHandle) -> Option<&CollEp> {
        self.core.registry.get(ep)
    }

    /// Number of live endpoints, loopback included.
    pub fn ep_count(&self) -> usize {
        self.core.registry.len()
    }

    pub fn set_am_handler(&mut self, am_id: u8, handler: AmHandler) -> Result<()> {
        self.core.rx.am.set(am_id, handler)
    }

    pub fn clear_am_handler(&mut self, am_id: u8) -> Result<()> {
        self.core.rx.am.clear(am_id)
    }

    // -----------------------------------------------------------------------
    // Query / address
    // -----------------------------------------------------------------------

    fn max_short(&self) -> usize {
        match self.core.kind {
            IfaceKind::Broadcast => self.core.fifo.geometry().elem_payload(),
            IfaceKind::Incast => self.core.fifo.geometry().elem_payload() / self.core.proc_count - 1,
        }
    }

    fn max_bcopy(&self) -> usize {
        match self.core.kind {
            IfaceKind::Broadcast => self.core.cfg.seg_size as usize,
            IfaceKind::Incast => self.core.bcopy_stride - 1,
        }
    }

    pub fn query(&self) -> IfaceAttr {
        let kind_cap = match self.core.kind {
            IfaceKind::Broadcast => cap::BCAST,
            IfaceKind::Incast => cap::INCAST,
        };
        IfaceAttr {
            kind: self.core.kind,
            cap_flags: cap::AM_SHORT
                | cap::AM_BCOPY
                | cap::AM_ZCOPY
                | cap::PENDING
                | cap::CB_SYNC
                | cap::CONNECT_TO_IFACE
                | kind_cap,
            coll_modes: coll_mode::PADDED | coll_mode::PACKED,
            max_short: self.max_short(),
            max_bcopy: self.max_bcopy(),
            max_zcopy: self.max_short(),
            latency_ns: LATENCY_NS,
            overhead_short_ns: OVERHEAD_SHORT_NS,
            overhead_bcopy_ns: OVERHEAD_BCOPY_NS,
            strategy: self.core.rx.strategy,
            geometry: self.core.fifo.geometry(),
            proc_count: self.core.proc_count,
            my_id: self.core.my_id,
        }
    }

    pub fn address(&self) -> IfaceAddr {
        IfaceAddr {
            coll_id: self.core.my_id,
            fifo: Arc::clone(&self.core.fifo),
        }
    }

    /// Whether `addr` names a member of this group with a compatible FIFO.
    pub fn is_reachable(&self, addr: &IfaceAddr) -> bool {
        (addr.coll_id as usize) < self.core.proc_count
            && addr.fifo.geometry() == self.core.fifo.geometry()
    }

    // -----------------------------------------------------------------------
    // Endpoint lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the member at `addr`. Connecting again to the same member
    /// returns the same handle with one more reference.
    pub fn ep_create(&mut self, addr: &IfaceAddr) -> Result<EpHandle> {
        if !self.is_reachable(addr) {
            return Err(CollError::InvalidParam(format!(
                "member {} is not reachable from this interface",
                addr.coll_id
            )));
        }
        let core = &mut self.core;
        let writers = core.proc_count - 1;

        if addr.coll_id == core.my_id {
            if let Some(ep) = core.registry.get_mut(EpHandle::Loopback) {
                ep.ref_count += 1;
                return Ok(EpHandle::Loopback);
            }
            let ep = CollEp::new(core.my_id, core.my_id, writers, Arc::clone(&core.fifo));
            let _blocked = core.async_ctx.block();
            core.registry.set_loopback(ep);
            tracing::debug!(my_id = core.my_id, "loopback endpoint created");
            return Ok(EpHandle::Loopback);
        }

        if let Some(h) = core.registry.find(addr.coll_id) {
            if let Some(ep) = core.registry.get_mut(h) {
                ep.ref_count += 1;
            }
            return Ok(h);
        }

        let ep = CollEp::new(core.my_id, addr.coll_id, writers, Arc::clone(&addr.fifo));
        let my_offset = ep.my_offset();
        let h = {
            let _blocked = core.async_ctx.block();
            core.registry.insert(ep)
        };
        tracing::debug!(my_id = core.my_id, peer = addr.coll_id, my_offset, "endpoint connected");
        Ok(h)
    }

    /// Drop one reference. The last reference disconnects the endpoint and
    /// discards its queued pending callbacks.
    pub fn ep_destroy(&mut self, ep: EpHandle) -> Result<()> {
        let core = &mut self.core;
        let Some(entry) = core.registry.get_mut(ep) else {
            tracing::error!(?ep, "destroy of unknown endpoint");
            return Err(CollError::NoSuchEndpoint);
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }
        let removed = {
            let _blocked = core.async_ctx.block();
            core.registry.remove(ep)
        };
        if let Some(removed) = removed {
            tracing::debug!(
                peer = removed.peer_id,
                dropped_pending = removed.pending.len(),
                "endpoint disconnected"
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    fn check_send_target(&self, ep: EpHandle) -> Result<()> {
        match (self.core.kind, ep) {
            (IfaceKind::Broadcast, EpHandle::Loopback) | (IfaceKind::Incast, EpHandle::Remote(_)) => Ok(()),
            (IfaceKind::Broadcast, _) => Err(CollError::InvalidParam(
                "broadcast sends go through the loopback endpoint".into(),
            )),
            (IfaceKind::Incast, _) => Err(CollError::InvalidParam(
                "incast sends go to the root, not loopback".into(),
            )),
        }
    }

    fn send(&mut self, ep: EpHandle, req: &SendReq, fill: impl FnOnce(&mut [u8]) -> usize) -> Result<usize> {
        let core = &mut self.core;
        let ctx = SendCtx {
            kind: core.kind,
            strategy: core.rx.strategy,
            reducer: core.rx.reducer.as_ref(),
            short_stride: core.short_stride,
            bcopy_stride: core.bcopy_stride,
        };
        let Some(entry) = core.registry.get_mut(ep) else {
            tracing::error!(?ep, "send on unknown endpoint");
            return Err(CollError::NoSuchEndpoint);
        };
        let index = entry.tx_index;
        let peer = entry.peer_id;
        match entry.send(&ctx, req, fill) {
            Ok(len) => {
                match req.op {
                    TxOp::Short => core.stats.tx_short += 1,
                    TxOp::Bcopy => core.stats.tx_bcopy += 1,
                    TxOp::Zcopy => core.stats.tx_zcopy += 1,
                }
                tracing::trace!(am_id = req.am_id, peer, index, len, "am send");
                Ok(len)
            }
            Err(e) => {
                if e.is_retriable() {
                    core.stats.tx_no_resource += 1;
                }
                Err(e)
            }
        }
    }

    /// Send `payload` inline with an 8-byte `header`.
    pub fn ep_am_short(&mut self, ep: EpHandle, am_id: u8, header: u64, payload: &[u8]) -> Result<()> {
        AmTable::check_id(am_id)?;
        self.check_send_target(ep)?;
        self.check_short_len(payload.len())?;
        let req = SendReq {
            am_id,
            header,
            op: TxOp::Short,
            short_len: Some(payload.len()),
            signaled: false,
        };
        self.send_inline(ep, &req, payload)
    }

    fn check_short_len(&self, len: usize) -> Result<()> {
        let max = self.max_short();
        if len > max {
            return Err(CollError::MessageTooLong { len, max });
        }
        Ok(())
    }

    fn send_inline(&mut self, ep: EpHandle, req: &SendReq, payload: &[u8]) -> Result<()> {
        self.send(ep, req, |dst| {
            let n = payload.len().min(dst.len());
            dst[..n].copy_from_slice(&payload[..n]);
            n
        })?;
        Ok(())
    }

    /// Send a caller-owned `payload` with an 8-byte `header`.
    ///
    /// `offsets` describes the caller's layout and holds one entry per
    /// member. The payload travels inline, so the limits of
    /// [`CollIface::ep_am_short`] apply.
    pub fn ep_am_zcopy(
        &mut self,
        ep: EpHandle,
        am_id: u8,
        header: u64,
        payload: &[u8],
        offsets: &[usize],
    ) -> Result<()> {
        AmTable::check_id(am_id)?;
        self.check_send_target(ep)?;
        if offsets.len() != self.core.proc_count {
            return Err(CollError::InvalidParam(format!(
                "zcopy needs {} offsets, got {}",
                self.core.proc_count,
                offsets.len()
            )));
        }
        self.check_short_len(payload.len())?;
        let req = SendReq {
            am_id,
            header,
            op: TxOp::Zcopy,
            short_len: Some(payload.len()),
            signaled: false,
        };
        self.send_inline(ep, &req, payload)
    }

    /// Send through the element's segment. `pack` fills the window it is
    /// given and returns the number of bytes written; more than the window
    /// is refused with [`CollError::MessageTooLong`] and nothing is sent.
    pub fn ep_am_bcopy<P>(&mut self, ep: EpHandle, am_id: u8, pack: P, flags: SendFlags) -> Result<usize>
    where
        P: FnOnce(&mut [u8]) -> usize,
    {
        AmTable::check_id(am_id)?;
        self.check_send_target(ep)?;
        let req = SendReq {
            am_id,
            header: 0,
            op: TxOp::Bcopy,
            short_len: None,
            signaled: flags.contains(SendFlags::SIGNALED),
        };
        self.send(ep, &req, pack)
    }

    // -----------------------------------------------------------------------
    // Pending queue
    // -----------------------------------------------------------------------

    /// Queue `callback` until `ep` has room. Returns [`CollError::Busy`] if
    /// the endpoint can send right now.
    pub fn ep_pending_add(&mut self, ep: EpHandle, callback: PendingCallback) -> Result<()> {
        let entry = self.core.registry.get_mut(ep).ok_or(CollError::NoSuchEndpoint)?;
        if entry.pending.is_empty() && entry.can_send() {
            return Err(CollError::Busy);
        }
        entry.pending.push_back(callback);
        Ok(())
    }

    /// Remove every queued callback of `ep`, passing each to `f`.
    pub fn ep_pending_purge(&mut self, ep: EpHandle, mut f: impl FnMut(PendingCallback)) -> Result<()> {
        let entry = self.core.registry.get_mut(ep).ok_or(CollError::NoSuchEndpoint)?;
        for cb in entry.pending.drain(..) {
            f(cb);
        }
        Ok(())
    }

    fn dispatch_pending(&mut self) {
        for h in self.core.registry.with_pending() {
            let cb = self.core.registry.get_mut(h).and_then(|entry| {
                if entry.can_send() {
                    entry.pending.pop_front()
                } else {
                    None
                }
            });
            let Some(mut cb) = cb else { continue };
            match cb(self, h) {
                Ok(()) => {}
                Err(e) if e.is_retriable() => match self.core.registry.get_mut(h) {
                    Some(entry) => entry.pending.push_front(cb),
                    None => tracing::error!(ep = ?h, "endpoint vanished under a pending send; dropped"),
                },
                Err(e) => tracing::error!(ep = ?h, error = %e, "pending send failed; dropped"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Deliver completed elements, then retry queued sends. Returns the
    /// number of elements delivered.
    pub fn progress(&mut self) -> usize {
        let budget = self.core.cfg.fifo_poll_count as usize;
        let delivered = match &mut self.variant {
            Variant::Broadcast => {
                let core = &mut self.core;
                let readers = core.proc_count - 1;
                let mut count = 0;
                for ep in core.registry.remotes_mut() {
                    while count < budget {
                        let index = ep.read_index;
                        let Some(status) = core.rx.poll(&ep.fifo, index, Some(ep.peer_id), &mut core.stats) else {
                            break;
                        };
                        ep.read_index += 1;
                        count += 1;
                        if status == AmStatus::Ok {
                            reader_done(&ep.fifo, index, readers);
                        }
                    }
                }
                count
            }
            Variant::Incast { read_index } => {
                let core = &mut self.core;
                let mut count = 0;
                while count < budget {
                    let index = *read_index;
                    let Some(status) = core.rx.poll(&core.fifo, index, None, &mut core.stats) else {
                        break;
                    };
                    *read_index += 1;
                    count += 1;
                    if status == AmStatus::Ok {
                        core.fifo.release(index);
                    }
                }
                count
            }
        };
        self.dispatch_pending();
        delivered
    }

    /// Progress entry point for signal or timer context: does nothing while
    /// the async context is blocked.
    pub fn progress_async(&mut self) -> usize {
        if self.core.async_ctx.is_blocked() {
            return 0;
        }
        self.progress()
    }

    /// Release an element whose handler took its descriptor. Consumes the
    /// descriptor, so each element is released once.
    pub fn release_shared_desc(&mut self, desc: SharedDesc) -> Result<()> {
        let SharedDesc { peer, index } = desc;
        match (&self.variant, peer) {
            (Variant::Broadcast, Some(peer)) => {
                let Some(ep) = self.core.registry.find(peer).and_then(|h| self.core.registry.get(h)) else {
                    tracing::error!(peer, index, "release for an unknown broadcast peer");
                    return Err(CollError::NoSuchEndpoint);
                };
                debug_assert!(index < ep.read_index, "descriptor {index} was never delivered");
                reader_done(&ep.fifo, index, self.core.proc_count - 1);
                Ok(())
            }
            (Variant::Incast { read_index }, None) => {
                debug_assert!(index < *read_index, "descriptor {index} was never delivered");
                self.core.fifo.release(index);
                Ok(())
            }
            _ => Err(CollError::InvalidParam(
                "descriptor does not belong to this interface".into(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Flush / fence
    // -----------------------------------------------------------------------

    /// `true` once every element `ep` wrote has been drained.
    pub fn ep_flush(&self, ep: EpHandle) -> Result<bool> {
        self.core
            .registry
            .get(ep)
            .map(CollEp::is_flushed)
            .ok_or(CollError::NoSuchEndpoint)
    }

    pub fn iface_flush(&self) -> bool {
        self.core.registry.iter().all(|(_, ep)| ep.is_flushed())
    }

    /// Order every earlier send through `ep` before any later one.
    pub fn ep_fence(&mut self, ep: EpHandle) -> Result<()> {
        if self.core.registry.get(ep).is_none() {
            return Err(CollError::NoSuchEndpoint);
        }
        fence(Ordering::SeqCst);
        self.core.stats.tx_fence += 1;
        Ok(())
    }

    /// Order every earlier send of this interface before any later one.
    pub fn iface_fence(&mut self) {
        fence(Ordering::SeqCst);
        self.core.stats.tx_fence += 1;
    }
}

impl Drop for CollIface {
    fn drop(&mut self) {
        tracing::debug!(my_id = self.core.my_id, endpoints = self.core.registry.len(), "collective iface closed");
    }
}
