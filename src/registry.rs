// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Endpoint registry: a slab of remote endpoints searched by peer id, plus
// the loopback endpoint kept outside the slab.

use slab::Slab;

use crate::ep::CollEp;

/// Handle to an endpoint owned by a `CollIface`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpHandle {
    Remote(usize),
    Loopback,
}

#[derive(Default)]
pub(crate) struct EpRegistry {
    eps: Slab<CollEp>,
    loopback: Option<CollEp>,
}

impl EpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The remote endpoint connected to `peer_id`, if any.
    pub fn find(&self, peer_id: u8) -> Option<EpHandle> {
        self.eps
            .iter()
            .find(|(_, ep)| ep.peer_id == peer_id)
            .map(|(key, _)| EpHandle::Remote(key))
    }

    pub fn get(&self, h: EpHandle) -> Option<&CollEp> {
        match h {
            EpHandle::Remote(key) => self.eps.get(key),
            EpHandle::Loopback => self.loopback.as_ref(),
        }
    }

    pub fn get_mut(&mut self, h: EpHandle) -> Option<&mut CollEp> {
        match h {
            EpHandle::Remote(key) => self.eps.get_mut(key),
            EpHandle::Loopback => self.loopback.as_mut(),
        }
    }

    pub fn insert(&mut self, ep: CollEp) -> EpHandle {
        EpHandle::Remote(self.eps.insert(ep))
    }

    pub fn set_loopback(&mut self, ep: CollEp) {
        debug_assert!(self.loopback.is_none());
        self.loopback = Some(ep);
    }

    pub fn remove(&mut self, h: EpHandle) -> Option<CollEp> {
        match h {
            EpHandle::Remote(key) => self.eps.try_remove(key),
            EpHandle::Loopback => self.loopback.take(),
        }
    }

    /// Remote endpoints in slot order.
    pub fn remotes_mut(&mut self) -> impl Iterator<Item = &mut CollEp> {
        self.eps.iter_mut().map(|(_, ep)| ep)
    }

    /// Every endpoint, remote ones first.
    pub fn iter(&self) -> impl Iterator<Item = (EpHandle, &CollEp)> {
        self.eps
            .iter()
            .map(|(key, ep)| (EpHandle::Remote(key), ep))
            .chain(self.loopback.iter().map(|ep| (EpHandle::Loopback, ep)))
    }

    /// Handles of endpoints with queued pending callbacks.
    pub fn with_pending(&self) -> Vec<EpHandle> {
        self.iter()
            .filter(|(_, ep)| !ep.pending.is_empty())
            .map(|(h, _)| h)
            .collect()
    }

    /// Number of live endpoints, loopback included.
    pub fn len(&self) -> usize {
        self.eps.len() + usize::from(self.loopback.is_some())
    }
}
