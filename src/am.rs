// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Active messages: ids, handler table, and the message view handed to
// handlers.

use std::fmt;
use std::ops::BitOr;

use crate::error::{CollError, Result};

/// Active message ids are `0..AM_ID_MAX`.
pub const AM_ID_MAX: u8 = 32;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Attributes of a delivered message.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AmFlags(u32);

impl AmFlags {
    /// `data` lives in a buffer-copy segment and may be kept past the
    /// callback by taking the descriptor.
    pub const DESC: AmFlags = AmFlags(1 << 0);
    /// `data` is read-only memory shared with other readers.
    pub const SHARED: AmFlags = AmFlags(1 << 1);
    /// `data` is an unreduced gather: one contribution every `stride` bytes.
    pub const STRIDE: AmFlags = AmFlags(1 << 2);
    /// `data` was carried inline in the FIFO element.
    pub const INLINE: AmFlags = AmFlags(1 << 3);

    pub const fn empty() -> Self {
        AmFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: AmFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AmFlags {
    type Output = AmFlags;

    fn bitor(self, rhs: AmFlags) -> AmFlags {
        AmFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for AmFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (AmFlags::DESC, "DESC"),
            (AmFlags::SHARED, "SHARED"),
            (AmFlags::STRIDE, "STRIDE"),
            (AmFlags::INLINE, "INLINE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AmFlags({})", set.join(" | "))
    }
}

/// Flags accepted by buffer-copy sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u32);

impl SendFlags {
    /// Count the completion in the destination FIFO's signal counter.
    pub const SIGNALED: SendFlags = SendFlags(1 << 0);

    pub const fn empty() -> Self {
        SendFlags(0)
    }

    pub const fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmStatus {
    /// The message was consumed; the element may be reused.
    Ok,
    /// The handler took the descriptor with [`AmMessage::take_desc`]. The
    /// element stays owned until the descriptor is passed to
    /// `release_shared_desc`.
    InProgress,
}

/// Identifies a delivered element for deferred release.
///
/// Not `Clone`: the one descriptor of an element is consumed by the release
/// that frees it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SharedDesc {
    pub(crate) peer: Option<u8>,
    pub(crate) index: u64,
}

impl SharedDesc {
    /// The broadcasting peer, or `None` for an element of our own FIFO.
    pub fn peer(&self) -> Option<u8> {
        self.peer
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

/// A received message, borrowed from the FIFO for the duration of the
/// handler call.
#[derive(Debug)]
pub struct AmMessage<'a> {
    pub am_id: u8,
    pub header: u64,
    pub data: &'a [u8],
    /// Length of one contribution.
    pub length: usize,
    /// Distance between contributions when [`AmFlags::STRIDE`] is set.
    pub stride: usize,
    pub flags: AmFlags,
    desc: Option<SharedDesc>,
}

impl<'a> AmMessage<'a> {
    pub(crate) fn new(
        am_id: u8,
        header: u64,
        data: &'a [u8],
        length: usize,
        stride: usize,
        flags: AmFlags,
        desc: SharedDesc,
    ) -> Self {
        Self {
            am_id,
            header,
            data,
            length,
            stride,
            flags,
            desc: Some(desc),
        }
    }

    /// Keep the element past the handler call. Returns `None` once taken.
    ///
    /// A handler that takes the descriptor returns [`AmStatus::InProgress`]
    /// and later hands it to `release_shared_desc`.
    pub fn take_desc(&mut self) -> Option<SharedDesc> {
        self.desc.take()
    }

    pub(crate) fn desc_taken(&self) -> bool {
        self.desc.is_none()
    }

    /// Each writer's contribution. A reduced or single-writer message yields
    /// one item.
    pub fn contributions(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let data = self.data;
        let (stride, length) = if self.flags.contains(AmFlags::STRIDE) && self.stride > 0 {
            (self.stride, self.length)
        } else {
            (data.len().max(1), data.len())
        };
        data.chunks(stride).map(move |c| &c[..length.min(c.len())])
    }
}

pub type AmHandler = Box<dyn FnMut(&mut AmMessage<'_>) -> AmStatus + Send>;

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

pub struct AmTable {
    handlers: Vec<Option<AmHandler>>,
}

impl AmTable {
    pub fn new() -> Self {
        Self {
            handlers: (0..AM_ID_MAX).map(|_| None).collect(),
        }
    }

    pub fn check_id(am_id: u8) -> Result<()> {
        if am_id >= AM_ID_MAX {
            return Err(CollError::InvalidAmId(am_id));
        }
        Ok(())
    }

    pub fn set(&mut self, am_id: u8, handler: AmHandler) -> Result<()> {
        Self::check_id(am_id)?;
        self.handlers[am_id as usize] = Some(handler);
        Ok(())
    }

    pub fn clear(&mut self, am_id: u8) -> Result<()> {
        Self::check_id(am_id)?;
        self.handlers[am_id as usize] = None;
        Ok(())
    }

    pub fn is_set(&self, am_id: u8) -> bool {
        self.handlers
            .get(am_id as usize)
            .is_some_and(|h| h.is_some())
    }

    pub fn dispatch(&mut self, msg: &mut AmMessage<'_>) -> AmStatus {
        match self.handlers.get_mut(msg.am_id as usize) {
            Some(Some(handler)) => handler(msg),
            _ => {
                tracing::warn!(am_id = msg.am_id, len = msg.data.len(), "no handler for active message; dropped");
                AmStatus::Ok
            }
        }
    }
}

impl Default for AmTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(flags: AmFlags, data: &[u8], length: usize, stride: usize) -> AmMessage<'_> {
        AmMessage::new(1, 0, data, length, stride, flags, SharedDesc { peer: None, index: 0 })
    }

    #[test]
    fn contributions_of_gather() {
        let data = [1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0];
        let m = msg(AmFlags::STRIDE | AmFlags::INLINE, &data, 2, 4);
        let parts: Vec<&[u8]> = m.contributions().collect();
        assert_eq!(parts, vec![&[1u8, 2][..], &[3, 4][..], &[5, 6][..]]);
    }

    #[test]
    fn contributions_of_single() {
        let data = [9u8, 8, 7];
        let m = msg(AmFlags::INLINE, &data, 3, 0);
        assert_eq!(m.contributions().count(), 1);
    }

    #[test]
    fn table_rejects_out_of_range_id() {
        let mut t = AmTable::new();
        assert!(matches!(
            t.set(AM_ID_MAX, Box::new(|_| AmStatus::Ok)),
            Err(CollError::InvalidAmId(32))
        ));
        t.set(3, Box::new(|_| AmStatus::InProgress)).unwrap();
        assert!(t.is_set(3));
        let data = [0u8; 1];
        let mut m = msg(AmFlags::empty(), &data, 1, 0);
        m.am_id = 3;
        assert_eq!(t.dispatch(&mut m), AmStatus::InProgress);
        m.am_id = 4;
        assert_eq!(t.dispatch(&mut m), AmStatus::Ok);
    }

    #[test]
    fn descriptor_is_taken_once() {
        let mut t = AmTable::new();
        let data = [0u8; 4];
        let mut m = msg(AmFlags::DESC, &data, 4, 0);
        assert!(!m.desc_taken());
        t.set(
            1,
            Box::new(|m| {
                let first = m.take_desc();
                assert!(first.is_some());
                assert!(m.take_desc().is_none());
                AmStatus::InProgress
            }),
        )
        .unwrap();
        assert_eq!(t.dispatch(&mut m), AmStatus::InProgress);
        assert!(m.desc_taken());
        assert!(m.take_desc().is_none());
    }

    #[test]
    fn flags_debug_lists_names() {
        let s = format!("{:?}", AmFlags::DESC | AmFlags::SHARED);
        assert_eq!(s, "AmFlags(DESC | SHARED)");
    }
}
