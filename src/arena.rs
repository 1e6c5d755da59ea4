// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Zero-initialised, cache-line aligned byte arena backing one FIFO.
// Either heap memory (a group of threads in one process) or a named
// shared-memory segment (a group of processes).

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use crate::error::{CollError, Result};
#[cfg(unix)]
use crate::platform::{PlatformShm, ShmMode};

pub const ARENA_ALIGN: usize = 64;

enum Backing {
    Heap(Layout),
    #[cfg(unix)]
    Shm(PlatformShm),
}

pub struct SharedArena {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// Safety: the arena is plain memory; callers synchronise through the
// atomics that the FIFO layout places inside it.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Allocate `len` zeroed bytes on the heap.
    pub fn heap(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CollError::InvalidParam("arena length is 0".into()));
        }
        let layout = Layout::from_size_align(len, ARENA_ALIGN)
            .map_err(|e| CollError::InvalidParam(e.to_string()))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(CollError::NoMemory)?;
        Ok(Self {
            base,
            len,
            backing: Backing::Heap(layout),
        })
    }

    /// Map `len` bytes of the named segment `name`.
    ///
    /// A freshly created segment is zero-filled by the kernel. mmap returns
    /// page-aligned memory, which satisfies [`ARENA_ALIGN`].
    #[cfg(unix)]
    pub fn shm(name: &str, len: usize, mode: ShmMode) -> io::Result<Self> {
        let shm = PlatformShm::acquire(name, len, mode)?;
        let base = NonNull::new(shm.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            base,
            len,
            backing: Backing::Shm(shm),
        })
    }

    /// Remove a named segment left behind by an earlier run.
    #[cfg(unix)]
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        !matches!(self.backing, Backing::Heap(_))
    }

    /// Number of mappings of the backing segment, including this one.
    /// Always 1 for heap arenas.
    pub fn ref_count(&self) -> i32 {
        match &self.backing {
            Backing::Heap(_) => 1,
            #[cfg(unix)]
            Backing::Shm(shm) => shm.ref_count(),
        }
    }

    /// The POSIX name of a shared arena.
    pub fn shm_name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Heap(_) => None,
            #[cfg(unix)]
            Backing::Shm(shm) => Some(shm.name()),
        }
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if let Backing::Heap(layout) = self.backing {
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArena")
            .field("len", &self.len)
            .field("shared", &self.is_shared())
            .finish()
    }
}
