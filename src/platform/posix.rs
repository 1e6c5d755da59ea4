// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory: shm_open + ftruncate + mmap, with a trailing
// process-shared reference counter so the last unmapper unlinks the segment.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

/// Rounds `user_size` up to the counter alignment and appends the counter.
pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = user_size.div_ceil(ALIGN) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The trailing reference counter of a mapped region of `total_size` bytes.
///
/// # Safety
/// `mem` must point to a live mapping of at least `total_size` bytes.
unsafe fn acc_of<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// Open mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,  // total mapped size (including ref counter)
    name: String, // POSIX name (with leading '/')
}

// Safety: the mapping is process-shared; all mutation goes through atomics
// or through regions that the FIFO protocol assigns to a single writer.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

fn open_fd(c_name: &CString, flags: libc::c_int) -> io::Result<libc::c_int> {
    let perms: libc::mode_t = 0o666;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let total_size = calc_size(user_size);
        let excl = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

        // Only the creator truncates: resizing an existing object can clobber
        // a peer's live FIFO on some platforms.
        let (fd, created) = match mode {
            ShmMode::Create => (open_fd(&c_name, excl)?, true),
            ShmMode::Open => (open_fd(&c_name, libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match open_fd(&c_name, excl) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    (open_fd(&c_name, libc::O_RDWR)?, false)
                }
                Err(e) => return Err(e),
            },
        };

        if created && unsafe { libc::ftruncate(fd, total_size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mem = mem as *mut u8;
        unsafe { acc_of(mem, total_size).fetch_add(1, Ordering::AcqRel) };
        tracing::debug!(name = %posix_name, size = total_size, created, "shm mapped");
        Ok(Self {
            mem,
            size: total_size,
            name: posix_name,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Remove the name. Existing mappings stay valid.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}
