// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming of the shared-memory segments that back collective FIFOs.
// Every rank of a job publishes its receive FIFO under a name derived from
// the job name and its collective id, so peers can attach by id alone.

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names. 0 disables truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Name of the receive FIFO of rank `coll_id` in job `job`.
pub fn fifo_name(job: &str, coll_id: u8) -> String {
    format!("{job}_MMCOLL__{coll_id}")
}

/// Produce a POSIX shm-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names whose POSIX form would exceed that limit
/// are shortened to `/<prefix>_<16-hex-FNV-1a-hash>`; the prefix keeps the
/// start of the original name for debuggability.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = fnv1a_64(result.as_bytes());
    let body = &result[1..];
    let take = prefix_len.min(body.len());
    format!("/{}_{hash:016x}", &body[..take])
}
