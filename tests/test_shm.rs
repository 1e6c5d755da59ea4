// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Arenas and FIFOs backed by named shared memory.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};

use mmcoll::{
    AmFlags, AmStatus, CollError, CollIface, CollIfaceConfig, Fifo, FifoGeometry, IfaceAddr,
    IfaceKind, IfaceParams, SharedArena, ShmMode,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}", std::process::id())
}

fn geo() -> FifoGeometry {
    FifoGeometry {
        fifo_size: 4,
        elem_size: 128,
        seg_size: 256,
    }
}

// ========== Arena ==========

#[test]
fn arena_create_is_zeroed() {
    let name = unique_name("arena_zero");
    SharedArena::unlink_by_name(&name);

    let arena = SharedArena::shm(&name, 4096, ShmMode::Create).expect("create");
    assert!(arena.is_shared());
    assert_eq!(arena.len(), 4096);
    assert_eq!(arena.as_ptr() as usize % 64, 0);
    let bytes = unsafe { std::slice::from_raw_parts(arena.as_ptr(), arena.len()) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn arena_open_nonexistent_fails() {
    let name = unique_name("arena_missing");
    SharedArena::unlink_by_name(&name);
    assert!(SharedArena::shm(&name, 1024, ShmMode::Open).is_err());
}

#[test]
fn arena_mappings_share_bytes_and_count() {
    let name = unique_name("arena_share");
    SharedArena::unlink_by_name(&name);

    let a = SharedArena::shm(&name, 512, ShmMode::CreateOrOpen).expect("first");
    let b = SharedArena::shm(&name, 512, ShmMode::CreateOrOpen).expect("second");
    assert_eq!(a.ref_count(), 2);

    let msg = b"collective";
    unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), a.as_ptr(), msg.len()) };
    let seen = unsafe { std::slice::from_raw_parts(b.as_ptr(), msg.len()) };
    assert_eq!(seen, msg);

    drop(b);
    assert_eq!(a.ref_count(), 1);
}

#[test]
fn heap_arena_is_private() {
    let arena = SharedArena::heap(1024).expect("heap");
    assert!(!arena.is_shared());
    assert_eq!(arena.ref_count(), 1);
    assert!(arena.shm_name().is_none());
    assert!(SharedArena::heap(0).is_err());
}

// ========== Fifo ==========

#[test]
fn fifo_attach_sees_geometry() {
    let name = unique_name("fifo_attach");
    SharedArena::unlink_by_name(&name);

    let owner = Fifo::open_shared(&name, geo()).expect("open");
    let peer = Fifo::attach(&name, geo()).expect("attach");
    assert!(owner.is_shared());
    assert_eq!(peer.geometry(), geo());
    assert_eq!(owner.map_count(), 2);
    assert_eq!(peer.head(), 0);
    assert_eq!(peer.tail(), 0);
}

#[test]
fn fifo_geometry_mismatch_is_rejected() {
    let name = unique_name("fifo_mismatch");
    SharedArena::unlink_by_name(&name);

    let _owner = Fifo::open_shared(&name, geo()).expect("open");
    // same arena size, different split between elements and segments
    let other = FifoGeometry {
        fifo_size: 4,
        elem_size: 192,
        seg_size: 192,
    };
    assert_eq!(other.arena_size(), geo().arena_size());
    assert!(matches!(
        Fifo::attach(&name, other),
        Err(CollError::InvalidParam(_))
    ));
}

#[test]
fn fifo_attach_before_publish_fails() {
    let name = unique_name("fifo_early");
    SharedArena::unlink_by_name(&name);
    assert!(matches!(Fifo::attach(&name, geo()), Err(CollError::Io(_))));
}

// ========== Interfaces across named FIFOs ==========

#[test]
fn broadcast_through_named_fifo() {
    let job = unique_name("job");
    let cfg = CollIfaceConfig::default();

    let mut root = CollIface::open(
        &cfg,
        IfaceParams::new(IfaceKind::Broadcast, 0, 2).with_shm_job(&job),
    )
    .expect("root");
    let mut leaf = CollIface::open(
        &cfg,
        IfaceParams::new(IfaceKind::Broadcast, 1, 2).with_shm_job(&job),
    )
    .expect("leaf");
    assert!(root.fifo().is_shared());

    // The leaf finds the root by job name and id, as another process would.
    let geometry = leaf.query().geometry;
    let root_addr = IfaceAddr::attach(&job, 0, geometry).expect("attach root");
    let to_root = leaf.ep_create(&root_addr).expect("ep");
    let lo = root.ep_create(&root.address()).expect("loopback");

    let got = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&got);
    leaf.set_am_handler(
        2,
        Box::new(move |m| {
            assert!(m.flags.contains(AmFlags::SHARED));
            sink.lock().unwrap().push((m.header, m.data.to_vec()));
            AmStatus::Ok
        }),
    )
    .unwrap();

    root.ep_am_short(lo, 2, 77, b"over shm").unwrap();
    assert_eq!(leaf.progress(), 1);
    assert_eq!(got.lock().unwrap().as_slice(), &[(77u64, b"over shm".to_vec())]);
    assert!(root.ep_flush(lo).unwrap());

    leaf.ep_destroy(to_root).unwrap();
}
