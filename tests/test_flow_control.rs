// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Back-pressure: a full ring refuses sends until a reader drains it.

use mmcoll::{
    AmStatus, CollError, CollIface, CollIfaceConfig, EpHandle, IfaceKind, IfaceParams,
};

fn small_cfg() -> CollIfaceConfig {
    CollIfaceConfig {
        fifo_size: 2,
        fifo_poll_count: 1,
        ..Default::default()
    }
}

fn pair(kind: IfaceKind) -> (CollIface, CollIface) {
    let cfg = small_cfg();
    let a = CollIface::open(&cfg, IfaceParams::new(kind, 0, 2)).unwrap();
    let b = CollIface::open(&cfg, IfaceParams::new(kind, 1, 2)).unwrap();
    (a, b)
}

#[test]
fn broadcast_third_send_waits_for_one_poll() {
    let (mut root, mut leaf) = pair(IfaceKind::Broadcast);
    let addr = root.address();
    let lo = root.ep_create(&addr).unwrap();
    leaf.ep_create(&addr).unwrap();
    leaf.set_am_handler(1, Box::new(|_| AmStatus::Ok)).unwrap();

    root.ep_am_short(lo, 1, 100, b"first").unwrap();
    root.ep_am_short(lo, 1, 101, b"second").unwrap();

    let err = root.ep_am_short(lo, 1, 102, b"third").unwrap_err();
    assert!(matches!(err, CollError::NoResource));
    assert!(err.is_retriable());
    assert_eq!(root.stats().tx_no_resource, 1);

    // the refused send left the oldest element alone
    let fifo = root.fifo();
    assert_eq!(fifo.head(), 2);
    assert_eq!(fifo.elem(0).header(), 100);
    assert!(fifo.is_ready(0));

    // poll count 1: exactly one element drained
    assert_eq!(leaf.progress(), 1);
    assert_eq!(root.fifo().tail(), 1);

    root.ep_am_short(lo, 1, 102, b"third").unwrap();
    assert_eq!(root.fifo().elem(2).header(), 102);
    assert_eq!(root.ep(lo).unwrap().tx_index(), 3);
}

#[test]
fn incast_writer_is_throttled_by_root() {
    let (mut root, mut writer) = pair(IfaceKind::Incast);
    let ep = writer.ep_create(&root.address()).unwrap();

    writer.ep_am_short(ep, 0, 0, b"a").unwrap();
    writer.ep_am_short(ep, 0, 1, b"b").unwrap();
    assert!(matches!(
        writer.ep_am_short(ep, 0, 2, b"c"),
        Err(CollError::NoResource)
    ));
    assert!(!writer.ep_flush(ep).unwrap());

    assert_eq!(root.progress(), 1);
    writer.ep_am_short(ep, 0, 2, b"c").unwrap();

    assert_eq!(root.progress(), 1);
    assert_eq!(root.progress(), 1);
    assert_eq!(root.progress(), 0);
    assert!(writer.ep_flush(ep).unwrap());
}

#[test]
fn poll_budget_bounds_each_progress_call() {
    let cfg = CollIfaceConfig {
        fifo_size: 8,
        fifo_poll_count: 3,
        ..Default::default()
    };
    let mut root = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Broadcast, 0, 2)).unwrap();
    let mut leaf = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Broadcast, 1, 2)).unwrap();
    let addr = root.address();
    let lo: EpHandle = root.ep_create(&addr).unwrap();
    leaf.ep_create(&addr).unwrap();

    for i in 0..7 {
        root.ep_am_short(lo, 0, i, b"").unwrap();
    }
    assert_eq!(leaf.progress(), 3);
    assert_eq!(leaf.progress(), 3);
    assert_eq!(leaf.progress(), 1);
    assert_eq!(leaf.progress(), 0);
    assert_eq!(root.fifo().tail(), 7);
}
