// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pending-send queue: deferred sends run from progress() once the ring has
// room, in the order they were queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mmcoll::{
    AmStatus, CollError, CollIface, CollIfaceConfig, EpHandle, IfaceKind, IfaceParams,
    PendingCallback,
};

struct Bcast {
    root: CollIface,
    lo: EpHandle,
    leaf: CollIface,
    headers: Arc<Mutex<Vec<u64>>>,
}

fn open() -> Bcast {
    mmcoll::logging::init_for_tests();
    let cfg = CollIfaceConfig {
        fifo_size: 2,
        ..Default::default()
    };
    let mut root = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Broadcast, 0, 2)).unwrap();
    let mut leaf = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Broadcast, 1, 2)).unwrap();
    let addr = root.address();
    let lo = root.ep_create(&addr).unwrap();
    leaf.ep_create(&addr).unwrap();

    let headers: Arc<Mutex<Vec<u64>>> = Arc::default();
    let sink = Arc::clone(&headers);
    leaf.set_am_handler(
        1,
        Box::new(move |m| {
            sink.lock().unwrap().push(m.header);
            AmStatus::Ok
        }),
    )
    .unwrap();
    Bcast {
        root,
        lo,
        leaf,
        headers,
    }
}

fn send_later(header: u64) -> PendingCallback {
    Box::new(move |iface: &mut CollIface, ep: EpHandle| iface.ep_am_short(ep, 1, header, b"late"))
}

#[test]
fn add_while_sendable_is_busy() {
    let mut b = open();
    let err = b.root.ep_pending_add(b.lo, send_later(0)).unwrap_err();
    assert!(matches!(err, CollError::Busy));
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 0);
}

#[test]
fn queued_sends_run_in_order_after_drain() {
    let mut b = open();
    b.root.ep_am_short(b.lo, 1, 0, b"a").unwrap();
    b.root.ep_am_short(b.lo, 1, 1, b"b").unwrap();

    b.root.ep_pending_add(b.lo, send_later(2)).unwrap();
    b.root.ep_pending_add(b.lo, send_later(3)).unwrap();
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 2);

    // a direct send may not overtake the queue
    assert!(matches!(
        b.root.ep_am_short(b.lo, 1, 9, b"x"),
        Err(CollError::NoResource)
    ));

    // ring still full: nothing to dispatch
    b.root.progress();
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 2);

    // drain both, then the root dispatches one queued send per progress
    assert_eq!(b.leaf.progress(), 2);
    b.root.progress();
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 1);
    b.root.progress();
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 0);

    assert_eq!(b.leaf.progress(), 2);
    assert_eq!(*b.headers.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn retriable_failure_keeps_callback_at_front() {
    let mut b = open();
    b.root.ep_am_short(b.lo, 1, 0, b"a").unwrap();
    b.root.ep_am_short(b.lo, 1, 1, b"b").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    // takes both freed elements, then a third send overruns the ring
    b.root
        .ep_pending_add(
            b.lo,
            Box::new(move |iface: &mut CollIface, ep: EpHandle| {
                let n = seen.fetch_add(1, Ordering::Relaxed) as u64;
                iface.ep_am_short(ep, 1, 10 + n, b"")?;
                iface.ep_am_short(ep, 1, 20 + n, b"")?;
                iface.ep_am_short(ep, 1, 30 + n, b"")
            }),
        )
        .unwrap();

    assert_eq!(b.leaf.progress(), 2);
    b.root.progress();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(b.root.fifo().head(), 4);
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 1);
}

#[test]
fn failing_callback_is_dropped() {
    let mut b = open();
    b.root.ep_am_short(b.lo, 1, 0, b"a").unwrap();
    b.root.ep_am_short(b.lo, 1, 1, b"b").unwrap();
    b.root
        .ep_pending_add(
            b.lo,
            Box::new(|iface: &mut CollIface, ep: EpHandle| iface.ep_am_short(ep, 99, 0, b"")),
        )
        .unwrap();

    assert_eq!(b.leaf.progress(), 2);
    b.root.progress();
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 0);
}

#[test]
fn purge_hands_back_every_callback() {
    let mut b = open();
    b.root.ep_am_short(b.lo, 1, 0, b"a").unwrap();
    b.root.ep_am_short(b.lo, 1, 1, b"b").unwrap();
    for h in 2..5 {
        b.root.ep_pending_add(b.lo, send_later(h)).unwrap();
    }

    let mut purged = 0;
    b.root.ep_pending_purge(b.lo, |_| purged += 1).unwrap();
    assert_eq!(purged, 3);
    assert_eq!(b.root.ep(b.lo).unwrap().pending_len(), 0);

    assert_eq!(b.leaf.progress(), 2);
    b.root.progress();
    assert_eq!(b.leaf.progress(), 0);
}

#[test]
fn destroy_discards_queue() {
    let mut b = open();
    b.root.ep_am_short(b.lo, 1, 0, b"a").unwrap();
    b.root.ep_am_short(b.lo, 1, 1, b"b").unwrap();
    b.root.ep_pending_add(b.lo, send_later(2)).unwrap();

    b.root.ep_destroy(b.lo).unwrap();
    assert!(b.root.ep(b.lo).is_none());
    assert!(matches!(
        b.root.ep_pending_add(b.lo, send_later(3)),
        Err(CollError::NoSuchEndpoint)
    ));
    b.root.progress();
}
