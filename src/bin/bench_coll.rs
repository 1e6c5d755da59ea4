// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Throughput of broadcast and incast rounds between threads.
//
//   bench_coll [max_members]
//
// Set MM_COLL_LOG=mmcoll=debug for interface lifecycle logs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use mmcoll::reduce::f32_bytes;
use mmcoll::{
    AmStatus, CollError, CollIface, CollIfaceConfig, Dtype, EpHandle, IfaceKind, IfaceParams,
    ReduceOp, Reducer, Strategy,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Stats {
    total_ms: f64,
    count: usize,
}

impl Stats {
    fn us_per_round(&self) -> f64 {
        (self.total_ms * 1000.0) / self.count as f64
    }
}

fn random_sizes(count: usize, lo: usize, hi: usize) -> Vec<usize> {
    let mut rng_state: u64 = 42;
    (0..count)
        .map(|_| {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            lo + (rng_state >> 32) as usize % (hi - lo + 1)
        })
        .collect()
}

/// Spin on a full ring until the send goes through.
fn send_retry(iface: &mut CollIface, ep: EpHandle, header: u64, payload: &[u8]) {
    loop {
        match iface.ep_am_short(ep, 0, header, payload) {
            Ok(()) => return,
            Err(CollError::NoResource) => thread::yield_now(),
            Err(e) => panic!("send failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// broadcast: 1 root, N-1 readers (random 2-64 byte shorts x count)
// ---------------------------------------------------------------------------

fn bench_bcast(cfg: &CollIfaceConfig, members: usize, count: usize) -> Stats {
    let sizes = random_sizes(count, 2, 64);
    let payload = vec![b'X'; 64];

    let mut root = CollIface::open(cfg, IfaceParams::new(IfaceKind::Broadcast, 0, members)).unwrap();
    let root_addr = root.address();
    let lo = root.ep_create(&root_addr).unwrap();

    let mut readers = Vec::new();
    for i in 1..members {
        let mut leaf = CollIface::open(cfg, IfaceParams::new(IfaceKind::Broadcast, i, members)).unwrap();
        leaf.ep_create(&root_addr).unwrap();
        let got = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&got);
        leaf.set_am_handler(
            0,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                AmStatus::Ok
            }),
        )
        .unwrap();
        readers.push(thread::spawn(move || {
            while got.load(Ordering::Relaxed) < count {
                if leaf.progress() == 0 {
                    thread::yield_now();
                }
            }
        }));
    }

    let t0 = Instant::now();
    for (i, &size) in sizes.iter().enumerate() {
        send_retry(&mut root, lo, i as u64, &payload[..size]);
    }
    for t in readers {
        t.join().unwrap();
    }
    let total_ms = t0.elapsed().as_secs_f64() * 1000.0;

    Stats { total_ms, count }
}

// ---------------------------------------------------------------------------
// incast: N-1 writers, 1 root, f32 sum of 8 values per writer x count
// ---------------------------------------------------------------------------

fn bench_incast(cfg: &CollIfaceConfig, members: usize, count: usize) -> Stats {
    let reducer = Reducer::builtin(ReduceOp::Sum, Dtype::F32);
    let params = |i| IfaceParams::new(IfaceKind::Incast, i, members).with_reducer(reducer.clone());

    let mut root = CollIface::open(cfg, params(0)).unwrap();
    let got = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&got);
    root.set_am_handler(
        0,
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            AmStatus::Ok
        }),
    )
    .unwrap();

    let root_addr = root.address();
    let mut writers = Vec::new();
    for i in 1..members {
        let mut w = CollIface::open(cfg, params(i)).unwrap();
        let addr = root_addr.clone();
        writers.push(thread::spawn(move || {
            let ep = w.ep_create(&addr).unwrap();
            let bytes = f32_bytes(&[i as f32; 8]);
            for round in 0..count {
                send_retry(&mut w, ep, round as u64, &bytes);
            }
        }));
    }

    let t0 = Instant::now();
    while got.load(Ordering::Relaxed) < count {
        if root.progress() == 0 {
            thread::yield_now();
        }
    }
    let total_ms = t0.elapsed().as_secs_f64() * 1000.0;
    for t in writers {
        t.join().unwrap();
    }

    Stats { total_ms, count }
}

fn print_header(title: &str) {
    println!("\n=== {} ===", title);
    println!("{:>10}  {:>12}  {:>12}", "Members", "Total (ms)", "us/round");
    println!("{:>10}  {:>12}  {:>12}", "----------", "----------", "----------");
}

fn main() {
    mmcoll::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let max_members = if args.len() > 1 {
        args[1].parse().unwrap_or(8)
    } else {
        8
    };
    let count = 100_000;

    println!("mmcoll benchmark");
    println!(
        "{} hardware threads\n",
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    );

    let cfg = match CollIfaceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "bad configuration; using defaults");
            CollIfaceConfig::default()
        }
    };

    print_header("broadcast (random 2-64 byte shorts x 100000)");
    let mut n = 2;
    while n <= max_members {
        let s = bench_bcast(&cfg, n, count);
        println!("{:>10}  {:>12.2}  {:>12.3}", n, s.total_ms, s.us_per_round());
        n *= 2;
    }

    for strategy in [Strategy::Locked, Strategy::Atomic, Strategy::Batched, Strategy::Centralized] {
        let forced = CollIfaceConfig {
            strategy: Some(strategy),
            ..cfg.clone()
        };
        print_header(&format!("incast {strategy} (f32 sum of 8 x 100000)"));
        let mut n = 2;
        while n <= max_members {
            let s = bench_incast(&forced, n, count);
            println!("{:>10}  {:>12.2}  {:>12.3}", n, s.total_ms, s.us_per_round());
            n *= 2;
        }
    }

    println!("\nDone.");
}
