// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory collective FIFO transport.
//
// A group of `proc_count` members exchanges broadcast (one writer, many
// readers) and incast (many writers, one reader) active messages through
// per-member FIFO rings. Rings live on the heap for groups of threads, or in
// named POSIX shared memory for groups of processes.

pub mod shm_name;

mod platform;
#[cfg(unix)]
pub use platform::ShmMode;

mod arena;
pub use arena::SharedArena;

mod spin_lock;
pub use spin_lock::{SpinGuard, SpinLock};

mod error;
pub use error::{CollError, Result};

pub mod fifo;
pub use fifo::{Fifo, FifoGeometry, OpMode};

pub mod tracker;
pub use tracker::{SlotTrailers, Strategy};

pub mod reduce;
pub use reduce::{Dtype, ReduceOp, Reducer};

pub mod am;
pub use am::{AmFlags, AmHandler, AmMessage, AmStatus, SendFlags, SharedDesc, AM_ID_MAX};

pub mod config;
pub use config::{CollIfaceConfig, IfaceKind, IfaceParams};

mod async_ctx;
pub use async_ctx::{AsyncContext, AsyncGuard};

mod ep;
pub use ep::CollEp;

mod registry;
pub use registry::EpHandle;

mod progress;
pub use progress::IfaceStats;

pub mod iface;
pub use iface::{CollIface, IfaceAddr, IfaceAttr, PendingCallback};

pub mod logging;
