// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Interface configuration (tunables shared by the whole group) and the
// per-instance construction parameters.

use crate::error::{CollError, Result};
use crate::fifo::{align_up, FifoGeometry, CACHE_LINE, HEADER_SIZE};
use crate::reduce::Reducer;
use crate::tracker::Strategy;

/// Tunables of a collective interface.
///
/// Every member of a group must use the same values, since peers size each
/// other's FIFOs from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollIfaceConfig {
    /// Elements per FIFO. Power of two.
    pub fifo_size: u32,
    /// Bytes per element including the header, before incast resizing.
    pub fifo_elem_size: u32,
    /// Bytes per buffer-copy segment.
    pub seg_size: u32,
    /// Elements polled per `progress()` call.
    pub fifo_poll_count: u32,
    /// Groups larger than this bind the Centralized strategy.
    pub centralized_threshold: usize,
    /// Forced strategy; `None` selects by group size.
    pub strategy: Option<Strategy>,
    /// Guard registry updates with a lock as well as the block counter.
    pub multi_thread: bool,
}

impl Default for CollIfaceConfig {
    fn default() -> Self {
        Self {
            fifo_size: 64,
            fifo_elem_size: 128,
            seg_size: 8192,
            fifo_poll_count: 16,
            centralized_threshold: 8,
            strategy: None,
            multi_thread: false,
        }
    }
}

pub const ENV_FIFO_SIZE: &str = "MM_COLL_FIFO_SIZE";
pub const ENV_FIFO_ELEM_SIZE: &str = "MM_COLL_FIFO_ELEM_SIZE";
pub const ENV_SEG_SIZE: &str = "MM_COLL_SEG_SIZE";
pub const ENV_FIFO_MAX_POLL: &str = "MM_COLL_FIFO_MAX_POLL";
pub const ENV_CENTRALIZED_THRESHOLD: &str = "MM_COLL_CENTRALIZED_THRESHOLD";
pub const ENV_STRATEGY: &str = "MM_COLL_STRATEGY";
pub const ENV_MT: &str = "MM_COLL_MT";

fn parse_num<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| CollError::InvalidConfig(format!("{var}={raw:?} is not a number")))
}

fn parse_bool(var: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "true" | "on" => Ok(true),
        "n" | "no" | "0" | "false" | "off" => Ok(false),
        _ => Err(CollError::InvalidConfig(format!("{var}={raw:?} is not a boolean"))),
    }
}

impl CollIfaceConfig {
    /// Defaults overridden by `MM_COLL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_FIFO_SIZE) {
            cfg.fifo_size = parse_num(ENV_FIFO_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_FIFO_ELEM_SIZE) {
            cfg.fifo_elem_size = parse_num(ENV_FIFO_ELEM_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_SEG_SIZE) {
            cfg.seg_size = parse_num(ENV_SEG_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_FIFO_MAX_POLL) {
            cfg.fifo_poll_count = parse_num(ENV_FIFO_MAX_POLL, &v)?;
        }
        if let Some(v) = lookup(ENV_CENTRALIZED_THRESHOLD) {
            cfg.centralized_threshold = parse_num(ENV_CENTRALIZED_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_STRATEGY) {
            cfg.strategy = match v.trim().to_ascii_lowercase().as_str() {
                "" | "auto" => None,
                other => Some(other.parse()?),
            };
        }
        if let Some(v) = lookup(ENV_MT) {
            cfg.multi_thread = parse_bool(ENV_MT, &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fifo_size < 2 || !self.fifo_size.is_power_of_two() {
            return Err(CollError::InvalidConfig(format!(
                "fifo_size {} must be a power of two >= 2",
                self.fifo_size
            )));
        }
        let elem = self.fifo_elem_size as usize;
        if elem < HEADER_SIZE + CACHE_LINE || elem % CACHE_LINE != 0 {
            return Err(CollError::InvalidConfig(format!(
                "fifo_elem_size {elem} must be a multiple of {CACHE_LINE} and at least {}",
                HEADER_SIZE + CACHE_LINE
            )));
        }
        if self.fifo_poll_count == 0 {
            return Err(CollError::InvalidConfig("fifo_poll_count must be > 0".into()));
        }
        // the smallest group has one writer and one dummy slot
        if self.seg_size / 2 < 2 {
            return Err(CollError::InvalidConfig(format!(
                "seg_size {} leaves no room for a contribution",
                self.seg_size
            )));
        }
        Ok(())
    }

    /// Padded inline slot size: one cache-line multiple per writer.
    pub fn short_stride(&self) -> usize {
        align_up(self.fifo_elem_size as usize - HEADER_SIZE, CACHE_LINE)
    }

    /// Padded segment slot size for a group of `proc_count` members.
    pub fn bcopy_stride(&self, proc_count: usize) -> usize {
        self.seg_size as usize / proc_count.max(1)
    }

    /// Geometry of the receive FIFO an interface of `kind` publishes.
    ///
    /// An incast root must hold every writer's inline contribution plus the
    /// dummy trailing slot, so its elements grow with the group.
    pub fn fifo_geometry(&self, kind: IfaceKind, proc_count: usize) -> FifoGeometry {
        let elem_size = match kind {
            IfaceKind::Broadcast => self.fifo_elem_size,
            IfaceKind::Incast => (HEADER_SIZE + proc_count * self.short_stride()) as u32,
        };
        FifoGeometry {
            fifo_size: self.fifo_size,
            elem_size,
            seg_size: self.seg_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-instance parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceKind {
    /// One writer (the root), every other member reads.
    Broadcast,
    /// Every other member writes, the root reads.
    Incast,
}

/// Construction inputs of one interface instance.
#[derive(Debug, Clone)]
pub struct IfaceParams {
    pub kind: IfaceKind,
    /// This member's id within the group.
    pub proc_idx: usize,
    pub proc_count: usize,
    /// Incast only: combine contributions. Without one, incast is a gather.
    pub reducer: Option<Reducer>,
    /// Publish the receive FIFO as named shared memory under this job name.
    /// `None` keeps it on the heap (a group of threads).
    pub shm_job: Option<String>,
}

/// Group size limit: ids travel as `u8` and trailers count in `u8`.
pub const MAX_PROCS: usize = 255;

impl IfaceParams {
    pub fn new(kind: IfaceKind, proc_idx: usize, proc_count: usize) -> Self {
        Self {
            kind,
            proc_idx,
            proc_count,
            reducer: None,
            shm_job: None,
        }
    }

    /// Parameters for a context that has no collective group information:
    /// a pair in which this side is member 0.
    pub fn without_group(kind: IfaceKind) -> Self {
        Self::new(kind, 0, 2)
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_shm_job(mut self, job: &str) -> Self {
        self.shm_job = Some(job.to_owned());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.proc_count < 2 || self.proc_count > MAX_PROCS {
            return Err(CollError::InvalidParam(format!(
                "proc_count {} outside 2..={MAX_PROCS}",
                self.proc_count
            )));
        }
        if self.proc_idx >= self.proc_count {
            return Err(CollError::InvalidParam(format!(
                "proc_idx {} not below proc_count {}",
                self.proc_idx, self.proc_count
            )));
        }
        Ok(())
    }
}
