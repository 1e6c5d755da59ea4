// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by every collective FIFO operation.

use std::io;

/// Errors reported by the collective FIFO transport.
///
/// Only [`CollError::NoResource`] is transient: the ring was full and the
/// caller may retry (through its pending queue, to keep ordering). Every
/// other variant is a caller or environment error and must not be retried
/// blindly.
#[derive(thiserror::Error, Debug)]
pub enum CollError {
    /// The destination FIFO has no free element.
    #[error("no resources: destination FIFO is full")]
    NoResource,

    /// A pending callback was offered to an endpoint that can send right now.
    #[error("endpoint is able to send; pending request not queued")]
    Busy,

    #[error("invalid active message id {0}")]
    InvalidAmId(u8),

    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLong { len: usize, max: usize },

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("out of memory")]
    NoMemory,

    /// The endpoint handle or descriptor does not refer to a live endpoint.
    #[error("no such endpoint")]
    NoSuchEndpoint,

    #[error("shared memory: {0}")]
    Io(#[from] io::Error),
}

impl CollError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CollError::NoResource)
    }
}

pub type Result<T> = std::result::Result<T, CollError>;
