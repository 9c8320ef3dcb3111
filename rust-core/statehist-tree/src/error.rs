// SPDX-License-Identifier: PMPL-1.0-or-later
//
// History tree error types.

use std::path::PathBuf;

use statehist_core::ValueError;
use thiserror::Error;

/// Errors that can occur while building or reading a history tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// An I/O error occurred on the history file.
    #[error("History tree I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file or one of its blocks is not a valid history tree.
    /// Never recovered from: the caller discards the file and rebuilds.
    #[error("Corrupt history file {path}: {reason}")]
    CorruptFile {
        /// File that failed validation.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The file was written by an incompatible format or provider version.
    #[error("{what} version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Which version field disagreed ("file format" or "provider").
        what: &'static str,
        expected: u32,
        found: u32,
    },

    /// A timestamp fell outside the range the tree accepts or covers.
    #[error("Timestamp {time} outside valid range [{start}, {end}]")]
    TimeRange {
        /// Offending timestamp.
        time: i64,
        /// Lower bound of the valid range.
        start: i64,
        /// Upper bound of the valid range.
        end: i64,
    },

    /// An interval's encoding does not fit even in an empty node.
    #[error("Interval of {size} bytes does not fit in a node ({capacity} bytes available)")]
    IntervalTooLarge {
        size: usize,
        capacity: usize,
    },

    /// The configuration cannot produce a usable tree.
    #[error("Invalid history tree configuration: {0}")]
    InvalidConfig(String),

    /// A write was attempted on a sealed tree.
    #[error("History tree is sealed and read-only")]
    ReadOnly,

    /// A lock protecting shared tree state was poisoned.
    #[error("History tree lock poisoned")]
    LockPoisoned,

    /// Encoding a value failed (for example an oversize string).
    #[error("State value encoding error: {0}")]
    Value(#[from] ValueError),
}

impl TreeError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for history tree results.
pub type TreeResult<T> = Result<T, TreeError>;
