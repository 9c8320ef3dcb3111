// SPDX-License-Identifier: PMPL-1.0-or-later
//
// State system error types.
//
// Callers match on one enum: the history tree's corrupt-file, version and
// time-range errors are lifted into the variants of the same name here, and
// everything else from the backend is wrapped in `Backend`.

use statehist_core::{Quark, Timestamp, ValueType};
use statehist_tree::TreeError;
use thiserror::Error;

/// Errors surfaced by the state system.
#[derive(Debug, Error)]
pub enum StateSystemError {
    /// A quark or attribute path that does not exist.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// A query or modification outside the valid time bounds.
    #[error("Timestamp {time} outside valid range [{start}, {end}]")]
    TimeRange {
        time: Timestamp,
        start: Timestamp,
        end: Timestamp,
    },

    /// A value whose type differs from the one the attribute already holds.
    #[error("Quark {quark} holds {expected} values, cannot assign {found}")]
    StateValueType {
        quark: Quark,
        expected: ValueType,
        found: ValueType,
    },

    /// The history file (or the data it decodes to) is invalid.
    #[error("Corrupt state history: {0}")]
    CorruptFile(String),

    /// The history file was written by an incompatible version.
    #[error("{what} version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    /// The state system was disposed; no further queries are possible.
    #[error("State system has been disposed")]
    Disposed,

    /// A write or ongoing-state access after the history was closed.
    #[error("State system is sealed; no ongoing state")]
    Sealed,

    /// A sub-attribute filter was not a valid regular expression.
    #[error("Invalid attribute pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// A stack attribute exceeded its depth limit.
    #[error("Stack attribute {quark} reached its depth limit of {limit}")]
    StackOverflow { quark: Quark, limit: i32 },

    /// A lock protecting shared state was poisoned.
    #[error("State system lock poisoned")]
    LockPoisoned,

    /// Any other history backend failure.
    #[error("History backend error: {0}")]
    Backend(TreeError),
}

impl StateSystemError {
    /// True when the on-disk history is unusable and must be regenerated
    /// from the trace.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, Self::CorruptFile(_) | Self::VersionMismatch { .. })
    }

    pub(crate) fn not_found(quark: Quark) -> Self {
        Self::AttributeNotFound(format!("quark {quark}"))
    }
}

impl From<TreeError> for StateSystemError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::CorruptFile { path, reason } => {
                Self::CorruptFile(format!("{}: {reason}", path.display()))
            }
            TreeError::VersionMismatch {
                what,
                expected,
                found,
            } => Self::VersionMismatch {
                what,
                expected,
                found,
            },
            TreeError::TimeRange { time, start, end } => Self::TimeRange { time, start, end },
            other => Self::Backend(other),
        }
    }
}

/// Convenience type alias for state system results.
pub type StateSystemResult<T> = Result<T, StateSystemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_errors_lift_into_taxonomy() {
        let err: StateSystemError = TreeError::TimeRange {
            time: 5,
            start: 10,
            end: 20,
        }
        .into();
        assert!(matches!(err, StateSystemError::TimeRange { time: 5, .. }));

        let err: StateSystemError = TreeError::CorruptFile {
            path: "/tmp/x.ht".into(),
            reason: "bad magic".into(),
        }
        .into();
        assert!(err.requires_rebuild());
        assert!(err.to_string().contains("bad magic"));

        let err: StateSystemError = TreeError::ReadOnly.into();
        assert!(matches!(err, StateSystemError::Backend(TreeError::ReadOnly)));
        assert!(!err.requires_rebuild());
    }

    #[test]
    fn test_version_mismatch_requires_rebuild() {
        let err: StateSystemError = TreeError::VersionMismatch {
            what: "provider",
            expected: 4,
            found: 3,
        }
        .into();
        assert!(err.requires_rebuild());
        assert_eq!(
            err.to_string(),
            "provider version mismatch: expected 4, found 3"
        );
    }
}
