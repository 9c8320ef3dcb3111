// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Errors raised while encoding or decoding state values and intervals.

use thiserror::Error;

/// Errors from the value and interval codecs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    /// The type tag byte does not name a known value type.
    #[error("Invalid state value type tag: {0}")]
    InvalidTypeTag(u8),

    /// The buffer ended before the encoded item was complete.
    #[error("Truncated buffer: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset at which the read started.
        offset: usize,
        /// Bytes required by the read.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A string payload was not valid UTF-8.
    #[error("Invalid UTF-8 in string value")]
    InvalidUtf8,

    /// A string or custom payload exceeds the u16 length prefix.
    #[error("Value payload of {0} bytes exceeds the {max} byte limit", max = u16::MAX)]
    PayloadTooLarge(usize),
}

/// Convenience type alias for codec results.
pub type ValueResult<T> = Result<T, ValueError>;
