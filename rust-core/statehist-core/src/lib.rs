// SPDX-License-Identifier: PMPL-1.0-or-later
//
// statehist core types
//
// Shared vocabulary for the history tree and the state system: quarks
// (integer attribute identifiers), the tagged `StateValue` union with its
// stable binary encoding, closed `StateInterval`s, and overflow-safe
// timestamp arithmetic.
//
// ## On-disk value encoding (all integers little-endian)
//
// ```text
// [1 byte: type tag]   -- 0=Null, 1=Int, 2=Long, 3=Double, 4=String, 5=Custom
// Int:    [4 bytes: i32]
// Long:   [8 bytes: i64]
// Double: [8 bytes: f64 bits]
// String: [2 bytes: len (u16)] [len bytes: UTF-8]
// Custom: [2 bytes: len (u16)] [len bytes]
// ```
//
// ## On-disk interval encoding
//
// ```text
// [8 bytes: start (i64)]
// [8 bytes: end (i64)]
// [4 bytes: quark (u32)]
// [value encoding as above]
// ```

#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod interval;
pub mod saturated;
pub mod value;

pub use codec::ByteReader;
pub use error::{ValueError, ValueResult};
pub use interval::{StateInterval, INTERVAL_FIXED_SIZE};
pub use value::{StateValue, ValueType};

/// Integer identifier of one attribute in the attribute tree.
pub type Quark = u32;

/// Sentinel quark standing for the (unnamed) root of the attribute tree.
///
/// The root is never stored as a real attribute; quark `0` is the first
/// attribute created beneath it.
pub const ROOT_QUARK: Quark = u32::MAX;

/// Timestamp unit used throughout: a signed 64-bit tick count.
pub type Timestamp = i64;
