// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Closed time intervals during which one attribute held one value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::ByteReader;
use crate::error::ValueResult;
use crate::saturated::saturated_add;
use crate::value::StateValue;
use crate::{Quark, Timestamp};

/// Fixed part of an encoded interval: start, end and quark.
pub const INTERVAL_FIXED_SIZE: usize = 8 + 8 + 4;

/// `[start, end]` (both inclusive) during which `quark` held `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInterval {
    pub start: Timestamp,
    pub end: Timestamp,
    pub quark: Quark,
    pub value: StateValue,
}

impl StateInterval {
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Self {
        Self {
            start,
            end,
            quark,
            value,
        }
    }

    /// True if `t` lies within `[start, end]`.
    #[inline]
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// True if this interval shares at least one timestamp with `[t1, t2]`.
    #[inline]
    pub fn intersects(&self, t1: Timestamp, t2: Timestamp) -> bool {
        self.start <= t2 && t1 <= self.end
    }

    /// Number of timestamps covered, clamped to `i64::MAX`.
    pub fn duration(&self) -> i64 {
        saturated_add(self.end.saturating_sub(self.start), 1)
    }

    pub fn size_on_disk(&self) -> usize {
        INTERVAL_FIXED_SIZE + self.value.size_on_disk()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> ValueResult<()> {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.end.to_le_bytes());
        out.extend_from_slice(&self.quark.to_le_bytes());
        self.value.encode_into(out)
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> ValueResult<Self> {
        let start = reader.i64()?;
        let end = reader.i64()?;
        let quark = reader.u32()?;
        let value = StateValue::decode(reader)?;
        Ok(Self::new(start, end, quark, value))
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}] q{} = {}", self.start, self.end, self.quark, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_inclusive() {
        let iv = StateInterval::new(10, 20, 0, StateValue::Int(1));
        assert!(iv.contains(10));
        assert!(iv.contains(20));
        assert!(!iv.contains(9));
        assert!(!iv.contains(21));
    }

    #[test]
    fn test_intersects() {
        let iv = StateInterval::new(10, 20, 0, StateValue::Null);
        assert!(iv.intersects(0, 10));
        assert!(iv.intersects(20, 30));
        assert!(iv.intersects(12, 13));
        assert!(!iv.intersects(21, 30));
        assert!(!iv.intersects(0, 9));
    }

    #[test]
    fn test_duration_saturates() {
        assert_eq!(StateInterval::new(5, 5, 0, StateValue::Null).duration(), 1);
        assert_eq!(
            StateInterval::new(i64::MIN, i64::MAX, 0, StateValue::Null).duration(),
            i64::MAX
        );
    }

    #[test]
    fn test_encoding_size_matches() {
        let iv = StateInterval::new(-1001, -991, 7, StateValue::from("idle"));
        let mut buf = Vec::new();
        iv.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), iv.size_on_disk());
        assert_eq!(StateInterval::decode(&mut ByteReader::new(&buf)).unwrap(), iv);
    }

    #[test]
    fn test_truncated_interval_rejected() {
        let iv = StateInterval::new(1, 2, 3, StateValue::Long(4));
        let mut buf = Vec::new();
        iv.encode_into(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(StateInterval::decode(&mut ByteReader::new(&buf)).is_err());
    }
}
