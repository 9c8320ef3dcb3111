// SPDX-License-Identifier: PMPL-1.0-or-later
//
// In-memory history backend.
//
// Keeps every interval in one vector sorted by end time (inserts arrive in
// end order, so appending preserves it). Point queries binary-search the
// first interval ending at or after `t` and scan forward. Intended for tests
// and short-lived analyses; nothing is persisted.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard};

use statehist_core::{Quark, StateInterval, StateValue, Timestamp};

use crate::backend::HistoryBackend;
use crate::error::{TreeError, TreeResult};

#[derive(Debug)]
struct MemState {
    intervals: Vec<StateInterval>,
    end: Timestamp,
    attribute_tree: Option<Vec<u8>>,
}

/// A `HistoryBackend` holding all intervals in process memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    start: Timestamp,
    state: RwLock<MemState>,
}

impl InMemoryBackend {
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            state: RwLock::new(MemState {
                intervals: Vec::new(),
                end: start,
                attribute_tree: None,
            }),
        }
    }

    /// Number of intervals stored.
    pub fn len(&self) -> TreeResult<usize> {
        Ok(self.read()?.intervals.len())
    }

    pub fn is_empty(&self) -> TreeResult<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> TreeResult<RwLockReadGuard<'_, MemState>> {
        self.state.read().map_err(|_| TreeError::LockPoisoned)
    }

    fn check_time(&self, st: &MemState, t: Timestamp) -> TreeResult<()> {
        if t < self.start || (st.attribute_tree.is_some() && t > st.end) {
            return Err(TreeError::TimeRange {
                time: t,
                start: self.start,
                end: st.end,
            });
        }
        Ok(())
    }
}

fn first_ending_at_or_after(intervals: &[StateInterval], t: Timestamp) -> usize {
    intervals.partition_point(|iv| iv.end < t)
}

impl HistoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> TreeResult<Timestamp> {
        Ok(self.read()?.end)
    }

    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> TreeResult<()> {
        let mut st = self.state.write().map_err(|_| TreeError::LockPoisoned)?;
        if st.attribute_tree.is_some() {
            return Err(TreeError::ReadOnly);
        }
        if start < self.start || start > end {
            return Err(TreeError::TimeRange {
                time: start,
                start: self.start,
                end,
            });
        }
        if end < st.end {
            return Err(TreeError::TimeRange {
                time: end,
                start: st.end,
                end: Timestamp::MAX,
            });
        }
        st.end = end;
        st.intervals.push(StateInterval::new(start, end, quark, value));
        Ok(())
    }

    fn finished_building(&self, end: Timestamp, attribute_tree: &[u8]) -> TreeResult<Timestamp> {
        let mut st = self.state.write().map_err(|_| TreeError::LockPoisoned)?;
        if st.attribute_tree.is_some() {
            return Err(TreeError::ReadOnly);
        }
        st.end = st.end.max(end);
        st.attribute_tree = Some(attribute_tree.to_vec());
        Ok(st.end)
    }

    fn attribute_tree_bytes(&self) -> TreeResult<Vec<u8>> {
        self.read()?
            .attribute_tree
            .clone()
            .ok_or_else(|| TreeError::InvalidConfig("in-memory backend is not sealed".to_string()))
    }

    fn is_sealed(&self) -> TreeResult<bool> {
        Ok(self.read()?.attribute_tree.is_some())
    }

    fn do_query(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> TreeResult<()> {
        let st = self.read()?;
        self.check_time(&st, t)?;
        let from = first_ending_at_or_after(&st.intervals, t);
        for iv in &st.intervals[from..] {
            if iv.start <= t {
                if let Some(slot) = out.get_mut(iv.quark as usize) {
                    if slot.is_none() {
                        *slot = Some(iv.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> TreeResult<Option<StateInterval>> {
        let st = self.read()?;
        self.check_time(&st, t)?;
        let from = first_ending_at_or_after(&st.intervals, t);
        Ok(st.intervals[from..]
            .iter()
            .find(|iv| iv.quark == quark && iv.start <= t)
            .cloned())
    }

    fn query_2d(
        &self,
        quarks: &HashSet<Quark>,
        t1: Timestamp,
        t2: Timestamp,
    ) -> TreeResult<Vec<StateInterval>> {
        if t1 > t2 {
            return Err(TreeError::TimeRange {
                time: t1,
                start: self.start,
                end: t2,
            });
        }
        let st = self.read()?;
        let from = first_ending_at_or_after(&st.intervals, t1);
        Ok(st.intervals[from..]
            .iter()
            .filter(|iv| iv.start <= t2 && quarks.contains(&iv.quark))
            .cloned()
            .collect())
    }

    fn remove_files(&self) -> TreeResult<()> {
        Ok(())
    }

    fn dispose(&self) -> TreeResult<()> {
        let mut st = self.state.write().map_err(|_| TreeError::LockPoisoned)?;
        st.intervals.clear();
        st.intervals.shrink_to_fit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_times() {
        let backend = InMemoryBackend::new(-1001);
        let mut t = -1001;
        while t <= 200 {
            backend
                .insert_past_state(t, t + 10, 0, StateValue::Long(t))
                .unwrap();
            t += 10;
        }
        backend.finished_building(210, &[]).unwrap();
        let iv = backend.do_single_query(-1, 0).unwrap().unwrap();
        assert_eq!(iv.value, StateValue::Long(-11));
    }

    #[test]
    fn test_insert_before_start_rejected() {
        let backend = InMemoryBackend::new(100);
        let err = backend
            .insert_past_state(99, 101, 0, StateValue::Int(1))
            .unwrap_err();
        assert!(matches!(err, TreeError::TimeRange { time: 99, .. }));
    }

    #[test]
    fn test_full_query_and_window() {
        let backend = InMemoryBackend::new(0);
        backend.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        backend.insert_past_state(0, 19, 1, StateValue::Int(2)).unwrap();
        backend.insert_past_state(10, 19, 0, StateValue::Int(3)).unwrap();
        let mut out = vec![None; 2];
        backend.do_query(&mut out, 15).unwrap();
        assert_eq!(out[0].as_ref().unwrap().value, StateValue::Int(3));
        assert_eq!(out[1].as_ref().unwrap().value, StateValue::Int(2));

        let quarks: HashSet<Quark> = [0].into_iter().collect();
        assert_eq!(backend.query_2d(&quarks, 5, 12).unwrap().len(), 2);
        assert_eq!(backend.len().unwrap(), 3);
    }

    #[test]
    fn test_sealed_rejects_writes_and_late_queries() {
        let backend = InMemoryBackend::new(0);
        backend.insert_past_state(0, 5, 0, StateValue::Null).unwrap();
        assert_eq!(backend.finished_building(3, b"x").unwrap(), 5);
        assert!(matches!(
            backend.insert_past_state(6, 7, 0, StateValue::Null),
            Err(TreeError::ReadOnly)
        ));
        assert!(matches!(
            backend.do_single_query(6, 0),
            Err(TreeError::TimeRange { .. })
        ));
        assert_eq!(backend.attribute_tree_bytes().unwrap(), b"x");
    }
}
