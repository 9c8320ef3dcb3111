// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Lazy range queries.

use statehist_core::{Quark, StateInterval, Timestamp};

use crate::error::StateSystemResult;
use crate::system::StateSystem;

/// Successive intervals of one quark across `[t1, t2]`.
///
/// Each step is a single-state query at the end of the previous interval
/// plus one, so intervals come out in time order and tile the range. The
/// iterator ends after the interval reaching `t2`, after an ongoing
/// interval, or after the first error. Dropping it abandons the query.
///
/// Every step re-descends the tree from the root. Consecutive intervals
/// usually sit in the same or neighbouring nodes, so after the first step
/// the descent is served from the node cache.
#[derive(Debug)]
pub struct RangeIter<'a> {
    system: &'a StateSystem,
    quark: Quark,
    next: Timestamp,
    t2: Timestamp,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(system: &'a StateSystem, quark: Quark, t1: Timestamp, t2: Timestamp) -> Self {
        Self {
            system,
            quark,
            next: t1,
            t2,
            done: false,
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = StateSystemResult<StateInterval>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.system.lookup(self.next, self.quark) {
            Ok((iv, ongoing)) => {
                if ongoing || iv.end >= self.t2 || iv.end == Timestamp::MAX {
                    self.done = true;
                } else {
                    self.next = iv.end + 1;
                }
                Some(Ok(iv))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use statehist_core::StateValue;
    use statehist_tree::{HistoryBackend, InMemoryBackend, MetricsBackend};

    use crate::error::StateSystemError;

    use super::*;

    #[test]
    fn test_range_tiles_window() {
        let ss = StateSystem::new(Arc::new(InMemoryBackend::new(0)));
        let q = ss.get_quark_absolute_and_add(&["q"]).unwrap();
        for t in (10..100).step_by(10) {
            ss.modify_attribute(t, StateValue::Long(t), q).unwrap();
        }
        ss.close_history(100).unwrap();

        let ivs: Vec<_> = ss
            .query_range(q, 25, 55)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let bounds: Vec<_> = ivs.iter().map(|iv| (iv.start, iv.end)).collect();
        assert_eq!(bounds, vec![(20, 29), (30, 39), (40, 49), (50, 59)]);
    }

    #[test]
    fn test_range_stops_at_ongoing_interval() {
        let ss = StateSystem::new(Arc::new(InMemoryBackend::new(0)));
        let q = ss.get_quark_absolute_and_add(&["q"]).unwrap();
        ss.modify_attribute(10, StateValue::Int(1), q).unwrap();

        let ivs: Vec<_> = ss
            .query_range(q, 0, 1_000_000)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ivs.len(), 2);
        assert_eq!((ivs[1].start, ivs[1].value.clone()), (10, StateValue::Int(1)));
    }

    #[test]
    fn test_range_clamped_to_sealed_end() {
        let ss = StateSystem::new(Arc::new(InMemoryBackend::new(0)));
        let q = ss.get_quark_absolute_and_add(&["q"]).unwrap();
        ss.modify_attribute(100, StateValue::from("running"), q).unwrap();
        ss.close_history(300).unwrap();

        let ivs: Vec<_> = ss
            .query_range(q, 0, 500)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let bounds: Vec<_> = ivs.iter().map(|iv| (iv.start, iv.end)).collect();
        assert_eq!(bounds, vec![(0, 99), (100, 300)]);

        assert!(matches!(
            ss.query_range(q, 301, 500),
            Err(StateSystemError::TimeRange { .. })
        ));
    }

    #[test]
    fn test_range_is_lazy() {
        let backend = Arc::new(MetricsBackend::new(InMemoryBackend::new(0)));
        let ss = StateSystem::new(Arc::clone(&backend) as Arc<dyn HistoryBackend>);
        let q = ss.get_quark_absolute_and_add(&["q"]).unwrap();
        for t in (10..100).step_by(10) {
            ss.modify_attribute(t, StateValue::Long(t), q).unwrap();
        }
        ss.close_history(100).unwrap();
        backend.reset_stats().unwrap();

        let first: Vec<_> = ss.query_range(q, 0, 100).unwrap().take(3).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(backend.stats().unwrap().single_query_count, 3);

        let all = ss.query_range(q, 0, 100).unwrap().count();
        assert_eq!(all, 10);
        assert_eq!(backend.stats().unwrap().single_query_count, 13);
    }
}
