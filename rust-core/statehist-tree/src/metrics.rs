// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Metrics-collecting wrapper for history backends.
//
// Wraps any `HistoryBackend` and transparently counts inserts and queries
// and sums their wall-clock latency. Used by the benchmarks and the
// inspection CLI to compare backends and cache settings.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use statehist_core::{Quark, StateInterval, StateValue, Timestamp};

use crate::backend::HistoryBackend;
use crate::error::{TreeError, TreeResult};

/// Accumulated statistics for a history backend.
///
/// All counters are monotonically increasing until
/// [`MetricsBackend::reset_stats`] is called.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Number of intervals inserted.
    pub insert_count: u64,
    /// Number of single-quark point queries.
    pub single_query_count: u64,
    /// Number of full-state point queries.
    pub full_query_count: u64,
    /// Number of 2D (quarks x time window) queries.
    pub range_query_count: u64,
    /// Cumulative latency of all inserts, in milliseconds.
    pub insert_latency_sum_ms: f64,
    /// Cumulative latency of all queries, in milliseconds.
    pub query_latency_sum_ms: f64,
    /// Intervals handed back by all queries.
    pub intervals_returned: u64,
}

/// A history backend wrapper that collects operation metrics.
pub struct MetricsBackend<B: HistoryBackend> {
    inner: B,
    stats: Mutex<BackendStats>,
}

impl<B: HistoryBackend> MetricsBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            stats: Mutex::new(BackendStats::default()),
        }
    }

    /// Snapshot of the current statistics.
    pub fn stats(&self) -> TreeResult<BackendStats> {
        Ok(self
            .stats
            .lock()
            .map_err(|_| TreeError::LockPoisoned)?
            .clone())
    }

    pub fn reset_stats(&self) -> TreeResult<()> {
        *self.stats.lock().map_err(|_| TreeError::LockPoisoned)? = BackendStats::default();
        Ok(())
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn record<F>(&self, started: Instant, update: F) -> TreeResult<()>
    where
        F: FnOnce(&mut BackendStats, f64),
    {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut s = self.stats.lock().map_err(|_| TreeError::LockPoisoned)?;
        update(&mut s, elapsed_ms);
        Ok(())
    }
}

impl<B: HistoryBackend> HistoryBackend for MetricsBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start_time(&self) -> Timestamp {
        self.inner.start_time()
    }

    fn end_time(&self) -> TreeResult<Timestamp> {
        self.inner.end_time()
    }

    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> TreeResult<()> {
        let started = Instant::now();
        let result = self.inner.insert_past_state(start, end, quark, value);
        self.record(started, |s, ms| {
            s.insert_count += 1;
            s.insert_latency_sum_ms += ms;
        })?;
        result
    }

    fn finished_building(&self, end: Timestamp, attribute_tree: &[u8]) -> TreeResult<Timestamp> {
        self.inner.finished_building(end, attribute_tree)
    }

    fn attribute_tree_bytes(&self) -> TreeResult<Vec<u8>> {
        self.inner.attribute_tree_bytes()
    }

    fn is_sealed(&self) -> TreeResult<bool> {
        self.inner.is_sealed()
    }

    fn do_query(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> TreeResult<()> {
        let started = Instant::now();
        let before = out.iter().filter(|slot| slot.is_some()).count();
        let result = self.inner.do_query(out, t);
        let after = out.iter().filter(|slot| slot.is_some()).count();
        self.record(started, |s, ms| {
            s.full_query_count += 1;
            s.query_latency_sum_ms += ms;
            s.intervals_returned += (after - before) as u64;
        })?;
        result
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> TreeResult<Option<StateInterval>> {
        let started = Instant::now();
        let result = self.inner.do_single_query(t, quark);
        let found = matches!(result, Ok(Some(_)));
        self.record(started, |s, ms| {
            s.single_query_count += 1;
            s.query_latency_sum_ms += ms;
            s.intervals_returned += u64::from(found);
        })?;
        result
    }

    fn query_2d(
        &self,
        quarks: &HashSet<Quark>,
        t1: Timestamp,
        t2: Timestamp,
    ) -> TreeResult<Vec<StateInterval>> {
        let started = Instant::now();
        let result = self.inner.query_2d(quarks, t1, t2);
        let returned = result.as_ref().map_or(0, Vec::len);
        self.record(started, |s, ms| {
            s.range_query_count += 1;
            s.query_latency_sum_ms += ms;
            s.intervals_returned += returned as u64;
        })?;
        result
    }

    fn remove_files(&self) -> TreeResult<()> {
        self.inner.remove_files()
    }

    fn dispose(&self) -> TreeResult<()> {
        self.inner.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    #[test]
    fn test_counts_operations() {
        let metered = MetricsBackend::new(InMemoryBackend::new(0));
        metered.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        metered.insert_past_state(0, 9, 1, StateValue::Int(2)).unwrap();
        metered.do_single_query(5, 0).unwrap();
        metered.do_single_query(5, 7).unwrap();
        let mut out = vec![None; 2];
        metered.do_query(&mut out, 3).unwrap();

        let stats = metered.stats().unwrap();
        assert_eq!(stats.insert_count, 2);
        assert_eq!(stats.single_query_count, 2);
        assert_eq!(stats.full_query_count, 1);
        assert_eq!(stats.intervals_returned, 3);
        assert_eq!(metered.name(), "in-memory");
    }

    #[test]
    fn test_failed_insert_still_counted() {
        let metered = MetricsBackend::new(InMemoryBackend::new(10));
        assert!(metered.insert_past_state(0, 1, 0, StateValue::Null).is_err());
        assert_eq!(metered.stats().unwrap().insert_count, 1);
    }

    #[test]
    fn test_reset() {
        let metered = MetricsBackend::new(InMemoryBackend::new(0));
        metered.insert_past_state(0, 1, 0, StateValue::Null).unwrap();
        metered.reset_stats().unwrap();
        assert_eq!(metered.stats().unwrap(), BackendStats::default());
        assert_eq!(metered.inner().len().unwrap(), 1);
    }
}
