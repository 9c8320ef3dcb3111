// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Storage backend trait for closed state intervals.
//
// The state system talks to its storage only through `HistoryBackend`. The
// file-backed history tree is the production implementation; the in-memory
// backend and the metrics wrapper satisfy the same contract. Backends are
// shared between one builder thread and any number of query threads, so
// every method takes `&self` and implementations use interior locking.

use std::collections::HashSet;

use statehist_core::{Quark, StateInterval, StateValue, Timestamp};

use crate::config::HtConfig;
use crate::error::TreeResult;
use crate::tree::HistoryTree;

/// Storage for the intervals produced by a state system.
pub trait HistoryBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Earliest timestamp covered.
    fn start_time(&self) -> Timestamp;

    /// Latest end time stored so far, or the sealed end.
    fn end_time(&self) -> TreeResult<Timestamp>;

    /// Store one closed interval. Intervals arrive with non-decreasing end
    /// times.
    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> TreeResult<()>;

    /// Seal the backend at `end` (or its current end if later), persisting
    /// the attribute tree snapshot alongside. Returns the effective end.
    fn finished_building(&self, end: Timestamp, attribute_tree: &[u8]) -> TreeResult<Timestamp>;

    /// The attribute tree snapshot persisted by `finished_building`.
    fn attribute_tree_bytes(&self) -> TreeResult<Vec<u8>>;

    /// True once `finished_building` has run (or the data was reopened).
    fn is_sealed(&self) -> TreeResult<bool>;

    /// Fill `out[q]` with the stored interval covering `t` for every quark
    /// `q < out.len()` whose slot is still `None`.
    fn do_query(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> TreeResult<()>;

    /// The stored interval of `quark` covering `t`, if any.
    fn do_single_query(&self, t: Timestamp, quark: Quark) -> TreeResult<Option<StateInterval>>;

    /// Stored intervals of the given quarks intersecting `[t1, t2]`,
    /// unordered.
    fn query_2d(
        &self,
        quarks: &HashSet<Quark>,
        t1: Timestamp,
        t2: Timestamp,
    ) -> TreeResult<Vec<StateInterval>>;

    /// Delete any files backing this store.
    fn remove_files(&self) -> TreeResult<()>;

    /// Release caches. The backend must not be queried afterwards.
    fn dispose(&self) -> TreeResult<()>;
}

/// `HistoryBackend` over a [`HistoryTree`] file.
pub struct HistoryTreeBackend {
    tree: HistoryTree,
}

impl std::fmt::Debug for HistoryTreeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryTreeBackend").finish_non_exhaustive()
    }
}

impl HistoryTreeBackend {
    /// Start a new history file (truncating any existing one).
    pub fn create(config: HtConfig) -> TreeResult<Self> {
        Ok(Self {
            tree: HistoryTree::create(config)?,
        })
    }

    /// Open a sealed history file for querying.
    pub fn open_existing(config: &HtConfig) -> TreeResult<Self> {
        Ok(Self {
            tree: HistoryTree::open_existing(config)?,
        })
    }

    pub fn tree(&self) -> &HistoryTree {
        &self.tree
    }
}

impl HistoryBackend for HistoryTreeBackend {
    fn name(&self) -> &str {
        "history-tree"
    }

    fn start_time(&self) -> Timestamp {
        self.tree.start_time()
    }

    fn end_time(&self) -> TreeResult<Timestamp> {
        self.tree.end_time()
    }

    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> TreeResult<()> {
        self.tree.insert(StateInterval::new(start, end, quark, value))
    }

    fn finished_building(&self, end: Timestamp, attribute_tree: &[u8]) -> TreeResult<Timestamp> {
        self.tree.close_tree(end, attribute_tree)
    }

    fn attribute_tree_bytes(&self) -> TreeResult<Vec<u8>> {
        self.tree.attribute_tree_bytes()
    }

    fn is_sealed(&self) -> TreeResult<bool> {
        self.tree.is_sealed()
    }

    fn do_query(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> TreeResult<()> {
        self.tree.query_full(out, t)
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> TreeResult<Option<StateInterval>> {
        self.tree.query(t, quark)
    }

    fn query_2d(
        &self,
        quarks: &HashSet<Quark>,
        t1: Timestamp,
        t2: Timestamp,
    ) -> TreeResult<Vec<StateInterval>> {
        self.tree.query_2d(quarks, t1, t2)
    }

    fn remove_files(&self) -> TreeResult<()> {
        self.tree.remove_files()
    }

    fn dispose(&self) -> TreeResult<()> {
        self.tree.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backend_delegates_to_tree() {
        let dir = TempDir::new().unwrap();
        let config = HtConfig::new(dir.path().join("b.ht"), 1, 0);
        let backend = HistoryTreeBackend::create(config.clone()).unwrap();
        assert_eq!(backend.name(), "history-tree");
        backend.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        assert!(!backend.is_sealed().unwrap());
        assert_eq!(backend.finished_building(20, b"at").unwrap(), 20);
        assert!(backend.is_sealed().unwrap());
        drop(backend);

        let reopened = HistoryTreeBackend::open_existing(&config).unwrap();
        assert_eq!(reopened.end_time().unwrap(), 20);
        assert_eq!(reopened.attribute_tree_bytes().unwrap(), b"at");
        let iv = reopened.do_single_query(5, 0).unwrap().unwrap();
        assert_eq!(iv.value, StateValue::Int(1));
        reopened.remove_files().unwrap();
        assert!(!config.path.exists());
    }
}
