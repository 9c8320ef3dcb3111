// SPDX-License-Identifier: PMPL-1.0-or-later
//
// LRU cache of decoded nodes, keyed by sequence number.
//
// Only closed nodes are cached; they are immutable once flushed, so a cached
// `Arc<HtNode>` never goes stale.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::node::HtNode;

/// Hit/miss counters of a [`NodeCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    node: Arc<HtNode>,
    last_used: u64,
}

pub struct NodeCache {
    capacity: usize,
    slots: HashMap<u32, Slot>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl NodeCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: HashMap::with_capacity(capacity),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, seq: u32) -> Option<Arc<HtNode>> {
        self.tick += 1;
        match self.slots.get_mut(&seq) {
            Some(slot) => {
                slot.last_used = self.tick;
                self.hits += 1;
                Some(Arc::clone(&slot.node))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, node: Arc<HtNode>) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        let seq = node.seq();
        if !self.slots.contains_key(&seq) && self.slots.len() >= self.capacity {
            self.evict_lru();
        }
        self.slots.insert(
            seq,
            Slot {
                node,
                last_used: self.tick,
            },
        );
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(seq, _)| *seq);
        if let Some(seq) = oldest {
            self.slots.remove(&seq);
            self.evictions += 1;
            trace!(seq, "Evicted node from cache");
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.slots.len(),
            capacity: self.capacity,
        }
    }
}
