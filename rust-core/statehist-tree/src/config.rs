// SPDX-License-Identifier: PMPL-1.0-or-later
//! History tree configuration.
//!
//! Defaults:
//! - block_size: 64 KiB
//! - max_children: 50
//! - node_cache_capacity: 256 nodes
//!
//! `STATEHIST_BLOCK_SIZE`, `STATEHIST_MAX_CHILDREN` and `STATEHIST_NODE_CACHE`
//! override the corresponding fields through [`HtConfig::apply_env`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use statehist_core::INTERVAL_FIXED_SIZE;

use crate::error::{TreeError, TreeResult};
use crate::node::core_overhead;

/// Default size of one node block on disk.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default fan-out of core nodes.
pub const DEFAULT_MAX_CHILDREN: usize = 50;

/// Default number of decoded nodes kept in memory.
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 256;

/// Upper bound on the block size (it is stored as a u32 and read whole).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Provider version accepted against any stored version on reopen.
pub const ANY_PROVIDER_VERSION: u32 = u32::MAX;

/// Parameters of one history tree file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtConfig {
    /// Location of the history file.
    pub path: PathBuf,
    /// Size in bytes of every node block.
    pub block_size: usize,
    /// Maximum number of children per core node.
    pub max_children: usize,
    /// Version of the logic that produced the intervals. A file is only
    /// reopened by a reader expecting the same version.
    pub provider_version: u32,
    /// Earliest timestamp the tree accepts.
    pub tree_start: i64,
    /// Decoded nodes kept in the LRU cache.
    pub node_cache_capacity: usize,
}

impl HtConfig {
    /// Configuration with default sizing for a new or existing file.
    pub fn new(path: impl AsRef<Path>, provider_version: u32, tree_start: i64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version,
            tree_start,
            node_cache_capacity: DEFAULT_NODE_CACHE_CAPACITY,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    pub fn with_node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    /// Overlay sizing values from the environment. Values that do not
    /// parse are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_usize("STATEHIST_BLOCK_SIZE") {
            self.block_size = v;
        }
        if let Some(v) = env_usize("STATEHIST_MAX_CHILDREN") {
            self.max_children = v;
        }
        if let Some(v) = env_usize("STATEHIST_NODE_CACHE") {
            self.node_cache_capacity = v;
        }
        self
    }

    /// Bytes available for intervals in an empty core node, the smallest
    /// node kind.
    pub fn core_capacity(&self) -> usize {
        self.block_size.saturating_sub(core_overhead(self.max_children))
    }

    /// Check that the sizing can hold at least a full core header and one
    /// interval.
    pub fn validate(&self) -> TreeResult<()> {
        if self.max_children < 2 {
            return Err(TreeError::InvalidConfig(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(TreeError::InvalidConfig(format!(
                "block_size {} exceeds maximum {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        let min_block = core_overhead(self.max_children).saturating_add(INTERVAL_FIXED_SIZE + 1);
        if self.block_size < min_block {
            return Err(TreeError::InvalidConfig(format!(
                "block_size {} too small for {} children (need at least {min_block})",
                self.block_size, self.max_children
            )));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
