// SPDX-License-Identifier: PMPL-1.0-or-later
//
// The history tree: a shallow multi-way tree of fixed-size nodes keyed by
// time.
//
// The builder only ever works on the *latest branch*, the root-to-leaf path
// of nodes that are still open. An interval goes into the deepest branch
// node whose start is at or before the interval's start. When that node is
// full, it and everything below it are closed at the current tree end,
// flushed, and replaced by fresh nodes starting one tick later. When the
// root itself would have to split, a new root is grown above it.
//
// Closed nodes are written once and never modified. Queries walk the open
// branch under a read lock, then continue on flushed nodes without it.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use statehist_core::saturated::saturated_add;
use statehist_core::{Quark, StateInterval, Timestamp};

use crate::cache::CacheStats;
use crate::config::HtConfig;
use crate::error::{TreeError, TreeResult};
use crate::format::TreeHeader;
use crate::io::HtIo;
use crate::node::{HtNode, NO_PARENT};

/// Summary of a history tree, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeInfo {
    pub path: String,
    pub provider_version: u32,
    pub block_size: usize,
    pub max_children: usize,
    pub node_count: u32,
    pub depth: usize,
    pub root_seq: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub file_size: u64,
    pub sealed: bool,
}

struct TreeState {
    /// Open nodes, root first. Empty once sealed.
    branch: Vec<HtNode>,
    tree_end: Timestamp,
    node_count: u32,
    root_seq: u32,
    depth: usize,
    /// Present once the tree is sealed or was reopened from disk.
    header: Option<TreeHeader>,
}

impl TreeState {
    fn next_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }

    fn is_sealed(&self) -> bool {
        self.header.is_some()
    }
}

/// File-backed history tree.
pub struct HistoryTree {
    config: HtConfig,
    io: HtIo,
    state: RwLock<TreeState>,
}

impl HistoryTree {
    /// Create an empty tree, truncating any file at `config.path`.
    pub fn create(config: HtConfig) -> TreeResult<Self> {
        config.validate()?;
        let io = HtIo::create(
            &config.path,
            config.block_size,
            config.max_children,
            config.node_cache_capacity,
        )?;
        let root = HtNode::new_leaf(0, NO_PARENT, config.tree_start, config.block_size);
        info!(
            path = %config.path.display(),
            start = config.tree_start,
            provider_version = config.provider_version,
            "Created history tree"
        );
        Ok(Self {
            state: RwLock::new(TreeState {
                branch: vec![root],
                tree_end: config.tree_start,
                node_count: 1,
                root_seq: 0,
                depth: 1,
                header: None,
            }),
            config,
            io,
        })
    }

    /// Open a sealed tree for reading.
    ///
    /// `config.provider_version` must match the stored one unless it is
    /// [`ANY_PROVIDER_VERSION`](crate::config::ANY_PROVIDER_VERSION). Sizing
    /// and start time are taken from the file.
    pub fn open_existing(config: &HtConfig) -> TreeResult<Self> {
        let (mut io, header_block) = HtIo::open(&config.path, config.node_cache_capacity)?;
        let header = TreeHeader::decode(&header_block, config.provider_version, &config.path)?;
        let block_size = header.block_size as usize;
        let max_children = header.max_children as usize;
        io.set_geometry(block_size, max_children);

        let expected_offset = TreeHeader::node_offset(block_size, header.node_count);
        if header.attribute_offset != expected_offset {
            return Err(TreeError::corrupt(
                &config.path,
                format!(
                    "attribute tree at {} but {} nodes end at {expected_offset}",
                    header.attribute_offset, header.node_count
                ),
            ));
        }
        let file_size = io.file_size()?;
        if file_size < header.attribute_offset + header.attribute_len {
            return Err(TreeError::corrupt(
                &config.path,
                format!("file truncated to {file_size} bytes"),
            ));
        }

        let root = io.read_node(header.root_seq)?;
        if root.start() != header.start {
            return Err(TreeError::corrupt(
                &config.path,
                format!("root starts at {} but tree at {}", root.start(), header.start),
            ));
        }

        // Follow the last child of each level to find the depth of the
        // latest branch.
        let mut depth = 1;
        let mut node = root;
        while let Some(child) = node.children().last().copied() {
            if child.seq >= header.node_count || depth > header.node_count as usize {
                return Err(TreeError::corrupt(
                    &config.path,
                    format!("child pointer {} outside {} nodes", child.seq, header.node_count),
                ));
            }
            node = io.read_node(child.seq)?;
            depth += 1;
        }

        let config = HtConfig {
            block_size,
            max_children,
            provider_version: header.provider_version,
            tree_start: header.start,
            ..config.clone()
        };
        info!(
            path = %config.path.display(),
            nodes = header.node_count,
            depth,
            start = header.start,
            end = header.end,
            "Opened history tree"
        );
        Ok(Self {
            state: RwLock::new(TreeState {
                branch: Vec::new(),
                tree_end: header.end,
                node_count: header.node_count,
                root_seq: header.root_seq,
                depth,
                header: Some(header),
            }),
            config,
            io,
        })
    }

    fn read_state(&self) -> TreeResult<RwLockReadGuard<'_, TreeState>> {
        self.state.read().map_err(|_| TreeError::LockPoisoned)
    }

    fn write_state(&self) -> TreeResult<RwLockWriteGuard<'_, TreeState>> {
        self.state.write().map_err(|_| TreeError::LockPoisoned)
    }

    pub fn config(&self) -> &HtConfig {
        &self.config
    }

    pub fn start_time(&self) -> Timestamp {
        self.config.tree_start
    }

    /// Largest end time inserted so far, or the sealed end.
    pub fn end_time(&self) -> TreeResult<Timestamp> {
        Ok(self.read_state()?.tree_end)
    }

    pub fn node_count(&self) -> TreeResult<u32> {
        Ok(self.read_state()?.node_count)
    }

    pub fn depth(&self) -> TreeResult<usize> {
        Ok(self.read_state()?.depth)
    }

    pub fn is_sealed(&self) -> TreeResult<bool> {
        Ok(self.read_state()?.is_sealed())
    }

    pub fn cache_stats(&self) -> TreeResult<CacheStats> {
        self.io.cache_stats()
    }

    pub fn info(&self) -> TreeResult<TreeInfo> {
        let st = self.read_state()?;
        Ok(TreeInfo {
            path: self.config.path.display().to_string(),
            provider_version: self.config.provider_version,
            block_size: self.config.block_size,
            max_children: self.config.max_children,
            node_count: st.node_count,
            depth: st.depth,
            root_seq: st.root_seq,
            start: self.config.tree_start,
            end: st.tree_end,
            file_size: self.io.file_size()?,
            sealed: st.is_sealed(),
        })
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    /// Store one closed interval.
    ///
    /// The interval must start at or after the tree start and end at or
    /// after every interval inserted before it.
    pub fn insert(&self, interval: StateInterval) -> TreeResult<()> {
        let mut st = self.write_state()?;
        if st.is_sealed() {
            return Err(TreeError::ReadOnly);
        }
        if interval.start < self.config.tree_start || interval.start > interval.end {
            return Err(TreeError::TimeRange {
                time: interval.start,
                start: self.config.tree_start,
                end: interval.end,
            });
        }
        if interval.end < st.tree_end {
            return Err(TreeError::TimeRange {
                time: interval.end,
                start: st.tree_end,
                end: Timestamp::MAX,
            });
        }
        let size = interval.size_on_disk();
        let capacity = self.config.core_capacity();
        if size > capacity {
            return Err(TreeError::IntervalTooLarge { size, capacity });
        }

        let mut idx = st.branch.len() - 1;
        loop {
            let node = &st.branch[idx];
            if interval.start < node.start() && idx > 0 {
                idx -= 1;
                continue;
            }
            if size > node.free_space() {
                self.add_sibling(&mut st, idx)?;
                idx = st.branch.len() - 1;
                continue;
            }
            break;
        }
        st.tree_end = st.tree_end.max(interval.end);
        st.branch[idx].add_interval(interval);
        Ok(())
    }

    /// Close `branch[idx..]` and open fresh nodes in their place, under the
    /// deepest ancestor that can take another child.
    fn add_sibling(&self, st: &mut TreeState, idx: usize) -> TreeResult<()> {
        let mut idx = idx;
        loop {
            if idx == 0 {
                return self.add_new_root(st);
            }
            if !st.branch[idx - 1].is_full_of_children() {
                break;
            }
            idx -= 1;
        }

        let split = st.tree_end;
        let depth = st.branch.len();
        let closed: Vec<HtNode> = st.branch.drain(idx..).collect();
        let parent_seq = st.branch[idx - 1].seq();
        let first_seq = closed[0].seq();
        self.flush_closed(closed, split)?;
        st.branch[idx - 1].set_child_end(first_seq, split);
        debug!(
            level = idx,
            split,
            parent = parent_seq,
            "Closed branch and opened sibling"
        );
        self.open_branch_from(st, idx, depth, split)
    }

    /// Grow a new root above the current one and restart the branch.
    fn add_new_root(&self, st: &mut TreeState) -> TreeResult<()> {
        let split = st.tree_end;
        let depth = st.branch.len();
        let new_root_seq = st.next_seq();

        let mut closed: Vec<HtNode> = st.branch.drain(..).collect();
        let old_root_seq = closed[0].seq();
        closed[0].set_parent_seq(new_root_seq);
        self.flush_closed(closed, split)?;

        let mut root = HtNode::new_core(
            new_root_seq,
            NO_PARENT,
            self.config.tree_start,
            self.config.block_size,
            self.config.max_children,
        );
        root.link_child(old_root_seq, self.config.tree_start);
        root.set_child_end(old_root_seq, split);
        st.branch.push(root);
        st.root_seq = new_root_seq;
        st.depth = depth + 1;
        info!(
            root = new_root_seq,
            depth = st.depth,
            split,
            "Grew new history tree root"
        );
        self.open_branch_from(st, 1, depth + 1, split)
    }

    /// Close a detached run of branch nodes (shallowest first) at `end`,
    /// record each child's end in its parent, and write them out.
    fn flush_closed(&self, mut nodes: Vec<HtNode>, end: Timestamp) -> TreeResult<()> {
        for j in (0..nodes.len()).rev() {
            nodes[j].close(end);
            if j > 0 {
                let seq = nodes[j].seq();
                nodes[j - 1].set_child_end(seq, end);
            }
        }
        for node in nodes {
            self.io.write_node(node)?;
        }
        Ok(())
    }

    /// Append fresh nodes to the branch until it is `depth` long, all
    /// starting just after `split`. The last one is a leaf.
    fn open_branch_from(
        &self,
        st: &mut TreeState,
        from: usize,
        depth: usize,
        split: Timestamp,
    ) -> TreeResult<()> {
        let start = saturated_add(split, 1);
        for level in from..depth {
            let seq = st.next_seq();
            let parent = st.branch[level - 1].seq();
            let node = if level == depth - 1 {
                HtNode::new_leaf(seq, parent, start, self.config.block_size)
            } else {
                HtNode::new_core(
                    seq,
                    parent,
                    start,
                    self.config.block_size,
                    self.config.max_children,
                )
            };
            st.branch[level - 1].link_child(seq, start);
            st.branch.push(node);
        }
        Ok(())
    }

    /// Seal the tree: close the latest branch at `end` (or the current tree
    /// end if later), append the attribute tree snapshot and write the
    /// header. Returns the effective end time.
    pub fn close_tree(&self, end: Timestamp, attribute_tree: &[u8]) -> TreeResult<Timestamp> {
        let mut st = self.write_state()?;
        if st.is_sealed() {
            return Err(TreeError::ReadOnly);
        }
        let end = end.max(st.tree_end);
        let branch: Vec<HtNode> = st.branch.drain(..).collect();
        self.flush_closed(branch, end)?;

        let block_size = self.config.block_size;
        let attribute_offset = TreeHeader::node_offset(block_size, st.node_count);
        self.io.write_at(attribute_offset, attribute_tree)?;

        let header = TreeHeader {
            provider_version: self.config.provider_version,
            block_size: block_size as u32,
            max_children: self.config.max_children as u32,
            node_count: st.node_count,
            root_seq: st.root_seq,
            start: self.config.tree_start,
            end,
            attribute_offset,
            attribute_len: attribute_tree.len() as u64,
            attribute_crc: crc32fast::hash(attribute_tree),
        };
        self.io.write_at(0, &header.encode())?;
        self.io.sync()?;

        st.tree_end = end;
        st.header = Some(header);
        info!(
            path = %self.config.path.display(),
            nodes = st.node_count,
            depth = st.depth,
            end,
            "Sealed history tree"
        );
        Ok(end)
    }

    /// The attribute tree snapshot stored when the tree was sealed.
    pub fn attribute_tree_bytes(&self) -> TreeResult<Vec<u8>> {
        let header = self
            .read_state()?
            .header
            .clone()
            .ok_or_else(|| TreeError::InvalidConfig("history tree is not sealed".to_string()))?;
        let len = usize::try_from(header.attribute_len).map_err(|_| {
            TreeError::corrupt(&self.config.path, "attribute tree length overflows")
        })?;
        let bytes = self.io.read_at(header.attribute_offset, len)?;
        let crc = crc32fast::hash(&bytes);
        if crc != header.attribute_crc {
            return Err(TreeError::corrupt(
                &self.config.path,
                format!(
                    "attribute tree CRC mismatch: stored {:#010x}, computed {crc:#010x}",
                    header.attribute_crc
                ),
            ));
        }
        Ok(bytes)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn check_query_time(&self, st: &TreeState, t: Timestamp) -> TreeResult<()> {
        let start = self.config.tree_start;
        if t < start || (st.is_sealed() && t > st.tree_end) {
            return Err(TreeError::TimeRange {
                time: t,
                start,
                end: st.tree_end,
            });
        }
        Ok(())
    }

    /// Visit every node on the root-to-leaf path covering `t` until `visit`
    /// returns true.
    fn walk_path<F>(&self, t: Timestamp, mut visit: F) -> TreeResult<()>
    where
        F: FnMut(&HtNode) -> bool,
    {
        let mut next = None;
        {
            let st = self.read_state()?;
            self.check_query_time(&st, t)?;
            if st.branch.is_empty() {
                next = Some(st.root_seq);
            } else {
                for (level, node) in st.branch.iter().enumerate() {
                    if visit(node) {
                        return Ok(());
                    }
                    match node.select_child(t) {
                        Some(child) if st.branch.get(level + 1).map(HtNode::seq) == Some(child.seq) => {}
                        Some(child) => {
                            next = Some(child.seq);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        while let Some(seq) = next {
            let node = self.io.read_node(seq)?;
            if visit(node.as_ref()) {
                return Ok(());
            }
            next = node.select_child(t).map(|c| c.seq);
        }
        Ok(())
    }

    /// The stored interval of `quark` covering `t`, if any.
    pub fn query(&self, t: Timestamp, quark: Quark) -> TreeResult<Option<StateInterval>> {
        let mut found = None;
        self.walk_path(t, |node| {
            found = node.relevant_interval(quark, t).cloned();
            found.is_some()
        })?;
        Ok(found)
    }

    /// Fill `out[q]` with the stored interval covering `t` for every quark
    /// `q < out.len()` that has one.
    pub fn query_full(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> TreeResult<()> {
        self.walk_path(t, |node| {
            node.write_info(out, t);
            false
        })
    }

    /// All stored intervals of the given quarks intersecting `[t1, t2]`, in
    /// no particular order.
    pub fn query_2d(
        &self,
        quarks: &HashSet<Quark>,
        t1: Timestamp,
        t2: Timestamp,
    ) -> TreeResult<Vec<StateInterval>> {
        let keep = |q: Quark| quarks.contains(&q);
        let mut out = Vec::new();
        let mut pending = Vec::new();
        {
            let st = self.read_state()?;
            if t1 > t2 {
                return Err(TreeError::TimeRange {
                    time: t1,
                    start: self.config.tree_start,
                    end: t2,
                });
            }
            if st.branch.is_empty() {
                pending.push(st.root_seq);
            }
            for (level, node) in st.branch.iter().enumerate() {
                out.extend(node.intervals_intersecting(t1, t2, keep).cloned());
                let open_child = st.branch.get(level + 1).map(HtNode::seq);
                pending.extend(
                    node.children_intersecting(t1, t2)
                        .map(|c| c.seq)
                        .filter(|seq| Some(*seq) != open_child),
                );
            }
        }
        while let Some(seq) = pending.pop() {
            let node = self.io.read_node(seq)?;
            out.extend(node.intervals_intersecting(t1, t2, keep).cloned());
            pending.extend(node.children_intersecting(t1, t2).map(|c| c.seq));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Diagnostics and lifecycle
    // -----------------------------------------------------------------------

    /// A node by sequence number, from the open branch or from disk.
    pub fn node(&self, seq: u32) -> TreeResult<Arc<HtNode>> {
        {
            let st = self.read_state()?;
            if let Some(node) = st.branch.iter().find(|n| n.seq() == seq) {
                return Ok(Arc::new(node.clone()));
            }
            if seq >= st.node_count {
                return Err(TreeError::InvalidConfig(format!(
                    "no node {seq} among {}",
                    st.node_count
                )));
            }
        }
        self.io.read_node(seq)
    }

    /// Pre-order dump of the tree, one node per line, indented by depth.
    pub fn dump<W: Write>(&self, out: &mut W, print_intervals: bool) -> TreeResult<()> {
        let root_seq = self.read_state()?.root_seq;
        let mut stack = vec![(root_seq, 0usize)];
        while let Some((seq, level)) = stack.pop() {
            let node = self.node(seq)?;
            writeln!(out, "{:indent$}{node}", "", indent = level * 2)?;
            if print_intervals {
                for iv in node.intervals() {
                    writeln!(out, "{:indent$}  {iv}", "", indent = level * 2)?;
                }
            }
            for child in node.children().iter().rev() {
                stack.push((child.seq, level + 1));
            }
        }
        Ok(())
    }

    /// Delete the history file.
    pub fn remove_files(&self) -> TreeResult<()> {
        self.io.clear_cache()?;
        match std::fs::remove_file(&self.config.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop cached nodes.
    pub fn dispose(&self) -> TreeResult<()> {
        self.io.clear_cache()
    }
}
