// SPDX-License-Identifier: PMPL-1.0-or-later
//
// History tree nodes.
//
// A node covers a time range `[start, end]` and holds the intervals that
// were placed in it, sorted by end time. Core nodes additionally record, for
// each child, its sequence number and covered range. Leaf and core nodes
// share all traversal logic and differ only in `NodeKind`.
//
// ## Block layout (all integers little-endian)
//
// ```text
// [1 byte:  kind]                  -- 1=Core, 2=Leaf
// [8 bytes: start (i64)]
// [8 bytes: end (i64)]
// [4 bytes: sequence number]
// [4 bytes: parent sequence]       -- u32::MAX for the root
// [4 bytes: interval count]
// Core only:
//   [4 bytes: child count]
//   max_children x [4 bytes: seq][8 bytes: start][8 bytes: end]
// [intervals, packed]
// [zero padding]
// [4 bytes: crc32 of everything before it]
// ```
//
// The child table is reserved at full capacity so the space left for
// intervals does not change as children are linked.

use std::fmt;
use std::path::Path;

use statehist_core::{ByteReader, Quark, StateInterval, Timestamp, ValueError};

use crate::error::{TreeError, TreeResult};

/// Parent sequence recorded for the root node.
pub const NO_PARENT: u32 = u32::MAX;

/// End recorded for a child that is still on the latest branch.
pub const OPEN_END: Timestamp = Timestamp::MAX;

const KIND_CORE: u8 = 1;
const KIND_LEAF: u8 = 2;
const COMMON_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 4;
const CHILD_ENTRY_SIZE: usize = 4 + 8 + 8;
const TRAILER_SIZE: usize = 4;

/// Bytes of a core-node block not available for intervals.
///
/// Saturates instead of overflowing, so an absurd fan-out simply fails
/// the block-size check.
pub fn core_overhead(max_children: usize) -> usize {
    max_children
        .saturating_mul(CHILD_ENTRY_SIZE)
        .saturating_add(COMMON_HEADER_SIZE + 4 + TRAILER_SIZE)
}

/// Bytes of a leaf-node block not available for intervals.
pub fn leaf_overhead() -> usize {
    COMMON_HEADER_SIZE + TRAILER_SIZE
}

/// Pointer from a core node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub seq: u32,
    pub start: Timestamp,
    /// `OPEN_END` until the child is closed.
    pub end: Timestamp,
}

impl ChildRef {
    #[inline]
    pub fn intersects(&self, t1: Timestamp, t2: Timestamp) -> bool {
        self.start <= t2 && t1 <= self.end
    }
}

/// Child table of a core node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreData {
    max_children: usize,
    children: Vec<ChildRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Core(CoreData),
}

/// One node of the history tree, in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HtNode {
    seq: u32,
    parent_seq: u32,
    start: Timestamp,
    end: Option<Timestamp>,
    block_size: usize,
    kind: NodeKind,
    intervals: Vec<StateInterval>,
    used: usize,
}

impl HtNode {
    pub fn new_leaf(seq: u32, parent_seq: u32, start: Timestamp, block_size: usize) -> Self {
        Self::with_kind(seq, parent_seq, start, block_size, NodeKind::Leaf)
    }

    pub fn new_core(
        seq: u32,
        parent_seq: u32,
        start: Timestamp,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        let kind = NodeKind::Core(CoreData {
            max_children,
            children: Vec::with_capacity(max_children),
        });
        Self::with_kind(seq, parent_seq, start, block_size, kind)
    }

    fn with_kind(
        seq: u32,
        parent_seq: u32,
        start: Timestamp,
        block_size: usize,
        kind: NodeKind,
    ) -> Self {
        Self {
            seq,
            parent_seq,
            start,
            end: None,
            block_size,
            kind,
            intervals: Vec::new(),
            used: 0,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn parent_seq(&self) -> u32 {
        self.parent_seq
    }

    /// Re-parent a former root under a newly grown one.
    pub fn set_parent_seq(&mut self, parent_seq: u32) {
        self.parent_seq = parent_seq;
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// `None` while the node is on the latest branch.
    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn intervals(&self) -> &[StateInterval] {
        &self.intervals
    }

    fn overhead(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf => leaf_overhead(),
            NodeKind::Core(core) => core_overhead(core.max_children),
        }
    }

    /// Bytes available for intervals when the node is empty.
    pub fn capacity(&self) -> usize {
        self.block_size.saturating_sub(self.overhead())
    }

    pub fn free_space(&self) -> usize {
        self.capacity().saturating_sub(self.used)
    }

    /// Percentage of the interval area in use.
    pub fn usage_percent(&self) -> usize {
        match self.capacity() {
            0 => 100,
            cap => self.used * 100 / cap,
        }
    }

    /// Place an interval in this node, keeping intervals sorted by end.
    /// The caller checks [`HtNode::free_space`] first.
    pub fn add_interval(&mut self, interval: StateInterval) {
        debug_assert!(interval.size_on_disk() <= self.free_space());
        self.used += interval.size_on_disk();
        let idx = self.intervals.partition_point(|iv| iv.end <= interval.end);
        self.intervals.insert(idx, interval);
    }

    /// Seal the node's covered range. `end` may precede `start` for a node
    /// opened and closed at the same split point; such a node is empty.
    pub fn close(&mut self, end: Timestamp) {
        self.end = Some(end);
    }

    // -----------------------------------------------------------------------
    // Core node children
    // -----------------------------------------------------------------------

    pub fn children(&self) -> &[ChildRef] {
        match &self.kind {
            NodeKind::Core(core) => &core.children,
            NodeKind::Leaf => &[],
        }
    }

    /// True for a core node whose child table is full, and for leaves.
    pub fn is_full_of_children(&self) -> bool {
        match &self.kind {
            NodeKind::Core(core) => core.children.len() >= core.max_children,
            NodeKind::Leaf => true,
        }
    }

    /// Append a child starting at `start`. Ignored on leaves and on full
    /// core nodes; the tree checks [`HtNode::is_full_of_children`] first.
    pub fn link_child(&mut self, seq: u32, start: Timestamp) {
        if let NodeKind::Core(core) = &mut self.kind {
            if core.children.len() < core.max_children {
                core.children.push(ChildRef {
                    seq,
                    start,
                    end: OPEN_END,
                });
            }
        }
    }

    /// Record the final end of a child that was just closed.
    pub fn set_child_end(&mut self, seq: u32, end: Timestamp) {
        if let NodeKind::Core(core) = &mut self.kind {
            if let Some(child) = core.children.iter_mut().rev().find(|c| c.seq == seq) {
                child.end = end;
            }
        }
    }

    /// The child covering `t`: the last one whose start is at or before it.
    pub fn select_child(&self, t: Timestamp) -> Option<ChildRef> {
        let children = self.children();
        let idx = children.partition_point(|c| c.start <= t);
        idx.checked_sub(1).map(|i| children[i])
    }

    pub fn children_intersecting(
        &self,
        t1: Timestamp,
        t2: Timestamp,
    ) -> impl Iterator<Item = ChildRef> + '_ {
        self.children()
            .iter()
            .copied()
            .filter(move |c| c.intersects(t1, t2))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Index of the first interval whose end is at or after `t`.
    fn start_index_for(&self, t: Timestamp) -> usize {
        self.intervals.partition_point(|iv| iv.end < t)
    }

    /// The interval of `quark` covering `t`, if it lives in this node.
    pub fn relevant_interval(&self, quark: Quark, t: Timestamp) -> Option<&StateInterval> {
        self.intervals[self.start_index_for(t)..]
            .iter()
            .find(|iv| iv.quark == quark && iv.start <= t)
    }

    /// Fill `out[quark]` for every interval in this node covering `t`.
    /// Filled slots and quarks beyond `out.len()` are left alone.
    pub fn write_info(&self, out: &mut [Option<StateInterval>], t: Timestamp) {
        for iv in &self.intervals[self.start_index_for(t)..] {
            if iv.start <= t {
                match out.get_mut(iv.quark as usize) {
                    Some(slot) if slot.is_none() => *slot = Some(iv.clone()),
                    _ => {}
                }
            }
        }
    }

    /// Intervals intersecting `[t1, t2]` whose quark passes `keep`.
    pub fn intervals_intersecting<'a, F>(
        &'a self,
        t1: Timestamp,
        t2: Timestamp,
        keep: F,
    ) -> impl Iterator<Item = &'a StateInterval> + 'a
    where
        F: Fn(Quark) -> bool + 'a,
    {
        self.intervals[self.start_index_for(t1)..]
            .iter()
            .filter(move |iv| iv.start <= t2 && keep(iv.quark))
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Serialize into one `block_size` block. Only closed nodes are written.
    pub fn encode(&self) -> TreeResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.block_size);
        let kind = match self.kind {
            NodeKind::Core(_) => KIND_CORE,
            NodeKind::Leaf => KIND_LEAF,
        };
        buf.push(kind);
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.unwrap_or(OPEN_END).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.parent_seq.to_le_bytes());
        buf.extend_from_slice(&(self.intervals.len() as u32).to_le_bytes());

        if let NodeKind::Core(core) = &self.kind {
            buf.extend_from_slice(&(core.children.len() as u32).to_le_bytes());
            for child in &core.children {
                buf.extend_from_slice(&child.seq.to_le_bytes());
                buf.extend_from_slice(&child.start.to_le_bytes());
                buf.extend_from_slice(&child.end.to_le_bytes());
            }
            let reserved = (core.max_children - core.children.len()) * CHILD_ENTRY_SIZE;
            buf.resize(buf.len() + reserved, 0);
        }

        for iv in &self.intervals {
            iv.encode_into(&mut buf)?;
        }
        if buf.len() + TRAILER_SIZE > self.block_size {
            return Err(TreeError::IntervalTooLarge {
                size: buf.len() + TRAILER_SIZE,
                capacity: self.block_size,
            });
        }
        buf.resize(self.block_size - TRAILER_SIZE, 0);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse a block read from `path`. Any inconsistency is `CorruptFile`.
    pub fn decode(buf: &[u8], block_size: usize, max_children: usize, path: &Path) -> TreeResult<Self> {
        if buf.len() != block_size || block_size < TRAILER_SIZE {
            return Err(TreeError::corrupt(
                path,
                format!("node block of {} bytes, expected {block_size}", buf.len()),
            ));
        }
        let (body, trailer) = buf.split_at(block_size - TRAILER_SIZE);
        let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(TreeError::corrupt(
                path,
                format!("node CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
            ));
        }

        let corrupt = |e: ValueError| TreeError::corrupt(path, format!("malformed node: {e}"));
        let mut reader = ByteReader::new(body);
        let kind_byte = reader.u8().map_err(corrupt)?;
        let start = reader.i64().map_err(corrupt)?;
        let end = reader.i64().map_err(corrupt)?;
        let seq = reader.u32().map_err(corrupt)?;
        let parent_seq = reader.u32().map_err(corrupt)?;
        let interval_count = reader.u32().map_err(corrupt)? as usize;

        let kind = match kind_byte {
            KIND_LEAF => NodeKind::Leaf,
            KIND_CORE => {
                let child_count = reader.u32().map_err(corrupt)? as usize;
                if child_count > max_children {
                    return Err(TreeError::corrupt(
                        path,
                        format!("node {seq} lists {child_count} children, max {max_children}"),
                    ));
                }
                let mut children = Vec::with_capacity(max_children);
                for _ in 0..child_count {
                    children.push(ChildRef {
                        seq: reader.u32().map_err(corrupt)?,
                        start: reader.i64().map_err(corrupt)?,
                        end: reader.i64().map_err(corrupt)?,
                    });
                }
                reader
                    .bytes((max_children - child_count) * CHILD_ENTRY_SIZE)
                    .map_err(corrupt)?;
                NodeKind::Core(CoreData {
                    max_children,
                    children,
                })
            }
            other => {
                return Err(TreeError::corrupt(path, format!("unknown node kind {other}")));
            }
        };

        let mut node = Self::with_kind(seq, parent_seq, start, block_size, kind);
        node.end = Some(end);
        for _ in 0..interval_count {
            let iv = StateInterval::decode(&mut reader).map_err(corrupt)?;
            node.used += iv.size_on_disk();
            node.intervals.push(iv);
        }
        Ok(node)
    }
}

impl fmt::Display for HtNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_leaf() { "Leaf" } else { "Core" };
        write!(f, "{kind} #{} [{}, ", self.seq, self.start)?;
        match self.end {
            Some(end) => write!(f, "{end}]")?,
            None => f.write_str("...]")?,
        }
        write!(
            f,
            " {} intervals, {}% used",
            self.intervals.len(),
            self.usage_percent()
        )?;
        if !self.is_leaf() {
            write!(f, ", {} children", self.children().len())?;
        }
        Ok(())
    }
}
