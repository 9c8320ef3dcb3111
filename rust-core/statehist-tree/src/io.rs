// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Block I/O on the history file.
//
// `HtIo` owns the file handle and the node cache. Nodes live at
// `HEADER_SIZE + seq * block_size`; the attribute tree snapshot follows the
// last node. File access is serialized through one mutex; decoded nodes are
// shared as `Arc<HtNode>` so readers never hold the lock while scanning.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::cache::{CacheStats, NodeCache};
use crate::error::{TreeError, TreeResult};
use crate::format::{TreeHeader, HEADER_SIZE};
use crate::node::HtNode;

pub struct HtIo {
    path: PathBuf,
    file: Mutex<File>,
    cache: Mutex<NodeCache>,
    block_size: usize,
    max_children: usize,
}

impl HtIo {
    /// Create (or truncate) a history file with a zeroed header area.
    pub fn create(
        path: &Path,
        block_size: usize,
        max_children: usize,
        cache_capacity: usize,
    ) -> TreeResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(HEADER_SIZE)?;
        debug!(path = %path.display(), block_size, max_children, "Created history file");
        Ok(Self::with_file(path, file, block_size, max_children, cache_capacity))
    }

    /// Open an existing history file for reading.
    pub fn open(path: &Path, cache_capacity: usize) -> TreeResult<(Self, Vec<u8>)> {
        let mut file = File::open(path)?;
        let mut header = vec![0u8; HEADER_SIZE as usize];
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(TreeError::corrupt(
                path,
                format!("file of {len} bytes is shorter than its header"),
            ));
        }
        file.read_exact(&mut header)?;
        // Sizing is filled in once the header has been validated.
        Ok((Self::with_file(path, file, 0, 0, cache_capacity), header))
    }

    fn with_file(
        path: &Path,
        file: File,
        block_size: usize,
        max_children: usize,
        cache_capacity: usize,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            cache: Mutex::new(NodeCache::new(cache_capacity)),
            block_size,
            max_children,
        }
    }

    pub(crate) fn set_geometry(&mut self, block_size: usize, max_children: usize) {
        self.block_size = block_size;
        self.max_children = max_children;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn read_at(&self, offset: u64, len: usize) -> TreeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().map_err(|_| TreeError::LockPoisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TreeError::corrupt(
                    &self.path,
                    format!("unexpected end of file reading {len} bytes at {offset}"),
                )
            } else {
                TreeError::Io(e)
            }
        })?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> TreeResult<()> {
        let mut file = self.file.lock().map_err(|_| TreeError::LockPoisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Fetch a flushed node, from the cache when possible.
    pub fn read_node(&self, seq: u32) -> TreeResult<Arc<HtNode>> {
        {
            let mut cache = self.cache.lock().map_err(|_| TreeError::LockPoisoned)?;
            if let Some(node) = cache.get(seq) {
                return Ok(node);
            }
        }
        let offset = TreeHeader::node_offset(self.block_size, seq);
        let block = self.read_at(offset, self.block_size)?;
        let node = HtNode::decode(&block, self.block_size, self.max_children, &self.path)?;
        if node.seq() != seq {
            return Err(TreeError::corrupt(
                &self.path,
                format!("block {seq} holds node {}", node.seq()),
            ));
        }
        trace!(seq, "Read node from disk");
        let node = Arc::new(node);
        self.cache
            .lock()
            .map_err(|_| TreeError::LockPoisoned)?
            .insert(Arc::clone(&node));
        Ok(node)
    }

    /// Flush a closed node to its block and publish it to the cache.
    pub fn write_node(&self, node: HtNode) -> TreeResult<Arc<HtNode>> {
        let block = node.encode()?;
        let offset = TreeHeader::node_offset(self.block_size, node.seq());
        self.write_at(offset, &block)?;
        trace!(seq = node.seq(), "Wrote node");
        let node = Arc::new(node);
        self.cache
            .lock()
            .map_err(|_| TreeError::LockPoisoned)?
            .insert(Arc::clone(&node));
        Ok(node)
    }

    pub fn sync(&self) -> TreeResult<()> {
        let mut file = self.file.lock().map_err(|_| TreeError::LockPoisoned)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    pub fn file_size(&self) -> TreeResult<u64> {
        let file = self.file.lock().map_err(|_| TreeError::LockPoisoned)?;
        Ok(file.metadata()?.len())
    }

    pub fn cache_stats(&self) -> TreeResult<CacheStats> {
        Ok(self
            .cache
            .lock()
            .map_err(|_| TreeError::LockPoisoned)?
            .stats())
    }

    pub fn clear_cache(&self) -> TreeResult<()> {
        self.cache
            .lock()
            .map_err(|_| TreeError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NO_PARENT;
    use statehist_core::{StateInterval, StateValue};
    use tempfile::TempDir;

    #[test]
    fn test_node_written_then_read_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.ht");
        let io = HtIo::create(&path, 512, 3, 0).unwrap();

        let mut node = HtNode::new_leaf(2, NO_PARENT, 0, 512);
        node.add_interval(StateInterval::new(0, 9, 1, StateValue::Long(-3)));
        node.close(9);
        io.write_node(node.clone()).unwrap();

        // Cache disabled, so this decodes the block.
        let back = io.read_node(2).unwrap();
        assert_eq!(*back, node);
        assert_eq!(io.file_size().unwrap(), HEADER_SIZE + 3 * 512);
    }

    #[test]
    fn test_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.ht");
        let io = HtIo::create(&path, 512, 3, 8).unwrap();
        let mut node = HtNode::new_leaf(0, NO_PARENT, 0, 512);
        node.close(0);
        io.write_node(node).unwrap();
        io.read_node(0).unwrap();
        io.read_node(0).unwrap();
        assert_eq!(io.cache_stats().unwrap().hits, 2);
    }

    #[test]
    fn test_unwritten_block_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.ht");
        let io = HtIo::create(&path, 512, 3, 0).unwrap();
        let err = io.read_node(5).unwrap_err();
        assert!(matches!(err, TreeError::CorruptFile { .. }));
    }
}
