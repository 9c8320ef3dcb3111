// SPDX-License-Identifier: PMPL-1.0-or-later
//
// History file header.
//
// The first `HEADER_SIZE` bytes of the file are reserved for the header. It
// is written once, when the tree is sealed; until then the area is zeroed,
// so a file abandoned mid-build fails the magic check on reopen.
//
// ```text
// [4 bytes: magic (u32)]            -- 0x05FFA900
// [4 bytes: file format version]
// [4 bytes: provider version]
// [4 bytes: block size]
// [4 bytes: max children]
// [4 bytes: node count]
// [4 bytes: root sequence number]
// [8 bytes: tree start (i64)]
// [8 bytes: tree end (i64)]
// [8 bytes: attribute tree offset (u64)]
// [8 bytes: attribute tree length (u64)]
// [4 bytes: attribute tree crc32]
// [4 bytes: crc32 of all preceding header bytes]
// ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use statehist_core::{ByteReader, ValueError};

use crate::config::{ANY_PROVIDER_VERSION, MAX_BLOCK_SIZE};
use crate::error::{TreeError, TreeResult};

/// Identifies a history tree file.
pub const MAGIC: u32 = 0x05FF_A900;

/// Version of the on-disk layout produced by this crate.
pub const FILE_VERSION: u32 = 1;

/// Bytes reserved at the start of the file for the header.
pub const HEADER_SIZE: u64 = 4096;

const ENCODED_LEN: usize = 4 * 7 + 8 * 4 + 4 + 4;

/// Decoded file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHeader {
    pub provider_version: u32,
    pub block_size: u32,
    pub max_children: u32,
    pub node_count: u32,
    pub root_seq: u32,
    pub start: i64,
    pub end: i64,
    pub attribute_offset: u64,
    pub attribute_len: u64,
    pub attribute_crc: u32,
}

impl TreeHeader {
    /// Serialize into a full `HEADER_SIZE` block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.provider_version.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.max_children.to_le_bytes());
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.root_seq.to_le_bytes());
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.to_le_bytes());
        buf.extend_from_slice(&self.attribute_offset.to_le_bytes());
        buf.extend_from_slice(&self.attribute_len.to_le_bytes());
        buf.extend_from_slice(&self.attribute_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), ENCODED_LEN);
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    /// Parse and validate a header block.
    ///
    /// Magic, checksum and sizing problems are `CorruptFile`; a different
    /// format or provider version is `VersionMismatch`. Pass
    /// [`ANY_PROVIDER_VERSION`] to skip the provider check.
    pub fn decode(buf: &[u8], expected_provider: u32, path: &Path) -> TreeResult<Self> {
        if buf.len() < ENCODED_LEN {
            return Err(TreeError::corrupt(
                path,
                format!("header truncated to {} bytes", buf.len()),
            ));
        }
        let corrupt = |_: ValueError| TreeError::corrupt(path, "header truncated");
        let mut reader = ByteReader::new(&buf[..ENCODED_LEN]);

        let magic = reader.u32().map_err(corrupt)?;
        if magic != MAGIC {
            return Err(TreeError::corrupt(path, format!("bad magic {magic:#010x}")));
        }

        let stored_crc = u32::from_le_bytes([
            buf[ENCODED_LEN - 4],
            buf[ENCODED_LEN - 3],
            buf[ENCODED_LEN - 2],
            buf[ENCODED_LEN - 1],
        ]);
        let computed_crc = crc32fast::hash(&buf[..ENCODED_LEN - 4]);
        if stored_crc != computed_crc {
            return Err(TreeError::corrupt(
                path,
                format!("header CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
            ));
        }

        let file_version = reader.u32().map_err(corrupt)?;
        if file_version != FILE_VERSION {
            return Err(TreeError::VersionMismatch {
                what: "file format",
                expected: FILE_VERSION,
                found: file_version,
            });
        }

        let provider_version = reader.u32().map_err(corrupt)?;
        if expected_provider != ANY_PROVIDER_VERSION && provider_version != expected_provider {
            return Err(TreeError::VersionMismatch {
                what: "provider",
                expected: expected_provider,
                found: provider_version,
            });
        }

        let header = Self {
            provider_version,
            block_size: reader.u32().map_err(corrupt)?,
            max_children: reader.u32().map_err(corrupt)?,
            node_count: reader.u32().map_err(corrupt)?,
            root_seq: reader.u32().map_err(corrupt)?,
            start: reader.i64().map_err(corrupt)?,
            end: reader.i64().map_err(corrupt)?,
            attribute_offset: reader.u64().map_err(corrupt)?,
            attribute_len: reader.u64().map_err(corrupt)?,
            attribute_crc: reader.u32().map_err(corrupt)?,
        };
        header.check_sizes(path)?;
        Ok(header)
    }

    fn check_sizes(&self, path: &Path) -> TreeResult<()> {
        if self.block_size as usize > MAX_BLOCK_SIZE || self.block_size < 64 {
            return Err(TreeError::corrupt(
                path,
                format!("implausible block size {}", self.block_size),
            ));
        }
        if self.node_count == 0 || self.root_seq >= self.node_count {
            return Err(TreeError::corrupt(
                path,
                format!("root {} outside {} nodes", self.root_seq, self.node_count),
            ));
        }
        if self.end < self.start {
            return Err(TreeError::corrupt(
                path,
                format!("end {} before start {}", self.end, self.start),
            ));
        }
        Ok(())
    }

    /// File offset of the node with sequence number `seq`.
    pub fn node_offset(block_size: usize, seq: u32) -> u64 {
        HEADER_SIZE + u64::from(seq) * block_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TreeHeader {
        TreeHeader {
            provider_version: 3,
            block_size: 4096,
            max_children: 10,
            node_count: 12,
            root_seq: 11,
            start: 0,
            end: 300,
            attribute_offset: HEADER_SIZE + 12 * 4096,
            attribute_len: 77,
            attribute_crc: 0xABCD_0123,
        }
    }

    #[test]
    fn test_header_block_is_reserved_size() {
        assert_eq!(sample().encode().len(), HEADER_SIZE as usize);
    }

    #[test]
    fn test_decode_matches_encoded() {
        let buf = sample().encode();
        let header = TreeHeader::decode(&buf, 3, Path::new("t.ht")).unwrap();
        assert_eq!(header, sample());
    }

    #[test]
    fn test_any_provider_version_accepted() {
        let buf = sample().encode();
        assert!(TreeHeader::decode(&buf, ANY_PROVIDER_VERSION, Path::new("t.ht")).is_ok());
    }

    #[test]
    fn test_provider_mismatch() {
        let buf = sample().encode();
        let err = TreeHeader::decode(&buf, 4, Path::new("t.ht")).unwrap_err();
        assert!(matches!(
            err,
            TreeError::VersionMismatch {
                what: "provider",
                expected: 4,
                found: 3
            }
        ));
    }

    #[test]
    fn test_zeroed_header_is_corrupt() {
        let buf = vec![0u8; HEADER_SIZE as usize];
        let err = TreeHeader::decode(&buf, 3, Path::new("t.ht")).unwrap_err();
        assert!(matches!(err, TreeError::CorruptFile { .. }));
    }

    #[test]
    fn test_flipped_bit_is_corrupt() {
        let mut buf = sample().encode();
        buf[30] ^= 0x01;
        let err = TreeHeader::decode(&buf, 3, Path::new("t.ht")).unwrap_err();
        assert!(matches!(err, TreeError::CorruptFile { .. }));
    }

    #[test]
    fn test_node_offset() {
        assert_eq!(TreeHeader::node_offset(4096, 0), HEADER_SIZE);
        assert_eq!(TreeHeader::node_offset(4096, 2), HEADER_SIZE + 8192);
    }
}
