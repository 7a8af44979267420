//! Immutable committed table state and its on-medium node directory.
//!
//! # Directory entry layout (64 bytes, little-endian)
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬─────────────┬────────────┐
//! │ Offset   │ Byte len │ Record count │ First key   │ Last key   │
//! │ 8 bytes  │ 4 bytes  │ 4 bytes      │ 24 bytes    │ 24 bytes   │
//! └──────────┴──────────┴──────────────┴─────────────┴────────────┘
//! ```

use std::io::SeekFrom;
use std::sync::Arc;

use crate::codec::{PointKey, KEY_SIZE};
use crate::error::{DenError, Result};
use crate::medium::{FileHeader, IoSession};
use crate::node::EncodedNode;

/// Serialized size of one directory entry.
pub const DIRECTORY_ENTRY_SIZE: usize = 16 + 2 * KEY_SIZE;

/// A committed node and where it lives on the medium.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    /// Absolute medium offset of the node bytes.
    pub offset: u64,
    /// Decoded node.
    pub node: Arc<EncodedNode>,
}

/// One row of the node directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Absolute medium offset of the node bytes.
    pub offset: u64,
    /// Encoded node size.
    pub length: u32,
    /// Records in the node.
    pub record_count: u32,
    /// Smallest key in the node.
    pub first_key: PointKey,
    /// Largest key in the node.
    pub last_key: PointKey,
}

/// Committed, immutable view of a point table.
///
/// Nodes are sorted and their key ranges never overlap. Readers clone the
/// `Arc` and keep seeing the same data no matter what commits later.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    sequence: u64,
    nodes: Vec<NodeHandle>,
    record_count: u64,
}

impl TableSnapshot {
    /// Creates a snapshot from sorted, non-overlapping nodes.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupt` if the nodes are out of order or overlap.
    pub fn new(sequence: u64, nodes: Vec<NodeHandle>) -> Result<Self> {
        for pair in nodes.windows(2) {
            if pair[0].node.last_key() >= pair[1].node.first_key() {
                return Err(DenError::Corrupt(format!(
                    "nodes overlap: {} >= {}",
                    pair[0].node.last_key(),
                    pair[1].node.first_key()
                )));
            }
        }
        let record_count = nodes.iter().map(|h| h.node.record_count() as u64).sum();
        Ok(Self {
            sequence,
            nodes,
            record_count,
        })
    }

    /// Commit sequence that produced this snapshot (0 for a fresh table).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Committed nodes in key order.
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Total committed records.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Returns true if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Smallest committed key.
    pub fn first_key(&self) -> Option<PointKey> {
        self.nodes.first().map(|h| h.node.first_key())
    }

    /// Largest committed key.
    pub fn last_key(&self) -> Option<PointKey> {
        self.nodes.last().map(|h| h.node.last_key())
    }

    /// Index of the first node whose last key is `>= key`.
    ///
    /// Equals `nodes().len()` if every node is smaller.
    pub fn find_node(&self, key: &PointKey) -> usize {
        self.nodes.partition_point(|h| h.node.last_key() < *key)
    }

    /// Half-open index range of nodes intersecting `[lo, hi]`.
    pub fn overlapping(&self, lo: &PointKey, hi: &PointKey) -> std::ops::Range<usize> {
        let start = self.find_node(lo);
        let end = self.nodes.partition_point(|h| h.node.first_key() <= *hi);
        start..end.max(start)
    }

    /// Serializes the node directory.
    pub fn encode_directory(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nodes.len() * DIRECTORY_ENTRY_SIZE);
        for handle in &self.nodes {
            out.extend_from_slice(&handle.offset.to_le_bytes());
            out.extend_from_slice(&(handle.node.len() as u32).to_le_bytes());
            out.extend_from_slice(&handle.node.record_count().to_le_bytes());
            out.extend_from_slice(&handle.node.first_key().to_fixed());
            out.extend_from_slice(&handle.node.last_key().to_fixed());
        }
        out
    }

    /// Rebuilds the snapshot described by `header`, reading the directory and
    /// every node through `session`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::ChecksumMismatch` for a damaged directory and
    /// `DenError::Corrupt` if the directory disagrees with the header.
    pub fn load<S: IoSession>(header: &FileHeader, session: &mut S) -> Result<Self> {
        if header.directory_length == 0 {
            return Self::new(header.sequence, Vec::new());
        }

        let mut directory = vec![0u8; header.directory_length as usize];
        session.seek(SeekFrom::Start(header.directory_offset))?;
        session.read_exact(&mut directory)?;
        let actual = crc32fast::hash(&directory);
        if actual != header.directory_crc {
            return Err(DenError::ChecksumMismatch {
                expected: header.directory_crc,
                actual,
            });
        }

        let mut nodes = Vec::new();
        for entry in decode_directory(&directory)? {
            let mut data = vec![0u8; entry.length as usize];
            session.seek(SeekFrom::Start(entry.offset))?;
            session.read_exact(&mut data)?;
            let node =
                EncodedNode::from_parts(data, entry.record_count, entry.first_key, entry.last_key)?;
            nodes.push(NodeHandle {
                offset: entry.offset,
                node: Arc::new(node),
            });
        }

        let snapshot = Self::new(header.sequence, nodes)?;
        if snapshot.record_count != header.record_count {
            return Err(DenError::Corrupt(format!(
                "header counts {} records, directory {}",
                header.record_count, snapshot.record_count
            )));
        }
        Ok(snapshot)
    }
}

/// Parses a serialized node directory.
pub fn decode_directory(bytes: &[u8]) -> Result<Vec<DirectoryEntry>> {
    if bytes.len() % DIRECTORY_ENTRY_SIZE != 0 {
        return Err(DenError::Corrupt(format!(
            "directory length {} is not a multiple of {DIRECTORY_ENTRY_SIZE}",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(DIRECTORY_ENTRY_SIZE)
        .map(|chunk| {
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&chunk[0..8]);
            let mut length = [0u8; 4];
            length.copy_from_slice(&chunk[8..12]);
            let mut count = [0u8; 4];
            count.copy_from_slice(&chunk[12..16]);
            Ok(DirectoryEntry {
                offset: u64::from_le_bytes(offset),
                length: u32::from_le_bytes(length),
                record_count: u32::from_le_bytes(count),
                first_key: PointKey::from_fixed(&chunk[16..16 + KEY_SIZE])?,
                last_key: PointKey::from_fixed(&chunk[16 + KEY_SIZE..])?,
            })
        })
        .collect()
}
