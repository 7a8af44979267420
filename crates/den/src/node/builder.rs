//! Encoded node construction.

use crate::codec::varint::MAX_VARINT_LEN;
use crate::codec::{read_record_delta, write_record_delta, PointKey, PointValue};
use crate::error::{DenError, Result};

/// Default target size of an encoded node in bytes.
pub const DEFAULT_NODE_SIZE: usize = 4096;

/// Worst-case encoded size of one record (four varints).
pub const MAX_RECORD_LEN: usize = 4 * MAX_VARINT_LEN;

/// An immutable, delta-encoded run of records in ascending key order.
///
/// The first record is encoded against `PointKey::MIN` and a zero value; every
/// later record against its immediate predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedNode {
    data: Vec<u8>,
    record_count: u32,
    first_key: PointKey,
    last_key: PointKey,
}

impl EncodedNode {
    /// Reassembles a node from bytes and directory metadata read off a medium.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupt` for an empty node or inverted key bounds.
    pub fn from_parts(
        data: Vec<u8>,
        record_count: u32,
        first_key: PointKey,
        last_key: PointKey,
    ) -> Result<Self> {
        if record_count == 0 || data.is_empty() {
            return Err(DenError::Corrupt("empty encoded node".into()));
        }
        if first_key > last_key {
            return Err(DenError::Corrupt(format!(
                "node bounds inverted: {first_key} > {last_key}"
            )));
        }
        Ok(Self {
            data,
            record_count,
            first_key,
            last_key,
        })
    }

    /// Encoded bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; nodes hold at least one record.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Number of records in the node.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Smallest key in the node.
    pub fn first_key(&self) -> PointKey {
        self.first_key
    }

    /// Largest key in the node.
    pub fn last_key(&self) -> PointKey {
        self.last_key
    }

    /// Decodes every record in order.
    pub fn records(&self) -> Result<Vec<(PointKey, PointValue)>> {
        let mut out = Vec::with_capacity(self.record_count as usize);
        let (mut prev_key, mut prev_value) = (PointKey::MIN, PointValue::ZERO);
        let mut offset = 0;
        for _ in 0..self.record_count {
            let (mut key, mut value) = (PointKey::MIN, PointValue::ZERO);
            offset += read_record_delta(
                &self.data[offset..],
                &mut key,
                &mut value,
                &prev_key,
                &prev_value,
            )?;
            out.push((key, value));
            prev_key = key;
            prev_value = value;
        }
        Ok(out)
    }
}

/// Accumulates records into a single [`EncodedNode`].
#[derive(Debug)]
pub struct NodeBuilder {
    data: Vec<u8>,
    record_count: u32,
    first_key: PointKey,
    prev_key: PointKey,
    prev_value: PointValue,
    target_size: usize,
}

impl NodeBuilder {
    /// Creates a builder that reports full near `target_size` bytes.
    pub fn new(target_size: usize) -> Self {
        let target_size = target_size.max(MAX_RECORD_LEN);
        Self {
            data: Vec::with_capacity(target_size),
            record_count: 0,
            first_key: PointKey::MIN,
            prev_key: PointKey::MIN,
            prev_value: PointValue::ZERO,
            target_size,
        }
    }

    /// Returns true if no record has been added.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Returns true if another worst-case record would exceed the target size.
    pub fn is_full(&self) -> bool {
        self.data.len() + MAX_RECORD_LEN > self.target_size
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` if `key` is not strictly greater than
    /// the previously added key.
    pub fn push(&mut self, key: PointKey, value: PointValue) -> Result<()> {
        if self.record_count > 0 && key <= self.prev_key {
            return Err(DenError::invalid_state(format!(
                "node keys must ascend: {key} after {}",
                self.prev_key
            )));
        }
        if self.record_count == 0 {
            self.first_key = key;
        }
        write_record_delta(
            &mut self.data,
            &key,
            &value,
            &self.prev_key,
            &self.prev_value,
        );
        self.prev_key = key;
        self.prev_value = value;
        self.record_count += 1;
        Ok(())
    }

    /// Finishes the node, or returns `None` if it is empty.
    pub fn finish(self) -> Option<EncodedNode> {
        if self.record_count == 0 {
            return None;
        }
        Some(EncodedNode {
            data: self.data,
            record_count: self.record_count,
            first_key: self.first_key,
            last_key: self.prev_key,
        })
    }
}

/// Splits an ascending record sequence into nodes of roughly `node_size` bytes.
pub fn build_nodes<I>(records: I, node_size: usize) -> Result<Vec<EncodedNode>>
where
    I: IntoIterator<Item = (PointKey, PointValue)>,
{
    let mut nodes = Vec::new();
    let mut builder = NodeBuilder::new(node_size);
    for (key, value) in records {
        if builder.is_full() {
            let full = std::mem::replace(&mut builder, NodeBuilder::new(node_size));
            nodes.extend(full.finish());
        }
        builder.push(key, value)?;
    }
    nodes.extend(builder.finish());
    Ok(nodes)
}
