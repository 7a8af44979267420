//! Sequential scanner over one encoded node.
//!
//! Every record is stored relative to its predecessor, so the scanner only
//! moves forward. Seeking inside a node is a linear decode from the node
//! start; moving to another node must go through [`NodeScanner::load`] (or
//! [`NodeScanner::reset_baseline`]) so the first record of the new node is
//! decoded against the zero baseline instead of the old node's last record.

use std::sync::Arc;

use crate::codec::{read_record_delta, PointKey, PointValue};
use crate::error::{DenError, Result};
use crate::node::EncodedNode;

/// Forward-only decoder over a single [`EncodedNode`].
#[derive(Debug, Default)]
pub struct NodeScanner {
    node: Option<Arc<EncodedNode>>,
    offset: usize,
    next_index: u32,
    prev_key: PointKey,
    prev_value: PointValue,
    /// The record at `prev_*` was found by `find` and not yet returned.
    peeked: bool,
}

impl NodeScanner {
    /// Creates a scanner with no node loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scanner positioned at the start of `node`.
    pub fn with_node(node: Arc<EncodedNode>) -> Self {
        let mut scanner = Self::new();
        scanner.load(node);
        scanner
    }

    /// Switches to `node` and resets the delta baseline.
    pub fn load(&mut self, node: Arc<EncodedNode>) {
        self.node = Some(node);
        self.reset_baseline();
    }

    /// Rewinds to the start of the current node with a fresh baseline.
    pub fn reset_baseline(&mut self) {
        self.offset = 0;
        self.next_index = 0;
        self.prev_key = PointKey::MIN;
        self.prev_value = PointValue::ZERO;
        self.peeked = false;
    }

    /// Number of records in the loaded node (zero if none).
    pub fn record_count(&self) -> u32 {
        self.node.as_ref().map_or(0, |n| n.record_count())
    }

    /// Index of the next record that [`read_next`](Self::read_next) will return.
    pub fn position(&self) -> u32 {
        if self.peeked {
            self.next_index - 1
        } else {
            self.next_index
        }
    }

    /// Returns the next record, or `None` once the node is exhausted.
    pub fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        if self.peeked {
            self.peeked = false;
            return Ok(Some((self.prev_key, self.prev_value)));
        }
        self.decode_next()
    }

    /// Positions the scanner at the first record whose key is `>= target`.
    ///
    /// On success the record is cached so the next `read_next` returns it
    /// without decoding again, and its zero-based index is returned. If every
    /// record is smaller, nothing is cached and the number of records scanned
    /// (the record count) is returned.
    pub fn find(&mut self, target: &PointKey) -> Result<usize> {
        self.reset_baseline();
        while let Some((key, _)) = self.decode_next()? {
            if key >= *target {
                self.peeked = true;
                return Ok(self.next_index as usize - 1);
            }
        }
        Ok(self.next_index as usize)
    }

    fn decode_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        let Some(node) = self.node.as_ref() else {
            return Ok(None);
        };
        if self.next_index >= node.record_count() {
            return Ok(None);
        }
        let data = node.data();
        if self.offset >= data.len() {
            return Err(DenError::Corrupt(format!(
                "node ended after {} of {} records",
                self.next_index,
                node.record_count()
            )));
        }
        let (mut key, mut value) = (PointKey::MIN, PointValue::ZERO);
        self.offset += read_record_delta(
            &data[self.offset..],
            &mut key,
            &mut value,
            &self.prev_key,
            &self.prev_value,
        )?;
        self.next_index += 1;
        self.prev_key = key;
        self.prev_value = value;
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::build_nodes;

    fn node_of(keys: &[u64]) -> Arc<EncodedNode> {
        let records = keys
            .iter()
            .map(|&t| (PointKey::new(t, 1, 0), PointValue(t * 10)));
        let mut nodes = build_nodes(records, 1 << 16).unwrap();
        Arc::new(nodes.remove(0))
    }

    fn drain(scanner: &mut NodeScanner) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some((key, _)) = scanner.read_next().unwrap() {
            out.push(key.timestamp);
        }
        out
    }

    #[test]
    fn test_read_all() {
        let mut scanner = NodeScanner::with_node(node_of(&[10, 20, 30]));
        assert_eq!(scanner.record_count(), 3);
        assert_eq!(drain(&mut scanner), vec![10, 20, 30]);
        assert!(scanner.read_next().unwrap().is_none());
    }

    #[test]
    fn test_find_exact_and_between() {
        let mut scanner = NodeScanner::with_node(node_of(&[10, 20, 30, 40]));

        assert_eq!(scanner.find(&PointKey::new(20, 1, 0)).unwrap(), 1);
        assert_eq!(scanner.position(), 1);
        let (key, value) = scanner.read_next().unwrap().unwrap();
        assert_eq!(key.timestamp, 20);
        assert_eq!(value, PointValue(200));
        assert_eq!(drain(&mut scanner), vec![30, 40]);

        assert_eq!(scanner.find(&PointKey::new(25, 0, 0)).unwrap(), 2);
        assert_eq!(drain(&mut scanner), vec![30, 40]);
    }

    #[test]
    fn test_find_before_first_and_past_end() {
        let mut scanner = NodeScanner::with_node(node_of(&[10, 20]));
        assert_eq!(scanner.find(&PointKey::MIN).unwrap(), 0);
        assert_eq!(drain(&mut scanner), vec![10, 20]);

        assert_eq!(scanner.find(&PointKey::new(21, 0, 0)).unwrap(), 2);
        assert!(scanner.read_next().unwrap().is_none());
    }

    #[test]
    fn test_load_resets_baseline() {
        let first = node_of(&[1_000, 1_001]);
        let second = node_of(&[5, 6]);

        let mut scanner = NodeScanner::with_node(first);
        assert_eq!(drain(&mut scanner), vec![1_000, 1_001]);
        scanner.load(second.clone());
        assert_eq!(drain(&mut scanner), vec![5, 6]);

        // Same node decoded in isolation gives the same result.
        let mut fresh = NodeScanner::with_node(second);
        assert_eq!(drain(&mut fresh), vec![5, 6]);
    }

    #[test]
    fn test_truncated_node_is_corrupt() {
        let node = node_of(&[10, 20, 30]);
        let bytes = node.data()[..node.len() - 1].to_vec();
        let broken = EncodedNode::from_parts(bytes, 3, node.first_key(), node.last_key()).unwrap();
        let mut scanner = NodeScanner::with_node(Arc::new(broken));
        let mut result = Ok(None);
        for _ in 0..3 {
            result = scanner.read_next();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DenError::Corrupt(_))));
    }

    #[test]
    fn test_empty_scanner() {
        let mut scanner = NodeScanner::new();
        assert!(scanner.read_next().unwrap().is_none());
        assert_eq!(scanner.find(&PointKey::MIN).unwrap(), 0);
    }
}
