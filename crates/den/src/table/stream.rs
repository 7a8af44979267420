//! Ordered record streams over committed and staged data.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::codec::{PointKey, PointValue};
use crate::error::Result;
use crate::node::NodeScanner;
use crate::table::TableSnapshot;

/// Seekable forward cursor over a pinned [`TableSnapshot`].
///
/// Crosses node boundaries transparently; every node is decoded from a fresh
/// baseline. Records above the upper bound end the stream.
#[derive(Debug)]
pub struct TreeStream {
    snapshot: Arc<TableSnapshot>,
    node_index: usize,
    scanner: NodeScanner,
    upper: PointKey,
    done: bool,
}

impl TreeStream {
    /// Opens a stream at the first record of `snapshot`.
    pub fn new(snapshot: Arc<TableSnapshot>) -> Self {
        let mut scanner = NodeScanner::new();
        if let Some(first) = snapshot.nodes().first() {
            scanner.load(first.node.clone());
        }
        Self {
            snapshot,
            node_index: 0,
            scanner,
            upper: PointKey::MAX,
            done: false,
        }
    }

    /// Opens a stream over `[lower, upper]`.
    pub fn with_range(snapshot: Arc<TableSnapshot>, lower: &PointKey, upper: PointKey) -> Result<Self> {
        let mut stream = Self::new(snapshot);
        stream.set_upper_bound(upper);
        stream.seek(lower)?;
        Ok(stream)
    }

    /// Snapshot the stream reads from.
    pub fn snapshot(&self) -> &Arc<TableSnapshot> {
        &self.snapshot
    }

    /// Sets the inclusive upper bound.
    pub fn set_upper_bound(&mut self, upper: PointKey) {
        self.upper = upper;
    }

    /// Positions the stream at the first record `>= key`.
    ///
    /// Seeking backwards is allowed; the stream is reopened on the right node.
    pub fn seek(&mut self, key: &PointKey) -> Result<()> {
        self.node_index = self.snapshot.find_node(key);
        match self.snapshot.nodes().get(self.node_index) {
            Some(handle) => {
                self.scanner.load(handle.node.clone());
                self.scanner.find(key)?;
                self.done = false;
            }
            None => self.done = true,
        }
        Ok(())
    }

    /// Returns the next record, or `None` past the upper bound or the end.
    pub fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        while !self.done {
            match self.scanner.read_next()? {
                Some((key, value)) => {
                    if key > self.upper {
                        self.done = true;
                        return Ok(None);
                    }
                    return Ok(Some((key, value)));
                }
                None => {
                    self.node_index += 1;
                    match self.snapshot.nodes().get(self.node_index) {
                        Some(handle) => self.scanner.load(handle.node.clone()),
                        None => self.done = true,
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Iterator for TreeStream {
    type Item = Result<(PointKey, PointValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Borrowed range over a staged write map.
#[derive(Debug)]
pub struct StagedRange<'a>(btree_map::Range<'a, PointKey, PointValue>);

impl<'a> StagedRange<'a> {
    /// Records of `map` within `[lower, upper]`.
    pub fn new(map: &'a BTreeMap<PointKey, PointValue>, lower: PointKey, upper: PointKey) -> Self {
        if lower > upper {
            return Self(map.range(upper..upper));
        }
        Self(map.range(lower..=upper))
    }
}

impl Iterator for StagedRange<'_> {
    type Item = (PointKey, PointValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(k, v)| (*k, *v))
    }
}

/// Owning range over a shared, immutable write map.
#[derive(Debug, Clone)]
pub struct SharedRange {
    map: Arc<BTreeMap<PointKey, PointValue>>,
    from: Bound<PointKey>,
    upper: PointKey,
}

impl SharedRange {
    /// Records of `map` within `[lower, upper]`.
    pub fn new(map: Arc<BTreeMap<PointKey, PointValue>>, lower: PointKey, upper: PointKey) -> Self {
        Self {
            map,
            from: Bound::Included(lower),
            upper,
        }
    }

    /// Continues from the first record `>= key`.
    pub fn seek(&mut self, key: &PointKey) {
        self.from = Bound::Included(*key);
    }
}

impl Iterator for SharedRange {
    type Item = (PointKey, PointValue);

    fn next(&mut self) -> Option<Self::Item> {
        if let Bound::Included(lower) = self.from {
            if lower > self.upper {
                return None;
            }
        }
        let (key, value) = self
            .map
            .range((self.from, Bound::Included(self.upper)))
            .next()
            .map(|(k, v)| (*k, *v))?;
        self.from = Bound::Excluded(key);
        Some((key, value))
    }
}

/// Merges an ordered overlay of uncommitted records over a [`TreeStream`].
///
/// On equal keys the overlay record wins and the committed one is skipped.
#[derive(Debug)]
pub struct MergeStream<I: Iterator<Item = (PointKey, PointValue)>> {
    overlay: I,
    overlay_peek: Option<(PointKey, PointValue)>,
    base: TreeStream,
    base_peek: Option<(PointKey, PointValue)>,
}

impl<I: Iterator<Item = (PointKey, PointValue)>> MergeStream<I> {
    /// Creates a merged stream.
    pub fn new(overlay: I, base: TreeStream) -> Self {
        Self {
            overlay,
            overlay_peek: None,
            base,
            base_peek: None,
        }
    }

    /// Returns the next record in key order.
    pub fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        if self.overlay_peek.is_none() {
            self.overlay_peek = self.overlay.next();
        }
        if self.base_peek.is_none() {
            self.base_peek = self.base.read_next()?;
        }
        let over_key = self.overlay_peek.map(|(k, _)| k);
        let base_key = self.base_peek.map(|(k, _)| k);
        match (over_key, base_key) {
            (None, None) => Ok(None),
            (Some(over), Some(base)) if over == base => {
                self.base_peek = None;
                Ok(self.overlay_peek.take())
            }
            (Some(over), Some(base)) if over < base => Ok(self.overlay_peek.take()),
            (Some(_), None) => Ok(self.overlay_peek.take()),
            _ => Ok(self.base_peek.take()),
        }
    }
}

impl<I: Iterator<Item = (PointKey, PointValue)>> Iterator for MergeStream<I> {
    type Item = Result<(PointKey, PointValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// An ordered record stream that can jump forward to a key.
pub trait RecordSource {
    /// Positions the source at the first record `>= key`.
    fn seek(&mut self, key: &PointKey) -> Result<()>;

    /// Returns the next record in key order.
    fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>>;
}

impl RecordSource for TreeStream {
    fn seek(&mut self, key: &PointKey) -> Result<()> {
        TreeStream::seek(self, key)
    }

    fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        TreeStream::read_next(self)
    }
}

impl RecordSource for MergeStream<SharedRange> {
    fn seek(&mut self, key: &PointKey) -> Result<()> {
        self.overlay.seek(key);
        self.overlay_peek = None;
        self.base.seek(key)?;
        self.base_peek = None;
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<(PointKey, PointValue)>> {
        MergeStream::read_next(self)
    }
}
