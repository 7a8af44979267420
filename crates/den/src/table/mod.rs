//! Point table: committed snapshot, single-editor transactions and range reads.
//!
//! # Architecture
//!
//! ```text
//! Editor::add_point ──▶ staged BTreeMap ──commit──▶ new nodes + directory
//!                                                      │
//!                                          DiskMedium::flush_with_header
//!                                                      │
//! PointTable::read ◀── Arc<TableSnapshot> ◀────── publish snapshot
//! ```
//!
//! Readers pin the snapshot that is current when they open; a commit swaps in
//! a new snapshot without disturbing streams that are already running.
//! A commit only re-encodes the nodes whose key range intersects the staged
//! range; all other nodes are shared with the previous snapshot.
//!
//! The medium is append-only. Every commit writes its rebuilt nodes followed
//! by a complete copy of the node directory, so the directory cost grows with
//! the node count on each commit. Superseded nodes and directories stay on the
//! medium and are never reclaimed.

pub mod editor;
pub mod snapshot;
pub mod stream;

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use tracing::{debug, error, info};

pub use editor::{Editor, EditorState};
pub use snapshot::{decode_directory, DirectoryEntry, NodeHandle, TableSnapshot, DIRECTORY_ENTRY_SIZE};
pub use stream::{MergeStream, RecordSource, SharedRange, StagedRange, TreeStream};

use crate::codec::{PointKey, PointValue};
use crate::error::{DenError, Result};
use crate::medium::{DiskMedium, FileHeader};
use crate::node::{build_nodes, EncodedNode, DEFAULT_NODE_SIZE};

/// Guard proving exclusive read access to a table (see [`PointTable::lock_reads`]).
pub type ReadGuard = ArcMutexGuard<RawMutex, ()>;

/// Configuration for a [`PointTable`].
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Target encoded node size in bytes.
    pub node_size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
        }
    }
}

impl TableConfig {
    /// Sets the target node size.
    pub fn with_node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }
}

#[derive(Debug, Default)]
struct EditorSlot {
    generation: u64,
    active: Option<u64>,
}

/// A sorted archive of `(PointKey, PointValue)` records on a [`DiskMedium`].
pub struct PointTable<M: DiskMedium> {
    medium: Mutex<M>,
    snapshot: RwLock<Arc<TableSnapshot>>,
    editor_slot: Mutex<EditorSlot>,
    read_gate: Arc<Mutex<()>>,
    config: TableConfig,
}

impl<M: DiskMedium> std::fmt::Debug for PointTable<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PointTable")
            .field("sequence", &snapshot.sequence())
            .field("records", &snapshot.record_count())
            .field("nodes", &snapshot.nodes().len())
            .field("config", &self.config)
            .finish()
    }
}

impl<M: DiskMedium> PointTable<M> {
    /// Opens a table on `medium`, restoring the last flushed state if the
    /// medium carries a header.
    ///
    /// # Errors
    ///
    /// Returns a medium error, or `DenError::Corrupt`/`ChecksumMismatch` if
    /// the persisted directory cannot be decoded.
    pub fn open(mut medium: M, config: TableConfig) -> Result<Self> {
        let snapshot = match medium.header().copied() {
            Some(header) => {
                let mut session = medium.create_io_session()?;
                let snapshot = TableSnapshot::load(&header, &mut session)?;
                info!(
                    sequence = snapshot.sequence(),
                    records = snapshot.record_count(),
                    nodes = snapshot.nodes().len(),
                    "Opened point table"
                );
                snapshot
            }
            None => TableSnapshot::default(),
        };
        Ok(Self {
            medium: Mutex::new(medium),
            snapshot: RwLock::new(Arc::new(snapshot)),
            editor_slot: Mutex::new(EditorSlot::default()),
            read_gate: Arc::new(Mutex::new(())),
            config,
        })
    }

    /// Table configuration.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Current committed snapshot.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.snapshot.read().clone()
    }

    /// Smallest committed key.
    pub fn first_key(&self) -> Option<PointKey> {
        self.snapshot.read().first_key()
    }

    /// Largest committed key.
    pub fn last_key(&self) -> Option<PointKey> {
        self.snapshot.read().last_key()
    }

    /// Total committed records.
    pub fn record_count(&self) -> u64 {
        self.snapshot.read().record_count()
    }

    /// Returns true while an editor is open on this table.
    pub fn has_active_editor(&self) -> bool {
        self.editor_slot.lock().active.is_some()
    }

    /// Opens the table's single editing transaction.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` if another editor is still open.
    pub fn begin_edit(&self) -> Result<Editor<'_, M>> {
        let mut slot = self.editor_slot.lock();
        if let Some(active) = slot.active {
            return Err(DenError::invalid_state(format!(
                "editor generation {active} is still open"
            )));
        }
        slot.generation += 1;
        slot.active = Some(slot.generation);
        debug!(generation = slot.generation, "Editor opened");
        Ok(Editor::new(self, slot.generation))
    }

    /// Reads every record with `start <= timestamp <= stop`.
    pub fn read(&self, start: u64, stop: u64) -> Result<TreeStream> {
        self.read_keys(
            &PointKey::new(start, 0, 0),
            PointKey::new(stop, u64::MAX, u64::MAX),
        )
    }

    /// Reads every record with `lower <= key <= upper`.
    pub fn read_keys(&self, lower: &PointKey, upper: PointKey) -> Result<TreeStream> {
        TreeStream::with_range(self.snapshot(), lower, upper)
    }

    /// Blocks until no other holder of the read gate remains.
    ///
    /// Scans that require exclusive access hold the returned guard for their
    /// whole lifetime.
    pub fn lock_reads(&self) -> ReadGuard {
        self.read_gate.lock_arc()
    }

    /// Consumes the table and returns its medium.
    pub fn into_medium(self) -> M {
        self.medium.into_inner()
    }

    fn release_editor(&self, generation: u64) -> Result<()> {
        let mut slot = self.editor_slot.lock();
        if slot.active != Some(generation) {
            return Err(DenError::invalid_state(format!(
                "editor generation {generation} is stale (active: {:?})",
                slot.active
            )));
        }
        slot.active = None;
        Ok(())
    }

    fn commit_staged(
        &self,
        generation: u64,
        staged: &BTreeMap<PointKey, PointValue>,
    ) -> Result<()> {
        if self.editor_slot.lock().active != Some(generation) {
            return Err(DenError::invalid_state(format!(
                "editor generation {generation} is stale"
            )));
        }
        let (Some((&lo, _)), Some((&hi, _))) = (staged.first_key_value(), staged.last_key_value())
        else {
            debug!(generation, "Nothing staged, commit is a no-op");
            return Ok(());
        };

        let mut medium = self.medium.lock();
        let current = self.snapshot();
        let overlap = current.overlapping(&lo, &hi);

        // Merge the overlapping committed nodes with the staged records.
        let mut merged: Vec<(PointKey, PointValue)> = Vec::with_capacity(staged.len());
        let mut staged_iter = staged.iter().map(|(k, v)| (*k, *v)).peekable();
        for handle in &current.nodes()[overlap.clone()] {
            for (key, value) in handle.node.records()? {
                while let Some(&(skey, svalue)) = staged_iter.peek() {
                    if skey > key {
                        break;
                    }
                    merged.push((skey, svalue));
                    staged_iter.next();
                }
                if merged.last().map(|(k, _)| *k) != Some(key) {
                    merged.push((key, value));
                }
            }
        }
        merged.extend(staged_iter);
        let rebuilt = build_nodes(merged, self.config.node_size)?;

        let result = Self::write_commit(&mut *medium, &current, overlap.clone(), rebuilt);
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(generation, error = %err, "Commit failed, rolling back medium");
                if let Err(rollback_err) = medium.rollback_changes() {
                    error!(error = %rollback_err, "Medium rollback failed");
                }
                return Err(err);
            }
        };

        debug!(
            generation,
            sequence = snapshot.sequence(),
            staged = staged.len(),
            rewritten = overlap.len(),
            records = snapshot.record_count(),
            "Editor committed"
        );
        *self.snapshot.write() = Arc::new(snapshot);
        Ok(())
    }

    fn write_commit(
        medium: &mut M,
        current: &TableSnapshot,
        overlap: std::ops::Range<usize>,
        rebuilt: Vec<EncodedNode>,
    ) -> Result<TableSnapshot> {
        let nodes = current.nodes();
        let mut handles = Vec::with_capacity(nodes.len() - overlap.len() + rebuilt.len());
        handles.extend_from_slice(&nodes[..overlap.start]);

        let mut session = medium.create_io_session()?;
        let mut offset = session.seek(SeekFrom::End(0))?;
        for node in rebuilt {
            session.write_all(node.data())?;
            let len = node.len() as u64;
            handles.push(NodeHandle {
                offset,
                node: Arc::new(node),
            });
            offset += len;
        }
        handles.extend_from_slice(&nodes[overlap.end..]);

        let snapshot = TableSnapshot::new(current.sequence() + 1, handles)?;
        let directory = snapshot.encode_directory();
        let directory_offset = offset;
        session.write_all(&directory)?;
        session.flush()?;
        drop(session);

        let header = FileHeader {
            sequence: snapshot.sequence(),
            data_length: directory_offset + directory.len() as u64,
            directory_offset,
            directory_length: directory.len() as u32,
            directory_crc: crc32fast::hash(&directory),
            record_count: snapshot.record_count(),
            first_key: snapshot.first_key().unwrap_or(PointKey::MAX),
            last_key: snapshot.last_key().unwrap_or(PointKey::MIN),
        };
        medium.flush_with_header(&header)?;
        Ok(snapshot)
    }
}
