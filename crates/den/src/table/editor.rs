//! Single-writer editing transaction.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::codec::{PointKey, PointValue};
use crate::error::{DenError, Result};
use crate::medium::DiskMedium;
use crate::table::{MergeStream, PointTable, StagedRange, TreeStream};

/// Lifecycle of an [`Editor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    /// Accepting writes.
    Open,
    /// Staged writes were committed.
    Committed,
    /// Staged writes were discarded by an explicit rollback or a failed commit.
    RolledBack,
    /// Dropped while open; staged writes were discarded.
    Disposed,
}

/// The one open transaction of a [`PointTable`].
///
/// Writes are staged in memory and only reach the medium on
/// [`commit`](Self::commit). Dropping an open editor rolls it back.
pub struct Editor<'t, M: DiskMedium> {
    table: &'t PointTable<M>,
    generation: u64,
    staged: BTreeMap<PointKey, PointValue>,
    bounds: Option<(PointKey, PointKey)>,
    state: EditorState,
}

impl<'t, M: DiskMedium> Editor<'t, M> {
    pub(super) fn new(table: &'t PointTable<M>, generation: u64) -> Self {
        Self {
            table,
            generation,
            staged: BTreeMap::new(),
            bounds: None,
            state: EditorState::Open,
        }
    }

    /// Generation assigned by the table when the editor was opened.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EditorState {
        self.state
    }

    /// Number of staged records (duplicates collapsed).
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Smallest and largest key written through this editor.
    pub fn key_bounds(&self) -> Option<(PointKey, PointKey)> {
        self.bounds
    }

    /// Stages one record. A later write to the same key replaces it.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` unless the editor is open.
    pub fn add_point(&mut self, key: PointKey, value: PointValue) -> Result<()> {
        self.ensure_open("add_point")?;
        self.stage(key, value);
        Ok(())
    }

    /// Stages every record produced by `points`.
    pub fn add_points<I>(&mut self, points: I) -> Result<()>
    where
        I: IntoIterator<Item = (PointKey, PointValue)>,
    {
        self.ensure_open("add_points")?;
        for (key, value) in points {
            self.stage(key, value);
        }
        Ok(())
    }

    /// Streams the committed data with the staged writes applied on top.
    pub fn get_range(&self) -> Result<MergeStream<StagedRange<'_>>> {
        self.ensure_open("get_range")?;
        Ok(MergeStream::new(
            StagedRange::new(&self.staged, PointKey::MIN, PointKey::MAX),
            TreeStream::new(self.table.snapshot()),
        ))
    }

    /// Durably commits the staged writes and publishes the new snapshot.
    ///
    /// On a medium failure the medium is rolled back, the editor detaches from
    /// the table and the error is returned; nothing is retried.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` unless the editor is open, or the
    /// medium error that aborted the commit.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        let result = self.table.commit_staged(self.generation, &self.staged);
        self.state = if result.is_ok() {
            EditorState::Committed
        } else {
            EditorState::RolledBack
        };
        self.staged.clear();
        self.table.release_editor(self.generation)?;
        if result.is_ok() {
            debug!(generation = self.generation, bounds = ?self.bounds, "Transaction committed");
        }
        result
    }

    /// Discards the staged writes.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` unless the editor is open.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        self.discard(EditorState::RolledBack)
    }

    fn stage(&mut self, key: PointKey, value: PointValue) {
        self.bounds = Some(match self.bounds {
            None => (key, key),
            Some((lo, hi)) => (lo.min(key), hi.max(key)),
        });
        self.staged.insert(key, value);
    }

    fn discard(&mut self, next: EditorState) -> Result<()> {
        debug!(
            generation = self.generation,
            discarded = self.staged.len(),
            "Transaction rolled back"
        );
        self.staged.clear();
        self.state = next;
        self.table.release_editor(self.generation)
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        match self.state {
            EditorState::Open => Ok(()),
            state => Err(DenError::invalid_state(format!(
                "{op} called on {state:?} editor"
            ))),
        }
    }
}

impl<M: DiskMedium> Drop for Editor<'_, M> {
    fn drop(&mut self) {
        if self.state == EditorState::Open {
            if !self.staged.is_empty() {
                warn!(
                    generation = self.generation,
                    staged = self.staged.len(),
                    "Editor dropped without commit, rolling back"
                );
            }
            if let Err(err) = self.discard(EditorState::Disposed) {
                warn!(generation = self.generation, error = %err, "Implicit rollback failed");
            }
        }
    }
}

impl<M: DiskMedium> std::fmt::Debug for Editor<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("staged", &self.staged.len())
            .finish()
    }
}
