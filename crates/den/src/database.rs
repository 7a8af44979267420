//! Archive database: buffered writes over a [`PointTable`].
//!
//! Writes land in a pending buffer that no reader can see. A soft commit
//! moves the pending buffer into an in-memory overlay that new readers merge
//! over the table; a hard commit moves the overlay into the table through an
//! editor and flushes it to the medium. A [`ScheduledTask`] performs hard
//! commits in the background, a short delay after the first write or at once
//! when the pending buffer fills up.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::codec::{PointKey, PointValue};
use crate::error::{DenError, Result};
use crate::medium::{DiskMedium, FileMedium, SyncMode};
use crate::query::{Cancellation, MeasurementMetadata, TrendQuery, TrendStream};
use crate::table::{MergeStream, PointTable, SharedRange, TableConfig};
use crate::threading::{ScheduledTask, TaskRunArgs};

/// Default delay between a write and the background hard commit.
pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(1);

/// Default number of pending points that forces an immediate commit.
pub const DEFAULT_MAX_PENDING_POINTS: usize = 100_000;

/// Merged stream of committed and soft-committed records.
pub type DatabaseStream = MergeStream<SharedRange>;

/// Configuration for an [`ArchiveDatabase`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Table layout.
    pub table: TableConfig,
    /// Delay between a write and the background hard commit.
    pub commit_delay: Duration,
    /// Pending point count that triggers an immediate hard commit.
    pub max_pending_points: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            commit_delay: DEFAULT_COMMIT_DELAY,
            max_pending_points: DEFAULT_MAX_PENDING_POINTS,
        }
    }
}

impl DatabaseConfig {
    /// Sets the table configuration.
    pub fn with_table(mut self, table: TableConfig) -> Self {
        self.table = table;
        self
    }

    /// Sets the background commit delay.
    pub fn with_commit_delay(mut self, commit_delay: Duration) -> Self {
        self.commit_delay = commit_delay;
        self
    }

    /// Sets the pending point threshold.
    pub fn with_max_pending_points(mut self, max_pending_points: usize) -> Self {
        self.max_pending_points = max_pending_points.max(1);
        self
    }
}

struct DatabaseInner<M: DiskMedium> {
    table: PointTable<M>,
    pending: Mutex<BTreeMap<PointKey, PointValue>>,
    soft: RwLock<Arc<BTreeMap<PointKey, PointValue>>>,
    commit_lock: Mutex<()>,
}

impl<M: DiskMedium> DatabaseInner<M> {
    /// Moves pending writes into the overlay. Returns the number moved.
    fn soft_commit(&self) -> usize {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return 0;
        }
        let moved = std::mem::take(&mut *pending);
        let count = moved.len();
        let mut soft = self.soft.write();
        Arc::make_mut(&mut *soft).extend(moved);
        count
    }

    fn hard_commit(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        self.soft_commit();
        let staged = self.soft.read().clone();
        if staged.is_empty() {
            return Ok(());
        }

        let mut editor = self.table.begin_edit()?;
        editor.add_points(staged.iter().map(|(k, v)| (*k, *v)))?;
        editor.commit()?;

        // Keep overlay entries that were rewritten after `staged` was taken.
        let mut soft = self.soft.write();
        if Arc::ptr_eq(&*soft, &staged) {
            *soft = Arc::default();
        } else {
            let remaining: BTreeMap<_, _> = soft
                .iter()
                .filter(|(k, v)| staged.get(*k) != Some(*v))
                .map(|(k, v)| (*k, *v))
                .collect();
            *soft = Arc::new(remaining);
        }
        debug!(
            records = staged.len(),
            total = self.table.record_count(),
            "Hard commit complete"
        );
        Ok(())
    }

    fn read_merged(&self, lower: PointKey, upper: PointKey) -> Result<DatabaseStream> {
        // Overlay first: a concurrent hard commit publishes the table before
        // it clears the overlay.
        let soft = self.soft.read().clone();
        let base = self.table.read_keys(&lower, upper)?;
        Ok(MergeStream::new(SharedRange::new(soft, lower, upper), base))
    }
}

/// A point archive with buffered writes and background durability.
pub struct ArchiveDatabase<M: DiskMedium + 'static> {
    inner: Arc<DatabaseInner<M>>,
    task: ScheduledTask,
    config: DatabaseConfig,
    closed: AtomicBool,
}

impl<M: DiskMedium + 'static> std::fmt::Debug for ArchiveDatabase<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDatabase")
            .field("table", &self.inner.table)
            .field("pending", &self.pending_len())
            .field("soft", &self.soft_len())
            .field("task", &self.task)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ArchiveDatabase<FileMedium> {
    /// Opens or creates a file-backed database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O or recovery error from the file medium or the table.
    pub fn open_path(
        path: impl AsRef<Path>,
        sync_mode: SyncMode,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let medium = FileMedium::open(path, sync_mode)?;
        Self::open(medium, config)
    }
}

impl<M: DiskMedium + 'static> ArchiveDatabase<M> {
    /// Opens a database on `medium` and starts its commit task.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be restored or the commit thread
    /// cannot be spawned.
    pub fn open(medium: M, config: DatabaseConfig) -> Result<Self> {
        let table = PointTable::open(medium, config.table.clone())?;
        let inner = Arc::new(DatabaseInner {
            table,
            pending: Mutex::new(BTreeMap::new()),
            soft: RwLock::new(Arc::default()),
            commit_lock: Mutex::new(()),
        });
        let worker_inner = inner.clone();
        let task = ScheduledTask::new("den-commit", move |args: TaskRunArgs| {
            if let Err(err) = worker_inner.hard_commit() {
                if args.is_dispose {
                    error!(error = %err, "Final commit failed");
                } else {
                    warn!(error = %err, "Background commit failed");
                }
            }
        })?;
        info!(
            records = inner.table.record_count(),
            commit_delay_ms = config.commit_delay.as_millis() as u64,
            max_pending_points = config.max_pending_points,
            "Archive database opened"
        );
        Ok(Self {
            inner,
            task,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Database configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Underlying table (hard-committed data only).
    pub fn table(&self) -> &PointTable<M> {
        &self.inner.table
    }

    /// Writes not yet soft committed.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Soft-committed writes not yet hard committed.
    pub fn soft_len(&self) -> usize {
        self.inner.soft.read().len()
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffers one record.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` after close.
    pub fn write(&self, key: PointKey, value: PointValue) -> Result<()> {
        self.write_batch([(key, value)])
    }

    /// Buffers every record of `points`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` after close.
    pub fn write_batch<I>(&self, points: I) -> Result<()>
    where
        I: IntoIterator<Item = (PointKey, PointValue)>,
    {
        self.ensure_open()?;
        let pending = {
            let mut pending = self.inner.pending.lock();
            pending.extend(points);
            pending.len()
        };
        if pending >= self.config.max_pending_points {
            self.task.start_now();
        } else {
            self.task.start_after_delay(self.config.commit_delay);
        }
        Ok(())
    }

    /// Makes buffered writes visible to new readers. Nothing is written to
    /// the medium. Returns the number of records moved.
    pub fn soft_commit(&self) -> usize {
        self.inner.soft_commit()
    }

    /// Soft commits, then durably commits every soft-committed record.
    ///
    /// # Errors
    ///
    /// Returns the editor or medium error; the records stay in the overlay.
    pub fn hard_commit(&self) -> Result<()> {
        self.inner.hard_commit()
    }

    /// Reads soft and hard committed records with `start <= timestamp <= stop`.
    ///
    /// # Errors
    ///
    /// Returns a table read error.
    pub fn read(&self, start: u64, stop: u64) -> Result<DatabaseStream> {
        self.inner.read_merged(
            PointKey::new(start, 0, 0),
            PointKey::new(stop, u64::MAX, u64::MAX),
        )
    }

    /// Runs a trend query over soft and hard committed records.
    ///
    /// # Errors
    ///
    /// Returns a table read or metadata error.
    pub fn trend<C: Cancellation>(
        &self,
        query: &TrendQuery,
        metadata: &dyn MeasurementMetadata,
        cancel: C,
    ) -> Result<TrendStream<DatabaseStream, C>> {
        let filter = query.time_filter();
        let gate = self.inner.table.lock_reads();
        let source = self.inner.read_merged(
            PointKey::new(filter.lower_bound(), 0, 0),
            PointKey::new(filter.upper_bound(), u64::MAX, u64::MAX),
        )?;
        query.execute_on(Some(source), Some(gate), metadata, cancel)
    }

    /// Stops the commit task and hard commits everything still buffered.
    ///
    /// Later writes fail with `DenError::InvalidState`. A second close does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of the final commit.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.task.dispose(true);
        self.inner.hard_commit()?;
        info!(records = self.inner.table.record_count(), "Archive database closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DenError::invalid_state("database is closed"));
        }
        Ok(())
    }
}

impl<M: DiskMedium + 'static> Drop for ArchiveDatabase<M> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(error = %err, "Commit on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use crate::query::StaticMetadata;
    use std::thread;
    use std::time::Instant;

    fn database(config: DatabaseConfig) -> ArchiveDatabase<MemoryMedium> {
        ArchiveDatabase::open(MemoryMedium::new(), config).unwrap()
    }

    fn manual() -> DatabaseConfig {
        DatabaseConfig::default().with_commit_delay(Duration::from_secs(60))
    }

    fn point(t: u64) -> (PointKey, PointValue) {
        (PointKey::new(t, 1, 0), PointValue(t))
    }

    fn timestamps(stream: DatabaseStream) -> Vec<u64> {
        stream.map(|r| r.unwrap().0.timestamp).collect()
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_soft_then_hard_commit() {
        let db = database(manual());
        db.write_batch((0..10).map(point)).unwrap();
        assert_eq!(db.pending_len(), 10);
        assert!(timestamps(db.read(0, 100).unwrap()).is_empty());

        assert_eq!(db.soft_commit(), 10);
        assert_eq!(timestamps(db.read(0, 100).unwrap()), (0..10).collect::<Vec<_>>());
        assert_eq!(db.table().record_count(), 0);

        db.hard_commit().unwrap();
        assert_eq!(db.soft_len(), 0);
        assert_eq!(db.table().record_count(), 10);
        assert_eq!(timestamps(db.read(0, 100).unwrap()), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_overlay_wins_over_table() {
        let db = database(manual());
        db.write(PointKey::new(5, 1, 0), PointValue(1)).unwrap();
        db.hard_commit().unwrap();
        db.write(PointKey::new(5, 1, 0), PointValue(2)).unwrap();
        db.soft_commit();

        let records: Vec<_> = db.read(0, 10).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![(PointKey::new(5, 1, 0), PointValue(2))]);
    }

    #[test]
    fn test_background_commit_after_delay() {
        let db = database(DatabaseConfig::default().with_commit_delay(Duration::from_millis(20)));
        db.write_batch((0..50).map(point)).unwrap();
        wait_until(|| db.table().record_count() == 50);
        assert_eq!(db.table().record_count(), 50);
        assert_eq!(db.pending_len(), 0);
    }

    #[test]
    fn test_full_buffer_commits_immediately() {
        let db = database(manual().with_max_pending_points(10));
        db.write_batch((0..10).map(point)).unwrap();
        wait_until(|| db.table().record_count() == 10);
        assert_eq!(db.table().record_count(), 10);
    }

    #[test]
    fn test_close_commits_and_rejects_writes() {
        let db = database(manual());
        db.write_batch((0..5).map(point)).unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert_eq!(db.table().record_count(), 5);
        assert!(db.write(PointKey::new(9, 1, 0), PointValue(9)).unwrap_err().is_invalid_state());
        db.close().unwrap();
    }

    #[test]
    fn test_trend_sees_soft_commits() {
        let db = database(manual());
        db.write_batch((0..20).map(point)).unwrap();
        db.hard_commit().unwrap();
        db.write_batch((20..40).map(point)).unwrap();
        db.soft_commit();

        let meta = StaticMetadata::new().with_point(1, 1.0);
        let values: Vec<_> = db
            .trend(&TrendQuery::new(10, 30), &meta, ())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values.len(), 20);
        assert!(values.iter().all(|v| v.id == 1));
    }
}
