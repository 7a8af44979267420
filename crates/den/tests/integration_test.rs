//! Integration tests for the table write/read path, recovery and the
//! archive database.
//!
//! These tests verify:
//! - Editor commits followed by range reads (memory and file media)
//! - Snapshot isolation of open scans
//! - Reopening a file after clean and torn shutdowns
//! - Buffered writes through `ArchiveDatabase`

use den::query::{CancellationToken, Resolution, StaticMetadata, TrendQuery, TICKS_PER_SECOND};
use den::{
    ArchiveDatabase, DatabaseConfig, FileMedium, MemoryMedium, PointKey, PointTable, PointValue,
    SyncMode, TableConfig,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;

fn write_range<M: den::DiskMedium>(table: &PointTable<M>, range: std::ops::Range<u64>) {
    let mut editor = table.begin_edit().unwrap();
    editor
        .add_points(range.map(|t| (PointKey::new(t, 0, 0), PointValue(t))))
        .unwrap();
    editor.commit().unwrap();
}

fn count<I: Iterator<Item = den::Result<(PointKey, PointValue)>>>(stream: I) -> usize {
    stream.map(|r| r.unwrap()).count()
}

// ============================================================================
// Table Read/Write Path
// ============================================================================

/// Writes 0..999, then checks full, inner and snapshot-isolated range counts.
#[test]
fn test_end_to_end_range_counts() {
    let table = PointTable::open(MemoryMedium::new(), TableConfig::default()).unwrap();
    write_range(&table, 0..1_000);

    let all: Vec<u64> = table
        .read(0, 999)
        .unwrap()
        .map(|r| r.unwrap().0.timestamp)
        .collect();
    assert_eq!(all, (0..1_000).collect::<Vec<_>>());
    assert_eq!(count(table.read(5, 25).unwrap()), 21);

    // Opened before the second batch: pinned to the first snapshot.
    let early = table.read(900, 2_000).unwrap();
    write_range(&table, 1_000..2_001);

    assert_eq!(count(early), 100);
    assert_eq!(count(table.read(900, 2_000).unwrap()), 1_101);
}

/// Small nodes force many node boundaries on every commit.
#[test]
fn test_many_small_commits_small_nodes() {
    let table =
        PointTable::open(MemoryMedium::new(), TableConfig::default().with_node_size(64)).unwrap();
    for batch in 0..20u64 {
        // Interleave batches so every commit rewrites existing nodes.
        let mut editor = table.begin_edit().unwrap();
        for i in 0..50u64 {
            let t = i * 20 + batch;
            editor
                .add_point(PointKey::new(t, batch, 0), PointValue(t))
                .unwrap();
        }
        editor.commit().unwrap();
    }
    let keys: Vec<PointKey> = table.read(0, u64::MAX).unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(keys.len(), 1_000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(table.record_count(), 1_000);
}

/// Dropping an editor without commit leaves no trace.
#[test]
fn test_abandoned_editor_has_no_effect() {
    let table = PointTable::open(MemoryMedium::new(), TableConfig::default()).unwrap();
    write_range(&table, 0..10);
    {
        let mut editor = table.begin_edit().unwrap();
        editor
            .add_point(PointKey::new(100, 0, 0), PointValue(1))
            .unwrap();
    }
    assert_eq!(table.record_count(), 10);
    assert_eq!(count(table.read(100, 100).unwrap()), 0);

    let mut editor = table.begin_edit().unwrap();
    editor.commit().unwrap();
    let err = editor
        .add_point(PointKey::new(1, 0, 0), PointValue(1))
        .unwrap_err();
    assert!(err.is_invalid_state());
}

// ============================================================================
// File Medium Recovery
// ============================================================================

#[test]
fn test_file_table_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("archive.den");

    {
        let medium = FileMedium::open(&path, SyncMode::Fsync).unwrap();
        let table = PointTable::open(medium, TableConfig::default()).unwrap();
        write_range(&table, 0..500);
        write_range(&table, 250..750);
    }

    let medium = FileMedium::open(&path, SyncMode::Fsync).unwrap();
    let table = PointTable::open(medium, TableConfig::default()).unwrap();
    assert_eq!(table.record_count(), 750);
    assert_eq!(table.snapshot().sequence(), 2);
    assert_eq!(table.first_key(), Some(PointKey::new(0, 0, 0)));
    assert_eq!(table.last_key(), Some(PointKey::new(749, 0, 0)));
    assert_eq!(count(table.read(0, u64::MAX).unwrap()), 750);
}

/// Bytes appended after the last header flush are discarded on open.
#[test]
fn test_file_torn_tail_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("torn.den");

    let committed_len = {
        let medium = FileMedium::open(&path, SyncMode::None).unwrap();
        let table = PointTable::open(medium, TableConfig::default()).unwrap();
        write_range(&table, 0..100);
        table.into_medium().committed_length()
    };

    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 4096]).unwrap();
    }

    let medium = FileMedium::open(&path, SyncMode::None).unwrap();
    assert_eq!(medium.committed_length(), committed_len);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), committed_len);

    let table = PointTable::open(medium, TableConfig::default()).unwrap();
    assert_eq!(table.record_count(), 100);
    write_range(&table, 100..200);
    assert_eq!(count(table.read(0, u64::MAX).unwrap()), 200);
}

// ============================================================================
// Archive Database
// ============================================================================

#[test]
fn test_database_close_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("db.den");
    let config = DatabaseConfig::default().with_commit_delay(Duration::from_secs(60));

    {
        let db = ArchiveDatabase::open_path(&path, SyncMode::Fsync, config.clone()).unwrap();
        db.write_batch((0..300).map(|t| (PointKey::new(t, 7, 0), PointValue(t))))
            .unwrap();
        db.soft_commit();
        assert_eq!(count(db.read(0, u64::MAX).unwrap()), 300);
        db.close().unwrap();
    }

    let db = ArchiveDatabase::open_path(&path, SyncMode::Fsync, config).unwrap();
    assert_eq!(db.table().record_count(), 300);
    assert_eq!(count(db.read(100, 199).unwrap()), 100);
}

#[test]
fn test_database_drop_commits() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("drop.den");
    let config = DatabaseConfig::default().with_commit_delay(Duration::from_secs(60));

    {
        let db = ArchiveDatabase::open_path(&path, SyncMode::None, config.clone()).unwrap();
        db.write(PointKey::new(1, 1, 0), PointValue(1)).unwrap();
    }

    let db = ArchiveDatabase::open_path(&path, SyncMode::None, config).unwrap();
    assert_eq!(db.table().record_count(), 1);
}

// ============================================================================
// Trend Queries
// ============================================================================

/// One point sampled ten times a second for ten minutes, plotted per second.
#[test]
fn test_trend_over_file_table() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("trend.den");
    let base = den::query::UNIX_BASE_TICKS + 500 * den::query::TICKS_PER_DAY;
    let step = TICKS_PER_SECOND / 10;

    let medium = FileMedium::open(&path, SyncMode::None).unwrap();
    let table = PointTable::open(medium, TableConfig::default()).unwrap();
    let mut editor = table.begin_edit().unwrap();
    for i in 0..6_000u64 {
        editor
            .add_point(
                PointKey::new(base + i * step, 3, 0),
                PointValue::from_single(i as f32),
            )
            .unwrap();
    }
    editor.commit().unwrap();

    let meta = StaticMetadata::new().with_point(3, 10.0);
    let stop = base + 600 * TICKS_PER_SECOND;

    let full: Vec<_> = TrendQuery::new(base, stop)
        .execute(Some(&table), &meta, CancellationToken::new())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(full.len(), 6_000);

    let per_second: Vec<_> = TrendQuery::new(base, stop)
        .with_resolution(Resolution::EverySecond)
        .execute(Some(&table), &meta, CancellationToken::new())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(per_second.len(), 600);
    assert_eq!(per_second[1].value, 10.0);

    let capped: Vec<_> = TrendQuery::new(base, stop)
        .with_series_limit(100)
        .with_force_limit(true)
        .execute(Some(&table), &meta, CancellationToken::new())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(capped.len(), 100);
}
