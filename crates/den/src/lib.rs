//! Den - Alopex sorted point archive
//!
//! This crate stores time series samples as `(PointKey, PointValue)` records
//! in key order, in delta-encoded nodes on a pluggable disk medium, and
//! serves decimated trend queries over them.
//!
//! # Components
//!
//! - [`PointKey`] / [`PointValue`]: record codec (fixed and delta forms)
//! - [`NodeScanner`]: forward cursor over one encoded node
//! - [`DiskMedium`]: medium contract, with [`MemoryMedium`] and [`FileMedium`]
//! - [`PointTable`] / [`Editor`]: snapshot reads and single-editor commits
//! - [`ScheduledTask`]: coalescing background execution
//! - [`TrendQuery`]: decimated plot queries
//! - [`ArchiveDatabase`]: buffered writes with soft and hard commits
//!
//! # Example
//!
//! ```rust
//! use den::{MemoryMedium, PointKey, PointTable, PointValue, TableConfig};
//!
//! let table = PointTable::open(MemoryMedium::new(), TableConfig::default())?;
//! let mut editor = table.begin_edit()?;
//! for t in 0..1_000u64 {
//!     editor.add_point(PointKey::new(t, 0, 0), PointValue(t))?;
//! }
//! editor.commit()?;
//!
//! let count = table.read(5, 25)?.count();
//! assert_eq!(count, 21);
//! # Ok::<(), den::DenError>(())
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod database;
pub mod error;
pub mod medium;
pub mod node;
pub mod query;
pub mod table;
pub mod threading;

pub use codec::{PointKey, PointValue};
pub use database::{ArchiveDatabase, DatabaseConfig};
pub use error::{DenError, Result};
pub use medium::{DiskMedium, FileHeader, FileMedium, MemoryMedium, PageArena, SyncMode};
pub use node::{EncodedNode, NodeScanner};
pub use query::{
    estimate_plot_resolution, CancellationToken, MeasurementMetadata, Resolution, StaticMetadata,
    TrendQuery, TrendValue,
};
pub use table::{Editor, PointTable, TableConfig, TreeStream};
pub use threading::{ScheduledTask, TaskRunArgs, TaskState};
