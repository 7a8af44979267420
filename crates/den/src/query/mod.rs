//! Query and decimation engine.
//!
//! Turns a time window over a [`PointTable`](crate::table::PointTable) into a
//! bounded stream of plot samples. See [`TrendQuery`].

pub mod cancel;
pub mod filter;
pub mod metadata;
pub mod resolution;
pub mod trend;

pub use cancel::{Cancellation, CancellationToken};
pub use filter::{FilterDecision, PointIdFilter, TimestampFilter};
pub use metadata::{MeasurementMetadata, StaticMetadata};
pub use resolution::{
    estimate_plot_resolution, ticks_to_unix_millis, unix_millis_to_ticks, BaselineInterval,
    Resolution, TICKS_PER_DAY, TICKS_PER_HOUR, TICKS_PER_MILLISECOND, TICKS_PER_MINUTE,
    TICKS_PER_SECOND, UNIX_BASE_TICKS,
};
pub use trend::{TrendQuery, TrendStream, TrendValue, UNKNOWN_POINT_ESTIMATE};
