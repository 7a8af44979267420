//! Timestamp and point id filters applied during a scan.

use std::collections::HashSet;

use crate::query::resolution::TICKS_PER_MILLISECOND;

/// What a scan should do with a record after consulting a [`TimestampFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Keep the record.
    Accept,
    /// Drop it and jump to the first record at or after this timestamp.
    SeekTo(u64),
    /// Nothing at or after this timestamp can match.
    Done,
}

/// Time selection for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFilter {
    /// Every timestamp in `[start, stop)`.
    Range {
        /// Inclusive start.
        start: u64,
        /// Exclusive stop.
        stop: u64,
    },
    /// Timestamps within `tolerance` of `start + k * interval`, up to `stop`.
    Interval {
        /// First sampling instant.
        start: u64,
        /// Last permitted sampling instant.
        stop: u64,
        /// Distance between sampling instants (at least one tick).
        interval: u64,
        /// Accepted distance from a sampling instant.
        tolerance: u64,
    },
}

impl TimestampFilter {
    /// Half-open range filter.
    pub fn range(start: u64, stop: u64) -> Self {
        Self::Range { start, stop }
    }

    /// Interval filter.
    pub fn interval(start: u64, stop: u64, interval: u64, tolerance: u64) -> Self {
        Self::Interval {
            start,
            stop,
            interval: interval.max(1),
            tolerance,
        }
    }

    /// Interval filter with the default one millisecond tolerance.
    pub fn sampled(start: u64, stop: u64, interval: u64) -> Self {
        Self::interval(start, stop, interval, TICKS_PER_MILLISECOND)
    }

    /// Smallest timestamp that can match.
    pub fn lower_bound(&self) -> u64 {
        match *self {
            Self::Range { start, .. } => start,
            Self::Interval {
                start, tolerance, ..
            } => start.saturating_sub(tolerance),
        }
    }

    /// Largest timestamp that can match.
    pub fn upper_bound(&self) -> u64 {
        match *self {
            Self::Range { stop, .. } => stop.saturating_sub(1),
            Self::Interval {
                stop, tolerance, ..
            } => stop.saturating_add(tolerance),
        }
    }

    /// Classifies `timestamp`. Seek targets are always past `timestamp`.
    pub fn check(&self, timestamp: u64) -> FilterDecision {
        match *self {
            Self::Range { start, stop } => {
                if timestamp >= stop {
                    FilterDecision::Done
                } else if timestamp < start {
                    FilterDecision::SeekTo(start)
                } else {
                    FilterDecision::Accept
                }
            }
            Self::Interval {
                start,
                stop,
                interval,
                tolerance,
            } => {
                if timestamp > self.upper_bound() {
                    return FilterDecision::Done;
                }
                if timestamp.saturating_add(tolerance) < start {
                    return FilterDecision::SeekTo(start.saturating_sub(tolerance));
                }
                // Last sampling instant at or before `timestamp + tolerance`.
                let k = (timestamp.saturating_add(tolerance) - start) / interval;
                let center = start + k * interval;
                if center <= stop && timestamp <= center.saturating_add(tolerance) {
                    return FilterDecision::Accept;
                }
                match center.checked_add(interval) {
                    Some(next) if next <= stop => {
                        FilterDecision::SeekTo(next.saturating_sub(tolerance))
                    }
                    _ => FilterDecision::Done,
                }
            }
        }
    }
}

/// Point id selection for a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointIdFilter {
    ids: Option<HashSet<u64>>,
}

impl PointIdFilter {
    /// Matches every point.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches only the listed points.
    pub fn from_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
        }
    }

    /// Returns true if `point_id` is selected.
    pub fn matches(&self, point_id: u64) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&point_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_is_half_open() {
        let filter = TimestampFilter::range(10, 20);
        assert_eq!(filter.check(5), FilterDecision::SeekTo(10));
        assert_eq!(filter.check(10), FilterDecision::Accept);
        assert_eq!(filter.check(19), FilterDecision::Accept);
        assert_eq!(filter.check(20), FilterDecision::Done);
        assert_eq!(filter.lower_bound(), 10);
        assert_eq!(filter.upper_bound(), 19);
    }

    #[test]
    fn test_interval_windows() {
        // Samples at 1000, 1100, ..., 1500 with tolerance 10.
        let filter = TimestampFilter::interval(1_000, 1_500, 100, 10);
        assert_eq!(filter.check(900), FilterDecision::SeekTo(990));
        assert_eq!(filter.check(990), FilterDecision::Accept);
        assert_eq!(filter.check(1_010), FilterDecision::Accept);
        assert_eq!(filter.check(1_011), FilterDecision::SeekTo(1_090));
        assert_eq!(filter.check(1_089), FilterDecision::SeekTo(1_090));
        assert_eq!(filter.check(1_105), FilterDecision::Accept);
        assert_eq!(filter.check(1_505), FilterDecision::Accept);
        assert_eq!(filter.check(1_480), FilterDecision::SeekTo(1_490));
        assert_eq!(filter.check(1_511), FilterDecision::Done);
    }

    #[test]
    fn test_interval_seek_always_advances() {
        let filter = TimestampFilter::interval(1_000, 100_000, 333, 7);
        for ts in (0..100_100).step_by(13) {
            if let FilterDecision::SeekTo(target) = filter.check(ts) {
                assert!(target > ts, "seek from {ts} to {target}");
                assert_eq!(filter.check(target), FilterDecision::Accept);
            }
        }
    }

    #[test]
    fn test_point_filter() {
        assert!(PointIdFilter::all().matches(42));
        let filter = PointIdFilter::from_ids([1, 3]);
        assert!(filter.matches(3));
        assert!(!filter.matches(2));
    }
}
