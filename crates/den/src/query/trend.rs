//! Decimated trend queries.
//!
//! A [`TrendQuery`] scans a time window of a table and emits at most roughly
//! `series_limit` samples per point. Each point gets a decimation interval
//! from its estimated sample count over the window; a record is emitted when
//! the point's running counter hits a multiple of that interval, or (unless
//! the limit is forced) when the point has been silent for longer than one
//! resolution interval.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::codec::{PointKey, PointValue};
use crate::error::{DenError, Result};
use crate::medium::DiskMedium;
use crate::query::cancel::Cancellation;
use crate::query::filter::{FilterDecision, PointIdFilter, TimestampFilter};
use crate::query::metadata::MeasurementMetadata;
use crate::query::resolution::{ticks_to_unix_millis, Resolution, TICKS_PER_SECOND};
use crate::table::{PointTable, ReadGuard, RecordSource, TreeStream};

/// Estimated count used at full resolution for points without metadata.
pub const UNKNOWN_POINT_ESTIMATE: u64 = 2;

/// One plotted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendValue {
    /// Point id.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: f64,
    /// Sample value.
    pub value: f32,
}

/// Parameters of a trend scan.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendQuery {
    start: u64,
    stop: u64,
    point_ids: Option<Vec<u64>>,
    resolution: Resolution,
    series_limit: u64,
    force_limit: bool,
}

impl TrendQuery {
    /// Full-resolution query over `[start, stop)` for every configured point,
    /// without a series limit.
    pub fn new(start: u64, stop: u64) -> Self {
        Self {
            start,
            stop,
            point_ids: None,
            resolution: Resolution::Full,
            series_limit: u64::MAX,
            force_limit: false,
        }
    }

    /// Restricts the query to `point_ids`.
    pub fn with_point_ids(mut self, point_ids: impl IntoIterator<Item = u64>) -> Self {
        self.point_ids = Some(point_ids.into_iter().collect());
        self
    }

    /// Sets the sampling resolution.
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the approximate number of samples per point (minimum 1).
    pub fn with_series_limit(mut self, series_limit: u64) -> Self {
        self.series_limit = series_limit;
        self
    }

    /// When set, the gap-fill rule is disabled and only the counter gate emits.
    pub fn with_force_limit(mut self, force_limit: bool) -> Self {
        self.force_limit = force_limit;
        self
    }

    /// Query resolution.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Start and stop after snapping to the resolution's baseline.
    pub fn window(&self) -> (u64, u64) {
        match self.resolution.baseline() {
            Some(baseline) => (baseline.snap(self.start), baseline.snap(self.stop)),
            None => (self.start, self.stop),
        }
    }

    /// Time filter the scan applies.
    pub fn time_filter(&self) -> TimestampFilter {
        let (start, stop) = self.window();
        match self.resolution {
            Resolution::Full => TimestampFilter::range(start, stop),
            resolution => TimestampFilter::sampled(start, stop, resolution.interval_ticks()),
        }
    }

    /// Runs the query against `table` under its read gate.
    ///
    /// An absent table yields an empty stream. The gate is held until the
    /// stream finishes or is dropped.
    ///
    /// # Errors
    ///
    /// Returns metadata errors other than `NotFound`, or a table read error.
    pub fn execute<M: DiskMedium, C: Cancellation>(
        &self,
        table: Option<&PointTable<M>>,
        metadata: &dyn MeasurementMetadata,
        cancel: C,
    ) -> Result<TrendStream<TreeStream, C>> {
        let Some(table) = table else {
            return self.execute_on(None, None, metadata, cancel);
        };
        let filter = self.time_filter();
        let gate = table.lock_reads();
        let source = table.read_keys(
            &PointKey::new(filter.lower_bound(), 0, 0),
            PointKey::new(filter.upper_bound(), u64::MAX, u64::MAX),
        )?;
        self.execute_on(Some(source), Some(gate), metadata, cancel)
    }

    /// Runs the query over an already opened record source.
    ///
    /// # Errors
    ///
    /// Returns metadata errors other than `NotFound`.
    pub fn execute_on<S: RecordSource, C: Cancellation>(
        &self,
        source: Option<S>,
        gate: Option<ReadGuard>,
        metadata: &dyn MeasurementMetadata,
        cancel: C,
    ) -> Result<TrendStream<S, C>> {
        let time_filter = self.time_filter();
        let point_filter = match &self.point_ids {
            Some(ids) => PointIdFilter::from_ids(ids.iter().copied()),
            None => PointIdFilter::all(),
        };
        let mut decimator = self.decimator();
        if source.is_some() {
            let ids = match &self.point_ids {
                Some(ids) => ids.clone(),
                None => metadata.point_ids(),
            };
            for id in ids {
                let estimate = self.estimate_count(id, metadata)?;
                decimator.track(id, estimate);
            }
            debug!(
                resolution = ?self.resolution,
                points = decimator.series.len(),
                series_limit = decimator.series_limit,
                force_limit = decimator.force_limit,
                "Trend scan opened"
            );
        }
        Ok(TrendStream {
            source,
            gate,
            time_filter,
            point_filter,
            decimator,
            cancel,
            cancelled: false,
            finished: false,
        })
    }

    fn range_seconds(&self) -> f64 {
        let (start, stop) = self.window();
        stop.saturating_sub(start) as f64 / TICKS_PER_SECOND as f64
    }

    fn span_estimate(&self) -> u64 {
        let interval = self.resolution.interval_ticks() as f64 / TICKS_PER_SECOND as f64;
        let interval = if interval == 0.0 { 1.0 } else { interval };
        (self.range_seconds() / interval) as u64
    }

    fn estimate_count(&self, point_id: u64, metadata: &dyn MeasurementMetadata) -> Result<u64> {
        if self.resolution != Resolution::Full {
            return Ok(self.span_estimate());
        }
        match metadata.sample_rate(point_id) {
            Ok(rate) => Ok((rate * self.range_seconds()) as u64),
            Err(DenError::NotFound(_)) => Ok(UNKNOWN_POINT_ESTIMATE),
            Err(err) => Err(err),
        }
    }

    fn decimator(&self) -> Decimator {
        let default_estimate = match self.resolution {
            Resolution::Full => UNKNOWN_POINT_ESTIMATE,
            _ => self.span_estimate(),
        };
        let resolution_span = match self.resolution.interval_ticks() {
            span if span <= 1 => TICKS_PER_SECOND,
            span => span,
        };
        Decimator {
            series: HashMap::new(),
            default_estimate,
            series_limit: self.series_limit.max(1),
            resolution_span,
            force_limit: self.force_limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SeriesState {
    counter: u64,
    interval: u64,
    last_emitted: u64,
}

#[derive(Debug)]
struct Decimator {
    series: HashMap<u64, SeriesState>,
    default_estimate: u64,
    series_limit: u64,
    resolution_span: u64,
    force_limit: bool,
}

impl Decimator {
    fn state(estimate: u64, series_limit: u64) -> SeriesState {
        SeriesState {
            counter: estimate,
            interval: (estimate / series_limit).max(1),
            last_emitted: 0,
        }
    }

    fn track(&mut self, point_id: u64, estimate: u64) {
        self.series
            .insert(point_id, Self::state(estimate, self.series_limit));
    }

    fn admit(&mut self, point_id: u64, timestamp: u64) -> bool {
        let (estimate, limit) = (self.default_estimate, self.series_limit);
        let state = self
            .series
            .entry(point_id)
            .or_insert_with(|| Self::state(estimate, limit));
        let counter = state.counter;
        state.counter = counter.wrapping_add(1);
        let emit = counter % state.interval == 0
            || (!self.force_limit
                && timestamp.saturating_sub(state.last_emitted) > self.resolution_span);
        if emit {
            state.last_emitted = timestamp;
        }
        emit
    }
}

/// Lazily evaluated result of a [`TrendQuery`].
///
/// Yields each emitted sample in key order. Cancellation ends the stream
/// without an error; check [`was_cancelled`](Self::was_cancelled) afterwards.
pub struct TrendStream<S, C> {
    source: Option<S>,
    gate: Option<ReadGuard>,
    time_filter: TimestampFilter,
    point_filter: PointIdFilter,
    decimator: Decimator,
    cancel: C,
    cancelled: bool,
    finished: bool,
}

impl<S, C> fmt::Debug for TrendStream<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendStream")
            .field("time_filter", &self.time_filter)
            .field("points", &self.decimator.series.len())
            .field("gated", &self.gate.is_some())
            .field("cancelled", &self.cancelled)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<S: RecordSource, C: Cancellation> TrendStream<S, C> {
    /// Returns true if the scan stopped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns the next emitted sample.
    pub fn read_next(&mut self) -> Result<Option<TrendValue>> {
        if self.finished {
            return Ok(None);
        }
        match self.scan() {
            Ok(Some(value)) => Ok(Some(value)),
            other => {
                self.finish();
                other
            }
        }
    }

    fn scan(&mut self) -> Result<Option<TrendValue>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        loop {
            if self.cancel.is_cancelled() {
                self.cancelled = true;
                debug!("Trend scan cancelled");
                return Ok(None);
            }
            let Some((key, value)) = source.read_next()? else {
                return Ok(None);
            };
            match self.time_filter.check(key.timestamp) {
                FilterDecision::Accept => {}
                FilterDecision::SeekTo(timestamp) => {
                    source.seek(&PointKey::new(timestamp, 0, 0))?;
                    continue;
                }
                FilterDecision::Done => return Ok(None),
            }
            if !self.point_filter.matches(key.point_id) {
                continue;
            }
            if self.decimator.admit(key.point_id, key.timestamp) {
                return Ok(Some(to_trend_value(&key, value)));
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.source = None;
        self.gate = None;
    }
}

impl<S: RecordSource, C: Cancellation> Iterator for TrendStream<S, C> {
    type Item = Result<TrendValue>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

fn to_trend_value(key: &PointKey, value: PointValue) -> TrendValue {
    TrendValue {
        id: key.point_id,
        timestamp: ticks_to_unix_millis(key.timestamp),
        value: value.as_single(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use crate::query::cancel::CancellationToken;
    use crate::query::metadata::StaticMetadata;
    use crate::query::resolution::{TICKS_PER_HOUR, TICKS_PER_MILLISECOND, UNIX_BASE_TICKS};
    use crate::table::TableConfig;

    const BASE: u64 = UNIX_BASE_TICKS + 1_000 * TICKS_PER_HOUR;

    fn table(records: impl IntoIterator<Item = (u64, u64, f32)>) -> PointTable<MemoryMedium> {
        let table = PointTable::open(MemoryMedium::new(), TableConfig::default()).unwrap();
        {
            let mut editor = table.begin_edit().unwrap();
            for (timestamp, point, value) in records {
                editor
                    .add_point(
                        PointKey::new(timestamp, point, 0),
                        PointValue::from_single(value),
                    )
                    .unwrap();
            }
            editor.commit().unwrap();
        }
        table
    }

    fn collect<S: RecordSource, C: Cancellation>(stream: TrendStream<S, C>) -> Vec<TrendValue> {
        stream.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_full_resolution_half_open() {
        let table = table((0..20).map(|i| (BASE + i * TICKS_PER_SECOND, 1, i as f32)));
        let meta = StaticMetadata::new().with_point(1, 1.0);
        let query = TrendQuery::new(BASE + 5 * TICKS_PER_SECOND, BASE + 10 * TICKS_PER_SECOND);
        let values = collect(query.execute(Some(&table), &meta, ()).unwrap());

        assert_eq!(values.len(), 5);
        assert_eq!(values[0].id, 1);
        assert_eq!(values[0].value, 5.0);
        let base_ms = ticks_to_unix_millis(BASE);
        assert_eq!(values[0].timestamp, base_ms + 5_000.0);
        assert_eq!(values[4].timestamp, base_ms + 9_000.0);
    }

    #[test]
    fn test_forced_limit_emits_once() {
        // 10_000 estimated samples, limit one.
        let table = table((0..100).map(|i| (BASE + i * TICKS_PER_SECOND, 1, i as f32)));
        let meta = StaticMetadata::new().with_point(1, 1.0);
        let query = TrendQuery::new(BASE, BASE + 10_000 * TICKS_PER_SECOND)
            .with_series_limit(1)
            .with_force_limit(true);
        let values = collect(query.execute(Some(&table), &meta, ()).unwrap());
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, 0.0);
    }

    #[test]
    fn test_gap_fill_when_not_forced() {
        let meta = StaticMetadata::new().with_point(1, 1.0);
        let query = TrendQuery::new(BASE, BASE + 10_000 * TICKS_PER_SECOND).with_series_limit(1);

        // The gap is measured from the last emitted sample: the record right
        // after an emitted one is one second away and never qualifies.
        let dense = table((0..50).map(|i| (BASE + i * TICKS_PER_SECOND, 1, i as f32)));
        let values = collect(query.execute(Some(&dense), &meta, ()).unwrap());
        assert_eq!(values.len(), 25);
        let emitted: Vec<f32> = values.iter().map(|v| v.value).collect();
        assert_eq!(emitted, (0..25).map(|i| (i * 2) as f32).collect::<Vec<_>>());

        let sparse = table((0..50).map(|i| (BASE + i * 2 * TICKS_PER_SECOND, 1, i as f32)));
        assert_eq!(collect(query.execute(Some(&sparse), &meta, ()).unwrap()).len(), 50);
    }

    #[test]
    fn test_point_filter_and_unknown_points() {
        let records = (0..30).map(|i| (BASE + i * TICKS_PER_SECOND, i % 3, i as f32));
        let table = table(records);
        let meta = StaticMetadata::new().with_point(0, 1.0);

        let only_two = TrendQuery::new(BASE, BASE + 60 * TICKS_PER_SECOND).with_point_ids([2]);
        let values = collect(only_two.execute(Some(&table), &meta, ()).unwrap());
        assert_eq!(values.len(), 10);
        assert!(values.iter().all(|v| v.id == 2));

        // Points 1 and 2 lack metadata and still stream.
        let all = TrendQuery::new(BASE, BASE + 60 * TICKS_PER_SECOND);
        assert_eq!(collect(all.execute(Some(&table), &meta, ()).unwrap()).len(), 30);
    }

    #[test]
    fn test_interval_resolution_samples_each_second() {
        let table = table((0..100).map(|i| (BASE + i * 100 * TICKS_PER_MILLISECOND, 4, i as f32)));
        let meta = StaticMetadata::new().with_point(4, 10.0);
        let query = TrendQuery::new(BASE + 1234, BASE + 10 * TICKS_PER_SECOND + 99)
            .with_resolution(Resolution::EverySecond);
        assert_eq!(query.window(), (BASE, BASE + 10 * TICKS_PER_SECOND));

        let values = collect(query.execute(Some(&table), &meta, ()).unwrap());
        let base_ms = ticks_to_unix_millis(BASE);
        let offsets: Vec<f64> = values.iter().map(|v| v.timestamp - base_ms).collect();
        assert_eq!(
            offsets,
            (0..10).map(|s| s as f64 * 1_000.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cancellation_ends_without_error() {
        let table = table((0..100).map(|i| (BASE + i, 1, 0.0)));
        let meta = StaticMetadata::new().with_point(1, 1.0);
        let token = CancellationToken::new();
        let mut stream = TrendQuery::new(BASE, BASE + 1_000)
            .execute(Some(&table), &meta, token.clone())
            .unwrap();
        assert!(stream.next().is_some());
        token.cancel();
        assert!(stream.next().is_none());
        assert!(stream.was_cancelled());
    }

    #[test]
    fn test_absent_table_is_empty() {
        let meta = StaticMetadata::new().with_point(1, 1.0);
        let mut stream = TrendQuery::new(BASE, BASE + 1_000)
            .execute::<MemoryMedium, _>(None, &meta, ())
            .unwrap();
        assert!(stream.next().is_none());
        assert!(!stream.was_cancelled());
    }

    #[test]
    fn test_gate_released_when_finished() {
        let table = table((0..10).map(|i| (BASE + i, 1, 0.0)));
        let meta = StaticMetadata::new();
        let query = TrendQuery::new(BASE, BASE + 100);
        let first = collect(query.execute(Some(&table), &meta, ()).unwrap());
        let second = collect(query.execute(Some(&table), &meta, ()).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_limit_coerced() {
        let query = TrendQuery::new(BASE, BASE).with_series_limit(0);
        let decimator = query.decimator();
        assert_eq!(decimator.series_limit, 1);
        assert_eq!(decimator.resolution_span, TICKS_PER_SECOND);
    }
}
