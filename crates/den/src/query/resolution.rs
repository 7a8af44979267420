//! Plot resolutions and tick arithmetic.
//!
//! Timestamps are ticks of 100 ns counted from 0001-01-01T00:00:00.

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: u64 = 10_000;
/// Ticks per second.
pub const TICKS_PER_SECOND: u64 = 1_000 * TICKS_PER_MILLISECOND;
/// Ticks per minute.
pub const TICKS_PER_MINUTE: u64 = 60 * TICKS_PER_SECOND;
/// Ticks per hour.
pub const TICKS_PER_HOUR: u64 = 60 * TICKS_PER_MINUTE;
/// Ticks per day.
pub const TICKS_PER_DAY: u64 = 24 * TICKS_PER_HOUR;

/// Tick value of the Unix epoch (1970-01-01T00:00:00Z).
pub const UNIX_BASE_TICKS: u64 = 621_355_968_000_000_000;

/// Sampling density of a trend query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    /// Every stored sample.
    #[default]
    Full,
    /// Ten samples per second.
    TenPerSecond,
    /// One sample per second.
    EverySecond,
    /// One sample per 10 seconds.
    Every10Seconds,
    /// One sample per 30 seconds.
    Every30Seconds,
    /// One sample per minute.
    EveryMinute,
    /// One sample per 10 minutes.
    Every10Minutes,
    /// One sample per 30 minutes.
    Every30Minutes,
    /// One sample per hour.
    EveryHour,
}

impl Resolution {
    /// Sampling interval in ticks (zero for [`Resolution::Full`]).
    pub fn interval_ticks(self) -> u64 {
        match self {
            Self::Full => 0,
            Self::TenPerSecond => 100 * TICKS_PER_MILLISECOND,
            Self::EverySecond => TICKS_PER_SECOND,
            Self::Every10Seconds => 10 * TICKS_PER_SECOND,
            Self::Every30Seconds => 30 * TICKS_PER_SECOND,
            Self::EveryMinute => TICKS_PER_MINUTE,
            Self::Every10Minutes => 10 * TICKS_PER_MINUTE,
            Self::Every30Minutes => 30 * TICKS_PER_MINUTE,
            Self::EveryHour => TICKS_PER_HOUR,
        }
    }

    /// Boundary that query start/stop times snap to at this resolution.
    pub fn baseline(self) -> Option<BaselineInterval> {
        let interval = self.interval_ticks();
        match self {
            Self::Full => None,
            _ if interval < TICKS_PER_MINUTE => Some(BaselineInterval::Second),
            _ if interval < TICKS_PER_HOUR => Some(BaselineInterval::Minute),
            _ => Some(BaselineInterval::Hour),
        }
    }
}

/// Truncation boundary for timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineInterval {
    /// Whole seconds.
    Second,
    /// Whole minutes.
    Minute,
    /// Whole hours.
    Hour,
}

impl BaselineInterval {
    /// Boundary width in ticks.
    pub fn ticks(self) -> u64 {
        match self {
            Self::Second => TICKS_PER_SECOND,
            Self::Minute => TICKS_PER_MINUTE,
            Self::Hour => TICKS_PER_HOUR,
        }
    }

    /// Truncates `timestamp` down to the boundary.
    pub fn snap(self, timestamp: u64) -> u64 {
        timestamp - timestamp % self.ticks()
    }
}

/// Picks a plot resolution suited to the span `[start, stop]`.
pub fn estimate_plot_resolution(start: u64, stop: u64) -> Resolution {
    let span = stop.saturating_sub(start);
    if span == 0 || span <= TICKS_PER_MINUTE {
        Resolution::Full
    } else if span <= 5 * TICKS_PER_MINUTE {
        Resolution::TenPerSecond
    } else if span <= 30 * TICKS_PER_MINUTE {
        Resolution::EverySecond
    } else if span <= 3 * TICKS_PER_HOUR {
        Resolution::Every10Seconds
    } else if span <= 8 * TICKS_PER_HOUR {
        Resolution::Every30Seconds
    } else if span <= TICKS_PER_DAY {
        Resolution::EveryMinute
    } else if span <= 7 * TICKS_PER_DAY {
        Resolution::Every10Minutes
    } else if span <= 21 * TICKS_PER_DAY {
        Resolution::Every30Minutes
    } else {
        Resolution::EveryHour
    }
}

/// Converts ticks to milliseconds since the Unix epoch.
pub fn ticks_to_unix_millis(ticks: u64) -> f64 {
    ticks.wrapping_sub(UNIX_BASE_TICKS) as i64 as f64 / TICKS_PER_MILLISECOND as f64
}

/// Converts milliseconds since the Unix epoch to ticks.
pub fn unix_millis_to_ticks(millis: i64) -> u64 {
    UNIX_BASE_TICKS.wrapping_add_signed(millis.saturating_mul(TICKS_PER_MILLISECOND as i64))
}
