//! Per-point measurement metadata consumed by trend queries.

use std::collections::BTreeMap;

use crate::error::{DenError, Result};

/// Lookup of configured measurement points.
pub trait MeasurementMetadata: Send + Sync {
    /// Configured samples per second for `point_id`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::NotFound` if the point is not configured.
    fn sample_rate(&self, point_id: u64) -> Result<f64>;

    /// Every configured point id, ascending.
    fn point_ids(&self) -> Vec<u64>;
}

/// In-memory metadata table.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    rates: BTreeMap<u64, f64>,
}

impl StaticMetadata {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a point.
    pub fn with_point(mut self, point_id: u64, sample_rate: f64) -> Self {
        self.rates.insert(point_id, sample_rate);
        self
    }
}

impl MeasurementMetadata for StaticMetadata {
    fn sample_rate(&self, point_id: u64) -> Result<f64> {
        self.rates
            .get(&point_id)
            .copied()
            .ok_or_else(|| DenError::NotFound(format!("measurement point {point_id}")))
    }

    fn point_ids(&self) -> Vec<u64> {
        self.rates.keys().copied().collect()
    }
}
