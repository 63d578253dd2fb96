//! Acquired data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered voltage readings from one triggered acquisition.
///
/// Index order is acquisition order and encodes time; the batch is immutable
/// once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    readings: Vec<f64>,
    acquired_at: DateTime<Utc>,
}

impl SampleBatch {
    /// Wrap readings acquired now.
    pub fn new(readings: Vec<f64>) -> Self {
        Self {
            readings,
            acquired_at: Utc::now(),
        }
    }

    /// Wrap readings with an explicit acquisition time.
    pub fn with_timestamp(readings: Vec<f64>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            readings,
            acquired_at,
        }
    }

    /// Readings in acquisition order.
    pub fn readings(&self) -> &[f64] {
        &self.readings
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True when the batch holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// When the batch was fetched.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Smallest and largest reading.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        let mut iter = self.readings.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// Node of the RC circuit being sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentPhase {
    /// Excitation voltage at the loaded generator output
    GeneratorPhase,
    /// Voltage across the capacitor
    CapacitorPhase,
}

impl ExperimentPhase {
    /// Phase that follows this one within a run, wrapping back to the start.
    pub fn next(self) -> Self {
        match self {
            ExperimentPhase::GeneratorPhase => ExperimentPhase::CapacitorPhase,
            ExperimentPhase::CapacitorPhase => ExperimentPhase::GeneratorPhase,
        }
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentPhase::GeneratorPhase => f.write_str("generator"),
            ExperimentPhase::CapacitorPhase => f.write_str("capacitor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let batch = SampleBatch::new(vec![0.3, 0.1, 0.2]);
        assert_eq!(batch.readings(), &[0.3, 0.1, 0.2]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.min_max(), Some((0.1, 0.3)));
    }

    #[test]
    fn test_empty_batch() {
        let batch = SampleBatch::new(Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.min_max(), None);
    }

    #[test]
    fn test_phase_alternation() {
        let p = ExperimentPhase::GeneratorPhase;
        assert_eq!(p.next(), ExperimentPhase::CapacitorPhase);
        assert_eq!(p.next().next(), ExperimentPhase::GeneratorPhase);
    }
}
