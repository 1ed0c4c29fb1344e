//! Metrics aggregation query port.
//!
//! The alert evaluator consumes aggregated telemetry through this interface;
//! ingestion and time-series storage are external.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationKind {
    Avg,
    Sum,
    Count,
    Min,
    Max,
    P95,
    P99,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Raw samples for a metric within `[from, to]`, filtered by labels.
    async fn query_range(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        filters: &HashMap<String, String>,
    ) -> Result<Vec<MetricSample>>;
}

/// Aggregate a sample set. Empty input yields `None` for every kind except
/// `Count`, which is zero.
pub fn aggregate(values: &[f64], kind: AggregationKind) -> Option<f64> {
    if values.is_empty() {
        return match kind {
            AggregationKind::Count => Some(0.0),
            _ => None,
        };
    }

    match kind {
        AggregationKind::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggregationKind::Sum => Some(values.iter().sum()),
        AggregationKind::Count => Some(values.len() as f64),
        AggregationKind::Min => values.iter().cloned().reduce(f64::min),
        AggregationKind::Max => values.iter().cloned().reduce(f64::max),
        AggregationKind::P95 => Some(percentile(values, 95.0)),
        AggregationKind::P99 => Some(percentile(values, 99.0)),
    }
}

/// Percentile via linear interpolation between ranks on the sorted sample.
fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_aggregations() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(aggregate(&values, AggregationKind::Avg), Some(2.5));
        assert_eq!(aggregate(&values, AggregationKind::Sum), Some(10.0));
        assert_eq!(aggregate(&values, AggregationKind::Count), Some(4.0));
        assert_eq!(aggregate(&values, AggregationKind::Min), Some(1.0));
        assert_eq!(aggregate(&values, AggregationKind::Max), Some(4.0));
    }

    #[test]
    fn empty_sample_yields_none_except_count() {
        assert_eq!(aggregate(&[], AggregationKind::Avg), None);
        assert_eq!(aggregate(&[], AggregationKind::P95), None);
        assert_eq!(aggregate(&[], AggregationKind::Count), Some(0.0));
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        // Rank for p95 over 5 points is 3.8: 40 + 0.8 * (50 - 40).
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        let p95 = aggregate(&values, AggregationKind::P95).unwrap();
        assert!((p95 - 48.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_of_single_sample_is_that_sample() {
        assert_eq!(aggregate(&[42.0], AggregationKind::P99), Some(42.0));
    }
}
