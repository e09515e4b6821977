//! Summary metrics of a histogram store: sample totals, distance averages, compulsory and
//! coherence share, and hit/miss rates at given cache sizes.

use crate::core::Distance;
use crate::curve::MissRatioCurve;
use crate::error::{AnalysisError, Result};
use crate::histogram::{HistogramStore, ThreadSelection};
use std::rc::Rc;
use tracing::{debug, warn};

/// Aggregate metrics over the default selection of a store.
#[derive(Clone, Debug)]
pub struct ProfileMetrics {
    /// Total recorded accesses.
    pub total_samples: u64,
    /// Sum of distance × count over finite buckets.
    pub histogram_distance: f64,
    /// `histogram_distance / total_samples`.
    pub histogram_avg_distance: f64,
    /// Recorded `totalDist`, when every thread has it.
    pub recorded_total_distance: Option<f64>,
    /// Recorded `avgDist`, weighted by each thread's access count.
    pub avg_distance: Option<f64>,
    /// Recorded `medianDist`, weighted by each thread's access count.
    pub median_distance: Option<f64>,
    /// Share of accesses in the cold and invalidation buckets.
    pub cold_coherence_fraction: f64,
    /// Share of accesses in the two lowest buckets.
    pub bottom_fraction: f64,
    curve: Rc<MissRatioCurve>,
}

impl ProfileMetrics {
    pub fn from_store(store: &HistogramStore) -> Result<Self> {
        let selection = store.default_selection();
        let curve = store.cumulative_curve(&selection)?;
        let total_samples = store.access_count(&selection);
        let aggregate = store.aggregate(&selection);

        let mut histogram_distance = 0.0;
        let mut sentinel_count = 0u64;
        for (key, count) in aggregate.xvals.iter().zip(&aggregate.counts) {
            match key.finite() {
                Some(d) => histogram_distance += d.value() * *count as f64,
                None => sentinel_count += count,
            }
        }

        let recorded_total_distance = store.attribute_sum("totalDist", &selection);
        if let Some(recorded) = recorded_total_distance {
            if (recorded - histogram_distance).abs() > 0.5 {
                warn!(
                    store = store.name(),
                    recorded,
                    histogram = histogram_distance,
                    "totalDist does not match histogram"
                );
            }
        }

        let bottom_fraction = curve
            .points()
            .get(1)
            .or_else(|| curve.points().last())
            .map(|p| p.hit_fraction)
            .unwrap_or(0.0);

        let metrics = Self {
            total_samples,
            histogram_distance,
            histogram_avg_distance: histogram_distance / total_samples as f64,
            recorded_total_distance,
            avg_distance: weighted_attribute(store, &selection, "avgDist"),
            median_distance: weighted_attribute(store, &selection, "medianDist"),
            cold_coherence_fraction: sentinel_count as f64 / total_samples as f64,
            bottom_fraction,
            curve,
        };
        debug!(
            store = store.name(),
            samples = metrics.total_samples,
            avg = metrics.histogram_avg_distance,
            "computed metrics"
        );
        Ok(metrics)
    }

    pub fn hit_rate(&self, capacity: Distance) -> f64 {
        self.curve.hit_ratio(capacity)
    }

    pub fn miss_rate(&self, capacity: Distance) -> f64 {
        self.curve.miss_ratio(capacity)
    }
}

/// Attribute averaged over threads, weighted by each thread's access count.
pub fn weighted_attribute(
    store: &HistogramStore,
    selection: &ThreadSelection,
    name: &str,
) -> Option<f64> {
    let total = store.access_count(selection);
    if total == 0 {
        return None;
    }
    let mut weighted = 0.0;
    for thread in selection.threads() {
        let value = store.thread(*thread)?.attributes().get(name)?;
        weighted += value * store.access_count(&ThreadSelection::single(*thread)) as f64;
    }
    Some(weighted / total as f64)
}

/// One row of a miss-ratio table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MissRatioRow {
    pub size_bytes: u64,
    pub capacity: Distance,
    pub miss_ratio_percent: f64,
    pub predicted_misses: f64,
}

/// Predicted miss ratio and miss count of the default selection at each cache size.
pub fn miss_ratio_table(
    store: &HistogramStore,
    sizes_bytes: &[u64],
    block_bytes: u64,
) -> Result<Vec<MissRatioRow>> {
    if block_bytes == 0 {
        return Err(AnalysisError::Config("block size must be positive".into()));
    }
    let selection = store.default_selection();
    let curve = store.cumulative_curve(&selection)?;
    let accesses = store.access_count(&selection) as f64;
    Ok(sizes_bytes
        .iter()
        .map(|&size_bytes| {
            let capacity = Distance::lines(size_bytes / block_bytes);
            let ratio = curve.miss_ratio(capacity);
            MissRatioRow {
                size_bytes,
                capacity,
                miss_ratio_percent: ratio * 100.0,
                predicted_misses: ratio * accesses,
            }
        })
        .collect())
}
