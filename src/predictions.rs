//! Interval hit predictions recorded by the profiler: for each tracked capacity, the number of
//! predicted hits in each profiling interval.

use crate::core::ThreadId;
use crate::error::{AnalysisError, Result};
use crate::histogram::{HistogramStore, ThreadSelection};
use std::collections::BTreeMap;
use tracing::warn;

/// One thread's predictions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntervalPredictions {
    /// Capacity -> predicted hits per interval.
    pub hits: BTreeMap<u64, Vec<u64>>,
    /// References per interval.
    pub accesses: Vec<u64>,
}

impl IntervalPredictions {
    pub fn sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.hits.keys().copied()
    }
}

/// Capacities tracked by the predictions; taken from thread 1 like the profiler output.
pub fn prediction_sizes(predictions: &BTreeMap<ThreadId, IntervalPredictions>) -> Vec<u64> {
    predictions
        .get(&ThreadId(1))
        .or_else(|| predictions.values().next())
        .map(|p| p.sizes().collect())
        .unwrap_or_default()
}

fn selected<'a>(
    predictions: &'a BTreeMap<ThreadId, IntervalPredictions>,
    selection: &ThreadSelection,
) -> Result<Vec<&'a IntervalPredictions>> {
    selection
        .threads()
        .iter()
        .map(|t| {
            predictions
                .get(t)
                .ok_or_else(|| AnalysisError::not_found(format!("predictions for thread {t}")))
        })
        .collect()
}

/// Hit ratio of each interval, summed over the selected threads. Empty intervals report 0.
pub fn hit_ratio_per_interval(
    predictions: &BTreeMap<ThreadId, IntervalPredictions>,
    size: u64,
    selection: &ThreadSelection,
) -> Result<Vec<f64>> {
    let threads = selected(predictions, selection)?;
    let Some(first) = threads.first() else {
        return Ok(Vec::new());
    };
    let intervals = first.accesses.len();
    let mut ratios = Vec::with_capacity(intervals);
    for i in 0..intervals {
        let accesses: u64 = threads.iter().map(|p| p.accesses.get(i).copied().unwrap_or(0)).sum();
        if accesses == 0 {
            ratios.push(0.0);
            continue;
        }
        let mut hits = 0u64;
        for p in &threads {
            let series = p
                .hits
                .get(&size)
                .ok_or_else(|| AnalysisError::not_found(format!("predictions for size {size}")))?;
            hits += series.get(i).copied().unwrap_or(0);
        }
        ratios.push(hits as f64 / accesses as f64);
    }
    Ok(ratios)
}

/// Hit ratio over the whole run for one capacity, normalized by `totalPredictionAccesses`.
pub fn overall_hit_ratio(
    store: &HistogramStore,
    predictions: &BTreeMap<ThreadId, IntervalPredictions>,
    size: u64,
    selection: &ThreadSelection,
) -> Result<f64> {
    let threads = selected(predictions, selection)?;
    let total_accesses = store
        .attribute_sum("totalPredictionAccesses", selection)
        .ok_or_else(|| AnalysisError::not_found("totalPredictionAccesses attribute"))?;
    let mut total_hits = 0u64;
    let mut interval_accesses = 0u64;
    for p in &threads {
        let series = p
            .hits
            .get(&size)
            .ok_or_else(|| AnalysisError::not_found(format!("predictions for size {size}")))?;
        total_hits += series.iter().sum::<u64>();
        interval_accesses += p.accesses.iter().sum::<u64>();
    }
    if interval_accesses as f64 != total_accesses {
        warn!(
            interval_accesses,
            total_prediction_accesses = total_accesses,
            "interval accesses do not match totalPredictionAccesses"
        );
    }
    if total_accesses == 0.0 {
        return Err(AnalysisError::EmptySelection);
    }
    Ok(total_hits as f64 / total_accesses)
}
