//! Aggregation and miss-ratio-curve engine.
//!
//! Per-thread histograms are merged into a cumulative hit-fraction curve over reuse distance.
//! For a fully-associative LRU cache of `C` lines the predicted miss ratio is `1 - curve(C)`,
//! so one profiling pass yields predictions for every capacity at once.

use crate::core::{Distance, DistanceKey, RAW_COLD_KEY, RAW_INVALIDATION_KEY};
use crate::error::{AnalysisError, Result};
use crate::histogram::{HistogramStore, ThreadSelection};
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Largest tolerated deviation of a normalized histogram's sum from 1.0.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-7;

/// Stand-in x value for the zero-distance bucket on log-scale axes.
pub const ZERO_DISTANCE_PLACEHOLDER: f64 = 0.5;

/// Bucket window for histogram queries: drop keys below `start`, keep indices before `end_index`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DistanceRange {
    pub start: Option<Distance>,
    pub end_index: Option<usize>,
}

impl DistanceRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn starting_at(start: Distance) -> Self {
        Self {
            start: Some(start),
            end_index: None,
        }
    }

    /// Index window into `xvals`; logs when leading buckets are cut off.
    fn window(&self, xvals: &[DistanceKey]) -> (usize, usize) {
        let begin = match self.start {
            Some(start) => xvals
                .iter()
                .position(|k| *k >= DistanceKey::Finite(start))
                .unwrap_or(xvals.len()),
            None => 0,
        };
        if begin > 0 {
            warn!(start = ?self.start, dropped = begin, "starting distance cuts off buckets");
        }
        let end = self.end_index.unwrap_or(xvals.len()).min(xvals.len());
        (begin, end.max(begin))
    }
}

/// Bucket counts summed over a thread selection, on the store's shared distance axis.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateProfile {
    pub xvals: Vec<DistanceKey>,
    pub counts: Vec<u64>,
}

impl AggregateProfile {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Histogram values on a distance axis, raw counts or fractions.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketSeries {
    pub xvals: Vec<DistanceKey>,
    pub values: Vec<f64>,
}

impl BucketSeries {
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn plot_distances(&self) -> Vec<f64> {
        plot_distances(&self.xvals)
    }
}

/// X values suitable for a log-scale axis: the zero bucket moves to a small positive placeholder
/// and the sentinels keep their raw encodings.
pub fn plot_distances(xvals: &[DistanceKey]) -> Vec<f64> {
    xvals
        .iter()
        .map(|k| match k {
            DistanceKey::Finite(d) if d.value() == 0.0 => ZERO_DISTANCE_PLACEHOLDER,
            DistanceKey::Finite(d) => d.value(),
            DistanceKey::Invalidation => RAW_INVALIDATION_KEY,
            DistanceKey::Cold => RAW_COLD_KEY,
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CurvePoint {
    pub distance: DistanceKey,
    /// Fraction of all accesses with reuse distance at or below `distance`.
    pub hit_fraction: f64,
}

/// Cumulative hit-fraction curve; non-decreasing, reaching 1.0 once the sentinels are included.
#[derive(Clone, Debug, PartialEq)]
pub struct MissRatioCurve {
    points: Vec<CurvePoint>,
}

impl MissRatioCurve {
    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_distance(&self) -> Option<DistanceKey> {
        self.points.last().map(|p| p.distance)
    }

    /// Smallest distance whose cumulative fraction reaches `fraction`.
    ///
    /// Fractions at or above 1.0 return the largest distance.
    pub fn quantile(&self, fraction: f64) -> Result<DistanceKey> {
        if fraction.is_nan() || fraction < 0.0 {
            return Err(AnalysisError::InvalidFraction(fraction));
        }
        let last = self.last_distance().ok_or(AnalysisError::EmptySelection)?;
        if fraction >= 1.0 {
            return Ok(last);
        }
        Ok(self
            .points
            .iter()
            .find(|p| p.hit_fraction >= fraction)
            .map(|p| p.distance)
            .unwrap_or(last))
    }

    /// Predicted hit ratio for a cache of `capacity` lines.
    ///
    /// Returns the value of the entry just before the first distance exceeding `capacity`, so a
    /// bucket exactly at `capacity` counts as a hit.
    pub fn hit_ratio(&self, capacity: Distance) -> f64 {
        if capacity == Distance::ZERO {
            return 0.0;
        }
        let limit = DistanceKey::Finite(capacity);
        match self.points.iter().position(|p| p.distance > limit) {
            Some(0) => 0.0,
            Some(idx) => self.points[idx - 1].hit_fraction,
            None => self.points.last().map(|p| p.hit_fraction).unwrap_or(0.0),
        }
    }

    pub fn miss_ratio(&self, capacity: Distance) -> f64 {
        1.0 - self.hit_ratio(capacity)
    }

    /// Step-function value at an arbitrary key (0 before the first point).
    pub fn value_at(&self, key: DistanceKey) -> f64 {
        self.points
            .iter()
            .take_while(|p| p.distance <= key)
            .last()
            .map(|p| p.hit_fraction)
            .unwrap_or(0.0)
    }
}

/// Result of comparing two normalized histograms bucket by bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramComparison {
    pub xvals: Vec<DistanceKey>,
    /// `other - self` per bucket.
    pub abs_error: Vec<f64>,
    /// `(1 - sum|error| / 2) * 100`.
    pub accuracy_percent: f64,
}

impl HistogramStore {
    /// Total recorded accesses of the selected threads (sum of `sampleCount`).
    ///
    /// Mismatches with the histogram contents are reported once per selection and ignored.
    pub fn access_count(&self, selection: &ThreadSelection) -> u64 {
        if let Some(count) = self.access_counts.borrow().get(selection) {
            return *count;
        }
        let mut total = 0;
        for thread in selection.threads() {
            match self.thread(*thread) {
                Some(h) => {
                    h.check_consistency(*thread);
                    total += h.sample_count();
                }
                None => warn!(%thread, store = self.name(), "thread not present in profile"),
            }
        }
        self.access_counts
            .borrow_mut()
            .insert(selection.clone(), total);
        total
    }

    fn bucket_sums(&self, keys: &[DistanceKey], selection: &ThreadSelection) -> Vec<u64> {
        keys.iter()
            .map(|key| {
                selection
                    .threads()
                    .iter()
                    .filter_map(|t| self.thread(*t))
                    .map(|h| h.count(key))
                    .sum()
            })
            .collect()
    }

    /// Sums bucket counts across the selection, missing buckets counting as zero.
    pub fn aggregate(&self, selection: &ThreadSelection) -> AggregateProfile {
        AggregateProfile {
            xvals: self.xvals().to_vec(),
            counts: self.bucket_sums(self.xvals(), selection),
        }
    }

    /// Histogram over a bucket window, optionally normalized by the windowed total.
    pub fn histogram(
        &self,
        selection: &ThreadSelection,
        range: &DistanceRange,
        normalized: bool,
    ) -> Result<BucketSeries> {
        let (begin, end) = range.window(self.xvals());
        let xvals = self.xvals()[begin..end].to_vec();
        let counts = self.bucket_sums(&xvals, selection);
        series_from_counts(xvals, &counts, normalized, self.access_count(selection))
    }

    /// Cumulative hit-fraction curve of the selection, memoized per selection.
    pub fn cumulative_curve(&self, selection: &ThreadSelection) -> Result<Rc<MissRatioCurve>> {
        if let Some(curve) = self.curves.borrow().get(selection) {
            return Ok(Rc::clone(curve));
        }
        if selection.is_empty() {
            return Err(AnalysisError::EmptySelection);
        }
        let total = self.access_count(selection);
        if total == 0 {
            return Err(AnalysisError::EmptySelection);
        }
        let aggregate = self.aggregate(selection);
        let mut cumulative = 0u64;
        let points = aggregate
            .xvals
            .iter()
            .zip(&aggregate.counts)
            .map(|(distance, count)| {
                cumulative += count;
                CurvePoint {
                    distance: *distance,
                    hit_fraction: cumulative as f64 / total as f64,
                }
            })
            .collect();
        let curve = Rc::new(MissRatioCurve { points });
        debug!(store = self.name(), threads = selection.threads().len(), "built cumulative curve");
        self.curves
            .borrow_mut()
            .insert(selection.clone(), Rc::clone(&curve));
        Ok(curve)
    }

    /// Curve over the default selection.
    pub fn default_curve(&self) -> Result<Rc<MissRatioCurve>> {
        self.cumulative_curve(&self.default_selection())
    }

    /// Smallest distance reached by `fraction` of the default selection's accesses.
    pub fn quantile(&self, fraction: f64) -> Result<DistanceKey> {
        self.default_curve()?.quantile(fraction)
    }

    /// Predicted miss ratio of the default selection for a cache of `capacity` lines.
    pub fn predict_miss_ratio(&self, capacity: Distance) -> Result<f64> {
        Ok(self.default_curve()?.miss_ratio(capacity))
    }

    /// Relative error of this profile's miss-ratio curve against `other`, per distance of this
    /// profile: `((1 - other) - (1 - self)) / (1 - other)`, or `1 - self` where `other` is 1.
    pub fn curve_relative_error(&self, other: &HistogramStore) -> Result<Vec<f64>> {
        let mine = self.default_curve()?;
        let theirs = other.default_curve()?;
        let errors: Vec<f64> = mine
            .points()
            .iter()
            .map(|p| {
                let o = theirs.value_at(p.distance);
                if o != 1.0 {
                    ((1.0 - o) - (1.0 - p.hit_fraction)) / (1.0 - o)
                } else {
                    1.0 - p.hit_fraction
                }
            })
            .collect();
        if let Some(last) = errors.last() {
            if *last > 0.01 {
                warn!(relative_error = *last, "curve relative error above 1%");
            }
        }
        Ok(errors)
    }

    /// Compares normalized histograms of both profiles over the union of their distance keys.
    pub fn histogram_difference(
        &self,
        other: &HistogramStore,
        range: &DistanceRange,
    ) -> Result<HistogramComparison> {
        let union: Vec<DistanceKey> = self
            .xvals()
            .iter()
            .chain(other.xvals())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (begin, end) = range.window(&union);
        let xvals = union[begin..end].to_vec();

        let my_sel = self.default_selection();
        let their_sel = other.default_selection();
        let mine = series_from_counts(
            xvals.clone(),
            &self.bucket_sums(&xvals, &my_sel),
            true,
            self.access_count(&my_sel),
        )?;
        let theirs = series_from_counts(
            xvals.clone(),
            &other.bucket_sums(&xvals, &their_sel),
            true,
            other.access_count(&their_sel),
        )?;

        let abs_error: Vec<f64> = mine
            .values
            .iter()
            .zip(&theirs.values)
            .map(|(m, o)| o - m)
            .collect();
        let error_sum: f64 = abs_error.iter().map(|e| e.abs()).sum();
        let accuracy_percent = (1.0 - error_sum / 2.0) * 100.0;
        info!(error_sum, accuracy_percent, "histogram difference");
        Ok(HistogramComparison {
            xvals,
            abs_error,
            accuracy_percent,
        })
    }
}

fn series_from_counts(
    xvals: Vec<DistanceKey>,
    counts: &[u64],
    normalized: bool,
    access_count: u64,
) -> Result<BucketSeries> {
    let windowed: u64 = counts.iter().sum();
    let values: Vec<f64> = if normalized {
        if windowed == 0 {
            return Err(AnalysisError::EmptySelection);
        }
        let values: Vec<f64> = counts.iter().map(|c| *c as f64 / windowed as f64).collect();
        check_normalized(&values);
        values
    } else {
        counts.iter().map(|c| *c as f64).collect()
    };
    if windowed < access_count {
        info!(
            excluded_percent = (access_count - windowed) as f64 / access_count as f64 * 100.0,
            "histogram window excludes accesses"
        );
    }
    Ok(BucketSeries { xvals, values })
}

/// Warns when normalized values stray from summing to 1. The values are used either way.
fn check_normalized(values: &[f64]) -> bool {
    let sum: f64 = values.iter().sum();
    let within = (sum - 1.0).abs() <= NORMALIZATION_TOLERANCE;
    if !within {
        warn!(sum, "normalized histogram does not sum to 1");
    }
    within
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ThreadId;
    use crate::histogram::{ThreadAttributes, ThreadHistogram};
    use std::collections::BTreeMap;

    fn histogram(buckets: &[(DistanceKey, u64)]) -> ThreadHistogram {
        let total: u64 = buckets.iter().map(|(_, c)| c).sum();
        let attrs: ThreadAttributes = [("sampleCount", total as f64)].into_iter().collect();
        ThreadHistogram::new(buckets.iter().copied().collect(), attrs)
    }

    fn example() -> Vec<(DistanceKey, u64)> {
        vec![
            (DistanceKey::lines(1), 10),
            (DistanceKey::lines(4), 5),
            (DistanceKey::Cold, 3),
        ]
    }

    fn store(threads: Vec<Vec<(DistanceKey, u64)>>) -> HistogramStore {
        let map: BTreeMap<ThreadId, ThreadHistogram> = threads
            .iter()
            .enumerate()
            .map(|(i, b)| (ThreadId(i as u32), histogram(b)))
            .collect();
        HistogramStore::new("test", map)
    }

    #[test]
    fn example_curve_values() {
        let s = store(vec![example()]);
        let curve = s.default_curve().unwrap();
        let values: Vec<f64> = curve.points().iter().map(|p| p.hit_fraction).collect();
        assert!((values[0] - 10.0 / 18.0).abs() < 1e-9);
        assert!((values[1] - 15.0 / 18.0).abs() < 1e-9);
        assert_eq!(values[2], 1.0);
    }

    #[test]
    fn example_quantile() {
        let s = store(vec![example()]);
        assert_eq!(s.quantile(0.6).unwrap(), DistanceKey::lines(4));
        assert_eq!(s.quantile(0.5).unwrap(), DistanceKey::lines(1));
        assert_eq!(s.quantile(1.0).unwrap(), DistanceKey::Cold);
        assert!(s.quantile(-0.1).is_err());
    }

    #[test]
    fn hit_ratio_includes_bucket_equal_to_capacity() {
        let s = store(vec![example()]);
        let curve = s.default_curve().unwrap();
        assert!((curve.hit_ratio(Distance::lines(4)) - 15.0 / 18.0).abs() < 1e-9);
        assert!((curve.hit_ratio(Distance::lines(2)) - 10.0 / 18.0).abs() < 1e-9);
        assert_eq!(curve.hit_ratio(Distance::ZERO), 0.0);
        assert!((s.predict_miss_ratio(Distance::lines(2)).unwrap() - 8.0 / 18.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_below_first_bucket_predicts_no_hits() {
        let s = store(vec![vec![(DistanceKey::lines(8), 4), (DistanceKey::Cold, 1)]]);
        let curve = s.default_curve().unwrap();
        assert_eq!(curve.hit_ratio(Distance::lines(2)), 0.0);
    }

    #[test]
    fn curve_is_memoized_per_selection() {
        let s = store(vec![example(), example()]);
        let sel = s.default_selection();
        let a = s.cumulative_curve(&sel).unwrap();
        let b = s.cumulative_curve(&sel).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        let single = s.cumulative_curve(&ThreadSelection::single(ThreadId(0))).unwrap();
        assert!(!Rc::ptr_eq(&a, &single));
    }

    #[test]
    fn replicated_threads_give_same_curve() {
        let s = store(vec![example(), example()]);
        let both = s.default_curve().unwrap();
        let one = s.cumulative_curve(&ThreadSelection::single(ThreadId(1))).unwrap();
        assert_eq!(both.points(), one.points());
    }

    #[test]
    fn empty_selection_fails() {
        let s = store(vec![example()]);
        let none: ThreadSelection = std::iter::empty().collect();
        assert!(matches!(
            s.cumulative_curve(&none),
            Err(AnalysisError::EmptySelection)
        ));
    }

    #[test]
    fn histogram_window_and_normalization() {
        let s = store(vec![vec![
            (DistanceKey::lines(0), 2),
            (DistanceKey::lines(1), 10),
            (DistanceKey::lines(4), 5),
            (DistanceKey::Cold, 3),
        ]]);
        let sel = s.default_selection();
        let raw = s.histogram(&sel, &DistanceRange::full(), false).unwrap();
        assert_eq!(raw.values, vec![2.0, 10.0, 5.0, 3.0]);
        assert_eq!(raw.plot_distances()[0], ZERO_DISTANCE_PLACEHOLDER);

        let trimmed = s
            .histogram(&sel, &DistanceRange::starting_at(Distance::lines(1)), true)
            .unwrap();
        assert_eq!(trimmed.xvals.len(), 3);
        assert!((trimmed.sum() - 1.0).abs() < 1e-12);
        assert!((trimmed.values[0] - 10.0 / 18.0).abs() < 1e-9);

        let head = DistanceRange {
            start: None,
            end_index: Some(2),
        };
        assert_eq!(s.histogram(&sel, &head, false).unwrap().values, vec![2.0, 10.0]);
    }

    #[test]
    fn normalization_tolerance() {
        assert!(check_normalized(&[0.25, 0.75]));
        assert!(check_normalized(&[0.5, 0.5 + 5e-8]));
        assert!(!check_normalized(&[0.5, 0.5 + 1e-6]));
        assert!(!check_normalized(&[]));
    }

    #[test]
    fn start_cutoff_keeps_remaining_buckets_intact() {
        let s = store(vec![
            vec![(DistanceKey::lines(1), 4), (DistanceKey::lines(16), 6), (DistanceKey::Cold, 2)],
            vec![(DistanceKey::lines(2), 3), (DistanceKey::Invalidation, 1)],
        ]);
        let sel = s.default_selection();
        let cut = s
            .histogram(&sel, &DistanceRange::starting_at(Distance::lines(3)), false)
            .unwrap();
        assert_eq!(
            cut.xvals,
            vec![DistanceKey::lines(16), DistanceKey::Invalidation, DistanceKey::Cold]
        );
        assert_eq!(cut.values, vec![6.0, 1.0, 2.0]);

        let normalized = s
            .histogram(&sel, &DistanceRange::starting_at(Distance::lines(3)), true)
            .unwrap();
        assert!((normalized.values[0] - 6.0 / 9.0).abs() < 1e-12);

        // past every finite bucket only the sentinels remain
        let sentinels = s
            .histogram(&sel, &DistanceRange::starting_at(Distance::lines(100)), false)
            .unwrap();
        assert_eq!(sentinels.values, vec![1.0, 2.0]);
        // the curve itself is unaffected by a windowed query
        assert_eq!(s.default_curve().unwrap().points().len(), 5);
    }

    #[test]
    fn access_count_uses_recorded_sample_counts() {
        let mut threads = BTreeMap::new();
        let attrs: ThreadAttributes = [("sampleCount", 25.0)].into_iter().collect();
        threads.insert(
            ThreadId(0),
            ThreadHistogram::new(example().into_iter().collect(), attrs),
        );
        let s = HistogramStore::new("corrupt", threads);
        assert_eq!(s.access_count(&s.default_selection()), 25);
        // recorded count exceeds the histogram, so the curve tops out below 1
        let curve = s.default_curve().unwrap();
        assert!((curve.points().last().unwrap().hit_fraction - 18.0 / 25.0).abs() < 1e-9);
    }

    #[test]
    fn identical_profiles_compare_perfectly() {
        let a = store(vec![example()]);
        let b = store(vec![example()]);
        let cmp = a.histogram_difference(&b, &DistanceRange::full()).unwrap();
        assert!((cmp.accuracy_percent - 100.0).abs() < 1e-9);
        let rel = a.curve_relative_error(&b).unwrap();
        assert!(rel.iter().all(|e| e.abs() < 1e-12));
    }

    #[test]
    fn histogram_difference_over_union_of_keys() {
        let a = store(vec![vec![(DistanceKey::lines(1), 1), (DistanceKey::Cold, 1)]]);
        let b = store(vec![vec![(DistanceKey::lines(2), 1), (DistanceKey::Cold, 1)]]);
        let cmp = a.histogram_difference(&b, &DistanceRange::full()).unwrap();
        assert_eq!(cmp.xvals.len(), 3);
        assert_eq!(cmp.abs_error, vec![-0.5, 0.5, 0.0]);
        assert!((cmp.accuracy_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn value_at_is_a_step_function() {
        let s = store(vec![example()]);
        let curve = s.default_curve().unwrap();
        assert_eq!(curve.value_at(DistanceKey::lines(0)), 0.0);
        assert!((curve.value_at(DistanceKey::lines(3)) - 10.0 / 18.0).abs() < 1e-9);
        assert_eq!(curve.value_at(DistanceKey::Cold), 1.0);
    }
}
