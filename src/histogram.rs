//! Histogram store: per-thread reuse-distance histograms and their recorded attributes.
//!
//! Input records come in two historical layouts. Both are resolved once, at load time, into the
//! canonical [`ThreadHistogram`] / [`HistogramStore`] shape used by every analysis.

use crate::core::{DistanceKey, ThreadId};
use crate::curve::MissRatioCurve;
use crate::predictions::IntervalPredictions;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{debug, warn};

/// Named numeric attributes recorded alongside a histogram (`sampleCount`, `coldCount`, ...).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadAttributes(BTreeMap<String, f64>);

impl ThreadAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ThreadAttributes {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Reuse-distance histogram of one thread: bucket key -> access count.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadHistogram {
    buckets: BTreeMap<DistanceKey, u64>,
    attributes: ThreadAttributes,
}

impl ThreadHistogram {
    pub fn new(buckets: BTreeMap<DistanceKey, u64>, attributes: ThreadAttributes) -> Self {
        Self {
            buckets,
            attributes,
        }
    }

    pub fn buckets(&self) -> &BTreeMap<DistanceKey, u64> {
        &self.buckets
    }

    pub fn count(&self, key: &DistanceKey) -> u64 {
        self.buckets.get(key).copied().unwrap_or(0)
    }

    pub fn attributes(&self) -> &ThreadAttributes {
        &self.attributes
    }

    /// Sum of all bucket counts.
    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Recorded `sampleCount`, or the histogram total when the attribute is absent.
    pub fn sample_count(&self) -> u64 {
        match self.attributes.get("sampleCount") {
            Some(n) => n as u64,
            None => {
                debug!("no sampleCount attribute, using histogram total");
                self.total()
            }
        }
    }

    /// Checks the recorded counts against the histogram. Mismatches are logged, never fatal,
    /// because the profiler's own counts are sometimes approximate.
    pub fn check_consistency(&self, thread: ThreadId) -> bool {
        let mut consistent = true;
        let samples = self.sample_count();
        if let Some(block) = self.attributes.get("blockAccessCount") {
            if self.attributes.contains("sampleCount") && block as u64 != samples {
                warn!(%thread, samples, block_accesses = block as u64, "sampleCount does not match blockAccessCount");
                consistent = false;
            }
        }
        let total = self.total();
        if total != samples {
            warn!(%thread, samples, histogram_total = total, "sampleCount does not match histogram");
            consistent = false;
        }
        consistent
    }
}

/// Which references a histogram covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKind {
    All,
    Read,
    Write,
    Fetch,
    Prefetch,
}

impl ReferenceKind {
    /// Key of the per-kind section in current-layout records.
    pub fn section_name(&self) -> Option<&'static str> {
        match self {
            ReferenceKind::All => None,
            ReferenceKind::Read => Some("read_histo"),
            ReferenceKind::Write => Some("write_histo"),
            ReferenceKind::Fetch => Some("fetch_histo"),
            ReferenceKind::Prefetch => Some("prefetch_histo"),
        }
    }

    pub const SECTIONS: [ReferenceKind; 4] = [
        ReferenceKind::Read,
        ReferenceKind::Write,
        ReferenceKind::Fetch,
        ReferenceKind::Prefetch,
    ];
}

/// Older list layout: `[histogram, attributes, time_histogram?, predictions?]`.
#[derive(Clone, Debug, Default)]
pub struct LegacyThreadRecord {
    pub histogram: ThreadHistogram,
    /// Rows are distance buckets, columns are time buckets.
    pub time_histogram: Option<Vec<Vec<u64>>>,
    pub predictions: Option<IntervalPredictions>,
}

/// Dict layout with optional per-reference-kind sections.
#[derive(Clone, Debug, Default)]
pub struct CurrentThreadRecord {
    pub histogram: ThreadHistogram,
    pub predictions: Option<IntervalPredictions>,
    pub sections: BTreeMap<ReferenceKind, ThreadHistogram>,
}

/// One thread's raw record, tagged by layout.
#[derive(Clone, Debug)]
pub enum ThreadRecord {
    Legacy(LegacyThreadRecord),
    Current(CurrentThreadRecord),
}

/// Sorted, de-duplicated set of threads; the memoization key for aggregates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadSelection(Vec<ThreadId>);

impl ThreadSelection {
    pub fn threads(&self) -> &[ThreadId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn single(thread: ThreadId) -> Self {
        Self(vec![thread])
    }
}

impl FromIterator<ThreadId> for ThreadSelection {
    fn from_iter<I: IntoIterator<Item = ThreadId>>(iter: I) -> Self {
        let set: BTreeSet<ThreadId> = iter.into_iter().collect();
        Self(set.into_iter().collect())
    }
}

/// Per-thread histograms of one profile plus memoized aggregates.
///
/// Immutable after construction; the caches are filled on first use and never invalidated.
#[derive(Debug)]
pub struct HistogramStore {
    name: String,
    threads: BTreeMap<ThreadId, ThreadHistogram>,
    xvals: Vec<DistanceKey>,
    pub(crate) curves: RefCell<HashMap<ThreadSelection, Rc<MissRatioCurve>>>,
    pub(crate) access_counts: RefCell<HashMap<ThreadSelection, u64>>,
}

impl HistogramStore {
    pub fn new(name: impl Into<String>, threads: BTreeMap<ThreadId, ThreadHistogram>) -> Self {
        let xvals: BTreeSet<DistanceKey> = threads
            .values()
            .flat_map(|h| h.buckets().keys().copied())
            .collect();
        Self {
            name: name.into(),
            threads,
            xvals: xvals.into_iter().collect(),
            curves: RefCell::new(HashMap::new()),
            access_counts: RefCell::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Union of the distance keys seen in any thread, ascending.
    pub fn xvals(&self) -> &[DistanceKey] {
        &self.xvals
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadHistogram> {
        self.threads.get(&id)
    }

    pub fn threads(&self) -> impl Iterator<Item = (ThreadId, &ThreadHistogram)> {
        self.threads.iter().map(|(id, h)| (*id, h))
    }

    /// Threads with a non-empty histogram; the selection used when the caller names none.
    pub fn default_selection(&self) -> ThreadSelection {
        self.threads
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.values().all(ThreadHistogram::is_empty)
    }

    /// Sum of an attribute over the selected threads; `None` if any thread lacks it.
    pub fn attribute_sum(&self, name: &str, selection: &ThreadSelection) -> Option<f64> {
        selection
            .threads()
            .iter()
            .map(|t| self.threads.get(t).and_then(|h| h.attributes().get(name)))
            .sum()
    }
}

/// A loaded stack: one histogram store per reference kind plus recorded predictions.
#[derive(Debug)]
pub struct ReuseProfile {
    name: String,
    all: HistogramStore,
    sections: BTreeMap<ReferenceKind, HistogramStore>,
    predictions: BTreeMap<ThreadId, IntervalPredictions>,
    time_histogram: Option<Vec<Vec<u64>>>,
}

impl ReuseProfile {
    /// Resolves raw per-thread records into the canonical per-kind stores.
    pub fn from_records(name: impl Into<String>, records: BTreeMap<ThreadId, ThreadRecord>) -> Self {
        let name = name.into();
        let mut per_kind: BTreeMap<ReferenceKind, BTreeMap<ThreadId, ThreadHistogram>> =
            BTreeMap::new();
        let mut predictions = BTreeMap::new();
        let mut time_histogram: Option<Vec<Vec<u64>>> = None;

        for (thread, record) in records {
            let (all, preds) = match record {
                ThreadRecord::Legacy(rec) => {
                    if let Some(th) = rec.time_histogram {
                        time_histogram = Some(match time_histogram.take() {
                            None => th,
                            Some(acc) => merge_time_histograms(acc, th),
                        });
                    }
                    (rec.histogram, rec.predictions)
                }
                ThreadRecord::Current(rec) => {
                    for (kind, hist) in rec.sections {
                        per_kind.entry(kind).or_default().insert(thread, hist);
                    }
                    (rec.histogram, rec.predictions)
                }
            };
            per_kind
                .entry(ReferenceKind::All)
                .or_default()
                .insert(thread, all);
            if let Some(p) = preds {
                predictions.insert(thread, p);
            }
        }

        let all = HistogramStore::new(
            name.clone(),
            per_kind.remove(&ReferenceKind::All).unwrap_or_default(),
        );
        let sections = per_kind
            .into_iter()
            .map(|(kind, threads)| (kind, HistogramStore::new(name.clone(), threads)))
            .collect();
        Self {
            name,
            all,
            sections,
            predictions,
            time_histogram,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self, kind: ReferenceKind) -> Option<&HistogramStore> {
        match kind {
            ReferenceKind::All => Some(&self.all),
            _ => self.sections.get(&kind),
        }
    }

    /// Store covering all references. Present (possibly empty) for every profile.
    pub fn all(&self) -> &HistogramStore {
        &self.all
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }

    pub fn predictions(&self) -> &BTreeMap<ThreadId, IntervalPredictions> {
        &self.predictions
    }

    /// Time-bucketed histogram summed over threads (legacy records only).
    pub fn time_histogram(&self) -> Option<&[Vec<u64>]> {
        self.time_histogram.as_deref()
    }
}

/// Element-wise sum, padding the shorter table with zero rows.
fn merge_time_histograms(mut acc: Vec<Vec<u64>>, other: Vec<Vec<u64>>) -> Vec<Vec<u64>> {
    let width = acc
        .first()
        .or_else(|| other.first())
        .map(Vec::len)
        .unwrap_or(0);
    while acc.len() < other.len() {
        acc.push(vec![0; width]);
    }
    for (row, other_row) in acc.iter_mut().zip(other) {
        if row.len() < other_row.len() {
            row.resize(other_row.len(), 0);
        }
        for (cell, v) in row.iter_mut().zip(other_row) {
            *cell += v;
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(buckets: &[(DistanceKey, u64)], sample_count: u64) -> ThreadHistogram {
        let attrs: ThreadAttributes = [("sampleCount", sample_count as f64)].into_iter().collect();
        ThreadHistogram::new(buckets.iter().copied().collect(), attrs)
    }

    #[test]
    fn consistent_histogram() {
        let h = histogram(
            &[(DistanceKey::lines(1), 10), (DistanceKey::lines(4), 5), (DistanceKey::Cold, 3)],
            18,
        );
        assert_eq!(h.total(), 18);
        assert!(h.check_consistency(ThreadId(0)));
    }

    #[test]
    fn corrupted_sample_count_is_flagged_not_fatal() {
        let h = histogram(&[(DistanceKey::lines(1), 10), (DistanceKey::Cold, 3)], 20);
        assert!(!h.check_consistency(ThreadId(0)));
        assert_eq!(h.sample_count(), 20);
    }

    #[test]
    fn missing_sample_count_falls_back_to_total() {
        let h = ThreadHistogram::new(
            [(DistanceKey::lines(2), 7)].into_iter().collect(),
            ThreadAttributes::new(),
        );
        assert_eq!(h.sample_count(), 7);
    }

    #[test]
    fn selection_is_sorted_and_deduplicated() {
        let sel: ThreadSelection = [ThreadId(3), ThreadId(1), ThreadId(3)].into_iter().collect();
        assert_eq!(sel.threads(), &[ThreadId(1), ThreadId(3)]);
    }

    #[test]
    fn store_xvals_are_union_and_empty_threads_excluded() {
        let mut threads = BTreeMap::new();
        threads.insert(ThreadId(0), histogram(&[(DistanceKey::lines(1), 2)], 2));
        threads.insert(ThreadId(1), histogram(&[(DistanceKey::lines(8), 1), (DistanceKey::Cold, 1)], 2));
        threads.insert(ThreadId(2), ThreadHistogram::default());
        let store = HistogramStore::new("t", threads);
        assert_eq!(
            store.xvals(),
            &[DistanceKey::lines(1), DistanceKey::lines(8), DistanceKey::Cold]
        );
        assert_eq!(store.default_selection().threads(), &[ThreadId(0), ThreadId(1)]);
    }

    #[test]
    fn records_resolve_into_sections() {
        let mut sections = BTreeMap::new();
        sections.insert(ReferenceKind::Read, histogram(&[(DistanceKey::lines(1), 4)], 4));
        let current = ThreadRecord::Current(CurrentThreadRecord {
            histogram: histogram(&[(DistanceKey::lines(1), 6)], 6),
            predictions: None,
            sections,
        });
        let legacy = ThreadRecord::Legacy(LegacyThreadRecord {
            histogram: histogram(&[(DistanceKey::lines(2), 3)], 3),
            time_histogram: Some(vec![vec![1, 2]]),
            predictions: None,
        });
        let records = [(ThreadId(0), current), (ThreadId(1), legacy)].into_iter().collect();
        let profile = ReuseProfile::from_records("p", records);
        assert_eq!(profile.all().default_selection().threads().len(), 2);
        let read = profile.store(ReferenceKind::Read).unwrap();
        assert_eq!(read.thread(ThreadId(0)).unwrap().total(), 4);
        assert!(profile.store(ReferenceKind::Prefetch).is_none());
        assert_eq!(profile.time_histogram().unwrap(), &[vec![1, 2]]);
    }

    #[test]
    fn time_histograms_merge_with_padding() {
        let merged = merge_time_histograms(vec![vec![1, 1]], vec![vec![1, 0], vec![2, 3]]);
        assert_eq!(merged, vec![vec![2, 1], vec![2, 3]]);
    }

    #[test]
    fn empty_profile_has_empty_all_store() {
        let profile = ReuseProfile::from_records("none", BTreeMap::new());
        assert!(profile.is_empty());
        assert!(profile.all().xvals().is_empty());
    }
}
