//! Per-instruction reuse-distance records.

use crate::core::{Address, Distance, DistanceKey};
use std::collections::BTreeMap;

/// One histogram bucket of a PC: access count plus the mean distance inside the bucket.
///
/// The zero bucket and the sentinels carry only a count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PcBucket {
    pub count: u64,
    pub mean_distance: Option<f64>,
}

impl PcBucket {
    pub fn count_only(count: u64) -> Self {
        Self {
            count,
            mean_distance: None,
        }
    }

    pub fn with_mean(count: u64, mean_distance: f64) -> Self {
        Self {
            count,
            mean_distance: Some(mean_distance),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PcRecord {
    pub total_distance: f64,
    pub access_count: u64,
    pub histogram: BTreeMap<DistanceKey, PcBucket>,
}

impl PcRecord {
    pub fn new(
        total_distance: f64,
        access_count: u64,
        histogram: BTreeMap<DistanceKey, PcBucket>,
    ) -> Self {
        Self {
            total_distance,
            access_count,
            histogram,
        }
    }

    /// Accesses of this PC that miss in a fully-associative cache of `capacity` lines.
    ///
    /// Finite buckets at or above the capacity always count; the cold and invalidation buckets
    /// count only with `include_sentinels`.
    pub fn misses_at(&self, capacity: Distance, include_sentinels: bool) -> u64 {
        self.histogram
            .iter()
            .filter(|(key, _)| {
                key.misses_at(capacity) && (include_sentinels || !key.is_sentinel())
            })
            .map(|(_, b)| b.count)
            .sum()
    }

    /// Sum of all bucket counts.
    pub fn histogram_total(&self) -> u64 {
        self.histogram.values().map(|b| b.count).sum()
    }

    pub fn mean_distance(&self) -> f64 {
        if self.access_count == 0 {
            return 0.0;
        }
        self.total_distance / self.access_count as f64
    }
}

/// Per-PC records of one run, keyed by raw instruction address.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PcProfile {
    records: BTreeMap<Address, PcRecord>,
}

impl PcProfile {
    pub fn new(records: BTreeMap<Address, PcRecord>) -> Self {
        Self { records }
    }

    pub fn get(&self, pc: Address) -> Option<&PcRecord> {
        self.records.get(&pc)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &PcRecord)> {
        self.records.iter().map(|(pc, r)| (*pc, r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of recorded access counts over all PCs.
    pub fn total_accesses(&self) -> u64 {
        self.records.values().map(|r| r.access_count).sum()
    }

    /// Sum of histogram bucket counts over all PCs.
    pub fn histogram_total(&self) -> u64 {
        self.records.values().map(PcRecord::histogram_total).sum()
    }
}

impl FromIterator<(Address, PcRecord)> for PcProfile {
    fn from_iter<I: IntoIterator<Item = (Address, PcRecord)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
