//! PC miss attribution: which instructions cause the misses at a given capacity, and how well
//! an approximate run reproduces the ranking of an exact one.

use crate::core::{Address, Distance};
use crate::error::{AnalysisError, Result};
use crate::library_map::{LibraryMap, NormalizedAddress};
use crate::pc_profile::PcProfile;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankingOptions {
    /// Count cold and invalidation buckets as misses.
    pub include_sentinels: bool,
    /// Keep only the first `slice` entries.
    pub slice: Option<usize>,
    /// Report shares of the profile's accesses instead of raw counts.
    pub as_fraction: bool,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            include_sentinels: true,
            slice: None,
            as_fraction: false,
        }
    }
}

/// A PC profile together with the library map of the run it came from.
#[derive(Clone, Copy, Debug)]
pub struct MappedProfile<'a> {
    pub profile: &'a PcProfile,
    pub map: &'a LibraryMap,
}

impl<'a> MappedProfile<'a> {
    pub fn new(profile: &'a PcProfile, map: &'a LibraryMap) -> Self {
        Self { profile, map }
    }
}

/// PCs with at least one miss at `capacity`, by miss count descending (address breaks ties).
pub fn ranked_misses(
    profile: &PcProfile,
    capacity: Distance,
    include_sentinels: bool,
) -> Vec<(Address, u64)> {
    let mut ranked: Vec<(Address, u64)> = profile
        .iter()
        .map(|(pc, r)| (pc, r.misses_at(capacity, include_sentinels)))
        .filter(|(_, misses)| *misses > 0)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Miss ranking at `capacity`; fractions are relative to every access recorded in the profile.
pub fn miss_contributors(
    profile: &PcProfile,
    capacity: Distance,
    options: &RankingOptions,
) -> Vec<(Address, f64)> {
    let mut ranked = ranked_misses(profile, capacity, options.include_sentinels);
    if let Some(slice) = options.slice {
        ranked.truncate(slice);
    }
    let scale = if options.as_fraction {
        let total = profile.histogram_total();
        if total == 0 {
            1.0
        } else {
            1.0 / total as f64
        }
    } else {
        1.0
    };
    ranked
        .into_iter()
        .map(|(pc, misses)| (pc, misses as f64 * scale))
        .collect()
}

/// Outcome of a weight-matched ranking comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightMatch<K> {
    /// Shortest baseline prefix reaching the coverage fraction.
    pub prefix_len: usize,
    /// Baseline misses covered by that prefix.
    pub baseline_covered: f64,
    /// Baseline misses of the PCs the candidate ranks in its own prefix.
    pub matched: f64,
    pub accuracy_percent: f64,
    /// Candidate PCs in the prefix that the baseline never saw miss.
    pub missing_from_baseline: Vec<K>,
}

/// Compares a candidate ranking against a baseline one.
///
/// The baseline prefix covering `coverage` of its misses fixes a length `N`; the candidate's
/// first `N` keys are then credited with the baseline's miss counts.
pub fn weight_matched_accuracy_ranked<K>(
    baseline: &[(K, f64)],
    candidate: &[K],
    coverage: f64,
) -> Result<WeightMatch<K>>
where
    K: Clone + Eq + Hash,
{
    if !(0.0..=1.0).contains(&coverage) {
        return Err(AnalysisError::InvalidFraction(coverage));
    }
    let total: f64 = baseline.iter().map(|(_, c)| c).sum();
    if total <= 0.0 {
        return Err(AnalysisError::EmptySelection);
    }
    let target = coverage * total;
    let mut covered = 0.0;
    let mut prefix_len = 0;
    while covered < target && prefix_len < baseline.len() {
        covered += baseline[prefix_len].1;
        prefix_len += 1;
    }
    if covered <= 0.0 {
        return Err(AnalysisError::degenerate("coverage selects no baseline misses"));
    }

    let counts: HashMap<&K, f64> = baseline.iter().map(|(k, c)| (k, *c)).collect();
    let mut matched = 0.0;
    let mut missing_from_baseline = Vec::new();
    for key in candidate.iter().take(prefix_len) {
        match counts.get(key) {
            Some(c) => matched += c,
            None => missing_from_baseline.push(key.clone()),
        }
    }
    let accuracy_percent = matched / covered * 100.0;
    info!(
        coverage,
        prefix_len,
        baseline_pcs = baseline.len(),
        baseline_covered = covered,
        matched,
        accuracy_percent,
        "weight-matched comparison"
    );
    Ok(WeightMatch {
        prefix_len,
        baseline_covered: covered,
        matched,
        accuracy_percent,
        missing_from_baseline,
    })
}

fn normalized_ranking(
    mapped: MappedProfile<'_>,
    capacity: Distance,
    include_sentinels: bool,
) -> Vec<(NormalizedAddress, f64)> {
    ranked_misses(mapped.profile, capacity, include_sentinels)
        .into_iter()
        .map(|(pc, misses)| (mapped.map.normalize(pc), misses as f64))
        .collect()
}

/// Weight-matched accuracy of two PC profiles from separate runs, compared by normalized PC.
pub fn weight_matched_accuracy(
    baseline: MappedProfile<'_>,
    candidate: MappedProfile<'_>,
    capacity: Distance,
    coverage: f64,
    include_sentinels: bool,
) -> Result<WeightMatch<NormalizedAddress>> {
    let baseline_ranking = normalized_ranking(baseline, capacity, include_sentinels);
    let candidate_ranking: Vec<NormalizedAddress> =
        normalized_ranking(candidate, capacity, include_sentinels)
            .into_iter()
            .map(|(pc, _)| pc)
            .collect();
    let result = weight_matched_accuracy_ranked(&baseline_ranking, &candidate_ranking, coverage)?;
    if !result.missing_from_baseline.is_empty() {
        debug!(
            missing = result.missing_from_baseline.len(),
            "candidate PCs absent from baseline ranking"
        );
    }
    Ok(result)
}

/// Top miss PCs of one profile at each capacity.
#[derive(Clone, Debug, PartialEq)]
pub struct TopMissSets {
    pub sets: Vec<BTreeSet<NormalizedAddress>>,
    /// `|set[i] ∩ set[i-1]|` for consecutive capacities.
    pub adjacent_intersections: Vec<usize>,
    /// Size of the intersection over all capacities.
    pub full_intersection: usize,
}

impl TopMissSets {
    pub fn sizes(&self) -> Vec<usize> {
        self.sets.iter().map(BTreeSet::len).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopMissOverlap {
    pub profiles: Vec<TopMissSets>,
    /// Per capacity, PCs shared by the first two profiles.
    pub overlap: Option<Vec<usize>>,
}

/// Compares the `count` heaviest miss PCs of each profile across a range of capacities.
pub fn top_miss_overlap(
    profiles: &[MappedProfile<'_>],
    capacities: &[Distance],
    count: usize,
    include_sentinels: bool,
) -> TopMissOverlap {
    let per_profile: Vec<TopMissSets> = profiles
        .iter()
        .map(|mapped| {
            let sets: Vec<BTreeSet<NormalizedAddress>> = capacities
                .iter()
                .map(|capacity| {
                    ranked_misses(mapped.profile, *capacity, include_sentinels)
                        .into_iter()
                        .take(count)
                        .map(|(pc, _)| mapped.map.normalize(pc))
                        .collect()
                })
                .collect();
            let adjacent_intersections = sets
                .windows(2)
                .map(|w| w[1].intersection(&w[0]).count())
                .collect();
            let full_intersection = sets
                .split_first()
                .map(|(first, rest)| {
                    first
                        .iter()
                        .filter(|pc| rest.iter().all(|s| s.contains(*pc)))
                        .count()
                })
                .unwrap_or(0);
            TopMissSets {
                sets,
                adjacent_intersections,
                full_intersection,
            }
        })
        .collect();
    let overlap = match per_profile.as_slice() {
        [a, b] => Some(
            a.sets
                .iter()
                .zip(&b.sets)
                .map(|(x, y)| x.intersection(y).count())
                .collect(),
        ),
        _ => None,
    };
    TopMissOverlap {
        profiles: per_profile,
        overlap,
    }
}

/// Access-share comparison of two profiles.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessShareOverlap {
    /// `Σ |share_a(pc) - share_b(pc)|` over the union of normalized PCs.
    pub total_difference: f64,
    pub accuracy_percent: f64,
    /// PCs each profile needs, heaviest first, to cover the requested access fraction.
    pub coverage_counts: [usize; 2],
    /// PCs present in both coverage sets.
    pub common: usize,
}

/// Compares how the two profiles distribute their accesses over instructions.
pub fn access_share_overlap(
    a: MappedProfile<'_>,
    b: MappedProfile<'_>,
    coverage: f64,
) -> Result<AccessShareOverlap> {
    if !(0.0..=1.0).contains(&coverage) {
        return Err(AnalysisError::InvalidFraction(coverage));
    }
    let shares_a = access_shares(a)?;
    let shares_b = access_shares(b)?;

    let keys: BTreeSet<&NormalizedAddress> = shares_a.iter().chain(&shares_b).map(|(k, _)| k).collect();
    let lookup_a: HashMap<&NormalizedAddress, f64> = shares_a.iter().map(|(k, v)| (k, *v)).collect();
    let lookup_b: HashMap<&NormalizedAddress, f64> = shares_b.iter().map(|(k, v)| (k, *v)).collect();
    let total_difference: f64 = keys
        .iter()
        .map(|k| {
            (lookup_a.get(k).copied().unwrap_or(0.0) - lookup_b.get(k).copied().unwrap_or(0.0)).abs()
        })
        .sum();

    let cover_a = coverage_set(&shares_a, coverage);
    let cover_b = coverage_set(&shares_b, coverage);
    let common = cover_a.intersection(&cover_b).count();
    let accuracy_percent = (1.0 - total_difference / 2.0) * 100.0;
    info!(total_difference, accuracy_percent, common, "access share overlap");
    Ok(AccessShareOverlap {
        total_difference,
        accuracy_percent,
        coverage_counts: [cover_a.len(), cover_b.len()],
        common,
    })
}

/// Normalized PCs with their share of all accesses, heaviest first.
fn access_shares(mapped: MappedProfile<'_>) -> Result<Vec<(NormalizedAddress, f64)>> {
    let total = mapped.profile.total_accesses();
    if total == 0 {
        return Err(AnalysisError::EmptySelection);
    }
    let mut by_count: Vec<(Address, u64)> = mapped
        .profile
        .iter()
        .map(|(pc, r)| (pc, r.access_count))
        .collect();
    by_count.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
    Ok(by_count
        .into_iter()
        .map(|(pc, count)| (mapped.map.normalize(pc), count as f64 / total as f64))
        .collect())
}

fn coverage_set(shares: &[(NormalizedAddress, f64)], coverage: f64) -> BTreeSet<&NormalizedAddress> {
    let mut covered = 0.0;
    shares
        .iter()
        .take_while(|(_, share)| {
            let take = covered < coverage;
            covered += share;
            take
        })
        .map(|(pc, _)| pc)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DistanceKey;
    use crate::library_map::ImageRange;
    use crate::pc_profile::{PcBucket, PcRecord};

    fn record(buckets: &[(DistanceKey, u64)]) -> PcRecord {
        let histogram = buckets
            .iter()
            .map(|(k, c)| (*k, PcBucket::count_only(*c)))
            .collect();
        let total = buckets.iter().map(|(_, c)| c).sum();
        PcRecord::new(0.0, total, histogram)
    }

    fn misses(pc: Address, count: u64) -> (Address, PcRecord) {
        (pc, record(&[(DistanceKey::lines(0), 1), (DistanceKey::Cold, count)]))
    }

    #[test]
    fn single_pc_example() {
        let p: PcProfile = [(
            0x10,
            record(&[
                (DistanceKey::lines(1), 10),
                (DistanceKey::lines(4), 5),
                (DistanceKey::Cold, 3),
            ]),
        )]
        .into_iter()
        .collect();
        let counts = miss_contributors(&p, Distance::lines(2), &RankingOptions::default());
        assert_eq!(counts, vec![(0x10, 8.0)]);
        let fractions = miss_contributors(
            &p,
            Distance::lines(2),
            &RankingOptions {
                as_fraction: true,
                ..RankingOptions::default()
            },
        );
        assert!((fractions[0].1 - 8.0 / 18.0).abs() < 1e-9);
    }

    #[test]
    fn ranking_is_sorted_sliced_and_skips_hit_only_pcs() {
        let mut records: Vec<(Address, PcRecord)> = vec![misses(1, 5), misses(2, 9), misses(3, 5)];
        records.push((4, record(&[(DistanceKey::lines(0), 7)])));
        let p: PcProfile = records.into_iter().collect();
        let ranked = ranked_misses(&p, Distance::lines(1), true);
        assert_eq!(ranked, vec![(2, 9), (1, 5), (3, 5)]);
        let sliced = miss_contributors(
            &p,
            Distance::lines(1),
            &RankingOptions {
                slice: Some(2),
                ..RankingOptions::default()
            },
        );
        assert_eq!(sliced.len(), 2);
        assert!(ranked_misses(&p, Distance::lines(1), false).is_empty());
    }

    #[test]
    fn weight_matched_prefix_example() {
        let baseline = vec![("A", 100.0), ("B", 50.0), ("C", 10.0)];
        let exact = weight_matched_accuracy_ranked(&baseline, &["A", "B", "C"], 0.9).unwrap();
        assert_eq!(exact.prefix_len, 2);
        assert_eq!(exact.baseline_covered, 150.0);
        assert!((exact.accuracy_percent - 100.0).abs() < 1e-9);

        let swapped = weight_matched_accuracy_ranked(&baseline, &["A", "C", "B"], 0.9).unwrap();
        assert_eq!(swapped.matched, 110.0);
        assert!((swapped.accuracy_percent - 110.0 / 150.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn candidate_pcs_missing_from_baseline_are_reported() {
        let baseline = vec![("A", 100.0), ("B", 50.0)];
        let r = weight_matched_accuracy_ranked(&baseline, &["Z", "A"], 1.0).unwrap();
        assert_eq!(r.prefix_len, 2);
        assert_eq!(r.missing_from_baseline, vec!["Z"]);
        assert_eq!(r.matched, 100.0);
    }

    #[test]
    fn weight_matched_rejects_bad_inputs() {
        let baseline: Vec<(&str, f64)> = vec![];
        assert!(matches!(
            weight_matched_accuracy_ranked(&baseline, &[], 0.8),
            Err(AnalysisError::EmptySelection)
        ));
        assert!(matches!(
            weight_matched_accuracy_ranked(&[("A", 1.0)], &["A"], 1.5),
            Err(AnalysisError::InvalidFraction(_))
        ));
    }

    #[test]
    fn weight_matched_across_relocated_runs() {
        let exact: PcProfile = [misses(0x400010, 100), misses(0x400020, 50), misses(0x400030, 10)]
            .into_iter()
            .collect();
        let sampled: PcProfile = [misses(0x800010, 60), misses(0x800020, 40)]
            .into_iter()
            .collect();
        let map_a = LibraryMap::new(vec![ImageRange::new("bench", 0x400000, 0x4fffff)]);
        let map_b = LibraryMap::new(vec![ImageRange::new("bench", 0x800000, 0x8fffff)]);
        let r = weight_matched_accuracy(
            MappedProfile::new(&exact, &map_a),
            MappedProfile::new(&sampled, &map_b),
            Distance::lines(1),
            0.9,
            true,
        )
        .unwrap();
        assert_eq!(r.prefix_len, 2);
        assert!((r.accuracy_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn top_miss_sets_and_overlap() {
        let a: PcProfile = [misses(1, 9), misses(2, 5), misses(3, 1)].into_iter().collect();
        let b: PcProfile = [misses(1, 4), misses(3, 8)].into_iter().collect();
        let map = LibraryMap::empty();
        let result = top_miss_overlap(
            &[MappedProfile::new(&a, &map), MappedProfile::new(&b, &map)],
            &[Distance::lines(1), Distance::lines(2)],
            2,
            true,
        );
        assert_eq!(result.profiles[0].sizes(), vec![2, 2]);
        assert_eq!(result.profiles[0].adjacent_intersections, vec![2]);
        assert_eq!(result.profiles[0].full_intersection, 2);
        assert_eq!(result.overlap, Some(vec![1, 1]));
    }

    #[test]
    fn identical_access_shares_overlap_fully() {
        let a: PcProfile = [misses(1, 9), misses(2, 1)].into_iter().collect();
        let map = LibraryMap::empty();
        let r = access_share_overlap(
            MappedProfile::new(&a, &map),
            MappedProfile::new(&a, &map),
            0.7,
        )
        .unwrap();
        assert!(r.total_difference.abs() < 1e-12);
        assert!((r.accuracy_percent - 100.0).abs() < 1e-9);
        assert_eq!(r.coverage_counts, [1, 1]);
        assert_eq!(r.common, 1);
    }
}
