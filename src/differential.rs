//! Differential profiles: per-PC miss deltas between two profiles sharing a sampling period,
//! used to carry a measured improvement over to another profile.

use crate::error::{AnalysisError, Result};
use crate::miss_profile::{MissProfile, PcKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// `misses(first) - misses(second)` for every PC in either profile.
///
/// Immutable once built; adjustments write into the target profile only.
#[derive(Clone, Debug, PartialEq)]
pub struct DifferentialProfile {
    sample_period: u64,
    deltas: BTreeMap<PcKey, f64>,
    /// Miss counts of the first profile.
    baseline: BTreeMap<PcKey, f64>,
    /// Instruction counts of the first profile.
    instructions: BTreeMap<PcKey, u64>,
}

/// Result of comparing two independently computed diffs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiffComparison {
    /// Sum of period-scaled delta differences over the union of PCs.
    pub error: f64,
    pub relative_error: f64,
}

/// On-disk form; PC keys are not strings, so maps are stored as entry lists.
#[derive(Serialize, Deserialize)]
struct PersistedDiff {
    sample_period: u64,
    deltas: Vec<(PcKey, f64)>,
    baseline: Vec<(PcKey, f64)>,
    instructions: Vec<(PcKey, u64)>,
}

impl DifferentialProfile {
    /// Diffs two profiles. Their sampling periods must match.
    pub fn new(first: &MissProfile, second: &MissProfile) -> Result<Self> {
        if first.sample_period() != second.sample_period() {
            return Err(AnalysisError::IncompatibleInputs {
                left: first.sample_period(),
                right: second.sample_period(),
            });
        }
        let mut deltas: BTreeMap<PcKey, f64> = first
            .misses()
            .iter()
            .map(|(pc, count)| (pc.clone(), count - second.miss_count(pc).unwrap_or(0.0)))
            .collect();
        for (pc, count) in second.misses() {
            deltas.entry(pc.clone()).or_insert(-count);
        }
        debug!(
            first = first.name(),
            second = second.name(),
            pcs = deltas.len(),
            "built differential profile"
        );
        Ok(Self {
            sample_period: first.sample_period(),
            deltas,
            baseline: first.misses().clone(),
            instructions: first.instruction_counts().clone(),
        })
    }

    pub fn sample_period(&self) -> u64 {
        self.sample_period
    }

    pub fn deltas(&self) -> &BTreeMap<PcKey, f64> {
        &self.deltas
    }

    pub fn delta(&self, pc: &PcKey) -> Option<f64> {
        self.deltas.get(pc).copied()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// `delta / baseline` for every PC the first profile saw miss.
    pub fn relative_reductions(&self) -> BTreeMap<PcKey, f64> {
        self.deltas
            .iter()
            .filter_map(|(pc, delta)| match self.baseline.get(pc) {
                Some(base) if *base != 0.0 => Some((pc.clone(), delta / base)),
                _ => None,
            })
            .collect()
    }

    /// Sum of deltas relative to the first profile's total misses.
    pub fn total_relative_change(&self) -> Result<f64> {
        let baseline: f64 = self.baseline.values().sum();
        if baseline == 0.0 {
            return Err(AnalysisError::degenerate("baseline profile has no misses"));
        }
        Ok(self.deltas.values().sum::<f64>() / baseline)
    }

    /// Applies each positive relative reduction to the target's count for the same PC.
    /// Returns how many PCs changed.
    pub fn adjust_relative(&self, target: &mut MissProfile) -> usize {
        let reductions = self.relative_reductions();
        let updates: Vec<(PcKey, f64)> = target
            .misses()
            .iter()
            .filter_map(|(pc, count)| match reductions.get(pc) {
                Some(r) if *r > 0.0 => Some((pc.clone(), count - r * count)),
                _ => None,
            })
            .collect();
        let adjusted = updates.len();
        for (pc, count) in updates {
            target.record_misses(pc, count);
        }
        info!(profile = target.name(), adjusted, "applied relative adjustment");
        adjusted
    }

    /// Subtracts each delta from the target after rescaling it to the target's time base.
    ///
    /// The delta is scaled by `diff period / target period`, and by the ratio of the target's
    /// instruction count to this diff's instruction count at that PC when both are known.
    /// The period ratio is diff over target, so a diff sampled twice as sparsely counts double.
    /// PCs without a delta are left as they are. Returns how many PCs changed.
    pub fn adjust_scaled(&self, target: &mut MissProfile) -> usize {
        let scale = self.sample_period as f64 / target.sample_period() as f64;
        let updates: Vec<(PcKey, f64)> = target
            .misses()
            .iter()
            .filter_map(|(pc, count)| {
                let delta = self.deltas.get(pc)?;
                let pc_scale = match (target.instructions(pc), self.instructions.get(pc)) {
                    (Some(theirs), Some(ours)) if *ours > 0 => {
                        theirs as f64 / (*ours as f64 * scale)
                    }
                    _ => 1.0,
                };
                Some((pc.clone(), count - delta * scale * pc_scale))
            })
            .collect();
        let adjusted = updates.len();
        for (pc, count) in updates {
            target.record_misses(pc, count);
        }
        info!(profile = target.name(), scale, adjusted, "applied scaled adjustment");
        adjusted
    }

    /// Normalized error between this diff and `other`, in absolute (period-scaled) misses.
    pub fn compare_to(&self, other: &DifferentialProfile) -> Result<DiffComparison> {
        let mine = self.sample_period as f64;
        let theirs = other.sample_period as f64;
        let keys: BTreeSet<&PcKey> = self.deltas.keys().chain(other.deltas.keys()).collect();
        let error: f64 = keys
            .into_iter()
            .map(|pc| {
                self.delta(pc).unwrap_or(0.0) * mine - other.delta(pc).unwrap_or(0.0) * theirs
            })
            .sum();
        let denominator = self.deltas.values().sum::<f64>() * mine
            + other.deltas.values().sum::<f64>() * theirs;
        if denominator == 0.0 {
            return Err(AnalysisError::degenerate("total deltas sum to zero"));
        }
        let relative_error = error / denominator;
        info!(error, relative_error, "compared differential profiles");
        Ok(DiffComparison {
            error,
            relative_error,
        })
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let persisted = PersistedDiff {
            sample_period: self.sample_period,
            deltas: entries(&self.deltas),
            baseline: entries(&self.baseline),
            instructions: entries(&self.instructions),
        };
        serde_json::to_writer(writer, &persisted)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let persisted: PersistedDiff = serde_json::from_reader(reader)?;
        Ok(Self {
            sample_period: persisted.sample_period,
            deltas: persisted.deltas.into_iter().collect(),
            baseline: persisted.baseline.into_iter().collect(),
            instructions: persisted.instructions.into_iter().collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), pcs = self.len(), "saved differential profile");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| AnalysisError::from_open(e, path))?;
        let diff = Self::from_reader(BufReader::new(file))?;
        debug!(path = %path.display(), pcs = diff.len(), "loaded differential profile");
        Ok(diff)
    }
}

fn entries<V: Copy>(map: &BTreeMap<PcKey, V>) -> Vec<(PcKey, V)> {
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc(a: u64) -> PcKey {
        PcKey::Address(a)
    }

    fn profile(period: u64, misses: &[(u64, f64)], insts: &[(u64, u64)]) -> MissProfile {
        let mut p = MissProfile::new("p", period);
        for (a, m) in misses {
            p.record_misses(pc(*a), *m);
        }
        for (a, i) in insts {
            p.record_instructions(pc(*a), *i);
        }
        p
    }

    #[test]
    fn unequal_periods_are_incompatible() {
        let a = profile(1000, &[(1, 5.0)], &[]);
        let b = profile(2000, &[(1, 3.0)], &[]);
        assert!(matches!(
            DifferentialProfile::new(&a, &b),
            Err(AnalysisError::IncompatibleInputs {
                left: 1000,
                right: 2000
            })
        ));
    }

    #[test]
    fn deltas_cover_union_of_pcs() {
        let a = profile(10, &[(1, 10.0), (2, 4.0)], &[]);
        let b = profile(10, &[(1, 6.0), (3, 2.0)], &[]);
        let d = DifferentialProfile::new(&a, &b).unwrap();
        assert_eq!(d.delta(&pc(1)), Some(4.0));
        assert_eq!(d.delta(&pc(2)), Some(4.0));
        assert_eq!(d.delta(&pc(3)), Some(-2.0));
        assert_eq!(d.sample_period(), 10);
        let rel = d.relative_reductions();
        assert!((rel[&pc(1)] - 0.4).abs() < 1e-12);
        assert!(!rel.contains_key(&pc(3)));
        assert!((d.total_relative_change().unwrap() - 6.0 / 14.0).abs() < 1e-12);
    }

    #[test]
    fn relative_adjustment_only_for_positive_reductions() {
        let a = profile(1, &[(1, 10.0), (2, 5.0)], &[]);
        let b = profile(1, &[(1, 5.0), (2, 10.0)], &[]);
        let d = DifferentialProfile::new(&a, &b).unwrap();
        let mut target = profile(1, &[(1, 100.0), (2, 100.0), (9, 7.0)], &[]);
        assert_eq!(d.adjust_relative(&mut target), 1);
        assert_eq!(target.miss_count(&pc(1)), Some(50.0));
        assert_eq!(target.miss_count(&pc(2)), Some(100.0));
        assert_eq!(target.miss_count(&pc(9)), Some(7.0));
    }

    #[test]
    fn scaled_adjustment_uses_period_and_instruction_ratio() {
        let a = profile(1000, &[(1, 10.0), (2, 10.0)], &[(1, 50)]);
        let b = profile(1000, &[(1, 6.0), (2, 6.0)], &[]);
        let d = DifferentialProfile::new(&a, &b).unwrap();
        // target sampled 10x more often; pc 1 ran twice as many instructions per sample
        let mut target = profile(100, &[(1, 200.0), (2, 200.0), (3, 1.0)], &[(1, 1000)]);
        assert_eq!(d.adjust_scaled(&mut target), 2);
        // delta 4 * scale 10 * (1000 / (50 * 10)) = 80
        assert!((target.miss_count(&pc(1)).unwrap() - 120.0).abs() < 1e-9);
        // no instruction counts: delta 4 * scale 10
        assert!((target.miss_count(&pc(2)).unwrap() - 160.0).abs() < 1e-9);
        assert_eq!(target.miss_count(&pc(3)), Some(1.0));
    }

    #[test]
    fn diff_compared_with_itself_has_no_error() {
        let a = profile(10, &[(1, 10.0), (2, 4.0)], &[]);
        let b = profile(10, &[(1, 6.0)], &[]);
        let d = DifferentialProfile::new(&a, &b).unwrap();
        let cmp = d.compare_to(&d.clone()).unwrap();
        assert_eq!(cmp.error, 0.0);
        assert_eq!(cmp.relative_error, 0.0);
    }

    #[test]
    fn compare_scales_by_period() {
        let d1 = DifferentialProfile::new(
            &profile(10, &[(1, 3.0)], &[]),
            &profile(10, &[(1, 1.0)], &[]),
        )
        .unwrap();
        let d2 = DifferentialProfile::new(
            &profile(20, &[(1, 2.0), (2, 1.0)], &[]),
            &profile(20, &[(1, 1.0)], &[]),
        )
        .unwrap();
        let cmp = d1.compare_to(&d2).unwrap();
        // 2*10 - 1*20 - 1*20 = -20 over 2*10 + 2*20 = 60
        assert!((cmp.error + 20.0).abs() < 1e-12);
        assert!((cmp.relative_error + 20.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn zero_total_comparison_is_degenerate() {
        let same = profile(10, &[(1, 3.0)], &[]);
        let d = DifferentialProfile::new(&same, &same).unwrap();
        assert!(matches!(
            d.compare_to(&d),
            Err(AnalysisError::DegenerateComparison { .. })
        ));
    }

    #[test]
    fn persisted_blob_round_trips_exactly() {
        let mut a = profile(997, &[(1, 0.1), (2, 1e-17)], &[(1, 12)]);
        a.record_misses(
            PcKey::FunctionOffset {
                function: "main".into(),
                offset: 8,
            },
            3.0 / 7.0,
        );
        let b = profile(997, &[(1, 0.3), (5, 2.0)], &[]);
        let d = DifferentialProfile::new(&a, &b).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.diff");
        d.save(&path).unwrap();
        let restored = DifferentialProfile::load(&path).unwrap();
        assert_eq!(restored, d);
        for (pc, delta) in d.deltas() {
            assert_eq!(restored.delta(pc).unwrap().to_bits(), delta.to_bits());
        }
    }

    #[test]
    fn missing_blob_is_missing_file() {
        let err = DifferentialProfile::load(Path::new("/nonexistent/x.diff")).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingFile { .. }));
    }
}
