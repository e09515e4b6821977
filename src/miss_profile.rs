//! Per-PC miss profiles, built either from reuse-distance PC records or from hardware-sampler
//! files. Both sources end up in the same shape so the differential engine does not care
//! which one it is looking at.

use crate::core::{Address, Distance};
use crate::error::Result;
use crate::pc_profile::PcProfile;
use crate::sampler::SampleFile;
use crate::skid::SkidCorrector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Identity of an instruction in a miss profile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PcKey {
    Address(Address),
    /// Position relative to the enclosing function, comparable across relinked binaries.
    FunctionOffset { function: String, offset: u64 },
}

impl fmt::Display for PcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcKey::Address(a) => write!(f, "{:#x}", a),
            PcKey::FunctionOffset { function, offset } => write!(f, "{}+{:#x}", function, offset),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MissProfile {
    name: String,
    sample_period: u64,
    misses: BTreeMap<PcKey, f64>,
    instructions: BTreeMap<PcKey, u64>,
    dropped_samples: usize,
}

impl MissProfile {
    /// An empty profile; counts are filled through [`record_misses`](Self::record_misses).
    pub fn new(name: impl Into<String>, sample_period: u64) -> Self {
        Self {
            name: name.into(),
            sample_period,
            misses: BTreeMap::new(),
            instructions: BTreeMap::new(),
            dropped_samples: 0,
        }
    }

    /// Misses every PC would take in a cache of `capacity` lines, cold and invalidation misses
    /// included. With a corrector, PCs are keyed by function offset where the listing knows them.
    pub fn from_pc_profile(
        name: impl Into<String>,
        profile: &PcProfile,
        capacity: Distance,
        corrector: Option<&SkidCorrector>,
    ) -> Self {
        let mut result = Self::new(name, 1);
        for (pc, record) in profile.iter() {
            let key = corrector
                .and_then(|c| c.normalize(pc))
                .unwrap_or(PcKey::Address(pc));
            let misses = record.misses_at(capacity, true);
            if misses > 0 {
                result.misses.insert(key.clone(), misses as f64);
            }
            result.instructions.insert(key, record.access_count);
        }
        debug!(
            name = result.name(),
            pcs = result.misses.len(),
            capacity = %capacity,
            "built miss profile from reuse-distance records"
        );
        result
    }

    /// Skid-corrects every sample; samples outside the listing are dropped and counted.
    pub fn from_samples(
        name: impl Into<String>,
        misses: &SampleFile,
        instructions: Option<&SampleFile>,
        corrector: &SkidCorrector,
    ) -> Self {
        let mut result = Self::new(name, misses.sample_period.unwrap_or(1));
        for record in &misses.records {
            match corrector.correct(record.address) {
                Some(key) => *result.misses.entry(key).or_default() += record.count as f64,
                None => {
                    debug!(
                        address = format_args!("{:#x}", record.address),
                        "dropping uncorrectable miss sample"
                    );
                    result.dropped_samples += 1;
                }
            }
        }
        if let Some(insts) = instructions {
            if insts.sample_period.is_some() && insts.sample_period != misses.sample_period {
                warn!(
                    misses = ?misses.sample_period,
                    instructions = ?insts.sample_period,
                    "instruction samples use a different period"
                );
            }
            for record in &insts.records {
                match corrector.correct(record.address) {
                    Some(key) => *result.instructions.entry(key).or_default() += record.count,
                    None => result.dropped_samples += 1,
                }
            }
        }
        debug!(
            name = result.name(),
            samples = misses.total_count(),
            pcs = result.misses.len(),
            "built miss profile from samples"
        );
        if result.dropped_samples > 0 {
            warn!(
                name = result.name(),
                dropped = result.dropped_samples,
                "samples not found in disassembly"
            );
        }
        result
    }

    /// Loads a miss sample file and, when present, its instruction companion.
    pub fn load_samples(
        name: impl Into<String>,
        miss_path: &Path,
        instruction_path: Option<&Path>,
        corrector: &SkidCorrector,
    ) -> Result<Self> {
        let misses = SampleFile::load(miss_path)?;
        let instructions = match instruction_path {
            Some(path) if path.exists() => Some(SampleFile::load(path)?),
            Some(path) => {
                info!(path = %path.display(), "no instruction samples");
                None
            }
            None => None,
        };
        Ok(Self::from_samples(name, &misses, instructions.as_ref(), corrector))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_period(&self) -> u64 {
        self.sample_period
    }

    pub fn misses(&self) -> &BTreeMap<PcKey, f64> {
        &self.misses
    }

    pub fn miss_count(&self, pc: &PcKey) -> Option<f64> {
        self.misses.get(pc).copied()
    }

    pub fn instructions(&self, pc: &PcKey) -> Option<u64> {
        self.instructions.get(pc).copied()
    }

    pub fn instruction_counts(&self) -> &BTreeMap<PcKey, u64> {
        &self.instructions
    }

    pub fn dropped_samples(&self) -> usize {
        self.dropped_samples
    }

    pub fn record_misses(&mut self, pc: PcKey, misses: f64) {
        self.misses.insert(pc, misses);
    }

    pub fn record_instructions(&mut self, pc: PcKey, count: u64) {
        self.instructions.insert(pc, count);
    }

    pub fn total_misses(&self) -> f64 {
        self.misses.values().sum()
    }

    /// PCs by miss count descending, as counts or as shares of the total.
    pub fn ranking(&self, as_fraction: bool) -> Vec<(PcKey, f64)> {
        let total = self.total_misses();
        let mut ranked: Vec<(PcKey, f64)> = self
            .misses
            .iter()
            .map(|(pc, m)| {
                let value = if as_fraction && total > 0.0 { m / total } else { *m };
                (pc.clone(), value)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    pub fn top(&self, n: usize) -> Vec<(PcKey, f64)> {
        let mut ranked = self.ranking(false);
        ranked.truncate(n);
        ranked
    }
}
