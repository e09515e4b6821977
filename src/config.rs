//! Analysis configuration: cache geometry, capacities to report, and comparison thresholds.

use crate::core::Distance;
use crate::error::{AnalysisError, Result};
use serde::Deserialize;
use std::path::Path;

/// Configuration shared by the analyses.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Cache block (line) size in bytes; distances are counted in blocks.
    pub block_bytes: u64,
    /// Capacities (bytes) reported by the miss-ratio table.
    pub cache_sizes_bytes: Vec<u64>,
    /// Capacity (bytes) at which per-PC miss profiles are built.
    pub pc_cache_size_bytes: u64,
    /// Coverage fractions swept by the weight-matched PC comparison.
    pub coverage_fractions: Vec<f64>,
    /// Quantile of the reuse-distance curve used as the PC comparison capacity.
    pub distance_fraction: f64,
    /// How many top miss PCs the overlap comparison keeps per capacity.
    pub top_compare_count: usize,
    /// Instructions between a sampled address and the instruction that caused the event.
    pub skid_instructions: usize,
    /// Count cold and invalidation buckets as misses in PC rankings.
    pub include_sentinels: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            block_bytes: 64,
            cache_sizes_bytes: vec![32 * 1024, 64 * 1024, 256 * 1024, 512 * 1024],
            pc_cache_size_bytes: 32 * 1024,
            coverage_fractions: vec![0.75, 0.8, 0.9, 0.95],
            distance_fraction: 0.9,
            top_compare_count: 30,
            skid_instructions: 1,
            include_sentinels: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AnalysisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AnalysisError::from_open(e, path))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.block_bytes == 0 {
            return Err(AnalysisError::Config("block_bytes must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.distance_fraction) {
            return Err(AnalysisError::Config(format!(
                "distance_fraction {} outside [0, 1)",
                self.distance_fraction
            )));
        }
        if let Some(bad) = self
            .coverage_fractions
            .iter()
            .find(|f| !(0.0..=1.0).contains(*f))
        {
            return Err(AnalysisError::Config(format!(
                "coverage fraction {} outside [0, 1]",
                bad
            )));
        }
        Ok(())
    }

    /// Capacity in cache lines for a capacity in bytes.
    pub fn cache_lines(&self, bytes: u64) -> Distance {
        Distance::lines(bytes / self.block_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_lines() {
        let c = AnalysisConfig::default();
        assert_eq!(c.cache_lines(32 * 1024), Distance::lines(512));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = AnalysisConfig::from_toml_str("block_bytes = 4\nskid_instructions = 2\n").unwrap();
        assert_eq!(c.block_bytes, 4);
        assert_eq!(c.skid_instructions, 2);
        assert_eq!(c.top_compare_count, 30);
        assert_eq!(c.cache_lines(64), Distance::lines(16));
    }

    #[test]
    fn zero_block_rejected() {
        assert!(AnalysisConfig::from_toml_str("block_bytes = 0").is_err());
    }

    #[test]
    fn bad_fraction_rejected() {
        assert!(AnalysisConfig::from_toml_str("coverage_fractions = [0.5, 1.5]").is_err());
        assert!(AnalysisConfig::from_toml_str("distance_fraction = 1.0").is_err());
    }
}
