//! Core vocabulary: thread ids, instruction addresses, and reuse-distance bucket keys.

use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Raw instruction or data address.
pub type Address = u64;

/// Identifies a profiled thread (or CPU) within one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw encodings the profiler uses for the two sentinel buckets.
pub const RAW_COLD_KEY: f64 = 9_223_372_036_854_775_808.0; // 2^63
pub const RAW_INVALIDATION_KEY: f64 = 4_611_686_018_427_387_904.0; // 2^62

/// A finite reuse distance in cache-line units.
///
/// Buckets written by the profiler are log-spaced, so a distance may be fractional. Always
/// finite and non-negative, which makes the total order below well defined.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Distance(f64);

impl Distance {
    pub const ZERO: Distance = Distance(0.0);

    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(AnalysisError::InvalidDistance(value));
        }
        // fold -0.0 into 0.0 so equal values hash equally
        Ok(Self(value + 0.0))
    }

    pub fn lines(lines: u64) -> Self {
        Self(lines as f64)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Distance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Histogram bucket key. Declaration order gives `Finite(_) < Invalidation < Cold`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DistanceKey {
    /// Reuse at a finite stack distance.
    Finite(Distance),
    /// Miss caused by invalidation of the block (coherence).
    Invalidation,
    /// First reference to the block (compulsory).
    Cold,
}

impl DistanceKey {
    pub fn lines(lines: u64) -> Self {
        Self::Finite(Distance::lines(lines))
    }

    /// Resolves a key as written by the profiler, where the sentinels are encoded as huge floats.
    pub fn from_raw(raw: f64) -> Result<Self> {
        if raw >= RAW_COLD_KEY {
            Ok(Self::Cold)
        } else if raw >= RAW_INVALIDATION_KEY {
            Ok(Self::Invalidation)
        } else {
            Distance::new(raw).map(Self::Finite)
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, Self::Finite(_))
    }

    pub fn finite(&self) -> Option<Distance> {
        match self {
            Self::Finite(d) => Some(*d),
            _ => None,
        }
    }

    /// True when an access at this key misses in a fully-associative cache of `capacity` lines.
    pub fn misses_at(&self, capacity: Distance) -> bool {
        match self {
            Self::Finite(d) => *d >= capacity,
            Self::Invalidation | Self::Cold => true,
        }
    }
}

impl fmt::Display for DistanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceKey::Finite(d) => write!(f, "{}", d),
            DistanceKey::Invalidation => write!(f, "INVALIDATION"),
            DistanceKey::Cold => write!(f, "COLD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_ordering() {
        let big = DistanceKey::lines(u64::MAX);
        assert!(big < DistanceKey::Invalidation);
        assert!(DistanceKey::Invalidation < DistanceKey::Cold);
        assert!(DistanceKey::lines(1) < DistanceKey::lines(4));
    }

    #[test]
    fn raw_keys_resolve_to_sentinels() {
        assert_eq!(
            DistanceKey::from_raw(9223372036854775808.0).unwrap(),
            DistanceKey::Cold
        );
        assert_eq!(
            DistanceKey::from_raw(4611686018427387904.0).unwrap(),
            DistanceKey::Invalidation
        );
        assert_eq!(
            DistanceKey::from_raw(1.071773).unwrap(),
            DistanceKey::Finite(Distance::new(1.071773).unwrap())
        );
    }

    #[test]
    fn negative_and_nan_distances_rejected() {
        assert!(Distance::new(-1.0).is_err());
        assert!(Distance::new(f64::NAN).is_err());
        assert!(DistanceKey::from_raw(f64::NAN).is_err());
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(Distance::new(-0.0).unwrap(), Distance::ZERO);
    }

    #[test]
    fn misses_at_capacity() {
        let cap = Distance::lines(2);
        assert!(!DistanceKey::lines(1).misses_at(cap));
        assert!(DistanceKey::lines(2).misses_at(cap));
        assert!(DistanceKey::Cold.misses_at(cap));
        assert!(DistanceKey::Invalidation.misses_at(Distance::lines(u64::MAX)));
    }
}
