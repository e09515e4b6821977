//! Error types for reuse-distance analysis.
//!
//! Row-level problems in input files are logged and skipped by the readers; only failures of a
//! whole operation surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors that can occur while loading or analyzing profiles.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Malformed input at a specific line.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Two profiles cannot be combined because their sampling periods differ.
    #[error("incompatible sample periods: {left} vs {right}")]
    IncompatibleInputs { left: u64, right: u64 },

    /// Required input file does not exist.
    #[error("file not found: {path}")]
    MissingFile { path: PathBuf },

    /// A lookup that the caller required to succeed did not.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The thread selection or ranking has nothing in it.
    #[error("selection contains no data")]
    EmptySelection,

    /// A fraction argument outside the valid range.
    #[error("invalid fraction: {0}")]
    InvalidFraction(f64),

    /// A distance that is negative or not a number.
    #[error("invalid distance: {0}")]
    InvalidDistance(f64),

    /// A comparison whose normalizing denominator is zero.
    #[error("degenerate comparison: {reason}")]
    DegenerateComparison { reason: String },

    /// Input parsed but does not have the expected shape.
    #[error("unexpected data layout: {reason}")]
    Schema { reason: String },

    /// I/O error during file operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl AnalysisError {
    #[must_use]
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    #[must_use]
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn degenerate(reason: impl Into<String>) -> Self {
        Self::DegenerateComparison {
            reason: reason.into(),
        }
    }

    /// Maps an open error to `MissingFile` when the path does not exist.
    #[must_use]
    pub fn from_open(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::MissingFile { path: path.into() }
        } else {
            Self::Io(err)
        }
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
