//! Reuse-distance profile analysis: miss-ratio curves, PC miss attribution, differential profiles.

pub mod attribution;
pub mod config;
pub mod core;
pub mod curve;
pub mod datafile;
pub mod differential;
pub mod error;
pub mod histogram;
mod input;
pub mod library_map;
pub mod metrics;
pub mod miss_profile;
pub mod pc_profile;
pub mod predictions;
pub mod sampler;
pub mod skid;
pub mod source_cache;

pub use error::{AnalysisError, Result};
