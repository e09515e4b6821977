//! Reader for hardware-sampler output files.
//!
//! Each data line is `count percent-self% percent-cumulative% address` (whitespace or comma
//! separated). `#sampleperiod N` / `#samplerate N` lines carry the sampling period; other
//! `#` lines are comments.

use crate::core::Address;
use crate::error::{AnalysisError, Result};
use crate::input::for_each_line;
use std::io::BufRead;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct SampleRecord {
    pub count: u64,
    /// Share of all samples attributed to this address, in percent.
    pub percent: f64,
    pub address: Address,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleFile {
    pub sample_period: Option<u64>,
    pub records: Vec<SampleRecord>,
    /// Lines that could not be parsed.
    pub skipped: usize,
}

impl SampleFile {
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut file = Self::default();
        let undecodable = for_each_line(reader, "sample file", |lineno, line| {
            file.apply_line(lineno, line)
        })?;
        file.skipped += undecodable;
        Ok(file)
    }

    fn apply_line(&mut self, lineno: usize, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if let Some(directive) = trimmed.strip_prefix('#') {
            if directive.starts_with("sampleperiod") || directive.starts_with("samplerate") {
                match directive.split_whitespace().last().map(str::parse::<u64>) {
                    Some(Ok(period)) => self.sample_period = Some(period),
                    _ => {
                        warn!(line = lineno, "malformed sample period directive");
                        self.skipped += 1;
                    }
                }
            }
            return;
        }
        match parse_record(trimmed) {
            Ok(record) => self.records.push(record),
            Err(reason) => {
                warn!(line = lineno, %reason, "skipping malformed sample line");
                self.skipped += 1;
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let handle = std::fs::File::open(path).map_err(|e| AnalysisError::from_open(e, path))?;
        let file = Self::parse(std::io::BufReader::new(handle))?;
        info!(
            path = %path.display(),
            records = file.records.len(),
            skipped = file.skipped,
            sample_period = ?file.sample_period,
            "loaded sample file"
        );
        Ok(file)
    }

    pub fn total_count(&self) -> u64 {
        self.records.iter().map(|r| r.count).sum()
    }
}

fn parse_record(line: &str) -> std::result::Result<SampleRecord, String> {
    let toks: Vec<&str> = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    let [count, percent, .., address] = toks.as_slice() else {
        return Err(format!("expected at least 3 fields, found {}", toks.len()));
    };
    let count = count
        .parse::<u64>()
        .map_err(|e| format!("bad count {count:?}: {e}"))?;
    let percent = percent
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|e| format!("bad percentage {percent:?}: {e}"))?;
    let hex = address.trim_start_matches("0x").trim_start_matches("0X");
    let address =
        u64::from_str_radix(hex, 16).map_err(|e| format!("bad address {address:?}: {e}"))?;
    Ok(SampleRecord {
        count,
        percent,
        address,
    })
}
