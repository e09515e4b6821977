//! Source-line attribution of per-PC access counts.
//!
//! Resolving a PC to `file:line` means running `addr2line`, which is slow, so results are kept in
//! a per-binary JSON cache file. The cache is rewritten whole by [`SourceLineCache::flush`].
//! Processes sharing one cache file are not coordinated: the last flush wins and entries added by
//! the other process are lost.

use crate::core::Address;
use crate::error::{AnalysisError, Result};
use crate::library_map::LibraryMap;
use crate::pc_profile::PcProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// File name addr2line reports when it cannot resolve an address.
pub const UNKNOWN_FILE: &str = "??";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLine {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl SourceLine {
    pub fn unknown() -> Self {
        Self {
            file: UNKNOWN_FILE.to_string(),
            line: 0,
            function: UNKNOWN_FILE.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.file == UNKNOWN_FILE
    }
}

/// Maps an instruction address to its source location.
pub trait Symbolizer {
    fn symbolize(&self, address: Address) -> Result<SourceLine>;
}

/// Symbolizer backed by binutils `addr2line -fe <binary>`.
#[derive(Clone, Debug)]
pub struct Addr2Line {
    binary: PathBuf,
}

impl Addr2Line {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Symbolizer for Addr2Line {
    fn symbolize(&self, address: Address) -> Result<SourceLine> {
        let output = Command::new("addr2line")
            .arg("-fe")
            .arg(&self.binary)
            .arg(format!("{address:#x}"))
            .output()?;
        if !output.status.success() {
            return Err(AnalysisError::not_found(format!(
                "addr2line failed for {address:#x} in {}",
                self.binary.display()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_addr2line(&text).ok_or_else(|| {
            AnalysisError::schema(format!("bad addr2line output for {address:#x}: {text:?}"))
        })
    }
}

/// Parses the two-line `function\nfile:line` output. A `?` line number counts as 0.
fn parse_addr2line(text: &str) -> Option<SourceLine> {
    let mut lines = text.lines();
    let function = lines.next()?.trim();
    let (file, line) = lines.next()?.trim().rsplit_once(':')?;
    // addr2line may append " (discriminator N)"
    let line = line.split_whitespace().next().unwrap_or("0");
    Some(SourceLine {
        file: file.to_string(),
        line: line.parse().unwrap_or(0),
        function: function.to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    address: Address,
    source: SourceLine,
}

/// Address → source-line memo persisted in a JSON file.
#[derive(Debug)]
pub struct SourceLineCache {
    path: PathBuf,
    entries: BTreeMap<Address, SourceLine>,
    dirty: bool,
}

impl SourceLineCache {
    /// Reads the cache file; a missing file gives an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::File::open(&path) {
            Ok(file) => {
                let persisted: Vec<CacheEntry> = serde_json::from_reader(BufReader::new(file))?;
                persisted.into_iter().map(|e| (e.address, e.source)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source-line cache yet");
                BTreeMap::new()
            }
            Err(err) => return Err(AnalysisError::from_open(err, &path)),
        };
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Cached location of `address`, symbolizing and remembering it on a miss.
    pub fn lookup(&mut self, address: Address, symbolizer: &dyn Symbolizer) -> Result<SourceLine> {
        if let Some(line) = self.entries.get(&address) {
            return Ok(line.clone());
        }
        let line = symbolizer.symbolize(address)?;
        self.entries.insert(address, line.clone());
        self.dirty = true;
        Ok(line)
    }

    /// Rewrites the cache file if anything was added. Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let persisted: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|(address, source)| CacheEntry {
                address: *address,
                source: source.clone(),
            })
            .collect();
        let mut writer = BufWriter::new(std::fs::File::create(&self.path)?);
        serde_json::to_writer(&mut writer, &persisted)?;
        writer.flush()?;
        self.dirty = false;
        info!(path = %self.path.display(), entries = self.entries.len(), "wrote source-line cache");
        Ok(true)
    }
}

/// Access counts aggregated per source line and per file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceProfile {
    pub lines: BTreeMap<SourceLine, u64>,
    /// Keyed by source file, or by image name when the file is unknown.
    pub files: BTreeMap<String, u64>,
    pub total: u64,
}

impl SourceProfile {
    /// Files by access count, descending.
    pub fn files_by_count(&self) -> Vec<(&str, u64)> {
        let mut files: Vec<(&str, u64)> = self.files.iter().map(|(f, c)| (f.as_str(), *c)).collect();
        files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        files
    }

    pub fn file_fraction(&self, file: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.files.get(file).copied().unwrap_or(0) as f64 / self.total as f64
    }

    /// Access count per line number within `file`.
    pub fn line_counts(&self, file: &str) -> BTreeMap<u32, u64> {
        let mut counts = BTreeMap::new();
        for (sl, count) in self.lines.iter().filter(|(sl, _)| sl.file == file) {
            *counts.entry(sl.line).or_insert(0) += count;
        }
        counts
    }

    /// Each line of `source` paired with the accesses attributed to it.
    pub fn annotate<R: BufRead>(&self, file: &str, source: R) -> Result<Vec<(u64, String)>> {
        let counts = self.line_counts(file);
        let mut annotated = Vec::new();
        for (idx, text) in source.lines().enumerate() {
            let lineno = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            annotated.push((counts.get(&lineno).copied().unwrap_or(0), text?));
        }
        Ok(annotated)
    }
}

/// Attributes every PC's access count to its source line.
pub fn source_profile(
    pcs: &PcProfile,
    cache: &mut SourceLineCache,
    symbolizer: &dyn Symbolizer,
    library_map: &LibraryMap,
) -> Result<SourceProfile> {
    let mut profile = SourceProfile::default();
    for (pc, record) in pcs.iter() {
        let line = match cache.lookup(pc, symbolizer) {
            Ok(line) => line,
            Err(err) => {
                warn!(pc = format_args!("{pc:#x}"), %err, "could not symbolize");
                SourceLine::unknown()
            }
        };
        let file = if line.is_unknown() {
            library_map.normalize(pc).image
        } else {
            line.file.clone()
        };
        *profile.lines.entry(line).or_insert(0) += record.access_count;
        *profile.files.entry(file).or_insert(0) += record.access_count;
        profile.total += record.access_count;
    }
    debug!(
        pcs = pcs.len(),
        files = profile.files.len(),
        total = profile.total,
        "built source profile"
    );
    Ok(profile)
}
