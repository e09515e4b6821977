//! Address normalization: raw instruction addresses to (image, offset) pairs.
//!
//! Runs of the same program may load images at different bases, so PCs are compared across
//! runs only after normalization.

use crate::core::Address;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Image name used when an address lies outside every registered image.
pub const UNMAPPED_IMAGE: &str = "NONE";

/// One loaded image, covering `base..=top`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRange {
    pub name: String,
    pub base: Address,
    pub top: Address,
}

impl ImageRange {
    pub fn new(name: impl Into<String>, base: Address, top: Address) -> Self {
        Self {
            name: name.into(),
            base,
            top,
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address <= self.top
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub image: String,
    pub offset: u64,
}

impl NormalizedAddress {
    pub fn unmapped(address: Address) -> Self {
        Self {
            image: UNMAPPED_IMAGE.to_string(),
            offset: address,
        }
    }

    pub fn is_unmapped(&self) -> bool {
        self.image == UNMAPPED_IMAGE
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.image, self.offset)
    }
}

/// Ordered image ranges of one run plus the reverse map of addresses normalized so far.
#[derive(Debug, Default)]
pub struct LibraryMap {
    entries: Vec<ImageRange>,
    reverse: RefCell<HashMap<NormalizedAddress, Address>>,
    quiet: bool,
}

impl LibraryMap {
    pub fn new(entries: Vec<ImageRange>) -> Self {
        Self {
            entries,
            reverse: RefCell::new(HashMap::new()),
            quiet: false,
        }
    }

    /// Map for a run that recorded no images: every address passes through without warnings.
    pub fn empty() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> &[ImageRange] {
        &self.entries
    }

    /// First registered range containing `address` decides the image; unmatched addresses
    /// fall back to `("NONE", address)`.
    pub fn normalize(&self, address: Address) -> NormalizedAddress {
        match self.entries.iter().find(|e| e.contains(address)) {
            Some(entry) => {
                let normalized = NormalizedAddress {
                    image: entry.name.clone(),
                    offset: address - entry.base,
                };
                self.reverse
                    .borrow_mut()
                    .insert(normalized.clone(), address);
                normalized
            }
            None => {
                if !self.quiet {
                    warn!(address = format_args!("{:#x}", address), "address not in any image");
                }
                NormalizedAddress::unmapped(address)
            }
        }
    }

    /// Concrete address of a normalized address produced by this map.
    ///
    /// Only addresses previously passed through [`normalize`](Self::normalize) on the same map
    /// can be resolved; other runs' addresses are not meaningful here.
    pub fn original_address(&self, normalized: &NormalizedAddress) -> Option<Address> {
        if normalized.is_unmapped() {
            return Some(normalized.offset);
        }
        self.reverse.borrow().get(normalized).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> LibraryMap {
        LibraryMap::new(vec![
            ImageRange::new("bench", 0x400000, 0x4fffff),
            ImageRange::new("libc.so", 0x7f0000, 0x7fffff),
        ])
    }

    #[test]
    fn address_inside_image_is_offset_from_base() {
        let m = map();
        let n = m.normalize(0x400123);
        assert_eq!(n.image, "bench");
        assert_eq!(n.offset, 0x123);
        assert_eq!(m.normalize(0x7fffff).offset, 0xffff);
    }

    #[test]
    fn address_outside_every_image_passes_through() {
        let m = map();
        let n = m.normalize(0x1000);
        assert!(n.is_unmapped());
        assert_eq!(n.offset, 0x1000);
        assert_eq!(m.original_address(&n), Some(0x1000));
    }

    #[test]
    fn reverse_mapping_within_one_run() {
        let m = map();
        let n = m.normalize(0x7f0010);
        assert_eq!(m.original_address(&n), Some(0x7f0010));
        let never_seen = NormalizedAddress {
            image: "bench".into(),
            offset: 4,
        };
        assert_eq!(m.original_address(&never_seen), None);
    }

    #[test]
    fn same_offset_from_different_bases_compares_equal() {
        let a = LibraryMap::new(vec![ImageRange::new("bench", 0x400000, 0x4fffff)]);
        let b = LibraryMap::new(vec![ImageRange::new("bench", 0x600000, 0x6fffff)]);
        assert_eq!(a.normalize(0x400040), b.normalize(0x600040));
    }

    #[test]
    fn empty_map_is_quiet_pass_through() {
        let m = LibraryMap::empty();
        assert!(m.entries().is_empty());
        assert_eq!(m.normalize(42), NormalizedAddress::unmapped(42));
    }
}
