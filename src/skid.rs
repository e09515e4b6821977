//! Disassembly listing and skid correction for hardware-sampled addresses.
//!
//! Sampling counters report an event against an instruction some fixed number of instructions
//! after the one that caused it. The listing gives program order, so a sample can be moved
//! back to the responsible instruction.

use crate::core::Address;
use crate::error::{AnalysisError, Result};
use crate::input::for_each_line;
use crate::miss_profile::PcKey;
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info, trace};

/// Default number of instructions between the sampled and the responsible instruction.
pub const DEFAULT_SKID: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub address: Address,
    /// Enclosing function, when a header preceded the instruction.
    pub function: Option<String>,
    /// Offset from the function start, or the raw address outside any function.
    pub offset: u64,
    pub text: String,
}

impl Instruction {
    /// Key that stays stable across relinked binaries.
    pub fn function_key(&self) -> PcKey {
        match &self.function {
            Some(function) => PcKey::FunctionOffset {
                function: function.clone(),
                offset: self.offset,
            },
            None => PcKey::Address(self.address),
        }
    }
}

/// `<hex> <name>:` with the name taken verbatim, so demangled signatures keep their spaces.
fn function_header(line: &str) -> Option<(Address, &str)> {
    let (hex, rest) = line.trim().split_once(char::is_whitespace)?;
    let name = rest.trim_start().strip_prefix('<')?.strip_suffix(">:")?;
    let address = u64::from_str_radix(hex, 16).ok()?;
    Some((address, name))
}

/// Instructions of a binary in program order.
#[derive(Clone, Debug, Default)]
pub struct InstructionListing {
    instructions: Vec<Instruction>,
    index: HashMap<Address, usize>,
    functions: BTreeMap<String, Address>,
}

impl InstructionListing {
    /// Reads an objdump-style listing: `<hex> <name>:` function headers and `<hex>: ...`
    /// instruction lines. Anything else is skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut listing = Self::default();
        let mut current: Option<(String, Address)> = None;
        let mut skipped = 0usize;
        let undecodable = for_each_line(reader, "disassembly", |lineno, line| {
            if let Some((address, name)) = function_header(line) {
                listing.functions.insert(name.to_string(), address);
                current = Some((name.to_string(), address));
                return;
            }
            let Some(first) = line.split_whitespace().next() else {
                return;
            };
            let Some(address) = first
                .strip_suffix(':')
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            else {
                trace!(line = lineno, "skipping non-instruction line");
                skipped += 1;
                return;
            };
            let (function, offset) = match &current {
                Some((name, start)) => (Some(name.clone()), address.wrapping_sub(*start)),
                None => (None, address),
            };
            listing.index.insert(address, listing.instructions.len());
            listing.instructions.push(Instruction {
                address,
                function,
                offset,
                text: line.trim().to_string(),
            });
        })?;
        skipped += undecodable;
        debug!(
            instructions = listing.instructions.len(),
            functions = listing.functions.len(),
            skipped,
            "parsed disassembly listing"
        );
        Ok(listing)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| AnalysisError::from_open(e, path))?;
        let listing = Self::parse(std::io::BufReader::new(file))?;
        info!(path = %path.display(), instructions = listing.len(), "loaded disassembly");
        Ok(listing)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn position(&self, address: Address) -> Option<usize> {
        self.index.get(&address).copied()
    }

    pub fn instruction(&self, position: usize) -> Option<&Instruction> {
        self.instructions.get(position)
    }

    pub fn lookup(&self, address: Address) -> Option<&Instruction> {
        self.position(address).and_then(|i| self.instruction(i))
    }

    /// Start address of each function header.
    pub fn functions(&self) -> &BTreeMap<String, Address> {
        &self.functions
    }
}

/// Maps sampled addresses back to the instruction responsible for the event.
#[derive(Clone, Debug)]
pub struct SkidCorrector {
    listing: InstructionListing,
    skid: usize,
    function_relative: bool,
}

impl SkidCorrector {
    pub fn new(listing: InstructionListing) -> Self {
        Self {
            listing,
            skid: DEFAULT_SKID,
            function_relative: false,
        }
    }

    pub fn with_skid(mut self, skid: usize) -> Self {
        self.skid = skid;
        self
    }

    /// Report corrected PCs as `(function, offset)` instead of raw addresses.
    pub fn function_relative(mut self, enabled: bool) -> Self {
        self.function_relative = enabled;
        self
    }

    pub fn skid(&self) -> usize {
        self.skid
    }

    pub fn listing(&self) -> &InstructionListing {
        &self.listing
    }

    /// The instruction `skid` places before `address`, or `None` when `address` is not an
    /// instruction of the listing (or too close to its start).
    pub fn correct(&self, address: Address) -> Option<PcKey> {
        let position = self.listing.position(address)?;
        let target = self.listing.instruction(position.checked_sub(self.skid)?)?;
        Some(if self.function_relative {
            target.function_key()
        } else {
            PcKey::Address(target.address)
        })
    }

    /// The `(function, offset)` key of `address` itself, without skid correction.
    pub fn normalize(&self, address: Address) -> Option<PcKey> {
        self.listing.lookup(address).map(Instruction::function_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
bench:     file format elf64-x86-64

Disassembly of section .text:

0000000000400500 <init>:
  400500:	55                   	push   %rbp
  400501:	c3                   	retq

0000000000400510 <main>:
  400510:	55                   	push   %rbp
  400511:	48 89 e5             	mov    %rsp,%rbp
  400514:	8b 07                	mov    (%rdi),%eax
  400516:	c3                   	retq
";

    fn listing() -> InstructionListing {
        InstructionListing::parse(LISTING.as_bytes()).unwrap()
    }

    #[test]
    fn parses_headers_and_instructions() {
        let l = listing();
        assert_eq!(l.len(), 6);
        assert_eq!(l.functions().get("main"), Some(&0x400510));
        let mov = l.lookup(0x400514).unwrap();
        assert_eq!(mov.function.as_deref(), Some("main"));
        assert_eq!(mov.offset, 4);
        assert!(mov.text.contains("mov"));
    }

    #[test]
    fn demangled_headers_start_a_function() {
        let text = "\
0000000000401130 <helper>:
  401130:\t55                   \tpush   %rbp
0000000000401136 <foo(int, int)>:
  401136:\t55                   \tpush   %rbp
  401137:\t89 c8                \tmov    %ecx,%eax
";
        let l = InstructionListing::parse(text.as_bytes()).unwrap();
        assert_eq!(l.functions().get("foo(int, int)"), Some(&0x401136));
        let mov = l.lookup(0x401137).unwrap();
        assert_eq!(mov.function.as_deref(), Some("foo(int, int)"));
        assert_eq!(mov.offset, 1);
    }

    #[test]
    fn undecodable_line_does_not_lose_the_rest() {
        let mut input = LISTING.as_bytes().to_vec();
        let at = LISTING.find("mov    (%rdi)").unwrap();
        input[at + 4] = 0xff;
        let l = InstructionListing::parse(input.as_slice()).unwrap();
        assert_eq!(l.len(), 5);
        assert!(l.lookup(0x400514).is_none());
        assert_eq!(l.lookup(0x400516).unwrap().function.as_deref(), Some("main"));
    }

    #[test]
    fn corrects_one_instruction_back() {
        let c = SkidCorrector::new(listing());
        assert_eq!(c.correct(0x400516), Some(PcKey::Address(0x400514)));
        // program order crosses function boundaries
        assert_eq!(c.correct(0x400510), Some(PcKey::Address(0x400501)));
    }

    #[test]
    fn unknown_or_leading_address_is_dropped() {
        let c = SkidCorrector::new(listing());
        assert_eq!(c.correct(0x400515), None);
        assert_eq!(c.correct(0x400500), None);
    }

    #[test]
    fn configurable_skid_and_function_keys() {
        let c = SkidCorrector::new(listing())
            .with_skid(2)
            .function_relative(true);
        assert_eq!(
            c.correct(0x400516),
            Some(PcKey::FunctionOffset {
                function: "main".into(),
                offset: 1
            })
        );
        assert_eq!(
            c.normalize(0x400501),
            Some(PcKey::FunctionOffset {
                function: "init".into(),
                offset: 1
            })
        );
        let none = SkidCorrector::new(listing()).with_skid(0);
        assert_eq!(none.correct(0x400500), Some(PcKey::Address(0x400500)));
    }
}
