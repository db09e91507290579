//! Loading and linking object programs into memory.
//!
//! Loading is done in two phases:
//! 1. Every section is placed into memory (in order, one after another),
//!     its exported symbols are registered, and its text records are copied.
//!     Modification records are only collected.
//! 2. Once every section is placed, the collected modification records are applied.
//!
//! Deferring modification records means a section can refer to symbols
//! defined by any other section, including sections later in the program.

use std::collections::HashMap;
use std::path::Path;

use crate::asm::encoding::{Modification, ObjFileFormat, ObjectProgram, TextFormat};
use crate::ast::Sign;

use super::mem::Mem;
use super::SimErr;

/// A section after it has been placed into memory.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LoadedSection {
    /// The name of the section.
    pub name: String,
    /// The address the section was loaded at.
    pub addr: u32,
    /// The length of the section.
    pub length: u32,
}
impl LoadedSection {
    /// Whether the address lies within this section.
    pub fn contains(&self, addr: u32) -> bool {
        (self.addr..self.addr + self.length).contains(&addr)
    }
}

/// A linked program in memory.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LoadedProgram {
    /// The sections of the program, in load order.
    pub sections: Vec<LoadedSection>,
    /// The absolute address of every section name and exported symbol.
    pub symbols: HashMap<String, u32>,
    /// The address execution starts at.
    pub entry: u32,
}
impl LoadedProgram {
    /// The name of the program (the name of its first section).
    pub fn name(&self) -> &str {
        self.sections.first().map_or("", |s| &s.name)
    }
    /// The address the program was loaded at.
    pub fn start(&self) -> u32 {
        self.sections.first().map_or(0, |s| s.addr)
    }
    /// The total length of the program.
    pub fn length(&self) -> u32 {
        self.sections.iter().map(|s| s.length).sum()
    }
    /// Finds the section which holds the given address.
    pub fn section_at(&self, addr: u32) -> Option<&LoadedSection> {
        self.sections.iter().find(|s| s.contains(addr))
    }
}

/// Loads an object program into memory.
///
/// The program is placed at the start address declared by its first section.
/// Every following section is placed directly after the section before it.
///
/// # Example
/// ```
/// use sicxe_ensemble::sim::load::load;
/// use sicxe_ensemble::sim::mem::Mem;
///
/// let obj = "\
/// HMAIN  00100000000A
/// RVAL
/// T0010000A031000004F0000000007
/// M00100105+VAL
/// E001000
///
/// HOTHER 000000000003
/// DVAL   000000
/// E
/// ".parse().unwrap();
///
/// let mut mem = Mem::new();
/// let program = load(&obj, &mut mem).unwrap();
/// assert_eq!(program.symbols["OTHER"], 0x100A);
/// assert_eq!(program.symbols["VAL"], 0x100A);
/// assert_eq!(mem.get_bytes(0x1000, 4).unwrap(), &[0x03, 0x10, 0x10, 0x0A]);
/// ```
pub fn load(program: &ObjectProgram, mem: &mut Mem) -> Result<LoadedProgram, SimErr> {
    let Some(first) = program.sections.first() else {
        return Err(SimErr::NoProgram);
    };

    tracing::trace!("starting load");
    let mut sections = vec![];
    let mut symbols = HashMap::new();
    let mut fixups: Vec<(u32, &Modification)> = vec![];
    let mut load_addr = first.header.start;

    for sect in &program.sections {
        let base = load_addr;
        let relocate = |addr: u32| addr.checked_sub(sect.header.start)
            .and_then(|offset| base.checked_add(offset))
            .ok_or(SimErr::AddressOutOfRange(addr));

        symbols.entry(sect.header.name.clone()).or_insert(base);
        for (name, addr) in &sect.define {
            symbols.insert(name.clone(), relocate(*addr)?);
        }
        for text in &sect.text {
            let addr = relocate(text.start)?;
            mem.set_bytes(addr, &text.bytes)?;
            tracing::trace!(addr, len = text.bytes.len(), "loaded text record");
        }
        for m in &sect.modifications {
            fixups.push((relocate(m.addr)?, m));
        }

        tracing::debug!(name = %sect.header.name, addr = base, length = sect.header.length, "placed section");
        sections.push(LoadedSection { name: sect.header.name.clone(), addr: base, length: sect.header.length });
        load_addr = base.checked_add(sect.header.length).ok_or(SimErr::AddressOutOfRange(base))?;
    }

    tracing::trace!(count = fixups.len(), "applying modification records");
    for (addr, m) in fixups {
        let value = *symbols.get(&m.symbol)
            .ok_or_else(|| SimErr::UnresolvedSymbol(m.symbol.clone()))?;
        modify(mem, addr, m.half_bytes, m.sign, value)?;
    }

    // The first section is loaded where it asks to be, so its entry point needs no relocation.
    let entry = first.end.unwrap_or(first.header.start);

    Ok(LoadedProgram { sections, symbols, entry })
}

/// Adds (or subtracts) a value to the `half_bytes`-wide field ending at the end of `ceil(half_bytes / 2)` bytes at `addr`.
///
/// If the field has an odd number of half-bytes, the high nibble of the first byte is left alone.
fn modify(mem: &mut Mem, addr: u32, half_bytes: u8, sign: Sign, value: u32) -> Result<(), SimErr> {
    let n_bytes = (u32::from(half_bytes) + 1) / 2;
    let current = mem.get_bytes(addr, n_bytes)?
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

    let field_mask = match half_bytes {
        8.. => u32::MAX,
        n => (1 << (4 * u32::from(n))) - 1,
    };
    let updated = match sign {
        Sign::Plus  => current.wrapping_add(value),
        Sign::Minus => current.wrapping_sub(value),
    };
    let result = (current & !field_mask) | (updated & field_mask);

    let bytes = result.to_be_bytes();
    mem.set_bytes(addr, &bytes[(4 - n_bytes as usize)..])
}

/// Parses object program text and loads it into memory.
pub fn load_str(text: &str, mem: &mut Mem) -> Result<LoadedProgram, SimErr> {
    let program = TextFormat::deserialize(text)?;
    load(&program, mem)
}

/// Reads an object program file and loads it into memory.
pub fn load_file(path: impl AsRef<Path>, mem: &mut Mem) -> Result<LoadedProgram, SimErr> {
    let text = std::fs::read_to_string(path).map_err(SimErr::Io)?;
    load_str(&text, mem)
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble;
    use crate::ast::{InstrTable, Sign};
    use crate::sim::mem::{Mem, FILLER};
    use crate::sim::SimErr;

    use super::{load, load_file, load_str, modify};

    const TWO_SECTIONS: &str = "\
MAIN     START   1000
         EXTREF  VAL
FIRST    +LDA    VAL
         RSUB
OTHER    CSECT
         EXTDEF  VAL
VAL      WORD    7
         END     FIRST
";

    #[test]
    fn test_two_sections() {
        let obj = assemble(TWO_SECTIONS, &InstrTable::sicxe()).unwrap();
        let mut mem = Mem::new();
        let program = load(&obj, &mut mem).unwrap();

        assert_eq!(program.name(), "MAIN");
        assert_eq!(program.start(), 0x1000);
        assert_eq!(program.length(), 10);
        assert_eq!(program.entry, 0x1000);

        // The second section starts right after the first.
        assert_eq!(program.sections[1].addr, 0x1000 + obj.sections[0].header.length);
        assert_eq!(program.symbols["OTHER"], 0x1007);
        assert_eq!(program.symbols["VAL"], 0x1007);
        assert_eq!(program.section_at(0x1008).map(|s| &*s.name), Some("OTHER"));
        assert_eq!(program.section_at(0x100A), None);

        // +LDA VAL was assembled with a 0 address, and is now VAL's address.
        // The high nibble (the flags) was left alone.
        assert_eq!(mem.get_bytes(0x1000, 4).unwrap(), &[0x03, 0x10, 0x10, 0x07]);
        assert_eq!(mem.get_word(0x1007).unwrap(), 7);
        assert_eq!(mem.get_byte(0x100A).unwrap(), FILLER);
    }

    #[test]
    fn test_modify() {
        let mut mem = Mem::new();
        mem.set_bytes(0, &[0x4B, 0x10, 0x00, 0x05]).unwrap();
        modify(&mut mem, 1, 5, Sign::Plus, 0x1033).unwrap();
        assert_eq!(mem.get_bytes(0, 4).unwrap(), &[0x4B, 0x10, 0x10, 0x38]);

        // Borrowing into the preserved nibble wraps within the field.
        modify(&mut mem, 1, 5, Sign::Minus, 0x1039).unwrap();
        assert_eq!(mem.get_bytes(0, 4).unwrap(), &[0x4B, 0x1F, 0xFF, 0xFF]);

        mem.set_word(0x10, 0x001000).unwrap();
        modify(&mut mem, 0x10, 6, Sign::Plus, 0x1033).unwrap();
        modify(&mut mem, 0x10, 6, Sign::Minus, 0x0033).unwrap();
        assert_eq!(mem.get_word(0x10).unwrap(), 0x002000);
    }

    #[test]
    fn test_forward_reference() {
        // The first section refers to a symbol defined by the second.
        let mut mem = Mem::new();
        let program = load_str("\
HA     000000000003
T00000003000000
M00000006+LATER
E000000
HB     000000000003
DLATER 000001
E
", &mut mem).unwrap();
        assert_eq!(program.symbols["LATER"], 4);
        assert_eq!(mem.get_word(0).unwrap(), 4);
    }

    #[test]
    fn test_load_errors() {
        let mut mem = Mem::new();
        assert!(matches!(
            load_str("HA     000000000003\nT00000003000000\nM00000006+NOPE\nE000000\n", &mut mem),
            Err(SimErr::UnresolvedSymbol(s)) if s == "NOPE"
        ));
        assert!(matches!(load_str("", &mut mem), Err(SimErr::NoProgram)));
        assert!(matches!(load_str("Q", &mut mem), Err(SimErr::MalformedRecord(_))));
        assert!(matches!(
            load_str("HA     0FFFFF000003\nT0FFFFF03000000\nE\n", &mut mem),
            Err(SimErr::AddressOutOfRange(_))
        ));
        assert!(matches!(load_file("/nonexistent/program.obj", &mut mem), Err(SimErr::Io(_))));
    }
}
