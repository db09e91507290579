//! Memory handling for the SIC/XE simulator.
//!
//! This module consists of:
//! - [`Mem`]: The byte-addressed memory.
//! - [`RegFile`]: The register file.
//! - [`ConditionCode`]: The result of the last comparison.

use std::ops::Range;

use crate::ast::Reg;

use super::SimErr;

/// The number of bytes of memory (1 MiB).
pub const MEM_SIZE: u32 = 0x10_0000;
/// The byte that unloaded memory is filled with.
///
/// The simulator skips over this byte when looking for the next instruction.
pub const FILLER: u8 = 0xFF;
/// Mask of a 24-bit word.
pub const WORD_MASK: u32 = 0xFF_FFFF;

/// The simulator's memory.
///
/// Memory is byte-addressed, and words are 3 bytes wide and big-endian.
/// Any access which goes past the end of memory raises [`SimErr::AddressOutOfRange`].
///
/// ```
/// use sicxe_ensemble::sim::mem::{Mem, FILLER};
///
/// let mut mem = Mem::new();
/// assert_eq!(mem.get_byte(0x1000).unwrap(), FILLER);
///
/// mem.set_word(0x1000, 0x454F46).unwrap();
/// assert_eq!(mem.get_bytes(0x1000, 3).unwrap(), b"EOF");
/// assert_eq!(mem.get_word(0x1000).unwrap(), 0x454F46);
///
/// assert!(mem.get_word(0xFFFFF).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mem {
    data: Box<[u8]>
}
impl Mem {
    /// Creates a new memory, filled with [`FILLER`].
    pub fn new() -> Self {
        Self { data: vec![FILLER; MEM_SIZE as usize].into_boxed_slice() }
    }

    fn range(addr: u32, len: u32) -> Result<Range<usize>, SimErr> {
        let end = addr.checked_add(len)
            .filter(|&end| end <= MEM_SIZE)
            .ok_or(SimErr::AddressOutOfRange(addr))?;
        Ok(addr as usize .. end as usize)
    }

    /// Reads the byte at the given address.
    pub fn get_byte(&self, addr: u32) -> Result<u8, SimErr> {
        let r = Self::range(addr, 1)?;
        Ok(self.data[r.start])
    }
    /// Writes a byte at the given address.
    pub fn set_byte(&mut self, addr: u32, byte: u8) -> Result<(), SimErr> {
        let r = Self::range(addr, 1)?;
        self.data[r.start] = byte;
        Ok(())
    }

    /// Reads `len` bytes starting at the given address.
    pub fn get_bytes(&self, addr: u32, len: u32) -> Result<&[u8], SimErr> {
        let r = Self::range(addr, len)?;
        Ok(&self.data[r])
    }
    /// Writes the bytes starting at the given address.
    pub fn set_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), SimErr> {
        let r = Self::range(addr, bytes.len() as u32)?;
        self.data[r].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads the word (3 bytes) at the given address.
    pub fn get_word(&self, addr: u32) -> Result<u32, SimErr> {
        let bytes = self.get_bytes(addr, 3)?;
        Ok(bytes.iter().fold(0, |acc, &b| (acc << 8) | u32::from(b)))
    }
    /// Writes a word (3 bytes) at the given address.
    ///
    /// Only the lower 24 bits of `word` are written.
    pub fn set_word(&mut self, addr: u32, word: u32) -> Result<(), SimErr> {
        let [_, hi, mid, lo] = word.to_be_bytes();
        self.set_bytes(addr, &[hi, mid, lo])
    }

    /// The full memory as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Resets all of memory to [`FILLER`].
    pub fn clear(&mut self) {
        self.data.fill(FILLER);
    }
}
impl Default for Mem {
    fn default() -> Self {
        Self::new()
    }
}

/// The register file.
///
/// All registers hold 24-bit values. The floating point register `F`
/// is also held here as a 24-bit value, since no floating point instructions are executed.
///
/// ```
/// use sicxe_ensemble::sim::mem::RegFile;
/// use sicxe_ensemble::ast::Reg;
///
/// let mut reg = RegFile::new();
/// reg.set(Reg::A, 0x1234);
/// assert_eq!(reg[Reg::A], 0x1234);
///
/// reg.set(Reg::X, 0x1000000);
/// assert_eq!(reg[Reg::X], 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegFile([u32; 10]);
impl RegFile {
    /// Creates a register file with every register set to 0.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets a register, truncating the value to 24 bits.
    pub fn set(&mut self, reg: Reg, value: u32) {
        self.0[usize::from(reg)] = value & WORD_MASK;
    }
}
impl std::ops::Index<Reg> for RegFile {
    type Output = u32;

    fn index(&self, index: Reg) -> &Self::Output {
        &self.0[usize::from(index)]
    }
}

/// The condition code, set by comparisons (`COMP`, `COMPR`, `TIXR`) and by `TD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    /// `<`
    Lt,
    /// `=`
    Eq,
    /// `>`
    Gt,
}
impl From<std::cmp::Ordering> for ConditionCode {
    fn from(value: std::cmp::Ordering) -> Self {
        match value {
            std::cmp::Ordering::Less    => ConditionCode::Lt,
            std::cmp::Ordering::Equal   => ConditionCode::Eq,
            std::cmp::Ordering::Greater => ConditionCode::Gt,
        }
    }
}
impl std::fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionCode::Lt => f.write_str("<"),
            ConditionCode::Eq => f.write_str("="),
            ConditionCode::Gt => f.write_str(">"),
        }
    }
}

/// Interprets a 24-bit word as a signed value.
pub fn signed(word: u32) -> i32 {
    ((word << 8) as i32) >> 8
}

#[cfg(test)]
mod tests {
    use crate::ast::Reg;
    use crate::sim::SimErr;

    use super::{signed, ConditionCode, Mem, RegFile, FILLER, MEM_SIZE};

    #[test]
    fn test_mem_bounds() {
        let mut mem = Mem::new();
        assert!(mem.as_slice().iter().all(|&b| b == FILLER));

        mem.set_word(MEM_SIZE - 3, 0xABCDEF).unwrap();
        assert_eq!(mem.get_word(MEM_SIZE - 3).unwrap(), 0xABCDEF);
        assert!(matches!(mem.get_word(MEM_SIZE - 2), Err(SimErr::AddressOutOfRange(a)) if a == MEM_SIZE - 2));
        assert!(matches!(mem.set_byte(MEM_SIZE, 0), Err(SimErr::AddressOutOfRange(_))));
        assert!(matches!(mem.get_bytes(u32::MAX, 2), Err(SimErr::AddressOutOfRange(_))));

        mem.clear();
        assert_eq!(mem.get_byte(MEM_SIZE - 1).unwrap(), FILLER);
    }

    #[test]
    fn test_mem_word() {
        let mut mem = Mem::new();
        mem.set_word(0x30, 0x1F454F46).unwrap();
        assert_eq!(mem.get_bytes(0x30, 3).unwrap(), &[0x45, 0x4F, 0x46]);
        assert_eq!(mem.get_byte(0x33).unwrap(), FILLER);

        mem.set_bytes(0x40, &[0x00, 0x10, 0x33]).unwrap();
        assert_eq!(mem.get_word(0x40).unwrap(), 0x1033);
    }

    #[test]
    fn test_reg_file() {
        let mut reg = RegFile::new();
        for r in Reg::ALL {
            assert_eq!(reg[r], 0);
        }
        reg.set(Reg::L, 0x100000);
        reg.set(Reg::SW, 0xFFFF_FFFF);
        assert_eq!(reg[Reg::L], 0x100000);
        assert_eq!(reg[Reg::SW], 0xFF_FFFF);
    }

    #[test]
    fn test_signed() {
        assert_eq!(signed(0), 0);
        assert_eq!(signed(0x7F_FFFF), 0x7F_FFFF);
        assert_eq!(signed(0xFF_FFFF), -1);
        assert_eq!(signed(0x80_0000), -0x80_0000);
        assert_eq!(ConditionCode::from(signed(0xFF_FFFF).cmp(&0)), ConditionCode::Lt);
        assert_eq!(ConditionCode::Gt.to_string(), ">");
    }
}
