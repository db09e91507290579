//! Decoding machine instructions out of memory.
//!
//! [`decode`] reads the instruction at an address and splits it into its opcode,
//! its length, and its operand fields. It does not compute target addresses,
//! which depend on the register state (see [`crate::sim::Simulator`]).

use crate::ast::{Format, InstrTable, Nixbpe};

use super::mem::Mem;
use super::SimErr;

/// The operand fields of a decoded instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operands {
    /// Format 1 has no operands.
    None,
    /// The two register nibbles of a format 2 instruction.
    Registers {
        /// The first nibble.
        r1: u8,
        /// The second nibble.
        r2: u8
    },
    /// The flags and displacement of a format 3/4 instruction.
    Memory {
        /// The addressing flags.
        flags: Nixbpe,
        /// The displacement field.
        ///
        /// For format 3, this is the raw 12-bit field (see [`DecodedInstruction::pc_relative_disp`]).
        /// For format 4, this is the 20-bit field, sign-extended.
        /// For SIC-compatible instructions (n = i = 0), this is the 15-bit address.
        disp: i32
    },
}

/// A single decoded instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DecodedInstruction {
    /// The opcode, with the low two bits (`n` and `i`) cleared.
    pub opcode: u8,
    /// The length of the instruction in bytes.
    pub length: u32,
    /// The operand fields.
    pub operands: Operands,
}
impl DecodedInstruction {
    /// The addressing flags, if this is a format 3/4 instruction.
    pub fn flags(&self) -> Option<Nixbpe> {
        match self.operands {
            Operands::Memory { flags, .. } => Some(flags),
            _ => None,
        }
    }

    /// The displacement as a signed PC-relative offset.
    ///
    /// This is the 12-bit field of a format 3 instruction, sign-extended.
    pub fn pc_relative_disp(&self) -> Option<i32> {
        match self.operands {
            Operands::Memory { disp, .. } if self.length == 3 => Some((disp << 20) >> 20),
            _ => None,
        }
    }
}

/// Decodes the instruction at the given address.
///
/// This returns `None` if the opcode is not in the instruction table.
///
/// # Example
/// ```
/// use sicxe_ensemble::ast::InstrTable;
/// use sicxe_ensemble::sim::decode::{decode, Operands};
/// use sicxe_ensemble::sim::mem::Mem;
///
/// let mut mem = Mem::new();
/// mem.set_bytes(0x1000, &[0x0F, 0x20, 0x4D]).unwrap(); // STA
///
/// let instr = decode(0x1000, &mem, &InstrTable::sicxe()).unwrap().unwrap();
/// assert_eq!(instr.opcode, 0x0C);
/// assert_eq!(instr.length, 3);
/// assert_eq!(instr.flags().unwrap().bits(), 0x32);
/// assert!(matches!(instr.operands, Operands::Memory { disp: 0x04D, .. }));
/// ```
pub fn decode(addr: u32, mem: &Mem, table: &InstrTable) -> Result<Option<DecodedInstruction>, SimErr> {
    let byte0 = mem.get_byte(addr)?;
    let opcode = byte0 & 0xFC;
    let Some(info) = table.lookup_opcode(opcode) else {
        return Ok(None);
    };

    let instr = match info.format {
        Format::One => DecodedInstruction { opcode, length: info.format.byte_len(), operands: Operands::None },
        Format::Two => {
            let regs = mem.get_byte(addr + 1)?;
            DecodedInstruction {
                // Format 2 opcodes use every bit of the first byte.
                opcode: byte0,
                length: info.format.byte_len(),
                operands: Operands::Registers { r1: regs >> 4, r2: regs & 0xF }
            }
        },
        Format::Three => {
            let byte1 = mem.get_byte(addr + 1)?;
            let flags = Nixbpe::new(((byte0 & 0b11) << 4) | (byte1 >> 4));

            match (flags.n() || flags.i(), flags.e()) {
                // SIC-compatible: x, then a 15-bit address.
                (false, _) => {
                    let [_, b1, b2] = <[u8; 3]>::try_from(mem.get_bytes(addr, 3)?)
                        .map_err(|_| SimErr::AddressOutOfRange(addr))?;
                    let flags = Nixbpe::new(if b1 & 0x80 != 0 { Nixbpe::X } else { 0 });
                    let disp = (i32::from(b1 & 0x7F) << 8) | i32::from(b2);
                    DecodedInstruction { opcode, length: 3, operands: Operands::Memory { flags, disp } }
                },
                (true, false) => {
                    let b2 = mem.get_byte(addr + 2)?;
                    let disp = (i32::from(byte1 & 0xF) << 8) | i32::from(b2);
                    DecodedInstruction { opcode, length: 3, operands: Operands::Memory { flags, disp } }
                },
                (true, true) => {
                    let bytes = mem.get_bytes(addr + 2, 2)?;
                    let field = (i32::from(byte1 & 0xF) << 16) | (i32::from(bytes[0]) << 8) | i32::from(bytes[1]);
                    // sign-extend 20 bits
                    let disp = (field << 12) >> 12;
                    DecodedInstruction { opcode, length: 4, operands: Operands::Memory { flags, disp } }
                },
            }
        },
    };

    Ok(Some(instr))
}

#[cfg(test)]
mod tests {
    use crate::ast::InstrTable;
    use crate::sim::mem::{Mem, MEM_SIZE};
    use crate::sim::SimErr;

    use super::{decode, DecodedInstruction, Operands};

    fn decode_bytes(bytes: &[u8]) -> Option<DecodedInstruction> {
        let mut mem = Mem::new();
        mem.set_bytes(0, bytes).unwrap();
        decode(0, &mem, &InstrTable::sicxe()).unwrap()
    }

    #[test]
    fn test_decode_format3() {
        // STL RETADR
        let instr = decode_bytes(&[0x17, 0x20, 0x27]).unwrap();
        assert_eq!(instr.opcode, 0x14);
        assert_eq!(instr.length, 3);
        assert_eq!(instr.flags().unwrap().bits(), 0x32);
        assert_eq!(instr.pc_relative_disp(), Some(0x27));

        // J CLOOP
        let instr = decode_bytes(&[0x3F, 0x2F, 0xEC]).unwrap();
        assert_eq!(instr.opcode, 0x3C);
        assert_eq!(instr.pc_relative_disp(), Some(-20));

        // J @RETADR
        let instr = decode_bytes(&[0x3E, 0x20, 0x00]).unwrap();
        let flags = instr.flags().unwrap();
        assert!(flags.is_indirect());
        assert!(flags.p());

        // COMP #0
        let instr = decode_bytes(&[0x29, 0x00, 0x00]).unwrap();
        assert!(instr.flags().unwrap().is_immediate());
        assert!(matches!(instr.operands, Operands::Memory { disp: 0, .. }));
    }

    #[test]
    fn test_decode_format4() {
        // +JSUB RDREC, relocated
        let instr = decode_bytes(&[0x4B, 0x10, 0x10, 0x33]).unwrap();
        assert_eq!(instr.opcode, 0x48);
        assert_eq!(instr.length, 4);
        assert!(instr.flags().unwrap().e());
        assert!(matches!(instr.operands, Operands::Memory { disp: 0x1033, .. }));
        assert_eq!(instr.pc_relative_disp(), None);

        // +STCH BUFFER,X
        let instr = decode_bytes(&[0x57, 0x90, 0x00, 0x33]).unwrap();
        assert!(instr.flags().unwrap().x());

        // negative immediate
        let instr = decode_bytes(&[0x01, 0x1F, 0xFF, 0xFD]).unwrap();
        assert!(matches!(instr.operands, Operands::Memory { disp: -3, .. }));
    }

    #[test]
    fn test_decode_format2() {
        let instr = decode_bytes(&[0xB4, 0x10]).unwrap();
        assert_eq!(instr, DecodedInstruction { opcode: 0xB4, length: 2, operands: Operands::Registers { r1: 1, r2: 0 } });

        let instr = decode_bytes(&[0xA0, 0x04]).unwrap();
        assert_eq!(instr.operands, Operands::Registers { r1: 0, r2: 4 });
    }

    #[test]
    fn test_decode_sic() {
        // LDA 1000,X in SIC format
        let instr = decode_bytes(&[0x00, 0x90, 0x00]).unwrap();
        let flags = instr.flags().unwrap();
        assert!(flags.x());
        assert!(!flags.n() && !flags.i());
        assert!(matches!(instr.operands, Operands::Memory { disp: 0x1000, .. }));
    }

    #[test]
    fn test_decode_unknown() {
        assert_eq!(decode_bytes(&[0xFC, 0x00, 0x00]), None);
        assert_eq!(decode_bytes(&[0xFF]), None);

        let mem = Mem::new();
        assert!(matches!(decode(MEM_SIZE, &mem, &InstrTable::sicxe()), Err(SimErr::AddressOutOfRange(_))));
    }
}
