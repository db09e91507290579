//! Components shared by the assembler and the simulator.
//!
//! This module holds the machine vocabulary of SIC/XE:
//! - [`InstrTable`]: the instruction metadata table (mnemonic, opcode, format)
//! - [`Reg`]: the registers of the machine
//! - [`Directive`]: the assembler directives
//! - [`Nixbpe`]: the addressing flag bits of format 3/4 instructions

use std::collections::HashMap;

/// A register of the SIC/XE machine.
///
/// The discriminant of each register is the register number used
/// in format 2 instructions and in the register file.
/// Register number 7 is reserved and has no name.
///
/// ## Examples
///
/// ```text
/// CLEAR X
///       ~
/// COMPR A,S
///       ~ ~
/// TIXR  T
///       ~
/// ```
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Reg {
    /// Accumulator.
    A = 0,
    /// Index register.
    X = 1,
    /// Linkage register (return address of `JSUB`).
    L = 2,
    /// Base register.
    B = 3,
    /// General working register.
    S = 4,
    /// General working register.
    T = 5,
    /// Floating-point accumulator.
    F = 6,
    /// Program counter.
    PC = 8,
    /// Status word.
    SW = 9,
}
impl Reg {
    /// All named registers, in register number order.
    pub const ALL: [Reg; 9] = [Reg::A, Reg::X, Reg::L, Reg::B, Reg::S, Reg::T, Reg::F, Reg::PC, Reg::SW];

    /// Gets the register number of this [`Reg`].
    pub fn reg_no(self) -> u8 {
        self as u8
    }
}
impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Reg::A  => "A",
            Reg::X  => "X",
            Reg::L  => "L",
            Reg::B  => "B",
            Reg::S  => "S",
            Reg::T  => "T",
            Reg::F  => "F",
            Reg::PC => "PC",
            Reg::SW => "SW",
        };
        f.pad(name)
    }
}
impl std::str::FromStr for Reg {
    type Err = ();

    /// Parses a register name.
    ///
    /// Only registers that can appear in a format 2 instruction are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Reg::A),
            "X" => Ok(Reg::X),
            "L" => Ok(Reg::L),
            "B" => Ok(Reg::B),
            "S" => Ok(Reg::S),
            "T" => Ok(Reg::T),
            "F" => Ok(Reg::F),
            _   => Err(()),
        }
    }
}
impl TryFrom<u8> for Reg {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Reg::ALL.into_iter()
            .find(|r| r.reg_no() == value)
            .ok_or(value)
    }
}
impl From<Reg> for usize {
    // Used for indexing the register file.
    fn from(value: Reg) -> Self {
        usize::from(value.reg_no())
    }
}

/// The instruction format of a machine instruction.
///
/// Format 4 is not listed here, as it is format 3 with the `e` flag set
/// (denoted with a `+` before the mnemonic in source).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Format {
    /// 1 byte: opcode.
    One,
    /// 2 bytes: opcode, two register nibbles.
    Two,
    /// 3 bytes: opcode and flags, 12-bit displacement (or 4 bytes, 20-bit address, if extended).
    Three,
}
impl Format {
    /// The length in bytes of an instruction with this format
    /// (excluding the extra byte of format 4).
    pub fn byte_len(self) -> u32 {
        match self {
            Format::One   => 1,
            Format::Two   => 2,
            Format::Three => 3,
        }
    }
}
impl TryFrom<u8> for Format {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Format::One),
            2 => Ok(Format::Two),
            3 => Ok(Format::Three),
            n => Err(n),
        }
    }
}

/// A single entry of the [`InstrTable`].
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct InstrInfo {
    /// The mnemonic (e.g., `LDA`).
    pub mnemonic: String,
    /// The opcode byte. For format 3/4 instructions, the two low bits are zero.
    pub opcode: u8,
    /// The instruction's format.
    pub format: Format,
    /// The number of operands the instruction expects.
    pub operands: u8,
}

/// Errors from reading an instruction table description.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TableErr {
    /// A line did not have the 4 fields `NAME FORMAT OPCODE OPERANDS`.
    MissingField(usize),
    /// The format field was not 1, 2, or 3.
    InvalidFormat(usize),
    /// The opcode field was not a hex byte.
    InvalidOpcode(usize),
    /// The operand count field was not a small decimal number.
    InvalidOperandCount(usize),
}
impl std::fmt::Display for TableErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableErr::MissingField(l)        => write!(f, "instruction table line {l} is missing a field"),
            TableErr::InvalidFormat(l)       => write!(f, "instruction table line {l} has an invalid format"),
            TableErr::InvalidOpcode(l)       => write!(f, "instruction table line {l} has an invalid opcode"),
            TableErr::InvalidOperandCount(l) => write!(f, "instruction table line {l} has an invalid operand count"),
        }
    }
}
impl std::error::Error for TableErr {}
impl crate::err::Error for TableErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            TableErr::MissingField(_)        => Some("each line should look like `LDA 3 00 1`".into()),
            TableErr::InvalidFormat(_)       => Some("the format must be 1, 2, or 3".into()),
            TableErr::InvalidOpcode(_)       => Some("the opcode is a hex byte, such as `0C` or `B4`".into()),
            TableErr::InvalidOperandCount(_) => Some("the operand count is a decimal number between 0 and 2".into()),
        }
    }
}

/// The instruction metadata table.
///
/// This maps mnemonics and opcodes to their [`InstrInfo`].
/// A table is built once and passed by reference to the tokenizer, the assembler, and the simulator.
///
/// ## Example
/// ```
/// use sicxe_ensemble::ast::{Format, InstrTable};
///
/// let table = InstrTable::sicxe();
/// let lda = table.lookup("LDA").unwrap();
/// assert_eq!(lda.opcode, 0x00);
/// assert_eq!(lda.format, Format::Three);
///
/// let clear = table.lookup_opcode(0xB4).unwrap();
/// assert_eq!(clear.mnemonic, "CLEAR");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrTable {
    by_name: HashMap<String, InstrInfo>,
    by_opcode: HashMap<u8, String>,
}

const SICXE_TABLE: &str = "\
ADD 3 18 1
ADDF 3 58 1
ADDR 2 90 2
AND 3 40 1
CLEAR 2 B4 1
COMP 3 28 1
COMPF 3 88 1
COMPR 2 A0 2
DIV 3 24 1
DIVF 3 64 1
DIVR 2 9C 2
FIX 1 C4 0
FLOAT 1 C0 0
HIO 1 F4 0
J 3 3C 1
JEQ 3 30 1
JGT 3 34 1
JLT 3 38 1
JSUB 3 48 1
LDA 3 00 1
LDB 3 68 1
LDCH 3 50 1
LDF 3 70 1
LDL 3 08 1
LDS 3 6C 1
LDT 3 74 1
LDX 3 04 1
LPS 3 D0 1
MUL 3 20 1
MULF 3 60 1
MULR 2 98 2
NORM 1 C8 0
OR 3 44 1
RD 3 D8 1
RMO 2 AC 2
RSUB 3 4C 0
SHIFTL 2 A4 2
SHIFTR 2 A8 2
SIO 1 F0 0
SSK 3 EC 1
STA 3 0C 1
STB 3 78 1
STCH 3 54 1
STF 3 80 1
STI 3 D4 1
STL 3 14 1
STS 3 7C 1
STSW 3 E8 1
STT 3 84 1
STX 3 10 1
SUB 3 1C 1
SUBF 3 5C 1
SUBR 2 94 2
SVC 2 B0 1
TD 3 E0 1
TIO 1 F8 0
TIX 3 2C 1
TIXR 2 B8 1
WD 3 DC 1
";

impl InstrTable {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self { by_name: HashMap::new(), by_opcode: HashMap::new() }
    }

    /// Creates the table of the full SIC/XE instruction set.
    pub fn sicxe() -> Self {
        Self::parse(SICXE_TABLE)
            .unwrap_or_else(|e| unreachable!("built-in instruction table should be well-formed: {e}"))
    }

    /// Reads a table description.
    ///
    /// Each non-blank line describes one instruction as
    /// `NAME FORMAT OPCODE OPERANDS`, where `OPCODE` is hex and the rest are decimal:
    /// ```text
    /// LDA 3 00 1
    /// CLEAR 2 B4 1
    /// RSUB 3 4C 0
    /// ```
    pub fn parse(src: &str) -> Result<Self, TableErr> {
        let mut table = Self::empty();

        for (i, line) in src.lines().enumerate() {
            let lno = i + 1;
            let fields: Vec<_> = line.split_whitespace().collect();
            if fields.is_empty() { continue };

            let &[name, format, opcode, operands] = fields.as_slice() else {
                return Err(TableErr::MissingField(lno));
            };
            let format = format.parse::<u8>().ok()
                .and_then(|f| Format::try_from(f).ok())
                .ok_or(TableErr::InvalidFormat(lno))?;
            let opcode = u8::from_str_radix(opcode, 16)
                .map_err(|_| TableErr::InvalidOpcode(lno))?;
            let operands = operands.parse::<u8>().ok()
                .filter(|&n| n <= 2)
                .ok_or(TableErr::InvalidOperandCount(lno))?;

            table.insert(InstrInfo { mnemonic: name.to_uppercase(), opcode, format, operands });
        }

        Ok(table)
    }

    /// Adds an instruction to the table, replacing any instruction with the same mnemonic.
    pub fn insert(&mut self, info: InstrInfo) {
        if let Some(old) = self.by_name.remove(&info.mnemonic) {
            self.by_opcode.remove(&old.opcode);
        }
        self.by_opcode.insert(info.opcode, info.mnemonic.clone());
        self.by_name.insert(info.mnemonic.clone(), info);
    }

    /// Looks up an instruction by mnemonic.
    pub fn lookup(&self, mnemonic: &str) -> Option<&InstrInfo> {
        self.by_name.get(mnemonic)
    }

    /// Looks up an instruction by its opcode byte.
    ///
    /// For format 3/4 instructions, the two low bits of the first byte hold the `n` and `i` flags,
    /// so callers decoding memory should try the byte as-is and masked with `0xFC`.
    pub fn lookup_opcode(&self, opcode: u8) -> Option<&InstrInfo> {
        self.by_opcode.get(&opcode)
            .and_then(|name| self.by_name.get(name))
    }

    /// Iterates over every instruction in the table (in no particular order).
    pub fn iter(&self) -> impl Iterator<Item=&InstrInfo> + '_ {
        self.by_name.values()
    }

    /// The number of instructions in the table.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table has no instructions.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
impl Default for InstrTable {
    fn default() -> Self {
        Self::sicxe()
    }
}

macro_rules! directive_enum {
    ($($name:ident),+) => {
        /// An assembler directive.
        #[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
        pub enum Directive {
            $(
                #[allow(missing_docs)]
                $name
            ),+
        }

        impl std::str::FromStr for Directive {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($name) => Ok(Self::$name)),*,
                    _ => Err(())
                }
            }
        }

        impl std::fmt::Display for Directive {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$name => f.pad(stringify!($name))),*
                }
            }
        }
    };
}
directive_enum! {
    START, END, EXTDEF, EXTREF, LTORG, RESB, RESW, CSECT, EQU, BYTE, WORD
}

impl Directive {
    /// Whether this directive emits bytes into the object program.
    pub fn emits_code(self) -> bool {
        matches!(self, Directive::BYTE | Directive::WORD | Directive::LTORG | Directive::END)
    }

    /// Whether this directive never takes an operand.
    ///
    /// For these directives, the field after the directive is a comment.
    pub fn takes_no_operand(self) -> bool {
        matches!(self, Directive::LTORG | Directive::CSECT)
    }
}

/// The sign of a term in an expression or a modification record.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum Sign {
    /// `+`
    #[default]
    Plus,
    /// `-`
    Minus,
}
impl Sign {
    /// Applies this sign to a value.
    pub fn apply(self, value: i64) -> i64 {
        match self {
            Sign::Plus  => value,
            Sign::Minus => -value,
        }
    }
}
impl std::fmt::Display for Sign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sign::Plus  => f.write_str("+"),
            Sign::Minus => f.write_str("-"),
        }
    }
}
impl TryFrom<char> for Sign {
    type Error = char;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            '+' => Ok(Sign::Plus),
            '-' => Ok(Sign::Minus),
            c   => Err(c),
        }
    }
}

/// The `nixbpe` flag bits of a format 3/4 instruction.
///
/// | bit | meaning                              |
/// |-----|--------------------------------------|
/// | `n` | indirect                             |
/// | `i` | immediate                            |
/// | `x` | indexed                              |
/// | `b` | base-relative (never set by the assembler) |
/// | `p` | PC-relative                          |
/// | `e` | extended (format 4)                  |
///
/// Simple addressing is encoded as both `n` and `i` set.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct Nixbpe(u8);
impl Nixbpe {
    /// Indirect bit.
    pub const N: u8 = 0x20;
    /// Immediate bit.
    pub const I: u8 = 0x10;
    /// Indexed bit.
    pub const X: u8 = 0x08;
    /// Base-relative bit.
    pub const B: u8 = 0x04;
    /// PC-relative bit.
    pub const P: u8 = 0x02;
    /// Extended bit.
    pub const E: u8 = 0x01;

    /// Creates a flag set from its 6 bits.
    pub fn new(bits: u8) -> Self {
        Self(bits & 0x3F)
    }
    /// Gets the 6 flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }
    /// Returns this flag set with the given bits set.
    pub fn with(self, bits: u8) -> Self {
        Self::new(self.0 | bits)
    }
    /// Returns this flag set with the given bits cleared.
    pub fn without(self, bits: u8) -> Self {
        Self::new(self.0 & !bits)
    }
    fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[allow(missing_docs)]
    pub fn n(self) -> bool { self.has(Self::N) }
    #[allow(missing_docs)]
    pub fn i(self) -> bool { self.has(Self::I) }
    #[allow(missing_docs)]
    pub fn x(self) -> bool { self.has(Self::X) }
    #[allow(missing_docs)]
    pub fn b(self) -> bool { self.has(Self::B) }
    #[allow(missing_docs)]
    pub fn p(self) -> bool { self.has(Self::P) }
    #[allow(missing_docs)]
    pub fn e(self) -> bool { self.has(Self::E) }

    /// Indirect addressing (`@`): `n` set without `i`.
    pub fn is_indirect(self) -> bool {
        self.n() && !self.i()
    }
    /// Immediate addressing (`#`): `i` set without `n`.
    pub fn is_immediate(self) -> bool {
        self.i() && !self.n()
    }
}
impl std::fmt::Debug for Nixbpe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nixbpe({:06b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let table = InstrTable::sicxe();
        assert_eq!(table.len(), 59);

        let info = table.lookup("STA").unwrap();
        assert_eq!((info.opcode, info.format, info.operands), (0x0C, Format::Three, 1));
        let info = table.lookup("TIXR").unwrap();
        assert_eq!((info.opcode, info.format, info.operands), (0xB8, Format::Two, 1));
        assert_eq!(table.lookup_opcode(0x4C).map(|i| &*i.mnemonic), Some("RSUB"));
        assert!(table.lookup("HALT").is_none());
        assert!(table.lookup("sta").is_none());
    }

    #[test]
    fn test_table_parse() {
        let table = InstrTable::parse("LDA 3 00 1\n\n  clear 2 b4 1\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("CLEAR").unwrap().opcode, 0xB4);

        assert_eq!(InstrTable::parse("LDA 3 00"), Err(TableErr::MissingField(1)));
        assert_eq!(InstrTable::parse("LDA 3 00 1\nSTA 5 0C 1"), Err(TableErr::InvalidFormat(2)));
        assert_eq!(InstrTable::parse("LDA 3 GG 1"), Err(TableErr::InvalidOpcode(1)));
        assert_eq!(InstrTable::parse("LDA 3 00 9"), Err(TableErr::InvalidOperandCount(1)));
    }

    #[test]
    fn test_table_insert_replaces() {
        let mut table = InstrTable::parse("LDA 3 00 1").unwrap();
        table.insert(InstrInfo { mnemonic: "LDA".into(), opcode: 0x04, format: Format::Three, operands: 1 });
        assert!(table.lookup_opcode(0x00).is_none());
        assert_eq!(table.lookup_opcode(0x04).unwrap().mnemonic, "LDA");
    }

    #[test]
    fn test_reg() {
        assert_eq!("T".parse(), Ok(Reg::T));
        assert_eq!("PC".parse::<Reg>(), Err(()));
        assert_eq!(Reg::try_from(8), Ok(Reg::PC));
        assert_eq!(Reg::try_from(7), Err(7));
        assert_eq!(usize::from(Reg::SW), 9);
        assert_eq!(Reg::F.to_string(), "F");
    }

    #[test]
    fn test_directive() {
        assert_eq!("LTORG".parse(), Ok(Directive::LTORG));
        assert!("ltorg".parse::<Directive>().is_err());
        assert_eq!(Directive::EXTREF.to_string(), "EXTREF");
        assert!(Directive::WORD.emits_code());
        assert!(!Directive::RESW.emits_code());
    }

    #[test]
    fn test_sign() {
        assert_eq!(Sign::Minus.apply(5), -5);
        assert_eq!(Sign::try_from('-'), Ok(Sign::Minus));
        assert_eq!(Sign::try_from('*'), Err('*'));
        assert_eq!(Sign::Plus.to_string(), "+");
    }

    #[test]
    fn test_nixbpe() {
        let flags = Nixbpe::new(Nixbpe::N | Nixbpe::I | Nixbpe::P);
        assert_eq!(flags.bits(), 0x32);
        assert!(flags.n() && flags.i() && flags.p());
        assert!(!flags.is_indirect() && !flags.is_immediate());

        let flags = flags.without(Nixbpe::N | Nixbpe::P);
        assert!(flags.is_immediate());
        assert_eq!(flags.with(Nixbpe::X).bits(), 0x18);
    }
}
