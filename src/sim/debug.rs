//! Breakpoints for pausing simulation.
//!
//! A [`Breakpoint`] is added with [`Simulator::add_breakpoint`], and is checked after each
//! instruction run by [`Simulator::run_while`] (and adjacent). Conditions on values use a [`Comparator`],
//! which can be parsed from text such as `<0`, `== 0x1033`, or `!=-1`:
//!
//! ```
//! use sicxe_ensemble::ast::Reg;
//! use sicxe_ensemble::sim::debug::{Breakpoint, Comparator};
//!
//! let bp = Breakpoint::Reg { reg: Reg::A, value: "<0".parse().unwrap() };
//! assert_eq!(bp.to_string(), "A < 0");
//! assert_eq!("== 0x1033".parse::<Comparator>(), Ok(Comparator::Eq(0x1033)));
//! ```
use std::fmt;
use std::str::FromStr;

use crate::ast::Reg;

use super::mem::signed;
use super::Simulator;

/// A condition which pauses the simulator.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Breakpoint {
    /// The PC is at the given address.
    PC(u32),
    /// The PC is at the address of a loaded symbol.
    ///
    /// Loaded symbols are the control section names and their `EXTDEF` symbols.
    Symbol(String),
    /// The next instruction has the given mnemonic (e.g., `RD`).
    Instruction(String),
    /// The register, read as a signed 24-bit value, matches.
    Reg {
        /// Register to check.
        reg: Reg,
        /// Predicate to break against.
        value: Comparator
    },
    /// The memory at the address matches.
    Mem {
        /// Address to check.
        addr: u32,
        /// Whether to read a byte or a word.
        width: Width,
        /// Predicate to break against.
        value: Comparator
    },
    /// Control has just moved into the given control section from outside of it.
    ///
    /// Unlike checking [`Simulator::current_section`], this does not
    /// break again on every instruction run inside the section.
    Section(String),
    /// The device with the given id has become the active device.
    Device(u8),
}

impl Breakpoint where Breakpoint: Send + Sync { /* assert Breakpoint is send/sync */ }

impl Breakpoint {
    /// Checks if a break should occur.
    pub fn check(&self, sim: &Simulator) -> bool {
        match self {
            Breakpoint::PC(addr) => sim.pc() == *addr,
            Breakpoint::Symbol(name) => sim.program()
                .and_then(|p| p.symbols.get(name))
                .is_some_and(|&addr| sim.pc() == addr),
            Breakpoint::Instruction(mnemonic) => sim.next_instruction_name() == Some(mnemonic.as_str()),
            Breakpoint::Reg { reg, value } => value.check(signed(sim.reg(*reg))),
            Breakpoint::Mem { addr, width: Width::Byte, value } => sim.read_byte(*addr)
                .is_ok_and(|b| value.check(i32::from(b))),
            Breakpoint::Mem { addr, width: Width::Word, value } => sim.read_word(*addr)
                .is_ok_and(|w| value.check(signed(w))),
            Breakpoint::Section(name) => {
                let Some(program) = sim.program() else { return false };
                let prev = sim.last_instruction_addr()
                    .and_then(|a| program.section_at(a))
                    .map(|s| &*s.name);

                sim.current_section() == Some(name.as_str()) && prev != Some(name.as_str())
            },
            Breakpoint::Device(id) => sim.active_device().is_some_and(|d| d.id == *id),
        }
    }
}
impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakpoint::PC(addr)           => write!(f, "PC == {addr:06X}"),
            Breakpoint::Symbol(name)       => write!(f, "PC at {name}"),
            Breakpoint::Instruction(name)  => write!(f, "before {name}"),
            Breakpoint::Reg { reg, value } => write!(f, "{reg} {value}"),
            Breakpoint::Mem { addr, width: Width::Byte, value } => write!(f, "byte[{addr:06X}] {value}"),
            Breakpoint::Mem { addr, width: Width::Word, value } => write!(f, "word[{addr:06X}] {value}"),
            Breakpoint::Section(name)      => write!(f, "entering {name}"),
            Breakpoint::Device(id)         => write!(f, "device {id:02X} active"),
        }
    }
}

/// How much memory a [`Breakpoint::Mem`] reads.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Width {
    /// One unsigned byte (as `LDCH` reads).
    Byte,
    /// One signed 24-bit word (as `LDA` reads).
    Word,
}

/// A comparison against a signed value.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Comparator {
    /// The value is less than this.
    Lt(i32),
    /// The value is less than or equal to this.
    Le(i32),
    /// The value is equal to this.
    Eq(i32),
    /// The value is not equal to this.
    Ne(i32),
    /// The value is greater than or equal to this.
    Ge(i32),
    /// The value is greater than this.
    Gt(i32),
}
impl Comparator {
    /// Checks if the value passes the comparator.
    pub fn check(&self, value: i32) -> bool {
        match *self {
            Comparator::Lt(r) => value < r,
            Comparator::Le(r) => value <= r,
            Comparator::Eq(r) => value == r,
            Comparator::Ne(r) => value != r,
            Comparator::Ge(r) => value >= r,
            Comparator::Gt(r) => value > r,
        }
    }
}
impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Lt(r) => write!(f, "< {r}"),
            Comparator::Le(r) => write!(f, "<= {r}"),
            Comparator::Eq(r) => write!(f, "== {r}"),
            Comparator::Ne(r) => write!(f, "!= {r}"),
            Comparator::Ge(r) => write!(f, ">= {r}"),
            Comparator::Gt(r) => write!(f, "> {r}"),
        }
    }
}
impl FromStr for Comparator {
    type Err = ComparatorErr;

    /// Parses an operator (`<`, `<=`, `==` or `=`, `!=`, `>=`, `>`) followed by
    /// a decimal or `0x`-prefixed hex value. The value may be negative.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Two-character operators have to be tried first.
        let ops: [(&str, fn(i32) -> Comparator); 7] = [
            ("<=", Comparator::Le), (">=", Comparator::Ge), ("==", Comparator::Eq), ("!=", Comparator::Ne),
            ("<", Comparator::Lt), (">", Comparator::Gt), ("=", Comparator::Eq),
        ];
        let (make, rest) = ops.iter()
            .find_map(|&(op, make)| s.strip_prefix(op).map(|rest| (make, rest.trim_start())))
            .ok_or(ComparatorErr::MissingOperator)?;

        let (negative, digits) = match rest.strip_prefix('-') {
            Some(d) => (true, d),
            None => (false, rest),
        };
        let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i32::from_str_radix(hex, 16),
            None => digits.parse::<i32>(),
        };
        let magnitude = magnitude.map_err(|_| ComparatorErr::BadValue(rest.to_string()))?;

        Ok(make(if negative { -magnitude } else { magnitude }))
    }
}

/// Error from parsing a [`Comparator`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ComparatorErr {
    /// The text did not start with a comparison operator.
    MissingOperator,
    /// The value after the operator was not a number.
    BadValue(String),
}
impl fmt::Display for ComparatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparatorErr::MissingOperator => f.write_str("expected a comparison operator"),
            ComparatorErr::BadValue(v)     => write!(f, "invalid value {v}"),
        }
    }
}
impl std::error::Error for ComparatorErr {}
impl crate::err::Error for ComparatorErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            ComparatorErr::MissingOperator => Some("start with one of <, <=, ==, !=, >=, >".into()),
            ComparatorErr::BadValue(_)     => Some("values are decimal (e.g., -1) or hex with 0x (e.g., 0x1033)".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::Reg;

    use super::{Breakpoint, Comparator, ComparatorErr, Width};

    #[test]
    fn test_comparator() {
        assert!(Comparator::Lt(0).check(-1));
        assert!(!Comparator::Lt(5).check(5));
        assert!(Comparator::Ge(5).check(5));
        assert!(Comparator::Ne(0).check(1));
    }

    #[test]
    fn test_parse_comparator() {
        assert_eq!("<0".parse::<Comparator>(), Ok(Comparator::Lt(0)));
        assert_eq!("<= 3".parse::<Comparator>(), Ok(Comparator::Le(3)));
        assert_eq!("=0x1033".parse::<Comparator>(), Ok(Comparator::Eq(0x1033)));
        assert_eq!("!= -1".parse::<Comparator>(), Ok(Comparator::Ne(-1)));
        assert_eq!(" >= -0x10 ".parse::<Comparator>(), Ok(Comparator::Ge(-16)));
        assert_eq!(">7".parse::<Comparator>(), Ok(Comparator::Gt(7)));

        assert_eq!("7".parse::<Comparator>(), Err(ComparatorErr::MissingOperator));
        assert_eq!("< X".parse::<Comparator>(), Err(ComparatorErr::BadValue("X".into())));
    }

    #[test]
    fn test_breakpoint_fmt() {
        assert_eq!(Breakpoint::PC(0x1033).to_string(), "PC == 001033");
        assert_eq!(Breakpoint::Symbol("RDREC".into()).to_string(), "PC at RDREC");
        assert_eq!(Breakpoint::Instruction("TD".into()).to_string(), "before TD");
        assert_eq!(
            Breakpoint::Reg { reg: Reg::X, value: Comparator::Ge(3) }.to_string(),
            "X >= 3"
        );
        assert_eq!(
            Breakpoint::Mem { addr: 0x30, width: Width::Byte, value: Comparator::Eq(0) }.to_string(),
            "byte[000030] == 0"
        );
        assert_eq!(
            Breakpoint::Mem { addr: 0x30, width: Width::Word, value: Comparator::Lt(-1) }.to_string(),
            "word[000030] < -1"
        );
        assert_eq!(Breakpoint::Section("RDREC".into()).to_string(), "entering RDREC");
        assert_eq!(Breakpoint::Device(0xF1).to_string(), "device F1 active");
    }
}
