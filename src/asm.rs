//! Assembling SIC/XE source into object programs.
//!
//! Assembly happens one control section at a time, in two passes:
//! - Pass 1 ([`ControlSection::new`]) tokenizes each line, assigns location counters,
//!     and fills the section's [`SymbolTable`] and [`LiteralTable`].
//! - Pass 2 ([`ControlSection::object_code`]) encodes each line and collects the
//!     object records of the section.
//!
//! The assembler module notably consists of:
//! - [`assemble`]: the main function, which splits the source at each `CSECT` and assembles every section
//! - [`SymbolTable`] and [`LiteralTable`]: the tables built in pass 1
//! - [`ControlSection`]: a single section with its tokens and tables
//! - [`encoding`]: the object records and their text format

pub mod encoding;

use std::collections::HashMap;
use std::ops::Range;

use crate::ast::{Directive, InstrInfo, InstrTable, Nixbpe, Sign};
use crate::err::ErrSpan;
use crate::parse::{advance_locctr, is_operator, parse_line, Constant, Expr, Operand, Operator, SyntaxErr, Term, Token, LOCCTR_LIMIT};
use encoding::{Modification, ObjectProgram, ObjectSection, TextRecord, MAX_TEXT_LEN};

/// Configuration for the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmFlags {
    /// Whether format 4 operands and `WORD`s which refer to local labels
    /// produce modification records against the section's own name.
    ///
    /// With this enabled, a section can be loaded anywhere in memory.
    /// With this disabled, local addresses are emitted as assembled and
    /// the section must be loaded at its start address.
    pub emit_local_relocations: bool,
}
impl Default for AsmFlags {
    fn default() -> Self {
        Self { emit_local_relocations: true }
    }
}

/// Assembles SIC/XE source code into an object program.
///
/// The source is split into control sections at each `CSECT`.
/// Every section but the last ends with an implicit `END` (which flushes its literal pool),
/// and the last section must end with an `END`.
///
/// # Example
/// ```
/// use sicxe_ensemble::asm::assemble;
/// use sicxe_ensemble::ast::InstrTable;
///
/// let src = "
/// COPY     START   1000
/// FIRST    LDA     FIVE
///          RSUB
/// FIVE     WORD    5
///          END     FIRST
/// ";
/// let program = assemble(src, &InstrTable::sicxe()).unwrap();
/// assert_eq!(program.to_string(), "\
/// HCOPY  001000000009
/// T001000090320034F0000000005
/// E001000
/// ");
/// ```
pub fn assemble(src: &str, table: &InstrTable) -> Result<ObjectProgram, AsmErr> {
    assemble_with_flags(src, table, AsmFlags::default())
}

/// Assembles SIC/XE source code into an object program, using the provided flags.
///
/// See [`assemble`] for more details.
pub fn assemble_with_flags(src: &str, table: &InstrTable, flags: AsmFlags) -> Result<ObjectProgram, AsmErr> {
    let sections = split_sections(src, table)?;
    let (Some(first), Some(last)) = (sections.first(), sections.last()) else {
        return Err(AsmErr::new(AsmErrKind::EmptyProgram, ErrSpan::new(0, "")));
    };

    // The program's entry point is the operand of the final END,
    // which is resolved in the first section.
    let entry = match &last.entry {
        Some(name) => {
            let span = last.tokens.iter()
                .rfind(|t| t.directive() == Some(Directive::END))
                .map_or_else(|| ErrSpan::new(0, ""), |t| t.span.clone());
            first.symbols.address(name).map_err(|e| AsmErr::new(e, span))?
        },
        None => first.start,
    };

    tracing::trace!("starting pass 2");
    let sections = sections.iter()
        .enumerate()
        .map(|(i, sect)| sect.object_code(flags, (i == 0).then_some(entry)))
        .collect::<Result<_, _>>()?;

    Ok(ObjectProgram { sections })
}

const IMPLICIT_END: &str = "         END";

/// Whether the line's operator is `CSECT`, found the same way [`parse_line`] finds it.
fn starts_section(line: &str, table: &InstrTable) -> bool {
    if line.trim_start().starts_with('.') { return false; }

    let mut fields = line.split_whitespace();
    let Some(first) = fields.next() else { return false };
    let operator = match line.starts_with(char::is_whitespace) || is_operator(first, table) {
        true  => Some(first),
        false => fields.next(),
    };
    operator == Some("CSECT")
}

/// Runs pass 1 over every control section in the source.
fn split_sections(src: &str, table: &InstrTable) -> Result<Vec<ControlSection>, AsmErr> {
    let mut groups: Vec<Vec<(usize, &str)>> = vec![];
    for line in src.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match groups.last_mut() {
            Some(g) if !starts_section(line.1, table) => g.push(line),
            _ => groups.push(vec![line]),
        }
    }

    let n_groups = groups.len();
    groups.into_iter()
        .enumerate()
        .map(|(i, mut lines)| {
            if i + 1 != n_groups {
                let last_index = lines.last().map_or(0, |&(index, _)| index);
                lines.push((last_index, IMPLICIT_END));
            }
            ControlSection::new(&lines, table)
        })
        .collect()
}

/// Kinds of errors that can occur from assembling given assembly code.
///
/// See [`AsmErr`] for this error type with span information included.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AsmErrKind {
    /// The line could not be tokenized.
    Syntax(SyntaxErr),
    /// A symbol (or literal) did not have an address.
    UndefinedSymbol(String),
    /// The instruction's format is not 2, 3, or 4.
    UnsupportedFormat,
    /// An external symbol was used where its value must be known at assembly time.
    ExternalInExpression(String),
    /// An external symbol was used in a format 3 instruction.
    ExternalNotExtended(String),
    /// A PC-relative displacement (or a direct address) did not fit in 12 bits.
    DisplacementOutOfRange(i64),
    /// A literal was assigned an address twice.
    LiteralReassigned(String),
    /// The program did not end with an `END` directive.
    MissingEnd,
    /// The source had no lines.
    EmptyProgram,
    /// The location counter moved past the end of memory.
    AddressOutOfRange(u64),
}
impl std::fmt::Display for AsmErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(e)                 => e.fmt(f),
            Self::UndefinedSymbol(s)        => write!(f, "symbol {s} is not defined"),
            Self::UnsupportedFormat         => f.write_str("instruction format is not supported"),
            Self::ExternalInExpression(s)   => write!(f, "external symbol {s} cannot be used here"),
            Self::ExternalNotExtended(s)    => write!(f, "external symbol {s} requires format 4"),
            Self::DisplacementOutOfRange(d) => write!(f, "displacement {d} does not fit in 12 bits"),
            Self::LiteralReassigned(l)      => write!(f, "literal {l} already has an address"),
            Self::MissingEnd                => f.write_str("program has no END directive"),
            Self::EmptyProgram              => f.write_str("program is empty"),
            Self::AddressOutOfRange(a)      => write!(f, "address {a:#X} is past the end of memory"),
        }
    }
}
impl From<SyntaxErr> for AsmErrKind {
    fn from(value: SyntaxErr) -> Self {
        AsmErrKind::Syntax(value)
    }
}

/// Error from assembling given assembly code.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AsmErr {
    /// The value with a span.
    pub kind: AsmErrKind,
    /// The span in the source associated with this value.
    pub span: ErrSpan
}
impl AsmErr {
    /// Creates a new [`AsmErr`].
    pub fn new(kind: AsmErrKind, span: ErrSpan) -> Self {
        AsmErr { kind, span }
    }
}
impl std::fmt::Display for AsmErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.kind, self.span)
    }
}
impl std::error::Error for AsmErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AsmErrKind::Syntax(e) => Some(e),
            _ => None
        }
    }
}
impl crate::err::Error for AsmErr {
    fn span(&self) -> Option<ErrSpan> {
        Some(self.span.clone())
    }

    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match &self.kind {
            AsmErrKind::Syntax(e)                 => crate::err::Error::help(e),
            AsmErrKind::UndefinedSymbol(_)        => Some("try adding this label, or importing it with EXTREF".into()),
            AsmErrKind::UnsupportedFormat         => Some("only format 2, 3, and 4 instructions can be assembled".into()),
            AsmErrKind::ExternalInExpression(_)   => Some("EQU values must be known within the section".into()),
            AsmErrKind::ExternalNotExtended(_)    => Some("try prefixing the instruction with + to use format 4".into()),
            AsmErrKind::DisplacementOutOfRange(_) => Some("the target must be within [-2048, 2047] bytes of the next instruction; try format 4".into()),
            AsmErrKind::LiteralReassigned(_)      => None,
            AsmErrKind::MissingEnd                => Some("add an END directive at the end of the program".into()),
            AsmErrKind::EmptyProgram              => None,
            AsmErrKind::AddressOutOfRange(_)      => Some(format!("a program must fit below {LOCCTR_LIMIT:#X}; try reserving less space").into()),
        }
    }
}

/// The value of a symbol.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SymbolValue {
    /// An address within the section (a label, `*`, or an `EQU` of one).
    Relative(u32),
    /// A value that does not move when the section is relocated (e.g., `MAXLEN EQU 4096`).
    Absolute(u32),
    /// A symbol imported with `EXTREF`, which is resolved when the program is loaded.
    External,
}
impl SymbolValue {
    /// The value of this symbol, if it is known at assembly time.
    pub fn address(self) -> Option<u32> {
        match self {
            SymbolValue::Relative(a) | SymbolValue::Absolute(a) => Some(a),
            SymbolValue::External => None,
        }
    }
}

/// The symbol table of a control section.
///
/// Labels follow a "first definition wins" rule: a later definition of
/// the same label is ignored. `EQU` symbols are overwritten.
///
/// ## Example
/// ```
/// use sicxe_ensemble::asm::{SymbolTable, SymbolValue};
///
/// let mut sym = SymbolTable::new();
/// sym.put_label("LOOP", 0x1003);
/// sym.put_label("LOOP", 0x2000);
/// sym.put_refer("RDREC");
///
/// assert_eq!(sym.get("LOOP"), Some(SymbolValue::Relative(0x1003)));
/// assert_eq!(sym.get("RDREC"), Some(SymbolValue::External));
/// assert!(sym.address("RDREC").is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SymbolTable {
    order: Vec<String>,
    values: HashMap<String, SymbolValue>,
}
impl SymbolTable {
    /// Creates an empty symbol table.
    pub fn new() -> Self {
        Default::default()
    }

    fn put_new(&mut self, name: &str, value: SymbolValue) -> bool {
        if self.values.contains_key(name) { return false; }

        self.order.push(name.to_string());
        self.values.insert(name.to_string(), value);
        true
    }

    /// Defines a label at the given address, returning whether it was newly defined.
    pub fn put_label(&mut self, name: &str, addr: u32) -> bool {
        self.put_new(name, SymbolValue::Relative(addr))
    }

    /// Defines a symbol, replacing any previous value.
    pub fn put(&mut self, name: &str, value: SymbolValue) {
        if !self.put_new(name, value) {
            self.values.insert(name.to_string(), value);
        }
    }

    /// Declares an external symbol.
    pub fn put_refer(&mut self, name: &str) -> bool {
        self.put_new(name, SymbolValue::External)
    }

    /// Gets the value of a symbol.
    pub fn get(&self, name: &str) -> Option<SymbolValue> {
        self.values.get(name).copied()
    }

    /// Gets the address of a symbol that is known at assembly time.
    pub fn address(&self, name: &str) -> Result<u32, AsmErrKind> {
        match self.get(name) {
            Some(SymbolValue::Relative(a) | SymbolValue::Absolute(a)) => Ok(a),
            Some(SymbolValue::External) => Err(AsmErrKind::ExternalInExpression(name.to_string())),
            None => Err(AsmErrKind::UndefinedSymbol(name.to_string())),
        }
    }

    /// Iterates over the symbols in the order they were defined.
    pub fn iter(&self) -> impl Iterator<Item=(&str, SymbolValue)> + '_ {
        self.order.iter()
            .filter_map(|name| Some((name.as_str(), self.get(name)?)))
    }

    /// The number of symbols in the table.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the table has no symbols.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
impl std::fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in self.iter() {
            match value.address() {
                Some(addr) => writeln!(f, "{name}\t{addr:04X}")?,
                None => writeln!(f, "{name}\tREF")?,
            }
        }
        Ok(())
    }
}

/// A literal in the literal table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Literal {
    /// The literal's value.
    pub constant: Constant,
    /// The literal's address, once its pool has been placed.
    pub address: Option<u32>,
}

/// The literal table of a control section.
///
/// Literals are collected as they are used and are given addresses
/// at the next `LTORG` or `END`. Each literal is pooled once per section.
///
/// ## Example
/// ```
/// use sicxe_ensemble::asm::LiteralTable;
/// use sicxe_ensemble::parse::{ConstKind, Constant};
///
/// let eof = Constant { kind: ConstKind::Char, bytes: b"EOF".to_vec() };
/// let mut lits = LiteralTable::new();
/// lits.put(&eof);
///
/// assert_eq!(lits.assign_addresses(0x30), 3);
/// assert_eq!(lits.address(&eof), Ok(0x30));
///
/// // Nothing left to place:
/// assert_eq!(lits.assign_addresses(0x60), 0);
/// assert_eq!(lits.address(&eof), Ok(0x30));
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LiteralTable {
    literals: Vec<Literal>,
}
impl LiteralTable {
    /// Creates an empty literal table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a literal to the table, if it isn't already present.
    pub fn put(&mut self, constant: &Constant) {
        if !self.literals.iter().any(|l| l.constant == *constant) {
            self.literals.push(Literal { constant: constant.clone(), address: None });
        }
    }

    /// Gives a literal its address.
    ///
    /// This fails if the literal already has an address.
    pub fn set_address(&mut self, constant: &Constant, addr: u32) -> Result<(), AsmErrKind> {
        let lit = self.literals.iter_mut()
            .find(|l| l.constant == *constant)
            .ok_or_else(|| AsmErrKind::UndefinedSymbol(format!("={constant}")))?;

        match lit.address {
            Some(_) => Err(AsmErrKind::LiteralReassigned(format!("={constant}"))),
            None => {
                lit.address = Some(addr);
                Ok(())
            }
        }
    }

    /// Places every literal without an address into a pool starting at `start`,
    /// in the order they were first used.
    ///
    /// This returns the size of the pool in bytes. Literals that already have
    /// an address are left alone, so repeated calls do not move anything.
    pub fn assign_addresses(&mut self, start: u32) -> u32 {
        let pending: Vec<_> = self.literals.iter()
            .filter(|l| l.address.is_none())
            .map(|l| l.constant.clone())
            .collect();

        let mut addr = start;
        for constant in pending {
            // Literals in `pending` have no address, so this cannot fail.
            if self.set_address(&constant, addr).is_ok() {
                addr += constant.bytes.len() as u32;
            }
        }
        addr - start
    }

    /// Gets the address of a literal.
    pub fn address(&self, constant: &Constant) -> Result<u32, AsmErrKind> {
        self.literals.iter()
            .find(|l| l.constant == *constant)
            .and_then(|l| l.address)
            .ok_or_else(|| AsmErrKind::UndefinedSymbol(format!("={constant}")))
    }

    /// The literals placed within the given address range, in address order.
    pub fn pool(&self, range: Range<u32>) -> Vec<&Literal> {
        let mut pool: Vec<_> = self.literals.iter()
            .filter(|l| l.address.is_some_and(|a| range.contains(&a)))
            .collect();
        pool.sort_by_key(|l| l.address);
        pool
    }

    /// Iterates over the literals in the order they were first used.
    pub fn iter(&self) -> impl Iterator<Item=&Literal> + '_ {
        self.literals.iter()
    }
}

/// The result of evaluating an [`Expr`].
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Value {
    /// The value, with external symbols counted as 0.
    pub value: i64,
    /// The net number of relative terms (`+LABEL` counts 1, `-LABEL` counts -1).
    pub relative: i32,
    /// The external symbols used, with their signs.
    pub externals: Vec<(Sign, String)>,
}

/// Evaluates an expression left to right.
///
/// `locctr` is the value of `*`.
pub fn eval(expr: &Expr, locctr: u32, symbols: &SymbolTable) -> Result<Value, AsmErrKind> {
    let mut out = Value::default();

    for (sign, term) in &expr.0 {
        let (value, relative) = match term {
            Term::Number(n) => (i64::from(*n), 0),
            Term::Star      => (i64::from(locctr), 1),
            Term::Symbol(s) => match symbols.get(s) {
                Some(SymbolValue::Relative(a)) => (i64::from(a), 1),
                Some(SymbolValue::Absolute(a)) => (i64::from(a), 0),
                Some(SymbolValue::External) => {
                    out.externals.push((*sign, s.clone()));
                    (0, 0)
                },
                None => return Err(AsmErrKind::UndefinedSymbol(s.clone())),
            },
        };
        out.value += sign.apply(value);
        out.relative += match sign {
            Sign::Plus  => relative,
            Sign::Minus => -relative,
        };
    }

    Ok(out)
}

fn to_word(value: i64) -> u32 {
    (value & 0xFF_FFFF) as u32
}

/// The bytes and fixups that a single line assembles to.
#[derive(Debug, Default)]
struct Encoded {
    /// Blocks of bytes. Most lines have one, literal pools have one per literal.
    blocks: Vec<Vec<u8>>,
    mods: Vec<Modification>,
}

/// A control section: an independently assembled unit of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSection {
    /// The name of the section (the label of its `START` or `CSECT`).
    pub name: String,
    /// The address the section starts at.
    pub start: u32,
    /// The length of the section in bytes.
    pub length: u32,
    /// The section's lines.
    pub tokens: Vec<Token>,
    /// The section's symbols.
    pub symbols: SymbolTable,
    /// The section's literals.
    pub literals: LiteralTable,
    /// The operand of the section's `END`, if any.
    pub entry: Option<String>,
}

impl ControlSection {
    /// Runs pass 1 over the lines of a single control section.
    ///
    /// Each line is paired with its 0-indexed line number in the source.
    /// The last line should be an `END`.
    ///
    /// ## Example
    /// ```
    /// use sicxe_ensemble::asm::{ControlSection, SymbolValue};
    /// use sicxe_ensemble::ast::InstrTable;
    ///
    /// let lines = [
    ///     (0usize, "COPY     START   1000"),
    ///     (1, "LOOP     STA     BUFFER"),
    ///     (2, "         RESB    77"),
    ///     (3, "BUFFER   RESB    1"),
    ///     (4, "         END     LOOP"),
    /// ];
    /// let sect = ControlSection::new(&lines, &InstrTable::sicxe()).unwrap();
    /// assert_eq!(sect.symbols.get("BUFFER"), Some(SymbolValue::Relative(0x1050)));
    /// assert_eq!(sect.generate(&sect.tokens[1]).unwrap(), "0F204D");
    /// ```
    pub fn new(lines: &[(usize, &str)], table: &InstrTable) -> Result<Self, AsmErr> {
        #[derive(Default)]
        struct Pass1 {
            locctr: u32,
            name: Option<String>,
            start: Option<u32>,
            tokens: Vec<Token>,
            symbols: SymbolTable,
            literals: LiteralTable,
            entry: Option<String>,
            end: Option<(u32, u32)>,
        }
        impl Pass1 {
            fn push(&mut self, mut token: Token) -> Result<(), AsmErrKind> {
                if token.is_comment() {
                    self.tokens.push(token);
                    return Ok(());
                }

                let directive = token.directive();
                if let (None, Some(Directive::START | Directive::CSECT)) = (&self.name, directive) {
                    self.name.clone_from(&token.label);
                }
                self.start.get_or_insert(token.locctr);

                if let Some(label) = &token.label {
                    match (directive, token.operand()) {
                        (Some(Directive::EQU), Some(Operand::Expr(e))) => {
                            let v = eval(e, token.locctr, &self.symbols)?;
                            if let Some((_, name)) = v.externals.first() {
                                return Err(AsmErrKind::ExternalInExpression(name.clone()));
                            }
                            let value = match v.relative {
                                1 => SymbolValue::Relative(to_word(v.value)),
                                _ => SymbolValue::Absolute(to_word(v.value)),
                            };
                            self.symbols.put(label, value);
                        },
                        _ => { self.symbols.put_label(label, token.locctr); }
                    }
                }

                for op in &token.operands {
                    match (directive, op) {
                        (Some(Directive::EXTREF), Operand::Expr(e)) => if let Some(name) = e.as_symbol() {
                            self.symbols.put_refer(name);
                        },
                        (_, Operand::Literal(c)) => self.literals.put(c),
                        _ => {}
                    }
                }

                if let Some(Directive::LTORG | Directive::END) = directive {
                    let pool = self.literals.assign_addresses(token.locctr);
                    token.next_locctr = advance_locctr(token.next_locctr, pool)?;
                    tracing::trace!(line = token.span.line, addr = token.locctr, size = pool, "placed literal pool");
                }
                if let Some(Directive::END) = directive {
                    if let Some(name) = token.operand().and_then(Operand::expr).and_then(Expr::as_symbol) {
                        self.entry = Some(name.to_string());
                    }
                    self.end.get_or_insert((token.locctr, token.next_locctr));
                }

                self.locctr = token.next_locctr;
                self.tokens.push(token);
                Ok(())
            }
        }

        tracing::trace!(first_line = ?lines.first().map(|&(i, _)| i + 1), "starting pass 1");
        let pass1 = lines.iter().try_fold(Pass1::default(), |mut state, &(index, text)| {
            let token = parse_line(index, text, table, state.locctr)
                .map_err(|e| AsmErr::new(e, ErrSpan::new(index, text)))?;
            state.push(token)
                .map_err(|e| AsmErr::new(e, ErrSpan::new(index, text)))?;
            Ok::<_, AsmErr>(state)
        })?;

        let Some((end_locctr, _)) = pass1.end else {
            let span = lines.last().map_or_else(|| ErrSpan::new(0, ""), |&(i, text)| ErrSpan::new(i, text));
            return Err(AsmErr::new(AsmErrKind::MissingEnd, span));
        };

        let start = pass1.start.unwrap_or(0);
        // The literal pool placed at the end (if any) is part of the section.
        let end_pool: u32 = pass1.literals.pool(end_locctr..u32::MAX).iter()
            .map(|l| l.constant.bytes.len() as u32)
            .sum();
        let length = end_locctr.saturating_sub(start) + end_pool;

        let sect = ControlSection {
            name: pass1.name.unwrap_or_default(),
            start,
            length,
            tokens: pass1.tokens,
            symbols: pass1.symbols,
            literals: pass1.literals,
            entry: pass1.entry,
        };
        tracing::debug!(name = %sect.name, start = sect.start, length = sect.length, symbols = sect.symbols.len(), "finished pass 1");

        Ok(sect)
    }

    /// Generates the object code of a line as a hex string.
    ///
    /// This is empty for lines which do not emit code (e.g., `RESB` or a comment).
    pub fn generate(&self, token: &Token) -> Result<String, AsmErr> {
        let encoded = self.encode(token, AsmFlags::default())
            .map_err(|e| AsmErr::new(e, token.span.clone()))?;

        Ok(encoded.blocks.iter()
            .flatten()
            .map(|b| format!("{b:02X}"))
            .collect())
    }

    /// Runs pass 2, creating the object records of this section.
    ///
    /// `end` is the address for the `E` record, which only the first section of a program has.
    pub fn object_code(&self, flags: AsmFlags, end: Option<u32>) -> Result<ObjectSection, AsmErr> {
        let mut sect = ObjectSection::new(&self.name, self.start, self.length);
        sect.end = end;

        let mut current: Option<TextRecord> = None;
        for token in self.tokens.iter().filter(|t| !t.is_comment()) {
            let err = |kind| AsmErr::new(kind, token.span.clone());
            let names = || token.operands.iter()
                .filter_map(Operand::expr)
                .filter_map(Expr::as_symbol);

            match token.directive() {
                Some(Directive::EXTDEF) => for name in names() {
                    let addr = self.symbols.address(name).map_err(err)?;
                    sect.define.push((name.to_string(), addr));
                },
                Some(Directive::EXTREF) => sect.refer.extend(names().map(str::to_string)),
                _ => {}
            }

            let encoded = self.encode(token, flags).map_err(err)?;
            sect.modifications.extend(encoded.mods);

            // A line without code breaks the text record.
            if encoded.blocks.iter().all(Vec::is_empty) {
                sect.text.extend(current.take());
                continue;
            }

            let mut addr = token.locctr;
            for chunk in encoded.blocks.iter().flat_map(|b| b.chunks(MAX_TEXT_LEN)) {
                let fits = current.as_ref()
                    .is_some_and(|r| r.end() == addr && r.bytes.len() + chunk.len() <= MAX_TEXT_LEN);
                if !fits {
                    sect.text.extend(current.take());
                }
                current.get_or_insert_with(|| TextRecord { start: addr, bytes: vec![] })
                    .bytes
                    .extend_from_slice(chunk);
                addr += chunk.len() as u32;
            }
        }
        sect.text.extend(current.take());

        Ok(sect)
    }

    /// The value of a format 3/4 instruction's operand.
    fn target(&self, token: &Token) -> Result<Value, AsmErrKind> {
        match token.operands.first() {
            // RSUB
            None => Ok(Value::default()),
            Some(Operand::Literal(c)) => Ok(Value {
                value: i64::from(self.literals.address(c)?),
                relative: 1,
                externals: vec![],
            }),
            Some(Operand::Expr(e)) => eval(e, token.locctr, &self.symbols),
            Some(Operand::Const(_)) => Err(SyntaxErr::BadExpression.into()),
        }
    }

    /// Creates the modification records for a field holding `target`,
    /// returning the value to assemble into the field.
    fn relocate(&self, target: &Value, addr: u32, half_bytes: u8, flags: AsmFlags) -> (i64, Vec<Modification>) {
        let mut mods: Vec<_> = target.externals.iter()
            .map(|(sign, name)| Modification { addr, half_bytes, sign: *sign, symbol: name.clone() })
            .collect();

        let mut value = target.value;
        if flags.emit_local_relocations && target.relative != 0 {
            let sign = match target.relative > 0 {
                true  => Sign::Plus,
                false => Sign::Minus,
            };
            for _ in 0..target.relative.unsigned_abs() {
                mods.push(Modification { addr, half_bytes, sign, symbol: self.name.clone() });
            }
            // The loader adds the section's load address back in.
            value -= i64::from(target.relative) * i64::from(self.start);
        }

        (value, mods)
    }

    fn encode(&self, token: &Token, flags: AsmFlags) -> Result<Encoded, AsmErrKind> {
        let Some(operator) = &token.operator else {
            return Ok(Encoded::default());
        };

        match operator {
            Operator::Format2(info) => {
                let (r1, r2) = token.register_fields()?;
                Ok(Encoded { blocks: vec![vec![info.opcode, (r1 << 4) | r2]], mods: vec![] })
            },
            Operator::Format3(info) => self.encode_format3(token, info),
            Operator::Format4(info) => {
                let target = self.target(token)?;
                let (value, mods) = self.relocate(&target, token.locctr + 1, 5, flags);
                let field = (value & 0xF_FFFF) as u32;
                let bits = token.nixbpe.bits();

                let bytes = vec![
                    info.opcode | (bits >> 4),
                    ((bits & 0xF) << 4) | ((field >> 16) as u8 & 0xF),
                    (field >> 8) as u8,
                    field as u8,
                ];
                Ok(Encoded { blocks: vec![bytes], mods })
            },
            Operator::Directive(d) if !d.emits_code() => Ok(Encoded::default()),
            Operator::Directive(Directive::BYTE) => match token.operand() {
                Some(Operand::Const(c)) => Ok(Encoded { blocks: vec![c.bytes.clone()], mods: vec![] }),
                _ => Err(SyntaxErr::ExpectedConstant.into()),
            },
            Operator::Directive(Directive::WORD) => {
                let expr = token.operand()
                    .and_then(Operand::expr)
                    .ok_or(SyntaxErr::BadExpression)?;
                let target = eval(expr, token.locctr, &self.symbols)?;
                let (value, mods) = self.relocate(&target, token.locctr, 6, flags);

                let [_, hi, mid, lo] = to_word(value).to_be_bytes();
                Ok(Encoded { blocks: vec![vec![hi, mid, lo]], mods })
            },
            // LTORG and END place the literal pool.
            Operator::Directive(_) => {
                let blocks = self.literals.pool(token.locctr..token.next_locctr)
                    .into_iter()
                    .map(|l| l.constant.bytes.clone())
                    .collect();
                Ok(Encoded { blocks, mods: vec![] })
            },
        }
    }

    fn encode_format3(&self, token: &Token, info: &InstrInfo) -> Result<Encoded, AsmErrKind> {
        let target = self.target(token)?;
        if let Some((_, name)) = target.externals.first() {
            return Err(AsmErrKind::ExternalNotExtended(name.clone()));
        }

        // An immediate operand that doesn't move with the section (e.g., an absolute EQU)
        // is its own value, not a displacement.
        let mut flags = token.nixbpe;
        if flags.is_immediate() && target.relative == 0 {
            flags = flags.without(Nixbpe::P);
        }

        let field = match flags.p() {
            true => {
                let disp = target.value - i64::from(token.next_locctr);
                if !(-2048..=2047).contains(&disp) {
                    return Err(AsmErrKind::DisplacementOutOfRange(disp));
                }
                (disp & 0xFFF) as u32
            },
            false => {
                if !(0..=0xFFF).contains(&target.value) {
                    return Err(AsmErrKind::DisplacementOutOfRange(target.value));
                }
                target.value as u32
            }
        };

        let bits = flags.bits();
        let bytes = vec![
            info.opcode | (bits >> 4),
            ((bits & 0xF) << 4) | ((field >> 8) as u8 & 0xF),
            field as u8,
        ];
        Ok(Encoded { blocks: vec![bytes], mods: vec![] })
    }
}
