//! Parsing SIC/XE source lines.
//!
//! The tokenizer works one line at a time. [`parse_line`] splits a source line into its
//! label, operator, operand, and comment fields and produces a [`Token`].
//!
//! A line is laid out as `[label] operator operand[,operand] [comment]`:
//! ```text
//! COPY     START   0
//! FIRST    STL     RETADR        save return address
//!          +JSUB   RDREC
//!          LDA     =C'EOF'
//! .        full-line comment
//! ```
//!
//! The location counter is threaded through explicitly: each token records the counter
//! at its line and the counter of the line after it ([`Token::next_locctr`]),
//! which is the cursor for the next call to [`parse_line`].

pub mod lex;

use logos::Logos;

use crate::asm::AsmErrKind;
use crate::ast::{Directive, Format, InstrInfo, InstrTable, Nixbpe, Reg, Sign};
use crate::err::{ErrSpan, LexErr};
use lex::Lexeme;

/// Maximum length of a name that appears in `H`, `D`, and `R` records.
pub const MAX_NAME_LEN: usize = 6;

/// Kinds of syntax errors that can occur while tokenizing a line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SyntaxErr {
    /// The line was blank.
    EmptyLine,
    /// The line had a label but no operator.
    MissingOperator,
    /// The operator is not a directive or a known instruction.
    UnknownOperator(String),
    /// The operand field could not be tokenized.
    Lex(LexErr),
    /// A `=` was not followed by a `C'...'` or `X'...'` constant.
    MalformedLiteral,
    /// An operand was not a valid `+`/`-` chain of symbols, numbers, and `*`.
    BadExpression,
    /// There was an empty operand (e.g., `A,,B`).
    ExpectedOperand,
    /// An operand was expected to be a number.
    ExpectedNumber,
    /// An operand was expected to be a symbol.
    ExpectedSymbol,
    /// An operand was expected to be a constant (e.g., `C'EOF'`).
    ExpectedConstant,
    /// An addressing sigil (`@`, `#`) was used where it is not allowed.
    UnexpectedSigil,
    /// A format 2 operand was not a register (or a small number).
    BadRegister(String),
    /// The wrong number of operands was provided.
    OperandCount {
        /// The number of operands expected.
        expected: u8,
        /// The number of operands provided.
        found: usize
    },
    /// The `START` operand was not a hex address.
    BadStartAddress,
    /// A directive that defines a name (`CSECT`, `EQU`) had no label.
    MissingLabel,
    /// A name which appears in object records is longer than 6 characters.
    NameTooLong(String),
    /// A label was also the name of an instruction or directive (e.g., `SUB      RSUB`).
    ReservedLabel(String),
}
impl std::fmt::Display for SyntaxErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyntaxErr::EmptyLine         => f.write_str("line is empty"),
            SyntaxErr::MissingOperator   => f.write_str("line is missing an operator"),
            SyntaxErr::UnknownOperator(op) => write!(f, "unknown operator {op}"),
            SyntaxErr::Lex(e)            => e.fmt(f),
            SyntaxErr::MalformedLiteral  => f.write_str("malformed literal"),
            SyntaxErr::BadExpression     => f.write_str("malformed expression"),
            SyntaxErr::ExpectedOperand   => f.write_str("expected operand"),
            SyntaxErr::ExpectedNumber    => f.write_str("expected number"),
            SyntaxErr::ExpectedSymbol    => f.write_str("expected symbol"),
            SyntaxErr::ExpectedConstant  => f.write_str("expected constant"),
            SyntaxErr::UnexpectedSigil   => f.write_str("addressing mode is not allowed here"),
            SyntaxErr::BadRegister(r)    => write!(f, "invalid register {r}"),
            SyntaxErr::OperandCount { expected, found } => write!(f, "expected {expected} operand(s), found {found}"),
            SyntaxErr::BadStartAddress   => f.write_str("invalid start address"),
            SyntaxErr::MissingLabel      => f.write_str("directive requires a label"),
            SyntaxErr::NameTooLong(name) => write!(f, "name {name} is longer than {MAX_NAME_LEN} characters"),
            SyntaxErr::ReservedLabel(name) => write!(f, "{name} is an operator and cannot be a label"),
        }
    }
}
impl std::error::Error for SyntaxErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyntaxErr::Lex(e) => Some(e),
            _ => None
        }
    }
}
impl crate::err::Error for SyntaxErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            SyntaxErr::EmptyLine          => Some("blank lines should be removed before tokenizing".into()),
            SyntaxErr::MissingOperator    => Some("add an instruction or directive after the label".into()),
            SyntaxErr::UnknownOperator(_) => Some("operators are case-sensitive; check the spelling against the instruction table".into()),
            SyntaxErr::Lex(e)             => crate::err::Error::help(e),
            SyntaxErr::MalformedLiteral   => Some("a literal looks like =C'EOF' or =X'05'".into()),
            SyntaxErr::BadExpression      => Some("expressions are symbols, numbers, or * joined by + and -".into()),
            SyntaxErr::ExpectedOperand    => Some("remove the extra comma".into()),
            SyntaxErr::ExpectedNumber     => Some("this directive takes a decimal number".into()),
            SyntaxErr::ExpectedSymbol     => Some("this directive takes a list of names".into()),
            SyntaxErr::ExpectedConstant   => Some("BYTE takes a constant such as C'EOF' or X'F1'".into()),
            SyntaxErr::UnexpectedSigil    => Some("@ and # can only prefix the operand of a format 3/4 instruction".into()),
            SyntaxErr::BadRegister(_)     => Some("registers are A, X, L, B, S, T, F".into()),
            SyntaxErr::OperandCount { .. } => None,
            SyntaxErr::BadStartAddress    => Some("the START operand is a hex address, such as 1000".into()),
            SyntaxErr::MissingLabel       => Some("add a name before this directive".into()),
            SyntaxErr::NameTooLong(_)     => Some(format!("object records hold names of at most {MAX_NAME_LEN} characters").into()),
            SyntaxErr::ReservedLabel(_)   => Some("rename the label so it is not an instruction or directive name".into()),
        }
    }
}
impl From<LexErr> for SyntaxErr {
    fn from(value: LexErr) -> Self {
        SyntaxErr::Lex(value)
    }
}

/// The operator of a line, disambiguated by its kind.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Operator {
    /// A format 2 (register) instruction.
    Format2(InstrInfo),
    /// A format 3 instruction.
    Format3(InstrInfo),
    /// A format 4 (`+`-extended) instruction.
    Format4(InstrInfo),
    /// An assembler directive.
    Directive(Directive),
}
impl Operator {
    /// The instruction metadata, if this is an instruction.
    pub fn instr(&self) -> Option<&InstrInfo> {
        match self {
            Operator::Format2(info) | Operator::Format3(info) | Operator::Format4(info) => Some(info),
            Operator::Directive(_) => None,
        }
    }

    /// The directive, if this is a directive.
    pub fn directive(&self) -> Option<Directive> {
        match self {
            Operator::Directive(d) => Some(*d),
            _ => None,
        }
    }
}
impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Format2(info) | Operator::Format3(info) => f.write_str(&info.mnemonic),
            Operator::Format4(info) => write!(f, "+{}", info.mnemonic),
            Operator::Directive(d)  => d.fmt(f),
        }
    }
}

/// A term of an [`Expr`].
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Term {
    /// A symbol (label, `EQU` name, or external reference).
    Symbol(String),
    /// A decimal number.
    Number(u32),
    /// The location counter of the current line.
    Star,
}

/// An operand expression: a left-to-right chain of terms joined by `+` and `-`.
///
/// There is no precedence and there are no parentheses.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Expr(pub Vec<(Sign, Term)>);
impl Expr {
    /// The value of this expression if it is a single unsigned number.
    pub fn as_number(&self) -> Option<u32> {
        match self.0.as_slice() {
            [(Sign::Plus, Term::Number(n))] => Some(*n),
            _ => None,
        }
    }

    /// The name of this expression if it is a single unsigned symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match self.0.as_slice() {
            [(Sign::Plus, Term::Symbol(s))] => Some(s),
            _ => None,
        }
    }

    /// Whether this expression only consists of numbers.
    pub fn is_constant(&self) -> bool {
        self.0.iter().all(|(_, t)| matches!(t, Term::Number(_)))
    }

    fn parse(lexemes: &[Lexeme]) -> Result<Self, SyntaxErr> {
        let mut terms = vec![];
        let mut sign = None;

        for lexeme in lexemes {
            let term = match lexeme {
                Lexeme::Plus | Lexeme::Minus => {
                    // Two operators in a row is malformed.
                    if sign.is_some() { return Err(SyntaxErr::BadExpression); }
                    sign = Some(match lexeme {
                        Lexeme::Plus => Sign::Plus,
                        _ => Sign::Minus,
                    });
                    continue;
                },
                Lexeme::Symbol(s) => Term::Symbol(s.clone()),
                Lexeme::Number(n) => Term::Number(*n),
                Lexeme::Star      => Term::Star,
                _ => return Err(SyntaxErr::BadExpression),
            };

            // Every term after the first needs an operator before it.
            let sign = match (sign.take(), terms.is_empty()) {
                (Some(s), _) => s,
                (None, true) => Sign::Plus,
                (None, false) => return Err(SyntaxErr::BadExpression),
            };
            terms.push((sign, term));
        }

        match sign.is_none() && !terms.is_empty() {
            true  => Ok(Expr(terms)),
            false => Err(SyntaxErr::BadExpression),
        }
    }
}
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sign, term)) in self.0.iter().enumerate() {
            if i != 0 || *sign == Sign::Minus {
                sign.fmt(f)?;
            }
            match term {
                Term::Symbol(s) => f.write_str(s)?,
                Term::Number(n) => write!(f, "{n}")?,
                Term::Star      => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

/// The kind of a constant.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ConstKind {
    /// `C'...'`
    Char,
    /// `X'...'`
    Hex,
}

/// A `C'...'` or `X'...'` constant (as a `BYTE` operand or as a literal).
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Constant {
    /// Which kind of constant this is.
    pub kind: ConstKind,
    /// The bytes this constant encodes to.
    pub bytes: Vec<u8>,
}
impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConstKind::Char => write!(f, "C'{}'", String::from_utf8_lossy(&self.bytes)),
            ConstKind::Hex  => {
                f.write_str("X'")?;
                self.bytes.iter().try_for_each(|b| write!(f, "{b:02X}"))?;
                f.write_str("'")
            },
        }
    }
}

/// A single operand of a line.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Operand {
    /// An expression (a symbol, a number, or a chain of them).
    Expr(Expr),
    /// A literal (e.g., `=C'EOF'`).
    Literal(Constant),
    /// A constant (e.g., `X'F1'`).
    Const(Constant),
}
impl Operand {
    /// The expression, if this operand is one.
    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Operand::Expr(e) => Some(e),
            _ => None,
        }
    }
}
impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Expr(e)    => e.fmt(f),
            Operand::Literal(c) => write!(f, "={c}"),
            Operand::Const(c)   => c.fmt(f),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Sigil {
    None,
    Indirect,
    Immediate,
}

/// One source line's parsed form.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Token {
    /// The label, if there is one.
    pub label: Option<String>,
    /// The operator. This is `None` for comment lines.
    pub operator: Option<Operator>,
    /// The operands, with addressing sigils and the index register stripped away.
    pub operands: Vec<Operand>,
    /// The comment, if there is one.
    pub comment: Option<String>,
    /// The addressing flags of a format 3/4 instruction (zero otherwise).
    pub nixbpe: Nixbpe,
    /// The location counter at this line.
    pub locctr: u32,
    /// The location counter of the next line.
    pub next_locctr: u32,
    /// The source line this token was parsed from.
    pub span: ErrSpan,
}
impl Token {
    /// Whether this token is a full-line comment.
    pub fn is_comment(&self) -> bool {
        self.operator.is_none()
    }

    /// The directive of this line, if it has one.
    pub fn directive(&self) -> Option<Directive> {
        self.operator.as_ref().and_then(Operator::directive)
    }

    /// The number of bytes this line occupies.
    pub fn byte_len(&self) -> u32 {
        self.next_locctr - self.locctr
    }

    /// The single operand of this line, if it has exactly one.
    pub fn operand(&self) -> Option<&Operand> {
        match self.operands.as_slice() {
            [op] => Some(op),
            _ => None,
        }
    }

    /// Computes the two register nibbles of a format 2 instruction.
    ///
    /// A single operand leaves the second nibble zero.
    /// `SHIFTL` and `SHIFTR` encode their count operand as `n - 1`.
    pub fn register_fields(&self) -> Result<(u8, u8), SyntaxErr> {
        let Some(Operator::Format2(info)) = &self.operator else {
            return Ok((0, 0));
        };
        register_fields(info, &self.operands)
    }
}
impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(operator) = &self.operator else {
            return write!(f, ".{}", self.comment.as_deref().unwrap_or(""));
        };
        write!(f, "{:<8} ", self.label.as_deref().unwrap_or(""))?;

        let sigil = match (self.nixbpe.is_indirect(), self.nixbpe.is_immediate()) {
            (true, _) => "@",
            (_, true) => "#",
            _ => "",
        };
        let mut operands = self.operands.iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>();
        if self.nixbpe.x() {
            operands.push(String::from("X"));
        }
        write!(f, "{:<8} {sigil}{}", operator.to_string(), operands.join(","))
    }
}

fn register_fields(info: &InstrInfo, operands: &[Operand]) -> Result<(u8, u8), SyntaxErr> {
    let shift = matches!(&*info.mnemonic, "SHIFTL" | "SHIFTR");
    let mut nibbles = [0u8; 2];

    for (i, op) in operands.iter().enumerate().take(2) {
        let expr = op.expr().ok_or_else(|| SyntaxErr::BadRegister(op.to_string()))?;
        let value = match (expr.as_symbol(), expr.as_number()) {
            (Some(name), _) => name.parse::<Reg>()
                .map(Reg::reg_no)
                .map_err(|_| SyntaxErr::BadRegister(name.to_string()))?,
            (_, Some(n)) if shift && i == 1 => n.checked_sub(1)
                .and_then(|n| u8::try_from(n).ok())
                .filter(|&n| n < 16)
                .ok_or_else(|| SyntaxErr::BadRegister(n.to_string()))?,
            (_, Some(n)) => u8::try_from(n).ok()
                .filter(|&n| n < 16)
                .ok_or_else(|| SyntaxErr::BadRegister(n.to_string()))?,
            _ => return Err(SyntaxErr::BadRegister(expr.to_string())),
        };
        nibbles[i] = value;
    }

    Ok((nibbles[0], nibbles[1]))
}

/// Splits off the next whitespace-delimited field.
///
/// Whitespace inside quotes (e.g., `C'A B'`) does not end a field.
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() { return None; }

    let mut quoted = false;
    let end = s.char_indices()
        .find(|&(_, c)| {
            if c == '\'' { quoted = !quoted; }
            !quoted && c.is_whitespace()
        })
        .map_or(s.len(), |(i, _)| i);

    Some((&s[..end], &s[end..]))
}

/// One past the last address of SIC/XE memory.
pub const LOCCTR_LIMIT: u32 = 0x10_0000;

/// Moves the location counter past `len` bytes.
///
/// This fails if the result would leave memory,
/// since object records could not hold the address.
pub fn advance_locctr(locctr: u32, len: u32) -> Result<u32, AsmErrKind> {
    locctr.checked_add(len)
        .filter(|&next| next <= LOCCTR_LIMIT)
        .ok_or(AsmErrKind::AddressOutOfRange(u64::from(locctr) + u64::from(len)))
}

pub(crate) fn is_operator(field: &str, table: &InstrTable) -> bool {
    let name = field.strip_prefix('+').unwrap_or(field);
    name.parse::<Directive>().is_ok() || table.lookup(name).is_some()
}

fn parse_operator(field: &str, table: &InstrTable) -> Result<Operator, AsmErrKind> {
    let (extended, name) = match field.strip_prefix('+') {
        Some(name) => (true, name),
        None => (false, field),
    };

    if let Ok(d) = name.parse::<Directive>() {
        return match extended {
            true  => Err(SyntaxErr::UnknownOperator(field.to_string()).into()),
            false => Ok(Operator::Directive(d)),
        };
    }

    let info = table.lookup(name)
        .ok_or_else(|| SyntaxErr::UnknownOperator(field.to_string()))?;
    match (info.format, extended) {
        (Format::One, _) | (Format::Two, true) => Err(AsmErrKind::UnsupportedFormat),
        (Format::Two, false)   => Ok(Operator::Format2(info.clone())),
        (Format::Three, false) => Ok(Operator::Format3(info.clone())),
        (Format::Three, true)  => Ok(Operator::Format4(info.clone())),
    }
}

/// Whether the field after this operator is an operand field (as opposed to a comment).
fn takes_operand_field(op: &Operator) -> bool {
    match op.instr() {
        Some(info) => info.operands > 0,
        None => op.directive().is_some_and(|d| !d.takes_no_operand()),
    }
}

/// Splits an operand field into operands, returning the sigil of the first operand.
fn parse_operands(field: &str) -> Result<(Vec<Operand>, Sigil), SyntaxErr> {
    let lexemes = Lexeme::lexer(field).collect::<Result<Vec<_>, _>>()?;
    let mut sigil = Sigil::None;
    let mut operands = vec![];

    for (i, group) in lexemes.split(|l| *l == Lexeme::Comma).enumerate() {
        let group = match group {
            [Lexeme::At, rest @ ..] if i == 0   => { sigil = Sigil::Indirect; rest },
            [Lexeme::Hash, rest @ ..] if i == 0 => { sigil = Sigil::Immediate; rest },
            [Lexeme::At | Lexeme::Hash, ..]     => return Err(SyntaxErr::UnexpectedSigil),
            g => g,
        };

        let operand = match group {
            [] => return Err(SyntaxErr::ExpectedOperand),
            [Lexeme::Equals, Lexeme::CharConst(b)] => Operand::Literal(Constant { kind: ConstKind::Char, bytes: b.clone() }),
            [Lexeme::Equals, Lexeme::HexConst(b)]  => Operand::Literal(Constant { kind: ConstKind::Hex, bytes: b.clone() }),
            [Lexeme::Equals, ..] => return Err(SyntaxErr::MalformedLiteral),
            [Lexeme::CharConst(b)] => Operand::Const(Constant { kind: ConstKind::Char, bytes: b.clone() }),
            [Lexeme::HexConst(b)]  => Operand::Const(Constant { kind: ConstKind::Hex, bytes: b.clone() }),
            g => Operand::Expr(Expr::parse(g)?),
        };
        operands.push(operand);
    }

    Ok((operands, sigil))
}

fn check_count(operands: &[Operand], expected: u8) -> Result<(), SyntaxErr> {
    match operands.len() == usize::from(expected) {
        true  => Ok(()),
        false => Err(SyntaxErr::OperandCount { expected, found: operands.len() }),
    }
}

fn check_name(name: &str) -> Result<(), SyntaxErr> {
    match name.len() <= MAX_NAME_LEN {
        true  => Ok(()),
        false => Err(SyntaxErr::NameTooLong(name.to_string())),
    }
}

/// Parses one source line into a [`Token`].
///
/// `index` is the 0-indexed line number (used for error reporting),
/// and `locctr` is the location counter at this line.
/// The location counter of the following line is [`Token::next_locctr`].
///
/// The length of an `LTORG` or `END` line is the size of the literal pool it flushes,
/// which the tokenizer cannot know. These lines are given length 0 here
/// and are extended by the assembler's first pass.
///
/// # Example
/// ```
/// use sicxe_ensemble::ast::InstrTable;
/// use sicxe_ensemble::parse::parse_line;
///
/// let table = InstrTable::sicxe();
/// let token = parse_line(0, "CLOOP    +JSUB   RDREC", &table, 0x0006).unwrap();
/// assert_eq!(token.label.as_deref(), Some("CLOOP"));
/// assert_eq!(token.locctr, 0x0006);
/// assert_eq!(token.next_locctr, 0x000A);
/// assert_eq!(token.nixbpe.bits(), 0x31);
/// ```
pub fn parse_line(index: usize, text: &str, table: &InstrTable, locctr: u32) -> Result<Token, AsmErrKind> {
    let span = ErrSpan::new(index, text);
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return Err(SyntaxErr::EmptyLine.into());
    }
    if let Some(comment) = trimmed.strip_prefix('.') {
        return Ok(Token {
            label: None,
            operator: None,
            operands: vec![],
            comment: Some(comment.trim().to_string()),
            nixbpe: Nixbpe::default(),
            locctr,
            next_locctr: locctr,
            span,
        });
    }

    // A line that starts with whitespace has no label.
    let labeled = !text.starts_with(char::is_whitespace);
    let (first, rest) = next_field(text).ok_or(SyntaxErr::EmptyLine)?;
    let (label, op_field, rest) = match labeled && !is_operator(first, table) {
        true => {
            let (op, rest) = next_field(rest).ok_or(SyntaxErr::MissingOperator)?;
            (Some(first.to_string()), op, rest)
        },
        false => {
            // `SUB      RSUB` would otherwise silently assemble as `SUB` with a `RSUB` operand.
            if labeled && next_field(rest).is_some_and(|(f, _)| is_operator(f, table)) {
                return Err(SyntaxErr::ReservedLabel(first.to_string()).into());
            }
            (None, first, rest)
        },
    };
    let operator = parse_operator(op_field, table)?;

    let (operand_field, rest) = match takes_operand_field(&operator) {
        true  => next_field(rest).map_or(("", rest), |(f, r)| (f, r)),
        false => ("", rest),
    };
    let comment = Some(rest.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    // The START operand is hex, which the operand lexer does not read.
    let hex_operand = operator == Operator::Directive(Directive::START);
    let (mut operands, sigil) = match operand_field.is_empty() || hex_operand {
        true  => (vec![], Sigil::None),
        false => parse_operands(operand_field)?,
    };

    let mut nixbpe = Nixbpe::default();
    let mut locctr = locctr;
    let len = match &operator {
        Operator::Format2(info) => {
            if sigil != Sigil::None { return Err(SyntaxErr::UnexpectedSigil.into()); }
            check_count(&operands, info.operands)?;
            register_fields(info, &operands)?;
            info.format.byte_len()
        },
        Operator::Format3(info) | Operator::Format4(info) => {
            let extended = matches!(operator, Operator::Format4(_));

            // A trailing `X` operand marks indexed addressing.
            let indexed = operands.len() == 2 && operands[1].expr().and_then(Expr::as_symbol) == Some("X");
            if indexed {
                operands.pop();
            }
            check_count(&operands, info.operands)?;

            let relative = operands.first().and_then(Operand::expr).is_some_and(|e| !e.is_constant());
            let bits = match (sigil, info.operands, extended) {
                (_, 0, false)   => Nixbpe::N | Nixbpe::I,
                (_, 0, true)    => Nixbpe::N | Nixbpe::I | Nixbpe::E,
                (Sigil::None, _, false)      => Nixbpe::N | Nixbpe::I | Nixbpe::P,
                (Sigil::None, _, true)       => Nixbpe::N | Nixbpe::I | Nixbpe::E,
                (Sigil::Indirect, _, false)  => Nixbpe::N | Nixbpe::P,
                (Sigil::Indirect, _, true)   => Nixbpe::N | Nixbpe::E,
                // `#LABEL` is encoded PC-relative (i+p) rather than as a bare 12-bit address,
                // so labels above 0xFFF still work. Pass 2 drops p again for absolute values.
                (Sigil::Immediate, _, false) if relative => Nixbpe::I | Nixbpe::P,
                (Sigil::Immediate, _, false) => Nixbpe::I,
                (Sigil::Immediate, _, true)  => Nixbpe::I | Nixbpe::E,
            };
            if sigil != Sigil::None && matches!(operands.first(), Some(Operand::Literal(_))) {
                return Err(SyntaxErr::UnexpectedSigil.into());
            }
            if operands.iter().any(|op| matches!(op, Operand::Const(_))) {
                return Err(SyntaxErr::BadExpression.into());
            }

            nixbpe = Nixbpe::new(bits);
            if indexed {
                nixbpe = nixbpe.with(Nixbpe::X);
            }
            info.format.byte_len() + u32::from(extended)
        },
        Operator::Directive(d) => {
            if sigil != Sigil::None { return Err(SyntaxErr::UnexpectedSigil.into()); }
            parse_directive(*d, label.as_deref(), operand_field, &mut operands, &mut locctr)?
        }
    };

    Ok(Token {
        label,
        operator: Some(operator),
        operands,
        comment,
        nixbpe,
        locctr,
        next_locctr: advance_locctr(locctr, len)?,
        span,
    })
}

/// Validates the operands of a directive, returning the number of bytes it occupies.
///
/// `START` and `CSECT` also move the location counter.
fn parse_directive(
    d: Directive,
    label: Option<&str>,
    field: &str,
    operands: &mut Vec<Operand>,
    locctr: &mut u32
) -> Result<u32, SyntaxErr> {
    fn number(operands: &[Operand]) -> Result<u32, SyntaxErr> {
        check_count(operands, 1)?;
        operands[0].expr()
            .and_then(Expr::as_number)
            .ok_or(SyntaxErr::ExpectedNumber)
    }

    match d {
        Directive::START => {
            let start = u32::from_str_radix(field, 16).ok()
                .filter(|&a| a <= 0xF_FFFF)
                .ok_or(SyntaxErr::BadStartAddress)?;
            if let Some(l) = label { check_name(l)?; }
            *operands = vec![Operand::Expr(Expr(vec![(Sign::Plus, Term::Number(start))]))];
            *locctr = start;
            Ok(0)
        },
        Directive::CSECT => {
            check_name(label.ok_or(SyntaxErr::MissingLabel)?)?;
            *locctr = 0;
            Ok(0)
        },
        Directive::END => match operands.len() {
            0 => Ok(0),
            _ => {
                check_count(operands, 1)?;
                operands[0].expr().and_then(Expr::as_symbol).ok_or(SyntaxErr::ExpectedSymbol)?;
                Ok(0)
            }
        },
        Directive::EXTDEF | Directive::EXTREF => {
            if operands.is_empty() {
                return Err(SyntaxErr::ExpectedSymbol);
            }
            for op in operands.iter() {
                let name = op.expr().and_then(Expr::as_symbol).ok_or(SyntaxErr::ExpectedSymbol)?;
                check_name(name)?;
            }
            Ok(0)
        },
        Directive::LTORG => Ok(0),
        Directive::RESB => number(operands),
        // An oversized reservation saturates, then fails the location counter check.
        Directive::RESW => number(operands).map(|n| n.saturating_mul(3)),
        Directive::BYTE => {
            check_count(operands, 1)?;
            match &operands[0] {
                Operand::Const(c) => Ok(c.bytes.len() as u32),
                _ => Err(SyntaxErr::ExpectedConstant),
            }
        },
        Directive::WORD => {
            check_count(operands, 1)?;
            operands[0].expr().ok_or(SyntaxErr::BadExpression)?;
            Ok(3)
        },
        Directive::EQU => {
            label.ok_or(SyntaxErr::MissingLabel)?;
            check_count(operands, 1)?;
            operands[0].expr().ok_or(SyntaxErr::BadExpression)?;
            Ok(0)
        },
    }
}

#[cfg(test)]
mod tests {
    use crate::asm::AsmErrKind;
    use crate::ast::{Directive, InstrTable, Nixbpe, Sign};

    use super::{parse_line, ConstKind, Constant, Expr, Operand, Operator, SyntaxErr, Term, Token};

    fn parse(line: &str) -> Token {
        parse_line(0, line, &InstrTable::sicxe(), 0x1000).unwrap()
    }
    fn parse_err(line: &str) -> AsmErrKind {
        parse_line(0, line, &InstrTable::sicxe(), 0x1000).unwrap_err()
    }
    fn sym(s: &str) -> Operand {
        Operand::Expr(Expr(vec![(Sign::Plus, Term::Symbol(s.to_string()))]))
    }

    #[test]
    fn test_comment_line() {
        let token = parse(".  SUBROUTINE TO READ RECORD");
        assert!(token.is_comment());
        assert_eq!(token.comment.as_deref(), Some("SUBROUTINE TO READ RECORD"));
        assert_eq!(token.byte_len(), 0);

        let token = parse("    . indented comment");
        assert!(token.is_comment());
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(parse_err(""), AsmErrKind::Syntax(SyntaxErr::EmptyLine));
        assert_eq!(parse_err("   \t "), AsmErrKind::Syntax(SyntaxErr::EmptyLine));
    }

    #[test]
    fn test_label_recognition() {
        let token = parse("LOOP     STA     BUFFER");
        assert_eq!(token.label.as_deref(), Some("LOOP"));
        assert!(matches!(&token.operator, Some(Operator::Format3(i)) if i.mnemonic == "STA"));
        assert_eq!(token.operands, vec![sym("BUFFER")]);

        // First field is an operator, so there's no label
        let token = parse("STA BUFFER");
        assert_eq!(token.label, None);
        assert_eq!(token.operands, vec![sym("BUFFER")]);

        // Indented lines have no label
        let token = parse("         +JSUB   WRREC");
        assert_eq!(token.label, None);
        assert!(matches!(&token.operator, Some(Operator::Format4(i)) if i.mnemonic == "JSUB"));
    }

    #[test]
    fn test_comment_field() {
        let token = parse("FIRST    STL     RETADR       SAVE RETURN ADDRESS");
        assert_eq!(token.comment.as_deref(), Some("SAVE RETURN ADDRESS"));

        // No-operand operators take the next field as a comment
        let token = parse("         RSUB    RETURN TO CALLER");
        assert!(token.operands.is_empty());
        assert_eq!(token.comment.as_deref(), Some("RETURN TO CALLER"));

        let token = parse("         LTORG   pool here");
        assert!(token.operands.is_empty());
        assert_eq!(token.comment.as_deref(), Some("pool here"));
    }

    #[test]
    fn test_nixbpe() {
        assert_eq!(parse(" STA BUFFER").nixbpe.bits(), 0x32);
        assert_eq!(parse(" +JSUB RDREC").nixbpe.bits(), 0x31);
        assert_eq!(parse(" RSUB").nixbpe.bits(), 0x30);
        assert_eq!(parse(" J @RETADR").nixbpe.bits(), 0x22);
        assert_eq!(parse(" COMP #0").nixbpe.bits(), 0x10);
        assert_eq!(parse(" +LDT #4096").nixbpe.bits(), 0x11);
        assert_eq!(parse(" LDA #LENGTH").nixbpe.bits(), 0x12);
        assert_eq!(parse(" STCH BUFFER,X").nixbpe.bits(), 0x3A);
        assert_eq!(parse(" +STCH BUFFER,X").nixbpe.bits(), 0x39);

        let token = parse(" STCH BUFFER,X");
        assert!(token.nixbpe.x());
        assert_eq!(token.operands, vec![sym("BUFFER")]);
    }

    #[test]
    fn test_lengths() {
        assert_eq!(parse(" CLEAR X").byte_len(), 2);
        assert_eq!(parse(" LDA LENGTH").byte_len(), 3);
        assert_eq!(parse(" +LDA LENGTH").byte_len(), 4);
        assert_eq!(parse("BUFFER RESB 4096").byte_len(), 4096);
        assert_eq!(parse("LENGTH RESW 2").byte_len(), 6);
        assert_eq!(parse("EOF BYTE C'EOF'").byte_len(), 3);
        assert_eq!(parse("OUT BYTE X'05'").byte_len(), 1);
        assert_eq!(parse("ZERO WORD 0").byte_len(), 3);
        assert_eq!(parse(" LTORG").byte_len(), 0);
        assert_eq!(parse("MAXLEN EQU BUFEND-BUFFER").byte_len(), 0);
    }

    #[test]
    fn test_start_and_csect() {
        let token = parse("COPY START 1000");
        assert_eq!(token.locctr, 0x1000);
        assert_eq!(token.next_locctr, 0x1000);

        let token = parse_line(0, "COPY START 0", &InstrTable::sicxe(), 0x55).unwrap();
        assert_eq!(token.locctr, 0);
        assert_eq!(parse("COPY START 1A0").locctr, 0x1A0);

        let token = parse("RDREC CSECT");
        assert_eq!(token.directive(), Some(Directive::CSECT));
        assert_eq!((token.locctr, token.next_locctr), (0, 0));

        assert_eq!(parse_err("COPY START XYZ"), AsmErrKind::Syntax(SyntaxErr::BadStartAddress));
        assert_eq!(parse_err(" CSECT"), AsmErrKind::Syntax(SyntaxErr::MissingLabel));
        assert_eq!(parse_err("LONGNAME CSECT"), AsmErrKind::Syntax(SyntaxErr::NameTooLong("LONGNAME".into())));
    }

    #[test]
    fn test_operands() {
        let token = parse(" EXTREF BUFFER,LENGTH,BUFEND");
        assert_eq!(token.operands, vec![sym("BUFFER"), sym("LENGTH"), sym("BUFEND")]);

        let token = parse(" LDA =C'EOF'");
        assert_eq!(token.operands, vec![Operand::Literal(Constant { kind: ConstKind::Char, bytes: b"EOF".to_vec() })]);

        let token = parse("MAXLEN WORD BUFEND-BUFFER");
        assert_eq!(token.operands, vec![Operand::Expr(Expr(vec![
            (Sign::Plus, Term::Symbol("BUFEND".into())),
            (Sign::Minus, Term::Symbol("BUFFER".into())),
        ]))]);

        let token = parse("HERE EQU *");
        assert_eq!(token.operands, vec![Operand::Expr(Expr(vec![(Sign::Plus, Term::Star)]))]);

        let token = parse("NEG WORD -3");
        assert_eq!(token.operands, vec![Operand::Expr(Expr(vec![(Sign::Minus, Term::Number(3))]))]);
    }

    #[test]
    fn test_quoted_field() {
        let token = parse("MSG BYTE C'HI THERE' greeting");
        assert_eq!(token.byte_len(), 8);
        assert_eq!(token.comment.as_deref(), Some("greeting"));
    }

    #[test]
    fn test_register_fields() {
        assert_eq!(parse(" COMPR A,S").register_fields(), Ok((0, 4)));
        assert_eq!(parse(" TIXR T").register_fields(), Ok((5, 0)));
        assert_eq!(parse(" CLEAR X").register_fields(), Ok((1, 0)));
        assert_eq!(parse(" SHIFTL A,4").register_fields(), Ok((0, 3)));
        assert_eq!(parse_err(" CLEAR Q"), AsmErrKind::Syntax(SyntaxErr::BadRegister("Q".into())));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse_err(" FOO BAR"), AsmErrKind::Syntax(SyntaxErr::UnknownOperator("FOO".into())));
        assert_eq!(parse_err("LABEL"), AsmErrKind::Syntax(SyntaxErr::MissingOperator));
        assert_eq!(parse_err(" LDA =5"), AsmErrKind::Syntax(SyntaxErr::MalformedLiteral));
        assert_eq!(parse_err(" LDA A++B"), AsmErrKind::Syntax(SyntaxErr::BadExpression));
        assert_eq!(parse_err(" LDA"), AsmErrKind::Syntax(SyntaxErr::OperandCount { expected: 1, found: 0 }));
        assert_eq!(parse_err(" COMPR A"), AsmErrKind::Syntax(SyntaxErr::OperandCount { expected: 2, found: 1 }));
        assert_eq!(parse_err(" EXTDEF A,,B"), AsmErrKind::Syntax(SyntaxErr::ExpectedOperand));
        assert_eq!(parse_err(" BYTE 5"), AsmErrKind::Syntax(SyntaxErr::ExpectedConstant));
        assert_eq!(parse_err(" RESW A"), AsmErrKind::Syntax(SyntaxErr::ExpectedNumber));
        assert_eq!(parse_err(" CLEAR #A"), AsmErrKind::Syntax(SyntaxErr::UnexpectedSigil));
        assert_eq!(parse_err(" +LTORG"), AsmErrKind::Syntax(SyntaxErr::UnknownOperator("+LTORG".into())));
    }

    #[test]
    fn test_reserved_label() {
        assert_eq!(parse_err("SUB      RSUB"), AsmErrKind::Syntax(SyntaxErr::ReservedLabel("SUB".into())));
        assert_eq!(parse_err("SUB      CSECT"), AsmErrKind::Syntax(SyntaxErr::ReservedLabel("SUB".into())));

        // Operators can still start unlabeled lines
        let token = parse("SUB      ONE");
        assert_eq!(token.label, None);
        assert!(matches!(&token.operator, Some(Operator::Format3(i)) if i.mnemonic == "SUB"));
    }

    #[test]
    fn test_locctr_limit() {
        let table = InstrTable::sicxe();

        // Filling memory exactly is fine
        let token = parse_line(0, "         RSUB", &table, 0xF_FFFD).unwrap();
        assert_eq!(token.next_locctr, 0x10_0000);

        assert_eq!(
            parse_line(0, "         LDA     #1", &table, 0xF_FFFE).unwrap_err(),
            AsmErrKind::AddressOutOfRange(0x10_0001)
        );
        assert_eq!(
            parse_line(0, "BIG      RESB    16777215", &table, 0).unwrap_err(),
            AsmErrKind::AddressOutOfRange(16777215)
        );
        assert_eq!(
            parse_line(0, "BIG      RESW    16777215", &table, 0x1000).unwrap_err(),
            AsmErrKind::AddressOutOfRange(0x1000 + 3 * 16777215)
        );
    }

    #[test]
    fn test_unsupported_format() {
        assert_eq!(parse_err(" FIX"), AsmErrKind::UnsupportedFormat);
        assert_eq!(parse_err(" +CLEAR A"), AsmErrKind::UnsupportedFormat);
    }

    #[test]
    fn test_display() {
        assert_eq!(parse("CLOOP +JSUB RDREC").to_string(), "CLOOP    +JSUB    RDREC");
        assert_eq!(parse(" STCH BUFFER,X").to_string(), "         STCH     BUFFER,X");
        assert_eq!(parse(" J @RETADR").to_string(), "         J        @RETADR");
        assert_eq!(Nixbpe::default().bits(), 0);
    }
}
