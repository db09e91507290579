//! Tokenizing the operand field of SIC/XE assembly.
//!
//! The line-level fields (label, operator, operands, comment) are split apart
//! by the tokenizer in [`crate::parse`]. The operand field is then broken
//! into [`Lexeme`]s by this module.
//!
//! For example, `=C'EOF'` lexes to `[Equals, CharConst(b"EOF")]`
//! and `BUFEND-BUFFER` lexes to `[Symbol("BUFEND"), Minus, Symbol("BUFFER")]`.

use std::num::IntErrorKind;

use logos::{Lexer, Logos};

/// A unit of information in an operand field.
#[derive(Debug, Logos, PartialEq, Eq, Clone)]
#[logos(skip r"[ \t]+", error = LexErr)]
pub enum Lexeme {
    // Like the numeric regex below, the constant regexes span over
    // invalid contents (e.g., `X'0G'`) and are validated in their callbacks.

    /// A character constant (e.g., `C'EOF'`).
    #[regex(r"[Cc]'[^']*'", lex_char_const)]
    #[regex(r"[Cc]'[^']*", lex_unclosed)]
    CharConst(Vec<u8>),

    /// A hex constant (e.g., `X'F1'`).
    #[regex(r"[Xx]'[^']*'", lex_hex_const)]
    #[regex(r"[Xx]'[^']*", lex_unclosed)]
    HexConst(Vec<u8>),

    /// An unsigned decimal number (e.g., `4096`).
    #[regex(r"\d\w*", lex_number)]
    Number(u32),

    /// A symbol (e.g., `BUFFER`, `X`, `RDREC`).
    ///
    /// Register names are also lexed as symbols.
    #[regex(r"[A-Za-z_]\w*", |lx| lx.slice().to_string())]
    Symbol(String),

    /// The current location counter (`*`).
    #[token("*")]
    Star,

    /// `+`
    #[token("+")]
    Plus,

    /// `-`
    #[token("-")]
    Minus,

    /// A comma, which separates operands.
    #[token(",")]
    Comma,

    /// Indirect addressing sigil.
    #[token("@")]
    At,

    /// Immediate addressing sigil.
    #[token("#")]
    Hash,

    /// Literal sigil (the `=` in `=X'05'`).
    #[token("=")]
    Equals,
}

/// Any errors raised in attempting to tokenize an operand field.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum LexErr {
    /// Numeric literal cannot fit within 24 bits.
    DoesNotFitWord,
    /// Numeric literal has invalid digits (i.e., not 0-9).
    InvalidNumeric,
    /// Hex constant has characters that are not hex digits.
    InvalidHex,
    /// Hex constant has an odd number of digits.
    OddHexLength,
    /// Constant has nothing between its quotes.
    EmptyConstant,
    /// Constant is missing its closing quote.
    UnclosedConstant,
    /// Int parsing failed but the reason why is unknown
    UnknownIntErr,
    /// A symbol was used which is not allowed in SIC/XE operands.
    #[default]
    InvalidSymbol
}
impl std::fmt::Display for LexErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexErr::DoesNotFitWord   => f.write_str("numeric token does not fit in a 24-bit word"),
            LexErr::InvalidNumeric   => f.write_str("invalid decimal literal"),
            LexErr::InvalidHex       => f.write_str("invalid hex constant"),
            LexErr::OddHexLength     => f.write_str("hex constant has an odd number of digits"),
            LexErr::EmptyConstant    => f.write_str("constant is empty"),
            LexErr::UnclosedConstant => f.write_str("unclosed constant"),
            LexErr::UnknownIntErr    => f.write_str("could not parse integer"),
            LexErr::InvalidSymbol    => f.write_str("unrecognized symbol"),
        }
    }
}
impl std::error::Error for LexErr {}
impl crate::err::Error for LexErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            LexErr::DoesNotFitWord   => Some(format!("the range for a word is [0, {}]", WORD_MAX).into()),
            LexErr::InvalidNumeric   => Some("a decimal literal only consists of digits 0-9".into()),
            LexErr::InvalidHex       => Some("a hex constant consists of 0-9, A-F".into()),
            LexErr::OddHexLength     => Some("each byte takes two hex digits; try adding a leading 0".into()),
            LexErr::EmptyConstant    => Some("a constant needs at least one byte".into()),
            LexErr::UnclosedConstant => Some("add a quote to the end of the constant".into()),
            LexErr::UnknownIntErr    => None,
            LexErr::InvalidSymbol    => Some("this char does not occur in any SIC/XE operand".into()),
        }
    }
}

const WORD_MAX: u32 = 0xFF_FFFF;

fn lex_number(lx: &Lexer<'_, Lexeme>) -> Result<u32, LexErr> {
    let n = lx.slice().parse::<u32>()
        .map_err(|e| match e.kind() {
            IntErrorKind::InvalidDigit => LexErr::InvalidNumeric,
            IntErrorKind::PosOverflow  => LexErr::DoesNotFitWord,
            _ => LexErr::UnknownIntErr,
        })?;

    match n <= WORD_MAX {
        true  => Ok(n),
        false => Err(LexErr::DoesNotFitWord),
    }
}
/// Gets the text between the quotes of a constant (e.g., `EOF` in `C'EOF'`).
fn const_body<'s>(lx: &Lexer<'s, Lexeme>) -> Result<&'s str, LexErr> {
    let body = &lx.slice()[2..(lx.slice().len() - 1)];
    match body.is_empty() {
        true  => Err(LexErr::EmptyConstant),
        false => Ok(body),
    }
}
fn lex_char_const(lx: &Lexer<'_, Lexeme>) -> Result<Vec<u8>, LexErr> {
    const_body(lx).map(|s| s.as_bytes().to_vec())
}
fn lex_hex_const(lx: &Lexer<'_, Lexeme>) -> Result<Vec<u8>, LexErr> {
    let body = const_body(lx)?;
    if !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LexErr::InvalidHex);
    }
    if body.len() % 2 != 0 {
        return Err(LexErr::OddHexLength);
    }

    (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..(i + 2)], 16).map_err(|_| LexErr::InvalidHex))
        .collect()
}
fn lex_unclosed(_lx: &Lexer<'_, Lexeme>) -> Result<Vec<u8>, LexErr> {
    Err(LexErr::UnclosedConstant)
}
