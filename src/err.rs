//! Error interface for this crate.
//!
//! Every error raised by the assembler, the loader, and the simulator
//! implements [`Error`], which adds an optional source location
//! and an optional help message to [`std::error::Error`].
//!
//! This module also re-exports all of the crate's error types.
use std::borrow::Cow;

pub use crate::parse::lex::LexErr;
pub use crate::parse::SyntaxErr;
pub use crate::asm::{AsmErr, AsmErrKind};
pub use crate::asm::encoding::{RecordErr, RecordErrKind};
pub use crate::ast::TableErr;
pub use crate::sim::SimErr;
pub use crate::sim::debug::ComparatorErr;

/// The source location an error occurred at.
///
/// Assembly is line-oriented, so this is the (1-indexed) line number
/// together with the text of that line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ErrSpan {
    /// The line number (starting at 1).
    pub line: usize,
    /// The contents of the offending line.
    pub text: String,
}
impl ErrSpan {
    /// Creates a span from a 0-indexed line number and its text.
    pub fn new(index: usize, text: &str) -> Self {
        Self { line: index + 1, text: text.trim_end().to_string() }
    }
}
impl std::fmt::Display for ErrSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.text)
    }
}

/// Unified error interface for all errors in this crate.
pub trait Error: std::error::Error {
    /// The location of the error in source, if there is one.
    fn span(&self) -> Option<ErrSpan> {
        None
    }

    /// A help message describing how the error could be fixed.
    fn help(&self) -> Option<Cow<str>>;
}
