//! Object programs and the text format they are written in.
//!
//! An [`ObjectProgram`] is a list of [`ObjectSection`]s, one per control section.
//! Each section is written as fixed-width records, one per line:
//!
//! | Record | Layout |
//! |--------|--------|
//! | `H` | name (6, space-padded), start (6 hex), length (6 hex) |
//! | `D` | repeated name (6) and address (6 hex) |
//! | `R` | repeated name (6) |
//! | `T` | start (6 hex), byte count (2 hex), payload (hex) |
//! | `M` | address (6 hex), half-byte count (2 decimal), sign, symbol |
//! | `E` | entry address (6 hex), or nothing |
//!
//! The [`ObjFileFormat`] trait describes reading and writing object programs.
//! [`TextFormat`] implements it for the record format above,
//! and backs the [`Display`](std::fmt::Display) and [`FromStr`](std::str::FromStr)
//! implementations of [`ObjectProgram`].

use std::fmt::Write;

use crate::ast::Sign;

/// Maximum number of bytes held in a single text record.
pub const MAX_TEXT_LEN: usize = 30;

/// The header of a control section.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    /// The name of the section.
    pub name: String,
    /// The address the section was assembled at.
    pub start: u32,
    /// The length of the section in bytes.
    pub length: u32,
}

/// A run of assembled bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TextRecord {
    /// The address of the first byte.
    pub start: u32,
    /// The bytes (at most [`MAX_TEXT_LEN`]).
    pub bytes: Vec<u8>,
}
impl TextRecord {
    /// The address one past the last byte of this record.
    pub fn end(&self) -> u32 {
        self.start + self.bytes.len() as u32
    }
}

/// A link-time fixup.
///
/// This instructs the loader to add (or subtract) the address of a symbol
/// into a field that has already been assembled.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Modification {
    /// The address of the first byte of the field.
    pub addr: u32,
    /// The length of the field in half-bytes (5 for format 4 addresses, 6 for words).
    ///
    /// A field with an odd length starts at the low half of its first byte.
    pub half_bytes: u8,
    /// Whether the symbol's address is added or subtracted.
    pub sign: Sign,
    /// The symbol whose address is applied.
    pub symbol: String,
}

/// The records of a single control section.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ObjectSection {
    /// The `H` record.
    pub header: Header,
    /// The `D` record: exported symbols and their addresses.
    pub define: Vec<(String, u32)>,
    /// The `R` record: imported symbol names.
    pub refer: Vec<String>,
    /// The `T` records.
    pub text: Vec<TextRecord>,
    /// The `M` records.
    pub modifications: Vec<Modification>,
    /// The address in the `E` record. Only the first section of a program has one.
    pub end: Option<u32>,
}
impl ObjectSection {
    /// Creates a section with only a header.
    pub fn new(name: &str, start: u32, length: u32) -> Self {
        Self {
            header: Header { name: name.to_string(), start, length },
            define: vec![],
            refer: vec![],
            text: vec![],
            modifications: vec![],
            end: None,
        }
    }
}

/// An assembled program, consisting of one or more control sections.
///
/// ## Example
/// ```
/// use sicxe_ensemble::asm::encoding::ObjectProgram;
///
/// let text = "HCOPY  000000000006\nT0000000617200348200E\nE000000\n";
/// let program: ObjectProgram = text.parse().unwrap();
/// assert_eq!(program.sections[0].header.name, "COPY");
/// assert_eq!(program.sections[0].text[0].bytes.len(), 6);
/// assert_eq!(program.to_string(), text);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ObjectProgram {
    /// The sections of the program, in load order.
    pub sections: Vec<ObjectSection>,
}
impl std::fmt::Display for ObjectProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&TextFormat::serialize(self))
    }
}
impl std::str::FromStr for ObjectProgram {
    type Err = RecordErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TextFormat::deserialize(s)
    }
}

/// Kinds of errors that can occur when reading object records.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RecordErrKind {
    /// The record type letter is not one of `H`, `D`, `R`, `T`, `M`, `E`.
    UnknownRecord(char),
    /// The record does not have the expected fields.
    Malformed(char),
    /// A record appeared before any `H` record.
    MissingHeader,
    /// A `T` record's byte count does not match its payload.
    LengthMismatch,
    /// A `T` record holds more than [`MAX_TEXT_LEN`] bytes.
    TextTooLong,
}
impl std::fmt::Display for RecordErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordErrKind::UnknownRecord(c) => write!(f, "unknown record type {c:?}"),
            RecordErrKind::Malformed(c)     => write!(f, "malformed {c} record"),
            RecordErrKind::MissingHeader    => f.write_str("record is not part of a section"),
            RecordErrKind::LengthMismatch   => f.write_str("text record length does not match its contents"),
            RecordErrKind::TextTooLong      => write!(f, "text record holds more than {MAX_TEXT_LEN} bytes"),
        }
    }
}

/// Error from reading object records.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecordErr {
    /// The line the error occurred on (starting at 1).
    pub line: usize,
    /// The kind of error.
    pub kind: RecordErrKind,
}
impl std::fmt::Display for RecordErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {})", self.kind, self.line)
    }
}
impl std::error::Error for RecordErr {}
impl crate::err::Error for RecordErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match &self.kind {
            RecordErrKind::UnknownRecord(_) => Some("object records start with H, D, R, T, M, or E".into()),
            RecordErrKind::Malformed('H')   => Some("H records are H, a 6-character name, a 6-digit hex start, and a 6-digit hex length".into()),
            RecordErrKind::Malformed('T')   => Some("T records are T, a 6-digit hex start, a 2-digit hex length, and hex bytes".into()),
            RecordErrKind::Malformed('M')   => Some("M records are M, a 6-digit hex address, a 2-digit length, a sign, and a symbol".into()),
            RecordErrKind::Malformed(_)     => None,
            RecordErrKind::MissingHeader    => Some("each section must start with an H record".into()),
            RecordErrKind::LengthMismatch   => None,
            RecordErrKind::TextTooLong      => None,
        }
    }
}

/// A trait defining object program formats.
pub trait ObjFileFormat {
    /// Representation of the serialized format.
    type Stream: ToOwned + ?Sized;
    /// Serializes into the stream format.
    fn serialize(o: &ObjectProgram) -> <Self::Stream as ToOwned>::Owned;
    /// Deserializes from the stream format.
    fn deserialize(i: &Self::Stream) -> Result<ObjectProgram, RecordErr>;
}

/// The fixed-width text format of object records.
///
/// Sections are separated by a blank line when written.
/// When read, blank lines are skipped and both `\n` and `\r\n` line endings are accepted.
pub struct TextFormat;

impl ObjFileFormat for TextFormat {
    type Stream = str;

    fn serialize(o: &ObjectProgram) -> <Self::Stream as ToOwned>::Owned {
        fn _ser(o: &ObjectProgram) -> Result<String, std::fmt::Error> {
            let mut buf = String::new();

            for (i, sect) in o.sections.iter().enumerate() {
                if i != 0 {
                    writeln!(buf)?;
                }

                let Header { name, start, length } = &sect.header;
                writeln!(buf, "H{name:<6}{start:06X}{length:06X}")?;

                if !sect.define.is_empty() {
                    buf.push('D');
                    for (name, addr) in &sect.define {
                        write!(buf, "{name:<6}{addr:06X}")?;
                    }
                    writeln!(buf)?;
                }
                if !sect.refer.is_empty() {
                    let mut names = String::new();
                    for name in &sect.refer {
                        write!(names, "{name:<6}")?;
                    }
                    writeln!(buf, "R{}", names.trim_end())?;
                }
                for rec in &sect.text {
                    write!(buf, "T{:06X}{:02X}", rec.start, rec.bytes.len())?;
                    rec.bytes.iter().try_for_each(|b| write!(buf, "{b:02X}"))?;
                    writeln!(buf)?;
                }
                for m in &sect.modifications {
                    writeln!(buf, "M{:06X}{:02}{}{}", m.addr, m.half_bytes, m.sign, m.symbol)?;
                }
                match sect.end {
                    Some(addr) => writeln!(buf, "E{addr:06X}")?,
                    None => writeln!(buf, "E")?,
                }
            }

            Ok(buf)
        }

        // Writing into a String cannot fail.
        _ser(o).unwrap_or_default()
    }

    fn deserialize(string: &Self::Stream) -> Result<ObjectProgram, RecordErr> {
        let mut sections: Vec<ObjectSection> = vec![];

        for (i, line) in string.lines().enumerate() {
            let line = line.trim_end();
            let err = |kind| RecordErr { line: i + 1, kind };
            let Some(rtype) = line.chars().next() else { continue };

            if rtype == 'H' {
                sections.push(parse_header(line).ok_or(err(RecordErrKind::Malformed('H')))?);
                continue;
            }
            if !"DRTME".contains(rtype) {
                return Err(err(RecordErrKind::UnknownRecord(rtype)));
            }
            let sect = sections.last_mut().ok_or(err(RecordErrKind::MissingHeader))?;
            if !line.is_ascii() {
                return Err(err(RecordErrKind::Malformed(rtype)));
            }
            let body = &line[1..];

            match rtype {
                'D' => {
                    if body.is_empty() || body.len() % 12 != 0 {
                        return Err(err(RecordErrKind::Malformed('D')));
                    }
                    for chunk in split_every(body, 12) {
                        let addr = hex2u32(&chunk[6..]).ok_or(err(RecordErrKind::Malformed('D')))?;
                        sect.define.push((chunk[..6].trim_end().to_string(), addr));
                    }
                },
                'R' => {
                    // The last name may have had its padding trimmed.
                    let names = split_every(body, 6)
                        .map(str::trim_end)
                        .filter(|n| !n.is_empty())
                        .map(str::to_string);
                    sect.refer.extend(names);
                },
                'T' => sect.text.push(parse_text(body).map_err(err)?),
                'M' => sect.modifications.push(parse_modification(body).ok_or(err(RecordErrKind::Malformed('M')))?),
                'E' => {
                    sect.end = match body.is_empty() {
                        true  => None,
                        false => Some(hex2u32(body).ok_or(err(RecordErrKind::Malformed('E')))?),
                    };
                },
                _ => unreachable!("record type should have been checked"),
            }
        }

        Ok(ObjectProgram { sections })
    }
}

fn split_every(s: &str, n: usize) -> impl Iterator<Item=&str> + '_ {
    (0..s.len()).step_by(n)
        .map(move |i| &s[i..(i + n).min(s.len())])
}
fn hex2u32(s: &str) -> Option<u32> {
    // from_str_radix accepts a leading `+`, which isn't valid here.
    match !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        true  => u32::from_str_radix(s, 16).ok(),
        false => None,
    }
}

fn parse_header(line: &str) -> Option<ObjectSection> {
    if !line.is_ascii() || line.len() != 19 { return None; }

    let name = line[1..7].trim_end();
    let start = hex2u32(&line[7..13])?;
    let length = hex2u32(&line[13..19])?;
    Some(ObjectSection::new(name, start, length))
}
fn parse_text(body: &str) -> Result<TextRecord, RecordErrKind> {
    let malformed = RecordErrKind::Malformed('T');
    if body.len() < 8 { return Err(malformed); }

    let start = hex2u32(&body[0..6]).ok_or(malformed.clone())?;
    let len = hex2u32(&body[6..8]).ok_or(malformed.clone())? as usize;
    let payload = &body[8..];

    if payload.len() != len * 2 {
        return Err(RecordErrKind::LengthMismatch);
    }
    if len > MAX_TEXT_LEN {
        return Err(RecordErrKind::TextTooLong);
    }
    let bytes = split_every(payload, 2)
        .map(|b| hex2u32(b).map(|b| b as u8))
        .collect::<Option<Vec<_>>>()
        .ok_or(malformed)?;

    Ok(TextRecord { start, bytes })
}
fn parse_modification(body: &str) -> Option<Modification> {
    if body.len() < 10 { return None; }

    let addr = hex2u32(&body[0..6])?;
    let half_bytes = body[6..8].parse::<u8>().ok()
        .filter(|n| (1..=6).contains(n))?;
    let sign = body[8..9].chars().next()
        .and_then(|c| Sign::try_from(c).ok())?;
    let symbol = body[9..].trim();

    Some(Modification { addr, half_bytes, sign, symbol: symbol.to_string() })
}

#[cfg(test)]
mod tests {
    use crate::ast::Sign;

    use super::{Modification, ObjFileFormat, ObjectProgram, ObjectSection, RecordErr, RecordErrKind, TextFormat, TextRecord};

    fn sample() -> ObjectProgram {
        let mut copy = ObjectSection::new("COPY", 0, 0x33);
        copy.define = vec![("BUFFER".into(), 0x33), ("BUFEND".into(), 0x1033), ("LENGTH".into(), 0x2D)];
        copy.refer = vec!["RDREC".into(), "WRREC".into()];
        copy.text = vec![
            TextRecord { start: 0x00, bytes: vec![0x17, 0x20, 0x27, 0x4B, 0x10, 0x00, 0x00] },
            TextRecord { start: 0x2A, bytes: vec![0x3F, 0x2F, 0xEC] },
        ];
        copy.modifications = vec![
            Modification { addr: 0x04, half_bytes: 5, sign: Sign::Plus, symbol: "RDREC".into() },
        ];
        copy.end = Some(0);

        let mut rdrec = ObjectSection::new("RDREC", 0, 0x2B);
        rdrec.refer = vec!["BUFFER".into(), "LENGTH".into(), "BUFEND".into()];
        rdrec.text = vec![TextRecord { start: 0x28, bytes: vec![0x00, 0x00, 0x00] }];
        rdrec.modifications = vec![
            Modification { addr: 0x28, half_bytes: 6, sign: Sign::Plus, symbol: "BUFEND".into() },
            Modification { addr: 0x28, half_bytes: 6, sign: Sign::Minus, symbol: "BUFFER".into() },
        ];

        ObjectProgram { sections: vec![copy, rdrec] }
    }

    const SAMPLE_TEXT: &str = "\
HCOPY  000000000033
DBUFFER000033BUFEND001033LENGTH00002D
RRDREC WRREC
T000000071720274B100000
T00002A033F2FEC
M00000405+RDREC
E000000

HRDREC 00000000002B
RBUFFERLENGTHBUFEND
T00002803000000
M00002806+BUFEND
M00002806-BUFFER
E
";

    #[test]
    fn test_serialize() {
        assert_eq!(TextFormat::serialize(&sample()), SAMPLE_TEXT);
    }

    #[test]
    fn test_deserialize() {
        assert_eq!(TextFormat::deserialize(SAMPLE_TEXT), Ok(sample()));
    }

    #[test]
    fn test_deserialize_crlf() {
        let crlf = SAMPLE_TEXT.replace('\n', "\r\n");
        assert_eq!(crlf.parse::<ObjectProgram>(), Ok(sample()));

        // Extra blank lines and trimmed padding are fine
        let loose = "\n\nHCOPY  000000000003\nRRDREC\n\n\nT00000003000000\nE\n\n";
        let program = loose.parse::<ObjectProgram>().unwrap();
        assert_eq!(program.sections.len(), 1);
        assert_eq!(program.sections[0].refer, vec!["RDREC".to_string()]);
        assert_eq!(program.sections[0].end, None);
    }

    #[test]
    fn test_deserialize_errors() {
        fn fail(s: &str) -> RecordErr {
            s.parse::<ObjectProgram>().unwrap_err()
        }

        assert_eq!(fail("HCOPY  00000000003"), RecordErr { line: 1, kind: RecordErrKind::Malformed('H') });
        assert_eq!(fail("T00000003000000"), RecordErr { line: 1, kind: RecordErrKind::MissingHeader });
        assert_eq!(fail("HCOPY  000000000003\nX123"), RecordErr { line: 2, kind: RecordErrKind::UnknownRecord('X') });
        assert_eq!(fail("HCOPY  000000000003\nT000000040000"), RecordErr { line: 2, kind: RecordErrKind::LengthMismatch });
        assert_eq!(fail("HCOPY  000000000003\nT00000001GG"), RecordErr { line: 2, kind: RecordErrKind::Malformed('T') });
        assert_eq!(fail("HCOPY  000000000003\nM00000407*RDREC"), RecordErr { line: 2, kind: RecordErrKind::Malformed('M') });
        assert_eq!(fail("HCOPY  000000000003\nDBUFFER00003"), RecordErr { line: 2, kind: RecordErrKind::Malformed('D') });
        assert_eq!(fail("HCOPY  000000000003\nE+00000"), RecordErr { line: 2, kind: RecordErrKind::Malformed('E') });

        let long = format!("HCOPY  000000000040\nT0000001F{}", "00".repeat(31));
        assert_eq!(fail(&long), RecordErr { line: 2, kind: RecordErrKind::TextTooLong });
    }

    #[test]
    fn test_text_record_end() {
        let rec = TextRecord { start: 0x1000, bytes: vec![0; 30] };
        assert_eq!(rec.end(), 0x101E);
    }
}
