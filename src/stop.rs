//! Stop sequences: parsing the comma-separated stop field and matching the
//! decoded strings against generated text.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::{Error, Result};

/// Stop sequences of a generation request.
///
/// `raw` keeps the entries exactly as split and trimmed from the input field;
/// these are what the model receives. `decoded` holds the same entries with
/// backslash escapes resolved, so that typing `\n` stops on a real newline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopSet {
    raw: Vec<String>,
    decoded: Vec<String>,
}

impl StopSet {
    /// Splits `field` on commas, trims each entry and decodes its escapes.
    ///
    /// A malformed escape (`\x4`, a trailing `\`) is a validation error.
    pub fn parse(field: &str) -> Result<Self> {
        let raw: Vec<String> = field.split(',').map(|s| s.trim().to_string()).collect();
        let decoded = raw
            .iter()
            .map(|s| decode_escapes(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { raw, decoded })
    }

    /// Entries as typed, forwarded to the model untouched.
    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    /// Decoded entries that can actually match; empty strings never do.
    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.decoded.iter().map(String::as_str).filter(|s| !s.is_empty())
    }

    /// True once any decoded stop string occurs in `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.active().any(|stop| text.contains(stop))
    }

    /// Cuts `text` before stop strings, applying them in configured order.
    ///
    /// Each entry searches the text left by the previous cut, so a later
    /// entry that only occurred past an earlier cut no longer applies.
    pub fn truncate(&self, text: &str) -> String {
        let mut end = text.len();
        for stop in self.active() {
            if let Some(at) = text[..end].find(stop) {
                end = at;
            }
        }
        text[..end].to_string()
    }
}

/// Resolves Python-style backslash escapes.
///
/// Supports the single-character escapes, octal `\ooo`, `\xhh`, `\uhhhh`
/// and `\Uhhhhhhhh`, and drops an escaped line break. Unknown escapes are
/// kept verbatim, backslash included.
pub fn decode_escapes(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let Some(escape) = chars.next() else {
            return Err(Error::Validation(format!(
                "stop sequence {input:?} ends with a lone backslash"
            )));
        };

        match escape {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = escape.to_digit(8).unwrap_or_default();
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(code_point(value, input)?);
            }
            'x' => out.push(hex_escape(&mut chars, 2, input)?),
            'u' => out.push(hex_escape(&mut chars, 4, input)?),
            'U' => out.push(hex_escape(&mut chars, 8, input)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    Ok(out)
}

fn hex_escape(chars: &mut Peekable<Chars<'_>>, digits: usize, input: &str) -> Result<char> {
    let mut value: u32 = 0;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|d| d.to_digit(16))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "stop sequence {input:?} has a truncated escape, expected {digits} hex digits"
                ))
            })?;
        value = value * 16 + digit;
    }
    code_point(value, input)
}

fn code_point(value: u32, input: &str) -> Result<char> {
    char::from_u32(value).ok_or_else(|| {
        Error::Validation(format!(
            "stop sequence {input:?} escapes an invalid code point {value:#x}"
        ))
    })
}
