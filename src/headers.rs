use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// A header field name.
///
/// Names compare case-insensitively but keep the spelling they were created
/// with, so `Content-Length` set by a handler goes out on the wire as written.
#[derive(Debug, Clone)]
pub struct HeaderName(String);

impl HeaderName {
    pub fn from_str(src: &str) -> Self {
        Self(src.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for HeaderName {}

impl Hash for HeaderName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("malformed header line: missing ':'")]
    MissingColon,
    #[error("malformed header line: empty field name")]
    EmptyName,
    #[error("malformed header line: whitespace before field name")]
    LeadingWhitespace,
    #[error("malformed header line: whitespace before ':'")]
    WhitespaceBeforeColon,
    #[error("malformed field name: invalid character {0:?}")]
    InvalidNameChar(char),
    #[error("malformed field name: not valid utf-8")]
    InvalidEncoding,
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("invalid value for header {0:?}")]
    InvalidValue(String),
}

/// Ordered collection of header fields.
///
/// Repeated fields are merged into a single entry, values joined with `", "`
/// in arrival order. Iteration follows first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: Vec<(HeaderName, String)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Consumes at most one CRLF-terminated header line from `data`.
    ///
    /// Returns the number of bytes consumed and whether the blank line ending
    /// the header section was reached. `(0, false)` means no complete line is
    /// buffered yet and the caller has to read more.
    pub fn parse(&mut self, data: &[u8]) -> Result<(usize, bool), HeaderError> {
        if data.starts_with(b"\r\n") {
            return Ok((2, true));
        }
        let end = match find_crlf(data) {
            Some(end) => end,
            None => return Ok((0, false)),
        };

        let line = &data[..end];
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(HeaderError::MissingColon)?;
        let name = std::str::from_utf8(&line[..colon]).map_err(|_| HeaderError::InvalidEncoding)?;
        validate_name(name)?;
        let value = decode_value(&line[colon + 1..]);

        self.insert(&name.to_ascii_lowercase(), trim_ows(&value));
        Ok((end + 2, false))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.matches(name))
            .map(|(_, v)| v.as_str())
    }

    /// Adds a value, appending to an existing field of the same name.
    pub fn insert(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(n, _)| n.matches(name)) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self
                .entries
                .push((HeaderName::from_str(name), value.to_owned())),
        }
    }

    /// Replaces the value of a field, keeping its position if it exists.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(n, _)| n.matches(name)) {
            Some((_, existing)) => *existing = value.to_owned(),
            None => self
                .entries
                .push((HeaderName::from_str(name), value.to_owned())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(n, _)| n.matches(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.entries.iter().map(|(n, v)| (n, v.as_str()))
    }

    /// The declared body length, if any.
    ///
    /// A repeated field merges to `"5, 5"`; that is accepted as long as every
    /// listed value is the same number.
    pub fn content_length(&self) -> Result<Option<usize>, HeaderError> {
        let value = match self.get("content-length") {
            Some(value) => value,
            None => return Ok(None),
        };
        let invalid = || HeaderError::InvalidContentLength(value.to_owned());

        let mut parts = value.split(',').map(trim_ows);
        let first = parts.next().filter(|p| is_digits(p)).ok_or_else(invalid)?;
        if parts.any(|p| p != first) {
            return Err(invalid());
        }
        first.parse().map(Some).map_err(|_| invalid())
    }
}

pub(crate) fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// RFC 9110 `tchar`.
pub(crate) fn is_token_char(c: char) -> bool {
    matches!(c,
        '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' |
        '^' | '_' | '`' | '|' | '~' | '0'..='9' | 'A'..='Z' | 'a'..='z'
    )
}

fn validate_name(name: &str) -> Result<(), HeaderError> {
    let first = name.chars().next().ok_or(HeaderError::EmptyName)?;
    if first.is_ascii_whitespace() {
        return Err(HeaderError::LeadingWhitespace);
    }
    if name.ends_with(|c: char| c.is_ascii_whitespace()) {
        return Err(HeaderError::WhitespaceBeforeColon);
    }
    match name.chars().find(|&c| !is_token_char(c)) {
        Some(c) => Err(HeaderError::InvalidNameChar(c)),
        None => Ok(()),
    }
}

/// Field values may carry obs-text; bytes that are not UTF-8 are read as
/// ISO-8859-1.
fn decode_value(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(value) => Cow::Borrowed(value),
        Err(_) => Cow::Owned(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

fn trim_ows(s: &str) -> &str {
    s.trim_matches(|c| c == ' ' || c == '\t')
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
