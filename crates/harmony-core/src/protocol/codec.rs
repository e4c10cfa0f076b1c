//! Text codec for the hub's colon-delimited `key=value` wire format.
//!
//! Wire format:
//! ```text
//! key=value:key=value:key={"nested"::"group"}
//! ```
//!
//! - Pairs are separated by a single `:`.  A doubled `::` is an escaped
//!   literal colon inside a value.
//! - A value wrapped in `{...}` is a *brace group*: entries are separated by
//!   `,`, and a key is separated from its value by either `=` or `:` (hubs use
//!   both, depending on which side produced the text).  Keys and values may be
//!   double-quoted.
//! - A value that is itself a complete `key=value[:key=value]*` sequence is a
//!   nested mapping inlined by [`encode`].
//!
//! Decoding is lenient: segments that are not `key=value` pairs are skipped,
//! and a brace group that cannot be parsed is kept as its raw text.

use indexmap::IndexMap;
use thiserror::Error;

/// Errors that can occur while decoding wire text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input was empty or contained only whitespace.
    #[error("empty input")]
    Empty,

    /// The input did not contain a single decodable field.
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Insertion-ordered mapping of field names to values.
pub type WireMap = IndexMap<String, WireValue>;

/// A decoded wire value: either a scalar string or a nested mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Text(String),
    Map(WireMap),
}

impl WireValue {
    /// Returns the scalar text, or `None` for a nested mapping.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s),
            WireValue::Map(_) => None,
        }
    }

    /// Returns the nested mapping, or `None` for a scalar.
    pub fn as_map(&self) -> Option<&WireMap> {
        match self {
            WireValue::Text(_) => None,
            WireValue::Map(m) => Some(m),
        }
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::Text(value.to_string())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::Text(value)
    }
}

impl From<WireMap> for WireValue {
    fn from(value: WireMap) -> Self {
        WireValue::Map(value)
    }
}

macro_rules! impl_scalar_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for WireValue {
                fn from(value: $t) -> Self {
                    WireValue::Text(value.to_string())
                }
            }
        )*
    };
}

impl_scalar_from!(bool, i32, i64, u8, u16, u32, u64, usize, f64);

/// Builds a [`WireMap`] from `(key, value)` pairs, preserving their order.
///
/// # Examples
///
/// ```rust
/// use harmony_core::protocol::codec::{encode, fields};
///
/// let body = fields([("status", "press".into()), ("timestamp", 0u64.into())]);
/// assert_eq!(encode(&body), "status=press:timestamp=0");
/// ```
pub fn fields<I, K>(pairs: I) -> WireMap
where
    I: IntoIterator<Item = (K, WireValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a mapping into wire text.
///
/// Interior colons in values are doubled.  Nested mappings are encoded
/// recursively and inlined as the value of their key, escaped like any other
/// value so the nesting survives a round trip through [`decode`].
///
/// # Examples
///
/// ```rust
/// use harmony_core::protocol::codec::{encode, fields};
///
/// let body = fields([("action", "{\"command\":\"Mute\"}".into())]);
/// assert_eq!(encode(&body), "action={\"command\"::\"Mute\"}");
/// ```
pub fn encode(map: &WireMap) -> String {
    map.iter()
        .map(|(key, value)| format!("{key}={}", escape(&encode_value(value))))
        .collect::<Vec<_>>()
        .join(":")
}

/// Encodes `(key, value)` pairs directly, in order.
///
/// ```rust
/// use harmony_core::protocol::codec::encode_fields;
///
/// assert_eq!(encode_fields([("verb", "render".into())]), "verb=render");
/// ```
pub fn encode_fields<I, K>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, WireValue)>,
    K: Into<String>,
{
    encode(&fields(pairs))
}

/// Decodes wire text into a mapping.
///
/// Returns `None` when nothing could be decoded, so callers can tell
/// "no fields" apart from "nothing parsed".
///
/// # Examples
///
/// ```rust
/// use harmony_core::protocol::codec::decode;
///
/// let map = decode("hello=world:goodbye=earth").unwrap();
/// assert_eq!(map["hello"].as_str(), Some("world"));
/// assert_eq!(map["goodbye"].as_str(), Some("earth"));
/// assert!(decode("").is_none());
/// ```
pub fn decode(text: &str) -> Option<WireMap> {
    try_decode(text).ok()
}

/// Decodes wire text into a mapping, reporting why decoding failed.
///
/// # Errors
///
/// Returns [`ProtocolError::Empty`] for blank input and
/// [`ProtocolError::Malformed`] when no `key=value` pair was found.
pub fn try_decode(text: &str) -> Result<WireMap, ProtocolError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let mut map = WireMap::new();
    for segment in split_segments(text) {
        match split_pair(&segment, '=') {
            Some((key, raw)) => {
                map.insert(key.to_string(), decode_value(raw));
            }
            None => tracing::trace!(segment = %segment, "skipping segment without key=value"),
        }
    }

    if map.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "no key=value pairs in {} bytes",
            text.len()
        )));
    }
    Ok(map)
}

/// Parses a `{...}` brace group into a mapping.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the group is unbalanced or an
/// entry is missing its key separator.
pub fn decode_brace_group(text: &str) -> Result<WireMap, ProtocolError> {
    let mut parser = GroupParser::new(text.trim());
    let map = parser.group()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(parser.error("trailing characters after group"));
    }
    Ok(map)
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn encode_value(value: &WireValue) -> String {
    match value {
        WireValue::Text(s) => s.clone(),
        WireValue::Map(m) => encode(m),
    }
}

fn escape(value: &str) -> String {
    value.replace(':', "::")
}

// ── Decoding helpers ──────────────────────────────────────────────────────────

/// Splits on single `:` separators outside brace groups, unescaping `::`.
///
/// A `{` only opens a group when it starts a value.  If a group is never
/// closed the text is split as if it had no groups at all.
fn split_segments(text: &str) -> Vec<String> {
    scan_segments(text, true)
        .or_else(|| scan_segments(text, false))
        .unwrap_or_default()
}

fn scan_segments(text: &str, track_groups: bool) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                current.push(':');
            }
            ':' if depth == 0 => segments.push(std::mem::take(&mut current)),
            '{' if track_groups && (depth > 0 || opens_value(&current)) => {
                depth += 1;
                current.push(c);
            }
            '}' if depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    (depth == 0).then_some(segments)
}

/// True when `segment` so far is `key=` with nothing after the separator.
fn opens_value(segment: &str) -> bool {
    segment
        .split_once('=')
        .is_some_and(|(_, value)| value.trim().is_empty())
}

/// Splits `key<sep>value` at the first separator, validating the key.
fn split_pair(segment: &str, separator: char) -> Option<(&str, &str)> {
    let (key, value) = segment.split_once(separator)?;
    let key = key.trim();
    is_field_name(key).then_some((key, value))
}

fn is_field_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn decode_value(raw: &str) -> WireValue {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return match decode_brace_group(trimmed) {
            Ok(map) => WireValue::Map(map),
            Err(e) => {
                tracing::debug!(error = %e, "keeping undecodable brace group as text");
                WireValue::Text(raw.to_string())
            }
        };
    }
    match decode_inlined(raw) {
        Some(map) => WireValue::Map(map),
        None => WireValue::Text(raw.to_string()),
    }
}

/// Recognises a value that is a complete encoded mapping.
///
/// Every segment must be a valid pair whose value does not itself start with
/// `=`, which keeps padded tokens such as `abc==` as plain text.
fn decode_inlined(raw: &str) -> Option<WireMap> {
    if !raw.contains('=') {
        return None;
    }
    let mut map = WireMap::new();
    for segment in split_segments(raw) {
        let (key, value) = split_pair(&segment, '=')?;
        if value.starts_with('=') {
            return None;
        }
        map.insert(key.to_string(), decode_value(value));
    }
    Some(map)
}

// ── Brace group parser ────────────────────────────────────────────────────────

/// Recursive-descent parser for `{key=value, "key":"value", key={...}}`.
struct GroupParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> GroupParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ProtocolError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{expected}'"))),
        }
    }

    fn error(&self, what: &str) -> ProtocolError {
        ProtocolError::Malformed(format!("{what} at offset {} in brace group", self.pos))
    }

    fn group(&mut self) -> Result<WireMap, ProtocolError> {
        self.skip_ws();
        self.expect('{')?;
        let mut map = WireMap::new();

        self.skip_ws();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(map);
        }

        loop {
            self.skip_ws();
            let key = self.key()?;
            self.skip_ws();
            match self.bump() {
                Some('=' | ':') => {}
                _ => return Err(self.error("expected '=' or ':' after key")),
            }
            self.skip_ws();
            let value = self.value()?;
            map.insert(key, value);

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(map),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn key(&mut self) -> Result<String, ProtocolError> {
        if self.peek() == Some('"') {
            return self.quoted();
        }
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !matches!(c, '=' | ':' | ',' | '}') && !c.is_whitespace())
        {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("empty key"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn value(&mut self) -> Result<WireValue, ProtocolError> {
        match self.peek() {
            Some('{') => self.group().map(WireValue::Map),
            Some('"') => self.quoted().map(WireValue::Text),
            Some(_) => self.bare().map(WireValue::Text),
            None => Err(self.error("missing value")),
        }
    }

    fn quoted(&mut self) -> Result<String, ProtocolError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    /// Reads an unquoted scalar up to the next top-level `,` or `}`.
    /// Bracketed arrays are kept verbatim, commas included.
    fn bare(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        let mut brackets = 0usize;
        while let Some(c) = self.peek() {
            match c {
                '[' => brackets += 1,
                ']' => brackets = brackets.saturating_sub(1),
                ',' | '}' if brackets == 0 => break,
                _ => {}
            }
            self.bump();
        }
        if brackets != 0 {
            return Err(self.error("unbalanced '['"));
        }
        Ok(self.src[start..self.pos].trim_end().to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
