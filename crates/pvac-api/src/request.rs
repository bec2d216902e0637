// ── Request specifications ──
//
// Parses the human-readable field-selection language into an immutable
// `PvRequest`:
//
//   ""                                  whole record
//   "value,alarm"                       shorthand for field(value,alarm)
//   "field(value,alarm.severity)"       dotted paths
//   "field(timeStamp{secondsPastEpoch})" nested selection
//   "record[process=true]field(value)"  record options
//   "putField(value)getField(value,alarm)"  split put-get selections
//
// Invalid input is rejected here, before any channel activity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::Error;

// ── FieldSelection ───────────────────────────────────────────────

/// A tree of selected field names. A node with no children selects the
/// whole subtree below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    children: Vec<(String, FieldSelection)>,
    whole: bool,
    options: Vec<(String, String)>,
}

impl FieldSelection {
    /// Selects everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.children.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &FieldSelection)> {
        self.children.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn child(&self, name: &str) -> Option<&FieldSelection> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Per-field options given as `name[key=value]`.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Whether a dotted path is selected (directly or through an ancestor).
    pub fn contains(&self, path: &str) -> bool {
        let mut node = self;
        for seg in path.split('.') {
            if node.is_all() {
                return true;
            }
            match node.child(seg) {
                Some(next) => node = next,
                None => return false,
            }
        }
        true
    }

    /// Select a dotted path. `whole` marks the final node as selecting its
    /// entire subtree; later narrower paths beneath it are ignored.
    fn insert(&mut self, segments: &[&str], whole: bool) -> Option<&mut FieldSelection> {
        let Some((first, rest)) = segments.split_first() else {
            return Some(self);
        };
        if self.whole {
            return None;
        }
        let idx = if let Some(i) = self.children.iter().position(|(n, _)| n == first) {
            i
        } else {
            self.children
                .push(((*first).to_owned(), FieldSelection::default()));
            self.children.len() - 1
        };
        let child = &mut self.children[idx].1;
        if rest.is_empty() {
            if whole {
                child.children.clear();
                child.whole = true;
            } else if child.whole {
                return None;
            }
            return Some(child);
        }
        child.insert(rest, whole)
    }
}

// ── PvRequest ────────────────────────────────────────────────────

/// A parsed, immutable request specification.
///
/// Equality and hashing use the trimmed source text, so two requests
/// written identically are interchangeable as cache keys.
#[derive(Debug, Clone)]
pub struct PvRequest {
    text: String,
    record_options: Vec<(String, String)>,
    field: FieldSelection,
    put_field: Option<FieldSelection>,
    get_field: Option<FieldSelection>,
}

impl PvRequest {
    /// Request for the whole record.
    pub fn all() -> Self {
        Self {
            text: String::new(),
            record_options: Vec::new(),
            field: FieldSelection::all(),
            put_field: None,
            get_field: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        Parser::new(text.trim()).parse()
    }

    /// The normalized source text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn record_options(&self) -> &[(String, String)] {
        &self.record_options
    }

    pub fn record_option(&self, key: &str) -> Option<&str> {
        self.record_options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `record[process=true]`.
    pub fn wants_process(&self) -> bool {
        self.record_option("process") == Some("true")
    }

    /// `record[queueSize=N]`.
    pub fn queue_size(&self) -> Option<usize> {
        self.record_option("queueSize")?.parse().ok()
    }

    pub fn field_selection(&self) -> &FieldSelection {
        &self.field
    }

    /// Selection for the put side: `putField(...)`, else `field(...)`.
    pub fn put_selection(&self) -> &FieldSelection {
        self.put_field.as_ref().unwrap_or(&self.field)
    }

    /// Selection for the get side: `getField(...)`, else `field(...)`.
    pub fn get_selection(&self) -> &FieldSelection {
        self.get_field.as_ref().unwrap_or(&self.field)
    }

    /// The same request with `record[key=value]` added, unless `key` is
    /// already set.
    pub fn with_record_option(&self, key: &str, value: &str) -> Result<Self, Error> {
        if self.record_option(key).is_some() {
            return Ok(self.clone());
        }
        let body = if self.text.is_empty() || Parser::new(&self.text).component_ahead() {
            self.text.clone()
        } else {
            format!("field({})", self.text)
        };
        Self::parse(&format!("record[{key}={value}]{body}"))
    }
}

impl Default for PvRequest {
    fn default() -> Self {
        Self::all()
    }
}

impl PartialEq for PvRequest {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for PvRequest {}

impl Hash for PvRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Display for PvRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for PvRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Parser ───────────────────────────────────────────────────────

const COMPONENTS: [&str; 4] = ["record", "field", "putField", "getField"];

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<PvRequest, Error> {
        let mut request = PvRequest::all();
        request.text = self.text.to_owned();

        self.skip_ws();
        if self.at_end() {
            return Ok(request);
        }

        if !self.component_ahead() {
            self.list(&mut request.field, None)?;
            self.skip_ws();
            if !self.at_end() {
                return Err(self.err("unexpected trailing input"));
            }
            return Ok(request);
        }

        while !self.at_end() {
            let start = self.pos;
            let keyword = self.ident()?;
            self.skip_ws();
            match keyword {
                "record" => {
                    self.expect(b'[')?;
                    request.record_options.extend(self.options()?);
                }
                "field" => self.component_list(&mut request.field)?,
                "putField" => {
                    self.component_list(request.put_field.get_or_insert_with(FieldSelection::all))?;
                }
                "getField" => {
                    self.component_list(request.get_field.get_or_insert_with(FieldSelection::all))?;
                }
                other => {
                    self.pos = start;
                    return Err(self.err(&format!("unknown request component '{other}'")));
                }
            }
            self.skip_ws();
        }
        Ok(request)
    }

    fn component_list(&mut self, into: &mut FieldSelection) -> Result<(), Error> {
        self.expect(b'(')?;
        self.list(into, Some(b')'))?;
        self.expect(b')')
    }

    /// Comma-separated items up to (not including) `close`.
    fn list(&mut self, into: &mut FieldSelection, close: Option<u8>) -> Result<(), Error> {
        loop {
            self.skip_ws();
            if close.is_some() && self.peek() == close {
                return Ok(());
            }
            let path = self.path()?;
            let segments: Vec<&str> = path.split('.').collect();
            self.skip_ws();
            let options = if self.eat(b'[') {
                self.options()?
            } else {
                Vec::new()
            };
            self.skip_ws();
            if self.eat(b'{') {
                match into.insert(&segments, false) {
                    Some(node) => {
                        node.options.extend(options);
                        self.list(node, Some(b'}'))?;
                    }
                    None => self.list(&mut FieldSelection::default(), Some(b'}'))?,
                }
                self.expect(b'}')?;
            } else if let Some(node) = into.insert(&segments, true) {
                node.options.extend(options);
            }
            self.skip_ws();
            if !self.eat(b',') {
                return Ok(());
            }
        }
    }

    /// `key=value` pairs up to and including the closing `]`.
    fn options(&mut self) -> Result<Vec<(String, String)>, Error> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b']') {
                return Ok(out);
            }
            let key = self.ident()?.to_owned();
            self.skip_ws();
            self.expect(b'=')?;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b',' || c == b']' {
                    break;
                }
                self.pos += 1;
            }
            let value = self.text[start..self.pos].trim();
            if value.is_empty() {
                return Err(self.err(&format!("empty value for option '{key}'")));
            }
            out.push((key, value.to_owned()));
            if !self.eat(b',') {
                self.expect(b']')?;
                return Ok(out);
            }
        }
    }

    fn path(&mut self) -> Result<String, Error> {
        let mut path = self.ident()?.to_owned();
        while self.peek() == Some(b'.') {
            self.pos += 1;
            path.push('.');
            path.push_str(self.ident()?);
        }
        Ok(path)
    }

    fn ident(&mut self) -> Result<&'a str, Error> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.pos += 1,
            Some(c) => return Err(self.err(&format!("expected field name, found '{}'", c as char))),
            None => return Err(self.err("expected field name, found end of input")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn component_ahead(&self) -> bool {
        let rest = &self.text[self.pos..];
        COMPONENTS.iter().any(|kw| {
            rest.strip_prefix(kw).is_some_and(|after| {
                matches!(after.trim_start().as_bytes().first(), Some(b'(' | b'['))
            })
        })
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), Error> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", c as char)))
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn err(&self, reason: &str) -> Error {
        Error::InvalidRequest {
            request: self.text.to_owned(),
            position: self.pos,
            reason: reason.to_owned(),
        }
    }
}
