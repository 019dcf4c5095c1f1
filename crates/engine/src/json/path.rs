//! Path expressions over JSON documents
//!
//! Supported syntax: `$` for the root (optional), `.name`, `['name']`,
//! `[n]` (negative counts from the end), `[*]` and `.*`. A path containing a
//! wildcard selects a list of every match.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{AccordError, AccordResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> AccordResult<Self> {
        let segments = Parser::new(raw).parse()?;
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the path addresses at most one node
    pub fn is_definite(&self) -> bool {
        !self.segments.contains(&Segment::Wildcard)
    }

    /// Selects the addressed value.
    ///
    /// Definite paths return the node or `None`. Wildcard paths always return
    /// an array of the matches, skipping branches where the rest of the path
    /// is missing.
    pub fn select(&self, doc: &Value) -> Option<Value> {
        if self.is_definite() {
            return self.select_ref(doc).cloned();
        }
        let mut current = vec![doc];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                match segment {
                    Segment::Wildcard => match node {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    other => next.extend(step(node, other)),
                }
            }
            current = next;
        }
        Some(Value::Array(current.into_iter().cloned().collect()))
    }

    /// Reference to the node addressed by a definite path
    pub fn select_ref<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(doc, |node, segment| step(node, segment))
    }

    /// Mutable reference to the node addressed by a definite path
    pub fn select_mut<'a>(&self, doc: &'a mut Value) -> Option<&'a mut Value> {
        let mut node = doc;
        for segment in &self.segments {
            node = match (segment, node) {
                (Segment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (Segment::Index(index), Value::Array(items)) => {
                    let i = resolve_index(*index, items.len())?;
                    items.get_mut(i)?
                }
                _ => return None,
            };
        }
        Some(node)
    }
}

fn step<'a>(node: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (segment, node) {
        (Segment::Key(key), Value::Object(map)) => map.get(key),
        (Segment::Index(index), Value::Array(items)) => {
            items.get(resolve_index(*index, items.len())?)
        }
        _ => None,
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        usize::try_from(index).ok()
    } else {
        len.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    }
}

impl FromStr for JsonPath {
    type Err = AccordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

struct Parser<'a> {
    raw: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw,
            chars: raw.trim().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> AccordError {
        AccordError::InvalidPath {
            path: self.raw.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse(mut self) -> AccordResult<Vec<Segment>> {
        let mut segments = Vec::new();
        if self.peek() == Some('$') {
            self.pos += 1;
        } else if matches!(self.peek(), Some(c) if c != '.' && c != '[') {
            // bare leading name, e.g. `widgetId.name`
            segments.push(self.name()?);
        }

        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('.') => return Err(self.error("recursive descent is not supported")),
                        Some('*') => {
                            self.pos += 1;
                            segments.push(Segment::Wildcard);
                        }
                        Some(_) => segments.push(self.name()?),
                        None => return Err(self.error("trailing '.'")),
                    }
                }
                '[' => {
                    self.pos += 1;
                    segments.push(self.bracket()?);
                }
                other => return Err(self.error(format!("unexpected '{}'", other))),
            }
        }
        Ok(segments)
    }

    fn name(&mut self) -> AccordResult<Segment> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c != '.' && c != '[') {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("empty field name"));
        }
        Ok(Segment::Key(self.chars[start..self.pos].iter().collect()))
    }

    fn bracket(&mut self) -> AccordResult<Segment> {
        let segment = match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated quoted name"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Segment::Key(name)
            }
            Some('*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            Some(_) => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c != ']') {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                let index = text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("invalid index '{}'", text)))?;
                Segment::Index(index)
            }
            None => return Err(self.error("unterminated '['")),
        };

        if self.peek() != Some(']') {
            return Err(self.error("expected ']'"));
        }
        self.pos += 1;
        Ok(segment)
    }
}
