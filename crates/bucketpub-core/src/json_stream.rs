//! Incremental extraction of array elements from one large JSON document.
//!
//! The document is walked byte by byte with an explicit container stack.
//! Structure is only tracked along the configured path; everything off the
//! path is skipped without buffering, and each matching element is buffered
//! alone and handed to `serde_json`. Memory is bounded by the largest single
//! element plus the keys along the path.

use std::io::{BufRead, BufReader, Read};

use serde::de::IgnoredAny;

use crate::error::PipelineError;
use crate::model::RecordValue;

/// Read buffer for the decompressed document (256KB)
const DOC_BUF_SIZE: usize = 256 * 1024;

/// Dotted element path such as `results.*`.
///
/// `*` matches any key or index at its depth; a literal segment matches an
/// object key of that name or, if numeric, an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Name(String),
    Any,
}

/// Location of a value inside its parent container
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

impl Segment {
    fn matches(&self, step: &Step) -> bool {
        match (self, step) {
            (Self::Any, _) => true,
            (Self::Name(name), Step::Key(key)) => name == key,
            (Self::Name(name), Step::Index(i)) => name.parse::<usize>().is_ok_and(|n| n == *i),
        }
    }
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, PipelineError> {
        let expr = expr.trim();
        let expr = expr.strip_prefix("$.").unwrap_or(expr);
        if expr.is_empty() {
            return Err(PipelineError::Input("array path is empty".to_string()));
        }
        let segments = expr
            .split('.')
            .map(|s| match s {
                "" => Err(PipelineError::Input(format!(
                    "array path {expr:?} has an empty segment"
                ))),
                "*" => Ok(Segment::Any),
                name => Ok(Segment::Name(name.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Value at `steps` is an element to emit
    fn matches(&self, steps: &[Step]) -> bool {
        steps.len() == self.segments.len() && self.prefix_matches(steps)
    }

    /// Value at `steps` may contain elements to emit
    fn leads_to_match(&self, steps: &[Step]) -> bool {
        steps.len() < self.segments.len() && self.prefix_matches(steps)
    }

    fn prefix_matches(&self, steps: &[Step]) -> bool {
        self.segments.iter().zip(steps).all(|(seg, step)| seg.matches(step))
    }
}

/// `results.*`, the layout of the bulk-download documents this was built for
impl Default for JsonPath {
    fn default() -> Self {
        Self {
            segments: vec![Segment::Name("results".to_string()), Segment::Any],
        }
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match seg {
                Segment::Any => f.write_str("*")?,
                Segment::Name(name) => f.write_str(name)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for JsonPath {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Buffered byte source with absolute offset tracking
struct Cursor<R> {
    inner: BufReader<R>,
    offset: u64,
}

impl<R: Read> Cursor<R> {
    fn bump(&mut self) {
        self.inner.consume(1);
        self.offset += 1;
    }

    fn advance(&mut self, n: usize) {
        self.inner.consume(n);
        self.offset += n as u64;
    }

    /// Skip whitespace; peek (without consuming) the next byte.
    fn skip_ws(&mut self) -> Result<Option<u8>, PipelineError> {
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(i) => {
                    let b = buf[i];
                    self.advance(i);
                    return Ok(Some(b));
                }
                None => {
                    let n = buf.len();
                    self.advance(n);
                }
            }
        }
    }

    fn expect_more(&mut self) -> Result<u8, PipelineError> {
        self.skip_ws()?.ok_or_else(|| self.error("unexpected end of document"))
    }

    fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::MalformedJson {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn unexpected(&self, found: u8, wanted: &str) -> PipelineError {
        self.error(format!("expected {wanted}, found {:?}", char::from(found)))
    }

    /// Consume one complete value starting at the next non-blank byte,
    /// appending its raw bytes to `out` when given.
    fn scan_value(&mut self, out: Option<&mut Vec<u8>>) -> Result<(), PipelineError> {
        match self.expect_more()? {
            b'{' | b'[' => self.scan_container(out),
            b'"' => self.scan_string(out),
            b @ (b'}' | b']' | b',' | b':') => Err(self.unexpected(b, "a value")),
            _ => self.scan_scalar(out),
        }
    }

    /// Bracket-balanced scan. Only string boundaries and nesting are tracked;
    /// captured bytes are fully validated by the deserializer afterwards.
    fn scan_container(&mut self, mut out: Option<&mut Vec<u8>>) -> Result<(), PipelineError> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(self.error("unexpected end of document inside a container"));
            }
            let mut end = None;
            for (i, &b) in buf.iter().enumerate() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                    continue;
                }
                match b {
                    b'"' => in_string = true,
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i + 1);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let n = end.unwrap_or(buf.len());
            if let Some(out) = out.as_deref_mut() {
                out.extend_from_slice(&buf[..n]);
            }
            self.advance(n);
            if end.is_some() {
                return Ok(());
            }
        }
    }

    /// Scan a string starting at its opening quote.
    fn scan_string(&mut self, mut out: Option<&mut Vec<u8>>) -> Result<(), PipelineError> {
        let mut escaped = false;
        let mut opened = false;
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(self.error("unexpected end of document inside a string"));
            }
            let mut end = None;
            for (i, &b) in buf.iter().enumerate() {
                if !opened {
                    opened = true;
                    continue;
                }
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    end = Some(i + 1);
                    break;
                } else if b < 0x20 {
                    let offset = self.offset + i as u64;
                    return Err(PipelineError::MalformedJson {
                        offset,
                        message: "control character inside a string".to_string(),
                    });
                }
            }
            let n = end.unwrap_or(buf.len());
            if let Some(out) = out.as_deref_mut() {
                out.extend_from_slice(&buf[..n]);
            }
            self.advance(n);
            if end.is_some() {
                return Ok(());
            }
        }
    }

    /// Scan a number or literal up to the next delimiter. Scalars are short,
    /// so they are always buffered and validated.
    fn scan_scalar(&mut self, out: Option<&mut Vec<u8>>) -> Result<(), PipelineError> {
        let start = self.offset;
        let mut scalar = Vec::new();
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let stop = buf
                .iter()
                .position(|b| b.is_ascii_whitespace() || matches!(b, b',' | b']' | b'}' | b':'));
            let n = stop.unwrap_or(buf.len());
            scalar.extend_from_slice(&buf[..n]);
            self.advance(n);
            if stop.is_some() {
                break;
            }
        }
        if let Err(e) = serde_json::from_slice::<IgnoredAny>(&scalar) {
            return Err(PipelineError::MalformedJson {
                offset: start,
                message: format!("invalid literal: {e}"),
            });
        }
        if let Some(out) = out {
            out.extend_from_slice(&scalar);
        }
        Ok(())
    }

    /// Object key followed by its colon
    fn read_key(&mut self, scratch: &mut Vec<u8>) -> Result<String, PipelineError> {
        let start = self.offset;
        scratch.clear();
        self.scan_string(Some(scratch))?;
        let key = serde_json::from_slice::<String>(scratch).map_err(|e| {
            PipelineError::MalformedJson {
                offset: start,
                message: format!("invalid object key: {e}"),
            }
        })?;
        match self.expect_more()? {
            b':' => {
                self.bump();
                Ok(key)
            }
            b => Err(self.unexpected(b, "':'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Positioned before a value at the current path
    Value,
    /// Just after an opening bracket
    Open(Container),
    /// A value at the current path has been consumed
    AfterValue,
    Done,
}

/// Lazy, single-pass sequence of the elements matching a [`JsonPath`].
///
/// Yields `Err` at most once; after an error or the end of the document every
/// further `next()` returns `None` without touching the input.
pub struct ElementStream<R> {
    cursor: Cursor<R>,
    path: JsonPath,
    steps: Vec<Step>,
    containers: Vec<Container>,
    state: State,
    scratch: Vec<u8>,
}

/// Stream the elements of `path` out of the JSON document read from `reader`.
pub fn parse<R: Read>(reader: R, path: JsonPath) -> ElementStream<R> {
    ElementStream {
        cursor: Cursor {
            inner: BufReader::with_capacity(DOC_BUF_SIZE, reader),
            offset: 0,
        },
        path,
        steps: Vec::new(),
        containers: Vec::new(),
        state: State::Value,
        scratch: Vec::new(),
    }
}

impl<R: Read> ElementStream<R> {
    /// Bytes of the document consumed so far
    pub fn offset(&self) -> u64 {
        self.cursor.offset
    }

    fn capture_element(&mut self) -> Result<RecordValue, PipelineError> {
        self.cursor.skip_ws()?;
        let start = self.cursor.offset;
        self.scratch.clear();
        self.cursor.scan_value(Some(&mut self.scratch))?;
        serde_json::from_slice(&self.scratch).map_err(|e| PipelineError::MalformedJson {
            offset: start,
            message: e.to_string(),
        })
    }

    fn advance(&mut self) -> Result<Option<RecordValue>, PipelineError> {
        loop {
            match self.state {
                State::Done => return Ok(None),

                State::Value => {
                    if self.path.matches(&self.steps) {
                        let value = self.capture_element()?;
                        self.state = State::AfterValue;
                        return Ok(Some(value));
                    }
                    let next = self.cursor.expect_more()?;
                    let container = match next {
                        b'{' => Some(Container::Object),
                        b'[' => Some(Container::Array),
                        _ => None,
                    };
                    match container {
                        Some(c) if self.path.leads_to_match(&self.steps) => {
                            self.cursor.bump();
                            self.containers.push(c);
                            self.state = State::Open(c);
                        }
                        _ => {
                            self.cursor.scan_value(None)?;
                            self.state = State::AfterValue;
                        }
                    }
                }

                State::Open(Container::Array) => match self.cursor.expect_more()? {
                    b']' => {
                        self.cursor.bump();
                        self.containers.pop();
                        self.state = State::AfterValue;
                    }
                    _ => {
                        self.steps.push(Step::Index(0));
                        self.state = State::Value;
                    }
                },

                State::Open(Container::Object) => match self.cursor.expect_more()? {
                    b'}' => {
                        self.cursor.bump();
                        self.containers.pop();
                        self.state = State::AfterValue;
                    }
                    b'"' => {
                        let key = self.cursor.read_key(&mut self.scratch)?;
                        self.steps.push(Step::Key(key));
                        self.state = State::Value;
                    }
                    b => return Err(self.cursor.unexpected(b, "an object key or '}'")),
                },

                State::AfterValue => {
                    let Some(&container) = self.containers.last() else {
                        return match self.cursor.skip_ws()? {
                            None => {
                                self.state = State::Done;
                                Ok(None)
                            }
                            Some(b) => Err(self.cursor.unexpected(b, "end of document")),
                        };
                    };
                    match (container, self.cursor.expect_more()?) {
                        (_, b',') => {
                            self.cursor.bump();
                            let step = match (container, self.steps.last()) {
                                (Container::Array, Some(Step::Index(i))) => Step::Index(i + 1),
                                (Container::Object, _) => match self.cursor.expect_more()? {
                                    b'"' => Step::Key(self.cursor.read_key(&mut self.scratch)?),
                                    b => return Err(self.cursor.unexpected(b, "an object key")),
                                },
                                (Container::Array, _) => {
                                    return Err(self.cursor.error("array member without an index"));
                                }
                            };
                            if let Some(last) = self.steps.last_mut() {
                                *last = step;
                            }
                            self.state = State::Value;
                        }
                        (Container::Array, b']') | (Container::Object, b'}') => {
                            self.cursor.bump();
                            self.containers.pop();
                            self.steps.pop();
                            self.state = State::AfterValue;
                        }
                        (_, b) => return Err(self.cursor.unexpected(b, "',' or a closing bracket")),
                    }
                }
            }
        }
    }
}

impl<R: Read> Iterator for ElementStream<R> {
    type Item = Result<RecordValue, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for ElementStream<R> {}
