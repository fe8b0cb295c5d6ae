/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The reply reader
//!
//! This is the incremental protocol parser (§4.1). It is fed arbitrary byte
//! slices and, on demand, hands back whichever reply has finished forming.
//! It never performs I/O and never blocks.
//!
//! The resumable design mirrors the store's own wire-handling state
//! machines (the request-side `resume_with`/`ChangeState` pattern): a short
//! read never re-walks already-accepted children, it only rewinds the
//! [`Scanner`] back to where the *current* token started and waits for more
//! bytes to arrive in [`Reader::feed`].

use crate::error::{Error, Result};
use crate::reply::Reply;
use crate::scanner::Scanner;
use bytes::{Buf, BytesMut};

/// Maximum nesting depth for aggregates (arrays/maps/sets/pushes/attrs).
/// The reference implementation uses 7 for the original protocol and 16 for
/// the Attr/Push-bearing extended one; since this reader always accepts
/// both, it uses the larger bound.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Advisory hooks a caller can install to observe (and potentially reject)
/// values as they are constructed, without changing the shape of [`Reply`]
/// itself. The default, no-op implementation is what [`Reader`] uses unless
/// [`Reader::set_factories`] installs another one; a "test factory" can
/// instead just record the offsets it was called with to assert on parser
/// behavior without allocating a full reply tree.
///
/// A hook returning `false` is treated exactly like an allocator-level OOM:
/// the reader reports [`Error::OutOfMemory`] and does not proceed to build
/// the surrounding aggregate. Because every constructed value in this
/// implementation is owned outright (no shared references), rejecting a
/// value never leaks a partial tree — any already-built children are simply
/// dropped along with the call stack that held them.
pub trait ReplyFactories: Send {
    fn accept_string(&mut self, _bytes: &[u8]) -> bool {
        true
    }
    fn accept_integer(&mut self, _v: i64) -> bool {
        true
    }
    fn accept_array(&mut self, _declared_len: usize) -> bool {
        true
    }
    fn accept_nil(&mut self) -> bool {
        true
    }
    fn accept_bool(&mut self, _v: bool) -> bool {
        true
    }
    fn accept_double(&mut self, _v: f64) -> bool {
        true
    }
    fn accept_bignum(&mut self, _text: &[u8]) -> bool {
        true
    }
}

/// The default factory: accepts everything.
#[derive(Debug, Default)]
pub struct DefaultFactories;
impl ReplyFactories for DefaultFactories {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Array,
    Map,
    Set,
    Push,
    Attr,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    want: usize,
    items: Vec<Reply>,
}

enum ParseOutcome {
    NeedMore,
    Continue,
    Value(Reply),
}

/// Size policy applied while parsing (§4.1: "Bulk lengths ... > max_buf ...
/// are errors", "Aggregate lengths ... > max_elements ... are errors").
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderLimits {
    pub max_buf: Option<usize>,
    pub max_elements: Option<usize>,
}

/// The incremental RESP2/RESP3 reply parser.
pub struct Reader {
    buf: BytesMut,
    stack: Vec<Frame>,
    last_attribute: Option<Vec<Reply>>,
    sticky_error: Option<Error>,
    limits: ReaderLimits,
    factories: Box<dyn ReplyFactories>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("buffered", &self.buf.len())
            .field("depth", &self.stack.len())
            .field("poisoned", &self.sticky_error.is_some())
            .finish()
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self::with_limits(ReaderLimits::default())
    }

    pub fn with_limits(limits: ReaderLimits) -> Self {
        Self {
            buf: BytesMut::new(),
            stack: Vec::new(),
            last_attribute: None,
            sticky_error: None,
            limits,
            factories: Box::new(DefaultFactories),
        }
    }

    /// Install alternate factory hooks (§4.1, §9).
    pub fn set_factories(&mut self, factories: Box<dyn ReplyFactories>) {
        self.factories = factories;
    }

    /// Append bytes to the internal buffer. Never fails: the only resource
    /// limits this reader enforces are the declared-length policies checked
    /// while parsing, not the raw byte count buffered so far.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// How many bytes are currently buffered and not yet turned into a reply.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Release a reply tree. Present for parity with the reference API and
    /// for `NO_AUTO_FREE_REPLIES` callers; in Rust this is an ordinary drop.
    pub fn free(&self, reply: Reply) {
        drop(reply);
    }

    /// Retrieve (and clear) the most recently parsed attribute block, if any
    /// attribute reply (`|...`) preceded the last value this reader produced
    /// (§4.2, §9 — the Open Question is resolved by attaching attributes as
    /// reader-level metadata on the following value rather than surfacing
    /// them as a standalone top-level reply).
    pub fn take_last_attribute(&mut self) -> Option<Vec<Reply>> {
        self.last_attribute.take()
    }

    /// Consume as much of the buffer as possible and return the next
    /// completed reply, if any.
    ///
    /// Once this returns `Err`, the reader is poisoned: every subsequent
    /// call returns a clone of the same error until a fresh `Reader` is
    /// constructed (§4.1: "Errors permanently poison the reader").
    pub fn get_reply(&mut self) -> Result<Option<Reply>> {
        if let Some(err) = &self.sticky_error {
            return Err(err.clone());
        }
        let mut scanner = Scanner::new(&self.buf);
        let result = self.drive(&mut scanner);
        let consumed = scanner.cursor();
        self.compact(consumed);
        if let Err(e) = &result {
            self.sticky_error = Some(e.clone());
        }
        result
    }

    /// Drop the consumed prefix. Shrinks the backing allocation once the
    /// freed prefix grows large, otherwise just moves the start pointer
    /// forward in place (§4.1 buffer management).
    fn compact(&mut self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        self.buf.advance(consumed);
        const SHRINK_THRESHOLD: usize = 16 * 1024;
        if self.buf.capacity() - self.buf.len() > SHRINK_THRESHOLD {
            let mut shrunk = BytesMut::with_capacity(self.buf.len());
            shrunk.extend_from_slice(&self.buf);
            self.buf = shrunk;
        }
    }

    fn drive(&mut self, sc: &mut Scanner) -> Result<Option<Reply>> {
        loop {
            match self.parse_one(sc)? {
                ParseOutcome::NeedMore => return Ok(None),
                ParseOutcome::Continue => continue,
                ParseOutcome::Value(v) => {
                    if let Some(root) = self.place_value(v) {
                        return Ok(Some(root));
                    }
                }
            }
        }
    }

    /// Bubble a completed value up through the frame stack, collapsing any
    /// aggregates that become complete as a result. Returns `Some(root)`
    /// only once the stack is fully drained (a root-level reply is ready).
    fn place_value(&mut self, mut value: Reply) -> Option<Reply> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Some(value);
            };
            frame.items.push(value);
            if frame.items.len() < frame.want {
                return None;
            }
            let frame = self.stack.pop().expect("checked Some above");
            match frame.kind {
                FrameKind::Attr => {
                    self.last_attribute = Some(frame.items);
                    return None;
                }
                FrameKind::Array => value = Reply::Array(frame.items),
                FrameKind::Map => value = Reply::Map(frame.items),
                FrameKind::Set => value = Reply::Set(frame.items),
                FrameKind::Push => value = Reply::Push(frame.items),
            }
        }
    }

    /// Parse exactly one "slot": either a complete leaf value, or progress
    /// on an aggregate header (pushing a frame / recording an attribute),
    /// or a signal that more bytes are required.
    fn parse_one(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let Some(ty) = sc.peek() else {
            return Ok(ParseOutcome::NeedMore);
        };
        match ty {
            b'+' => {
                let checkpoint = *sc;
                sc.advance(1);
                match take_line_or_rewind(sc, checkpoint) {
                    Some(line) => Ok(ParseOutcome::Value(Reply::Status(copy(line)))),
                    None => Ok(ParseOutcome::NeedMore),
                }
            }
            b'-' => {
                let checkpoint = *sc;
                sc.advance(1);
                match take_line_or_rewind(sc, checkpoint) {
                    Some(line) => Ok(ParseOutcome::Value(Reply::Error(copy(line)))),
                    None => Ok(ParseOutcome::NeedMore),
                }
            }
            b':' => self.parse_integer(sc),
            b',' => self.parse_double(sc),
            b'#' => self.parse_bool(sc),
            b'(' => self.parse_bignum(sc),
            b'_' => {
                let checkpoint = *sc;
                sc.advance(1);
                match take_line_or_rewind(sc, checkpoint) {
                    Some(line) if line.is_empty() => {
                        if !self.factories.accept_nil() {
                            return Err(Error::limit("factory rejected nil"));
                        }
                        Ok(ParseOutcome::Value(Reply::Nil))
                    }
                    Some(_) => Err(Error::protocol("malformed nil reply")),
                    None => Ok(ParseOutcome::NeedMore),
                }
            }
            b'$' => self.parse_bulk(sc),
            b'=' => self.parse_verbatim(sc),
            b'*' => self.parse_aggregate_header(sc, FrameKind::Array),
            b'%' => self.parse_aggregate_header(sc, FrameKind::Map),
            b'~' => self.parse_aggregate_header(sc, FrameKind::Set),
            b'>' => self.parse_aggregate_header(sc, FrameKind::Push),
            b'|' => self.parse_aggregate_header(sc, FrameKind::Attr),
            other => Err(Error::protocol(format!(
                "unknown reply type byte {other:#04x}"
            ))),
        }
    }

    fn parse_integer(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        match take_line_or_rewind(sc, checkpoint) {
            None => Ok(ParseOutcome::NeedMore),
            Some(line) => {
                let v = parse_strict_i64(line)?;
                if !self.factories.accept_integer(v) {
                    return Err(Error::limit("factory rejected integer"));
                }
                Ok(ParseOutcome::Value(Reply::Integer(v)))
            }
        }
    }

    fn parse_double(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        match take_line_or_rewind(sc, checkpoint) {
            None => Ok(ParseOutcome::NeedMore),
            Some(line) => {
                let v = parse_double_text(line)?;
                if !self.factories.accept_double(v) {
                    return Err(Error::limit("factory rejected double"));
                }
                Ok(ParseOutcome::Value(Reply::Double {
                    value: v,
                    text: copy(line),
                }))
            }
        }
    }

    fn parse_bool(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        match take_line_or_rewind(sc, checkpoint) {
            None => Ok(ParseOutcome::NeedMore),
            Some(b"t") => {
                if !self.factories.accept_bool(true) {
                    return Err(Error::limit("factory rejected bool"));
                }
                Ok(ParseOutcome::Value(Reply::Bool(true)))
            }
            Some(b"f") => {
                if !self.factories.accept_bool(false) {
                    return Err(Error::limit("factory rejected bool"));
                }
                Ok(ParseOutcome::Value(Reply::Bool(false)))
            }
            Some(_) => Err(Error::protocol("bool reply body must be 't' or 'f'")),
        }
    }

    fn parse_bignum(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        match take_line_or_rewind(sc, checkpoint) {
            None => Ok(ParseOutcome::NeedMore),
            Some(line) => {
                validate_bignum(line)?;
                if !self.factories.accept_bignum(line) {
                    return Err(Error::limit("factory rejected bignum"));
                }
                Ok(ParseOutcome::Value(Reply::BigNum(copy(line))))
            }
        }
    }

    fn parse_bulk(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        let Some(len_line) = sc.take_line() else {
            *sc = checkpoint;
            return Ok(ParseOutcome::NeedMore);
        };
        let len = self.parse_bulk_length(len_line)?;
        let Some(len) = len else {
            return Ok(ParseOutcome::Value(Reply::Nil));
        };
        if !sc.has_left(len + 2) {
            *sc = checkpoint;
            return Ok(ParseOutcome::NeedMore);
        }
        let body = sc.take(len).expect("checked above");
        if sc.take(2) != Some(b"\r\n".as_slice()) {
            return Err(Error::protocol("bulk string missing trailing CRLF"));
        }
        if !self.factories.accept_string(body) {
            return Err(Error::limit("factory rejected string"));
        }
        Ok(ParseOutcome::Value(Reply::String(copy(body))))
    }

    fn parse_verbatim(&mut self, sc: &mut Scanner) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        let Some(len_line) = sc.take_line() else {
            *sc = checkpoint;
            return Ok(ParseOutcome::NeedMore);
        };
        let len = self.parse_bulk_length(len_line)?;
        let Some(len) = len else {
            return Ok(ParseOutcome::Value(Reply::Nil));
        };
        if !sc.has_left(len + 2) {
            *sc = checkpoint;
            return Ok(ParseOutcome::NeedMore);
        }
        let body = sc.take(len).expect("checked above");
        if sc.take(2) != Some(b"\r\n".as_slice()) {
            return Err(Error::protocol("verbatim string missing trailing CRLF"));
        }
        if body.len() < 4 || body[3] != b':' {
            return Err(Error::protocol("verbatim string missing format tag"));
        }
        let format = [body[0], body[1], body[2]];
        let text = &body[4..];
        if !self.factories.accept_string(text) {
            return Err(Error::limit("factory rejected string"));
        }
        Ok(ParseOutcome::Value(Reply::Verbatim {
            format,
            text: copy(text),
        }))
    }

    /// Parse and validate a bulk-string declared length, returning `None`
    /// for the `-1` nil sentinel.
    fn parse_bulk_length(&self, line: &[u8]) -> Result<Option<usize>> {
        let len = parse_strict_i64(line)?;
        if len == -1 {
            return Ok(None);
        }
        if len < -1 {
            return Err(Error::protocol("negative bulk length"));
        }
        let len = len as usize;
        if let Some(max) = self.limits.max_buf {
            if len > max {
                return Err(Error::limit(format!(
                    "bulk length {len} exceeds max_buf {max}"
                )));
            }
        }
        Ok(Some(len))
    }

    fn parse_aggregate_header(&mut self, sc: &mut Scanner, kind: FrameKind) -> Result<ParseOutcome> {
        let checkpoint = *sc;
        sc.advance(1);
        match take_line_or_rewind(sc, checkpoint) {
            None => Ok(ParseOutcome::NeedMore),
            Some(line) => {
                let declared = parse_strict_i64(line)?;
                if declared == -1 {
                    if kind == FrameKind::Attr {
                        return Err(Error::protocol("attr reply cannot be nil"));
                    }
                    if !self.factories.accept_array(0) {
                        return Err(Error::limit("factory rejected aggregate"));
                    }
                    return Ok(ParseOutcome::Value(Reply::Nil));
                }
                if declared < -1 {
                    return Err(Error::protocol("negative aggregate length"));
                }
                let declared = declared as usize;
                let want = if kind == FrameKind::Map {
                    declared
                        .checked_mul(2)
                        .ok_or_else(|| Error::limit("map length overflow"))?
                } else {
                    declared
                };
                if let Some(max) = self.limits.max_elements {
                    if want > max {
                        return Err(Error::limit(format!(
                            "aggregate length {want} exceeds max_elements {max}"
                        )));
                    }
                }
                if !self.factories.accept_array(declared) {
                    return Err(Error::limit("factory rejected aggregate"));
                }
                if want == 0 {
                    return Ok(match kind {
                        FrameKind::Array => ParseOutcome::Value(Reply::Array(Vec::new())),
                        FrameKind::Map => ParseOutcome::Value(Reply::Map(Vec::new())),
                        FrameKind::Set => ParseOutcome::Value(Reply::Set(Vec::new())),
                        FrameKind::Push => ParseOutcome::Value(Reply::Push(Vec::new())),
                        FrameKind::Attr => {
                            self.last_attribute = Some(Vec::new());
                            ParseOutcome::Continue
                        }
                    });
                }
                if self.stack.len() >= MAX_NESTING_DEPTH {
                    return Err(Error::limit(format!(
                        "nesting depth exceeds {MAX_NESTING_DEPTH}"
                    )));
                }
                self.stack.push(Frame {
                    kind,
                    want,
                    items: Vec::with_capacity(want.min(4096)),
                });
                Ok(ParseOutcome::Continue)
            }
        }
    }
}

fn copy(bytes: &[u8]) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(bytes)
}

/// Take a CRLF-terminated line, or roll back to `checkpoint` (the scanner
/// position *before* the type byte was consumed) and signal "need more" if
/// the line isn't complete yet — mirroring `parse_bulk`/`parse_verbatim`'s
/// own checkpoint-and-restore so a split CRLF doesn't commit the type byte
/// via `compact` before the rest of the line has arrived.
fn take_line_or_rewind<'a>(sc: &mut Scanner<'a>, checkpoint: Scanner<'a>) -> Option<&'a [u8]> {
    match sc.take_line() {
        Some(line) => Some(line),
        None => {
            *sc = checkpoint;
            None
        }
    }
}

fn parse_strict_i64(line: &[u8]) -> Result<i64> {
    if line.is_empty() {
        return Err(Error::protocol("empty integer"));
    }
    let (neg, digits) = match line[0] {
        b'+' => (false, &line[1..]),
        b'-' => (true, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(Error::protocol("integer has no digits"));
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::protocol("integer has non-digit bytes"));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(Error::protocol("integer has a leading zero"));
    }
    if digits == b"0" && line[0] != digits[0] {
        // either '+0' or '-0': `line[0]` is the sign byte here
        return Err(Error::protocol("signed zero is not allowed"));
    }
    let mut acc: u128 = 0;
    for &b in digits {
        acc = acc * 10 + (b - b'0') as u128;
        if acc > (i64::MAX as u128) + 1 {
            return Err(Error::protocol("integer overflow"));
        }
    }
    if neg {
        if acc == (i64::MAX as u128) + 1 {
            Ok(i64::MIN)
        } else if acc <= i64::MAX as u128 {
            Ok(-(acc as i64))
        } else {
            Err(Error::protocol("integer overflow"))
        }
    } else if acc <= i64::MAX as u128 {
        Ok(acc as i64)
    } else {
        Err(Error::protocol("integer overflow"))
    }
}

fn parse_double_text(line: &[u8]) -> Result<f64> {
    if line.is_empty() {
        return Err(Error::protocol("empty double"));
    }
    let text = std::str::from_utf8(line).map_err(|_| Error::protocol("double is not utf-8"))?;
    let lower = text.to_ascii_lowercase();
    match lower.as_str() {
        "inf" | "+inf" | "infinity" => return Ok(f64::INFINITY),
        "-inf" | "-infinity" => return Ok(f64::NEG_INFINITY),
        "nan" => return Ok(f64::NAN),
        _ => {}
    }
    text.parse::<f64>()
        .map_err(|_| Error::protocol("malformed double"))
}

fn validate_bignum(line: &[u8]) -> Result<()> {
    let digits = match line.first() {
        Some(b'+') | Some(b'-') => &line[1..],
        _ => line,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::protocol("malformed bignum"));
    }
    Ok(())
}
