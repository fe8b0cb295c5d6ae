/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The reply object model
//!
//! A [`Reply`] is a tree: aggregates own their children by value, there is
//! no sharing and no parent back-reference on the emitted value (the parser
//! keeps its own parent bookkeeping in [`crate::reader::Frame`], privately,
//! while a reply is still under construction).

use bytes::Bytes;

/// The format tag carried by a verbatim string (`txt`, `mkd`, ...).
pub type VerbatimFormat = [u8; 3];

/// A single, fully-formed reply from the store.
///
/// Cloning is cheap for the byte-bearing variants (`Bytes` is refcounted),
/// but aggregates clone their whole child vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK\r\n`
    Status(Bytes),
    /// `-ERR message\r\n` — NOT a crate-level [`crate::error::Error`]; a
    /// perfectly ordinary, successfully-parsed reply (§7).
    Error(Bytes),
    /// `:123\r\n`
    Integer(i64),
    /// `_\r\n`, or a `-1` bulk/array length.
    Nil,
    /// `$5\r\nhello\r\n`
    String(Bytes),
    /// `*N\r\n` followed by `N` children.
    Array(Vec<Reply>),
    /// `%N\r\n` followed by `2N` children, pairs adjacent: `[k0, v0, k1, v1, ...]`.
    Map(Vec<Reply>),
    /// `~N\r\n` followed by `N` children.
    Set(Vec<Reply>),
    /// `>N\r\n` followed by `N` children; delivered out-of-band.
    Push(Vec<Reply>),
    /// `,3.14\r\n` — the parsed value plus the bytes as they appeared on the wire.
    Double { value: f64, text: Bytes },
    /// `#t\r\n` / `#f\r\n`
    Bool(bool),
    /// `(12345678901234567890\r\n` — arbitrary precision, kept as text.
    BigNum(Bytes),
    /// `=15\r\ntxt:Some string\r\n`
    Verbatim { format: VerbatimFormat, text: Bytes },
}

impl Reply {
    /// True for the sentinel absent-value replies (`Nil`, `-1` bulk, `-1` array).
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// True for `Reply::Error` — use this to distinguish a server-reported
    /// error from a transport-level [`crate::error::Error`].
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Borrow the byte payload of any byte-bearing variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(b) | Reply::Error(b) | Reply::String(b) | Reply::BigNum(b) => Some(b),
            Reply::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Borrow the child sequence of any aggregate variant.
    pub fn as_children(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(v) | Reply::Map(v) | Reply::Set(v) | Reply::Push(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_children_stay_adjacent_pairs() {
        let map = Reply::Map(vec![
            Reply::String(Bytes::from_static(b"k1")),
            Reply::Integer(1),
            Reply::String(Bytes::from_static(b"k2")),
            Reply::Integer(2),
        ]);
        let children = map.as_children().unwrap();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0], Reply::String(Bytes::from_static(b"k1")));
        assert_eq!(children[1], Reply::Integer(1));
    }

    #[test]
    fn error_reply_is_not_nil() {
        let e = Reply::Error(Bytes::from_static(b"ERR oops"));
        assert!(e.is_error());
        assert!(!e.is_nil());
    }
}
