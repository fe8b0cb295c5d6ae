/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The error taxonomy
//!
//! Every fallible operation in this crate returns [`Error`], a small closed
//! set of kinds. A server-reported `-ERR ...` reply is deliberately NOT
//! modeled here: it is a successful protocol round-trip and is surfaced to
//! the caller as an ordinary [`crate::reply::Reply::Error`] value.

use core::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of ways a request to the store can fail below the reply
/// layer.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not complete a read or write.
    Io(std::io::Error),
    /// The remote end closed the connection (a clean EOF, not a transport error).
    Eof,
    /// The byte stream did not conform to the wire protocol.
    Protocol(String),
    /// A configured timeout (connect or per-command) elapsed.
    Timeout,
    /// A size policy (`max_buf`/`max_elements`/nesting depth) was exceeded.
    OutOfMemory(String),
    /// Anything else: bad configuration, misuse of the API, formatting errors.
    Other(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub(crate) fn limit(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }
    pub(crate) fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True if the context that produced this error is now tainted and only
    /// `reconnect`/`free` remain valid operations on it (§4.4).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Other(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Eof => write!(f, "the server closed the connection"),
            Self::Protocol(m) => write!(f, "protocol error: {m}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::OutOfMemory(m) => write!(f, "resource limit exceeded: {m}"),
            Self::Other(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Eof => Self::Eof,
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::Timeout => Self::Timeout,
            Self::OutOfMemory(m) => Self::OutOfMemory(m.clone()),
            Self::Other(m) => Self::Other(m.clone()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Eof
        } else if e.kind() == std::io::ErrorKind::TimedOut
            || e.kind() == std::io::ErrorKind::WouldBlock
        {
            Self::Timeout
        } else {
            Self::Io(e)
        }
    }
}
