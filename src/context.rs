/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The synchronous context
//!
//! [`Context`] is the front door for blocking use (§4.4): connect once,
//! then either call [`Context::command`] for a single request/reply round
//! trip or pipeline several [`Context::append_command`] calls before
//! draining them with [`Context::get_reply`]. The shape mirrors the
//! teacher's own `Client`/`Connection::run_query` loop — write the request,
//! then loop reading into a buffer and feeding the parser until a reply
//! completes — generalized from one fixed metaline format to the
//! streaming [`crate::reader::Reader`].

use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::format::{format_argv, format_template, TemplateArg};
use crate::reader::Reader;
use crate::reply::Reply;
use crate::transport::{self, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Invoked for a push reply (`>...`) that arrives outside of any in-flight
/// command (§4.4 `push_cb`).
pub type PushCallback = Box<dyn FnMut(Reply) + Send>;

/// Blocking, single-connection client context.
pub struct Context {
    transport: Box<dyn Transport + Send>,
    reader: Reader,
    out: Vec<u8>,
    options: ConnectOptions,
    command_timeout: Option<Duration>,
    push_cb: Option<PushCallback>,
    tainted: bool,
}

impl Context {
    /// Establish a connection (§4.4 `connect`).
    pub fn connect(options: ConnectOptions) -> Result<Self> {
        let mut transport = transport::connect(&options)?;
        transport.set_read_timeout(options.command_timeout)?;
        transport.set_write_timeout(options.command_timeout)?;
        log::debug!("connected to {:?}", options.endpoint);
        Ok(Self {
            transport,
            reader: Reader::new(),
            out: Vec::with_capacity(128),
            command_timeout: options.command_timeout,
            options,
            push_cb: None,
            tainted: false,
        })
    }

    /// Install a handler for out-of-band push replies (§4.4).
    pub fn set_push_callback(&mut self, cb: PushCallback) {
        self.push_cb = Some(cb);
    }

    /// Change the per-call timeout applied to subsequent reads/writes.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport.set_read_timeout(timeout)?;
        self.transport.set_write_timeout(timeout)?;
        self.command_timeout = timeout;
        Ok(())
    }

    /// Tear down and re-establish the transport using the original connect
    /// parameters, re-initializing the reader (§10.5, hiredis's
    /// `redisReconnect`).
    pub fn reconnect(&mut self) -> Result<()> {
        self.transport.shutdown();
        let mut transport = transport::connect(&self.options)?;
        transport.set_read_timeout(self.command_timeout)?;
        transport.set_write_timeout(self.command_timeout)?;
        self.transport = transport;
        self.reader = Reader::new();
        self.out.clear();
        self.tainted = false;
        log::debug!("reconnected to {:?}", self.options.endpoint);
        Ok(())
    }

    /// Shut down the transport; no further operations are valid (§4.4 `free`).
    pub fn free(mut self) {
        self.transport.shutdown();
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.tainted = true;
        }
        err
    }

    fn check_tainted(&self) -> Result<()> {
        if self.tainted {
            return Err(Error::other(
                "context is tainted by a previous fatal error; reconnect() or free() it",
            ));
        }
        Ok(())
    }

    /// Format a command from an explicit argument list, send it, and block
    /// for its one reply.
    pub fn command<I, A>(&mut self, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.append_command(args)?;
        self.get_reply()
    }

    /// Format a command from a printf-style template, send it, and block
    /// for its one reply.
    pub fn command_fmt(&mut self, template: &str, args: &[TemplateArg<'_>]) -> Result<Reply> {
        self.check_tainted()?;
        let bytes = format_template(template, args).map_err(|e| self.fail(e))?;
        self.out.extend_from_slice(&bytes);
        self.flush()?;
        self.get_reply()
    }

    /// Queue a command's bytes without sending; call [`Context::get_reply`]
    /// (which flushes first) to actually complete the round trip. This is
    /// the pipelining form (§4.4 `append_command`).
    pub fn append_command<I, A>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.check_tainted()?;
        let bytes = format_argv(args);
        self.out.extend_from_slice(&bytes);
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.transport
            .write_all(&self.out)
            .map_err(|e| self.fail(e))?;
        self.out.clear();
        Ok(())
    }

    /// Drain the output buffer, then block until one reply is available,
    /// dispatching any out-of-band push replies encountered along the way
    /// to the installed [`PushCallback`] (§4.4).
    pub fn get_reply(&mut self) -> Result<Reply> {
        self.check_tainted()?;
        self.flush()?;
        loop {
            match self.reader.get_reply().map_err(|e| self.fail(e))? {
                Some(Reply::Push(children)) if self.push_cb.is_some() => {
                    let cb = self.push_cb.as_mut().unwrap();
                    cb(Reply::Push(children));
                    continue;
                }
                Some(reply) => return Ok(reply),
                None => {
                    let mut buf = [0u8; 16 * 1024];
                    let n = self.transport.read(&mut buf).map_err(|e| self.fail(e))?;
                    if n == 0 {
                        return Err(self.fail(Error::Eof));
                    }
                    self.reader.feed(&buf[..n]);
                }
            }
        }
    }
}

/// A [`Context`] shared across threads by a single lock held for the
/// duration of each call — multi-thread safety, where needed, is provided
/// by the embedder via a mutex held across callback invocations; the core
/// itself never locks. Mirrors the store's own `parking_lot`-guarded shared
/// state (e.g. `coredb`'s table locks) rather than reaching for a plain
/// `std::sync::Mutex`.
#[derive(Clone)]
pub struct SharedContext(Arc<Mutex<Context>>);

impl SharedContext {
    pub fn new(ctx: Context) -> Self {
        Self(Arc::new(Mutex::new(ctx)))
    }

    /// Run one operation with the lock held; the whole request/reply round
    /// trip for `f` happens under the single held guard, so concurrent
    /// callers serialize a full `command`/`append_command`+`get_reply` pair
    /// rather than interleaving partial writes.
    pub fn with<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut self.0.lock())
    }
}
