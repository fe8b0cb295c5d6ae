/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! Test-only helpers shared across the crate's unit tests (§10.4): an
//! in-process loopback transport so the Synchronous Context and the
//! Request Queue can be exercised without a live server.

#![cfg(test)]

use crate::error::{Error, Result};
use crate::transport::Transport;
use std::collections::VecDeque;

/// A `Transport` backed entirely by in-memory queues. `inbound` is what the
/// "server" has sent so far; `outbound` accumulates everything the context
/// under test has written.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub eof: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Transport for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inbound.is_empty() {
            return if self.eof {
                Err(Error::Eof)
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(self.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbound.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.outbound.extend_from_slice(buf);
        Ok(())
    }

    fn set_read_timeout(&mut self, _timeout: Option<std::time::Duration>) -> Result<()> {
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Option<std::time::Duration>) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.eof = true;
    }
}
