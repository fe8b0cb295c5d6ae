/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! A client library for a text/binary request-reply protocol used by an
//! in-memory data store (a RESP2/RESP3-family wire protocol).
//!
//! The crate is organized leaves-first:
//!
//! - [`reader`] — the incremental, non-blocking protocol parser.
//! - [`reply`] — the decoded reply tree ([`reply::Reply`]) the parser emits.
//! - [`format`] — wire-encodes one outbound command from an argv or a
//!   printf-style template.
//! - [`context`] — the blocking, single-connection front door
//!   ([`context::Context`]): connect, `command`, pipeline with
//!   `append_command`/`get_reply`.
//! - [`queue`] — the async request FIFO, with the pubsub/monitor/reset
//!   in-band reply classification.
//! - [`driver`] — the event-loop-agnostic async driver
//!   ([`driver::AsyncDriver`]) built on top of [`queue::RequestQueue`].
//! - [`config`] — connection options recognized by `connect`.
//! - [`transport`] — the blocking byte-stream collaborator used by
//!   [`context::Context`].
//! - [`tokio_adapter`] (behind the `tokio-adapter` feature) — a concrete
//!   `tokio`-backed [`driver::EventLoopAdapter`]/[`driver::NonBlockingTransport`]
//!   pair, plus [`tokio_adapter::TokioConnection`], an `async fn`-shaped
//!   wrapper around [`driver::AsyncDriver`] for embedders that just want a
//!   tokio future rather than raw readiness callbacks.

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod format;
pub mod queue;
pub mod reader;
pub mod reply;
pub mod scanner;
pub mod transport;

#[cfg(test)]
mod testutil;

#[cfg(feature = "tokio-adapter")]
pub mod tokio_adapter;

pub use config::ConnectOptions;
pub use context::Context;
pub use error::{Error, Result};
pub use reply::Reply;
