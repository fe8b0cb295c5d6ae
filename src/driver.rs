/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The async driver
//!
//! [`AsyncDriver`] is the event-loop-agnostic shim of §4.6: it owns the same
//! [`Reader`]/[`RequestQueue`] pair the synchronous [`crate::context::Context`]
//! does, but never blocks. Instead, the embedder's event loop calls
//! [`AsyncDriver::handle_readable`] / [`AsyncDriver::handle_writable`] /
//! [`AsyncDriver::handle_timeout`] whenever the underlying descriptor says so,
//! and the driver tells the embedder what it wants to wait for next through
//! the four-method [`EventLoopAdapter`] capability set — the same split the
//! teacher draws between its protocol state machine and `ConnectionHandler`'s
//! tokio-driven read loop, generalized from "always on a tokio runtime" to
//! "on whatever reactor the embedder already runs".

use crate::error::{Error, Result};
use crate::format::format_argv;
use crate::queue::{classify, is_pubsub_shaped, Callback, RequestQueue};
use crate::reader::Reader;
use crate::reply::Reply;
use std::time::Duration;

/// A small capability set the embedder implements to bind this driver to a
/// concrete event loop (§4.6 "Adapter capability set"). A "null" embedder
/// that always polls both directions can just make every method a no-op.
pub trait EventLoopAdapter {
    fn add_read(&mut self);
    fn del_read(&mut self);
    fn add_write(&mut self);
    fn del_write(&mut self);
    /// Called exactly once, during teardown, so the embedder can deregister
    /// this connection's descriptor from its reactor.
    fn cleanup(&mut self);
    /// Optional: (re)schedule the next command-timeout tick. The default
    /// no-op is correct for embedders that drive [`AsyncDriver::handle_timeout`]
    /// on their own fixed cadence rather than a per-connection timer.
    fn schedule_timer(&mut self, _after: Duration) {}
}

/// A non-blocking byte-stream transport (§6's transport collaborator,
/// specialized for readiness-driven I/O rather than [`crate::transport::Transport`]'s
/// blocking one). `Ok(None)` means "would block", matching the POSIX EAGAIN
/// convention the reference transport layer uses.
pub trait NonBlockingTransport {
    /// Poll whether a previously-initiated connect has completed. `Ok(true)`
    /// means connected (and, for TCP, `TCP_NODELAY` has been applied);
    /// `Ok(false)` means still in progress.
    fn poll_connect(&mut self) -> Result<bool>;
    fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
    fn try_write(&mut self, buf: &[u8]) -> Result<Option<usize>>;
    fn shutdown(&mut self);
}

/// Options the driver itself consults (a subset of [`crate::config::ConnectOptions`];
/// the rest are only relevant to establishing the transport before the driver
/// exists).
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    pub command_timeout: Option<Duration>,
    /// §6 `noautofree`: don't tear down automatically after a dirty
    /// (error-driven) disconnect; the embedder must call `free()` itself.
    pub noautofree: bool,
}

type ConnectCallback = Box<dyn FnMut(Result<()>)>;
type DisconnectCallback = Box<dyn FnMut(Result<()>)>;
type PushCallback = Box<dyn FnMut(Reply)>;

/// The event-loop-agnostic async connection driver (§4.6, §3 "Async Context").
pub struct AsyncDriver<T, A> {
    transport: T,
    adapter: A,
    reader: Reader,
    queue: RequestQueue,
    out: Vec<u8>,
    out_cursor: usize,
    options: DriverOptions,
    connected: bool,
    disconnecting: bool,
    freeing: bool,
    in_callback: bool,
    supports_push: bool,
    err: Option<Error>,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    push_cb: Option<PushCallback>,
}

impl<T: NonBlockingTransport, A: EventLoopAdapter> AsyncDriver<T, A> {
    /// Wrap an already-initiated (but not yet completed) non-blocking
    /// connect. Per hiredis's `redisAsyncSetConnectCallbackImpl`, the
    /// connect-completion check rides on the first write-readiness event, so
    /// construction immediately arms write interest.
    pub fn new(transport: T, adapter: A, options: DriverOptions) -> Self {
        let mut driver = Self {
            transport,
            adapter,
            reader: Reader::new(),
            queue: RequestQueue::new(),
            out: Vec::new(),
            out_cursor: 0,
            options,
            connected: false,
            disconnecting: false,
            freeing: false,
            in_callback: false,
            supports_push: false,
            err: None,
            on_connect: None,
            on_disconnect: None,
            push_cb: None,
        };
        driver.adapter.add_write();
        driver
    }

    pub fn set_on_connect(&mut self, cb: impl FnMut(Result<()>) + 'static) {
        self.on_connect = Some(Box::new(cb));
    }

    pub fn set_on_disconnect(&mut self, cb: impl FnMut(Result<()>) + 'static) {
        self.on_disconnect = Some(Box::new(cb));
    }

    /// Install the out-of-band push handler (§4.4/§4.6 `push_cb`): invoked
    /// for `Push` replies that do not match the pubsub delivery grammar.
    pub fn set_push_callback(&mut self, cb: impl FnMut(Reply) + 'static) {
        self.push_cb = Some(Box::new(cb));
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn is_freeing(&self) -> bool {
        self.freeing
    }

    pub fn is_subscribed(&self) -> bool {
        self.queue.is_subscribed()
    }

    pub fn is_monitoring(&self) -> bool {
        self.queue.is_monitoring()
    }

    pub fn supports_push(&self) -> bool {
        self.supports_push
    }

    /// Submit a command (§4.6 "Command submission"): refused while
    /// disconnecting or freeing, otherwise formatted, appended to the
    /// output buffer, and enqueued with the reply-counting classification of
    /// §4.5.
    pub fn submit<I, Arg>(&mut self, args: I, handler: impl FnMut(Reply) + 'static) -> Result<()>
    where
        I: IntoIterator<Item = Arg>,
        Arg: AsRef<[u8]>,
    {
        if self.disconnecting || self.freeing {
            return Err(Error::other(
                "context is disconnecting or freeing; command refused",
            ));
        }
        let argv: Vec<Vec<u8>> = args.into_iter().map(|a| a.as_ref().to_vec()).collect();
        if argv.is_empty() {
            return Err(Error::other("a command needs at least its name"));
        }
        let cmd = String::from_utf8_lossy(&argv[0]).into_owned();
        let pending = classify(&cmd, &argv[1..]);
        self.out.extend_from_slice(&format_argv(argv.iter()));
        self.queue.submit(Callback::new(pending, handler));
        self.adapter.add_write();
        Ok(())
    }

    /// Like [`AsyncDriver::submit`], but the callback is also retained with a
    /// finalizer run when its last reference is dropped (§3 "Request
    /// Callback", used by the subscribe family to keep a channel's handler
    /// alive in the subscription table after the FIFO forgets it).
    pub fn submit_with_finalizer<I, Arg>(
        &mut self,
        args: I,
        handler: impl FnMut(Reply) + 'static,
        finalizer: impl FnOnce() + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Arg>,
        Arg: AsRef<[u8]>,
    {
        if self.disconnecting || self.freeing {
            return Err(Error::other(
                "context is disconnecting or freeing; command refused",
            ));
        }
        let argv: Vec<Vec<u8>> = args.into_iter().map(|a| a.as_ref().to_vec()).collect();
        if argv.is_empty() {
            return Err(Error::other("a command needs at least its name"));
        }
        let cmd = String::from_utf8_lossy(&argv[0]).into_owned();
        let pending = classify(&cmd, &argv[1..]);
        self.out.extend_from_slice(&format_argv(argv.iter()));
        self.queue
            .submit(Callback::with_finalizer(pending, handler, finalizer));
        self.adapter.add_write();
        Ok(())
    }

    /// The event loop calls this when the descriptor is readable (§4.6 "On
    /// readable").
    pub fn handle_readable(&mut self) {
        if !self.connected {
            self.run_connect_completion();
            if !self.connected {
                return;
            }
        }
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.transport.try_read(&mut buf) {
                Ok(Some(0)) => {
                    self.fail_and_disconnect(Error::Eof);
                    return;
                }
                Ok(Some(n)) => self.reader.feed(&buf[..n]),
                Ok(None) => break,
                Err(e) => {
                    self.fail_and_disconnect(e);
                    return;
                }
            }
        }
        self.drain_replies();
        if self.connected {
            self.adapter.add_read();
        }
    }

    /// The event loop calls this when the descriptor is writable (§4.6 "On
    /// writable").
    pub fn handle_writable(&mut self) {
        if !self.connected {
            self.run_connect_completion();
            if !self.connected {
                return;
            }
        }
        if self.out_cursor < self.out.len() {
            match self.transport.try_write(&self.out[self.out_cursor..]) {
                Ok(Some(n)) => {
                    self.out_cursor += n;
                    if self.out_cursor == self.out.len() {
                        self.out.clear();
                        self.out_cursor = 0;
                        // the whole outstanding buffer made it onto the wire;
                        // everything queued in `to_write` is now awaiting its
                        // reply (§4.5's `to_write`/`wait_write` collapse).
                        self.queue.mark_flushed();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail_and_disconnect(e);
                    return;
                }
            }
        }
        if self.out_cursor == self.out.len() {
            self.adapter.del_write();
        } else {
            self.adapter.add_write();
        }
        self.adapter.add_read();
    }

    /// The event loop calls this when the configured command timeout (or the
    /// embedder's own timer cadence) fires (§4.6 "On timeout").
    pub fn handle_timeout(&mut self) {
        if self.connected {
            if !self.queue.has_pending() {
                return;
            }
            if self.options.command_timeout.is_none() {
                return;
            }
        }
        if self.err.is_none() {
            self.err = Some(Error::Timeout);
        }
        if !self.connected {
            self.run_callback_on_connect(Err(Error::Timeout));
        }
        self.queue.drain_with_nil();
        self.disconnecting = true;
        self.do_disconnect();
    }

    /// Disconnect (§4.6 "Disconnect protocol" / testable property 6): stop
    /// accepting new commands and immediately invoke every still-pending
    /// callback with `Nil` rather than leaving it hanging forever, the same
    /// way teardown does. Deferred while a callback is executing (it would
    /// be reentrant to free the queue the caller is iterating).
    pub fn disconnect(&mut self) {
        self.disconnecting = true;
        if !self.in_callback {
            self.do_disconnect();
        }
    }

    /// Immediate teardown (§4.6 `free()`). Also deferred while a callback is
    /// executing; the dispatch loop notices `freeing` on return.
    pub fn free(&mut self) {
        self.freeing = true;
        if !self.in_callback {
            self.do_teardown();
        }
    }

    fn run_connect_completion(&mut self) {
        match self.transport.poll_connect() {
            Ok(true) => {
                self.connected = true;
                self.run_callback_on_connect(Ok(()));
                if self.disconnecting {
                    self.do_disconnect();
                } else if self.freeing {
                    self.do_teardown();
                }
            }
            Ok(false) => {}
            Err(e) => {
                self.err = Some(e.clone());
                self.run_callback_on_connect(Err(e));
                self.disconnecting = true;
                self.do_disconnect();
            }
        }
    }

    fn drain_replies(&mut self) {
        loop {
            match self.reader.get_reply() {
                Ok(Some(reply)) => {
                    self.in_callback = true;
                    self.dispatch_one(reply);
                    self.in_callback = false;
                    if self.freeing {
                        self.do_teardown();
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail_and_disconnect(e);
                    return;
                }
            }
        }
        if self.disconnecting && !self.queue.has_pending() && self.out_cursor == self.out.len() {
            self.do_disconnect();
        }
    }

    /// Route one reply per §4.5's classification, with the one extra rule
    /// (§4.5 rule 3) that lives outside the queue: an out-of-band `Push`
    /// reply that does *not* match the pubsub grammar goes straight to the
    /// driver's own push callback and is never handed to the queue at all.
    fn dispatch_one(&mut self, reply: Reply) {
        if let Reply::Push(_) = &reply {
            self.supports_push = true;
            if !is_pubsub_shaped(&reply) {
                if let Some(cb) = &mut self.push_cb {
                    cb(reply);
                }
                return;
            }
        }
        self.queue.route(reply);
    }

    fn fail_and_disconnect(&mut self, err: Error) {
        self.err = Some(err);
        self.disconnecting = true;
        self.do_disconnect();
    }

    /// §4.6 "Disconnect protocol" / hiredis's `__redisAsyncDisconnect`: for a
    /// clean disconnect there must be nothing left pending; for a dirty one
    /// (error-driven) the embedder may have asked (`noautofree`) to keep the
    /// context alive rather than auto-tearing-down.
    fn do_disconnect(&mut self) {
        if self.freeing || self.err.is_none() || !self.options.noautofree {
            self.do_teardown();
        }
    }

    fn do_teardown(&mut self) {
        if !self.connected && self.err.is_none() {
            // never got off the ground and nothing failed; still run cleanup
        }
        self.queue.drain_with_nil();
        self.adapter.cleanup();
        let was_connected = self.connected;
        self.connected = false;
        if was_connected {
            let status = if self.freeing {
                Ok(())
            } else {
                match &self.err {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                }
            };
            self.run_callback_on_disconnect(status);
        }
        self.transport.shutdown();
    }

    fn run_callback_on_connect(&mut self, result: Result<()>) {
        if let Some(cb) = &mut self.on_connect {
            self.in_callback = true;
            cb(result);
            self.in_callback = false;
        }
    }

    fn run_callback_on_disconnect(&mut self, result: Result<()>) {
        if let Some(cb) = &mut self.on_disconnect {
            self.in_callback = true;
            cb(result);
            self.in_callback = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// A non-blocking transport backed entirely by in-memory queues, mirroring
    /// [`crate::testutil::LoopbackTransport`] but honoring the `Ok(None)` =
    /// "would block" contract [`NonBlockingTransport`] needs.
    #[derive(Default)]
    struct MockTransport {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        connect_ready: bool,
        connect_err: bool,
        shut: bool,
    }

    impl MockTransport {
        fn pre_connected() -> Self {
            Self {
                connect_ready: true,
                ..Default::default()
            }
        }
        fn push_inbound(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }
    }

    impl NonBlockingTransport for MockTransport {
        fn poll_connect(&mut self) -> Result<bool> {
            if self.connect_err {
                return Err(Error::other("connection refused"));
            }
            Ok(self.connect_ready)
        }
        fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
            if self.inbound.is_empty() {
                return Ok(None);
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(Some(n))
        }
        fn try_write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
            self.outbound.extend_from_slice(buf);
            Ok(Some(buf.len()))
        }
        fn shutdown(&mut self) {
            self.shut = true;
        }
    }

    #[derive(Default)]
    struct RecordingAdapter {
        read_armed: bool,
        write_armed: bool,
        cleanups: usize,
    }

    impl EventLoopAdapter for RecordingAdapter {
        fn add_read(&mut self) {
            self.read_armed = true;
        }
        fn del_read(&mut self) {
            self.read_armed = false;
        }
        fn add_write(&mut self) {
            self.write_armed = true;
        }
        fn del_write(&mut self) {
            self.write_armed = false;
        }
        fn cleanup(&mut self) {
            self.cleanups += 1;
        }
    }

    fn connected_driver() -> AsyncDriver<MockTransport, RecordingAdapter> {
        let mut d = AsyncDriver::new(
            MockTransport::pre_connected(),
            RecordingAdapter::default(),
            DriverOptions::default(),
        );
        d.handle_writable();
        assert!(d.is_connected());
        d
    }

    #[test]
    fn connect_completion_fires_on_connect_once() {
        let mut fired = Rc::new(RefCell::new(None));
        let mut d = AsyncDriver::new(
            MockTransport::pre_connected(),
            RecordingAdapter::default(),
            DriverOptions::default(),
        );
        let fired2 = fired.clone();
        d.set_on_connect(move |r| *fired2.borrow_mut() = Some(r.is_ok()));
        assert!(!d.is_connected());
        d.handle_writable();
        assert!(d.is_connected());
        assert_eq!(*Rc::get_mut(&mut fired).unwrap().get_mut(), Some(true));
    }

    #[test]
    fn s6_pipeline_ordering_three_pings_in_order() {
        let mut d = connected_driver();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let tag = tag.to_string();
            d.submit(["PING"], move |_| order.borrow_mut().push(tag.clone()))
                .unwrap();
        }
        d.handle_writable();
        d.transport.push_inbound(b"+PONG\r\n+PONG\r\n+PONG\r\n");
        d.handle_readable();
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn s5_pubsub_interleave_does_not_perturb_fifo() {
        let mut d = connected_driver();
        let events = Rc::new(RefCell::new(Vec::new()));
        let events2 = events.clone();
        d.submit(["SUBSCRIBE", "foo"], move |r| events2.borrow_mut().push(r))
            .unwrap();
        d.handle_writable();
        d.transport.push_inbound(
            b"*3\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n:1\r\n*3\r\n$7\r\nmessage\r\n$3\r\nfoo\r\n$3\r\nhi!\r\n",
        );
        d.handle_readable();
        assert_eq!(events.borrow().len(), 2);
        assert_eq!(
            events.borrow()[1],
            Reply::Array(vec![
                Reply::String(Bytes::from_static(b"message")),
                Reply::String(Bytes::from_static(b"foo")),
                Reply::String(Bytes::from_static(b"hi!")),
            ])
        );
        assert!(d.is_subscribed());
    }

    #[test]
    fn plain_push_reply_routes_to_push_callback_not_fifo() {
        let mut d = connected_driver();
        let pushes = Rc::new(RefCell::new(Vec::new()));
        let pushes2 = pushes.clone();
        d.set_push_callback(move |r| pushes2.borrow_mut().push(r));
        let got_reply = Rc::new(RefCell::new(None));
        let got_reply2 = got_reply.clone();
        d.submit(["GET", "k"], move |r| *got_reply2.borrow_mut() = Some(r))
            .unwrap();
        d.handle_writable();
        d.transport
            .push_inbound(b">2\r\n$10\r\ninvalidate\r\n$3\r\nbar\r\n");
        d.handle_readable();
        assert_eq!(pushes.borrow().len(), 1);
        d.transport.push_inbound(b"$-1\r\n");
        d.handle_readable();
        assert_eq!(*got_reply.borrow(), Some(Reply::Nil));
    }

    #[test]
    fn s7_timeout_drains_with_nil_and_disconnects() {
        let mut d = connected_driver();
        d.options.command_timeout = Some(Duration::from_millis(50));
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        d.submit(["GET", "k"], move |r| *got2.borrow_mut() = Some(r))
            .unwrap();
        let disconnected = Rc::new(RefCell::new(None));
        let disconnected2 = disconnected.clone();
        d.set_on_disconnect(move |r| *disconnected2.borrow_mut() = Some(r.is_err()));
        d.handle_writable();
        d.handle_timeout();
        assert_eq!(*got.borrow(), Some(Reply::Nil));
        assert_eq!(*disconnected.borrow(), Some(true));
        assert!(!d.is_connected());
    }

    #[test]
    fn idle_timeout_with_empty_queue_is_ignored() {
        let mut d = connected_driver();
        d.options.command_timeout = Some(Duration::from_millis(50));
        d.handle_timeout();
        assert!(d.is_connected());
    }

    #[test]
    fn disconnect_flushes_every_pending_callback_with_nil() {
        let mut d = connected_driver();
        let count = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let count = count.clone();
            d.submit(["PING"], move |r| {
                assert_eq!(r, Reply::Nil);
                *count.borrow_mut() += 1;
            })
            .unwrap();
        }
        d.handle_writable();
        d.disconnect();
        assert_eq!(*count.borrow(), 3);
        assert!(!d.is_connected());
    }

    #[test]
    fn submit_refused_once_disconnecting() {
        let mut d = connected_driver();
        d.disconnect();
        let err = d.submit(["PING"], |_| {}).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn free_tears_down_and_calls_cleanup_exactly_once() {
        let mut d = connected_driver();
        d.submit(["PING"], |_| {}).unwrap();
        d.free();
        assert_eq!(d.adapter.cleanups, 1);
        assert!(d.transport.shut);
    }

    #[test]
    fn connect_failure_runs_on_connect_with_err_and_never_connects() {
        let mut t = MockTransport::pre_connected();
        t.connect_ready = false;
        t.connect_err = true;
        let mut d = AsyncDriver::new(t, RecordingAdapter::default(), DriverOptions::default());
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        d.set_on_connect(move |r| *got2.borrow_mut() = Some(r.is_err()));
        d.handle_writable();
        assert!(!d.is_connected());
        assert_eq!(*got.borrow(), Some(true));
    }
}
